// dbbackup/src/utils/notify.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Local;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Where run reports go.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, recipient: &str, sender: &str, subject: &str, body: &str) -> Result<()>;
}

/// Hands a plain-text mail to the local MTA through `sendmail -t -i`.
#[derive(Debug, Clone)]
pub struct SendmailNotifier {
    pub sendmail_path: PathBuf,
}

impl SendmailNotifier {
    pub fn new(sendmail_path: impl Into<PathBuf>) -> Self {
        Self {
            sendmail_path: sendmail_path.into(),
        }
    }
}

/// RFC 2822 message with the recipients in the headers, as `sendmail -t` expects.
pub fn build_message(recipient: &str, sender: &str, subject: &str, body: &str) -> String {
    let mut message = format!(
        "From: {}\r\nTo: {}\r\nSubject: {}\r\nDate: {}\r\nMIME-Version: 1.0\r\nContent-Type: text/plain; charset=UTF-8\r\nContent-Transfer-Encoding: 8bit\r\n\r\n",
        sanitize_header(sender),
        sanitize_header(recipient),
        sanitize_header(subject),
        Local::now().to_rfc2822()
    );
    for line in body.lines() {
        message.push_str(line);
        message.push_str("\r\n");
    }
    message
}

// Header values must stay on one line.
fn sanitize_header(value: &str) -> String {
    value.replace(['\r', '\n'], " ")
}

#[async_trait]
impl Notifier for SendmailNotifier {
    async fn send(&self, recipient: &str, sender: &str, subject: &str, body: &str) -> Result<()> {
        let mut child = Command::new(&self.sendmail_path)
            .arg("-t")
            .arg("-i")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to execute {}", self.sendmail_path.display()))?;

        let message = build_message(recipient, sender, subject, body);
        {
            let mut stdin = child.stdin.take().context("sendmail stdin not available")?;
            stdin
                .write_all(message.as_bytes())
                .await
                .context("Failed to write message to sendmail")?;
        }

        let output = child.wait_with_output().await.context("Failed to wait for sendmail")?;
        if !output.status.success() {
            anyhow::bail!(
                "sendmail failed with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn test_build_message_headers() {
        let message = build_message("ops@example.com", "dbbackup@db01", "[FAILED] mysql\nbackup", "line one\nline two");
        let (headers, body) = message.split_once("\r\n\r\n").unwrap();

        assert!(headers.contains("From: dbbackup@db01\r\n"));
        assert!(headers.contains("To: ops@example.com\r\n"));
        assert!(headers.contains("Subject: [FAILED] mysql backup\r\n"));
        assert!(headers.contains("\r\nDate: "));
        assert!(headers.contains("Content-Type: text/plain; charset=UTF-8"));
        assert_eq!(body, "line one\r\nline two\r\n");
    }

    fn fake_sendmail(dir: &std::path::Path, script: &str) -> anyhow::Result<PathBuf> {
        let path = dir.join("sendmail");
        fs::write(&path, script)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        Ok(path)
    }

    #[tokio::test]
    async fn test_sendmail_receives_message() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let captured = dir.path().join("mail.txt");
        let script = format!("#!/bin/sh\ncat > '{}'\n", captured.display());
        let notifier = SendmailNotifier::new(fake_sendmail(dir.path(), &script)?);

        notifier.send("ops@example.com", "dbbackup@db01", "[SUCCESS] report", "all good").await?;

        let mail = fs::read_to_string(&captured)?;
        assert!(mail.contains("Subject: [SUCCESS] report"));
        assert!(mail.ends_with("all good\r\n"));
        Ok(())
    }

    #[tokio::test]
    async fn test_sendmail_failure_is_reported() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let notifier = SendmailNotifier::new(fake_sendmail(dir.path(), "#!/bin/sh\ncat >/dev/null\necho 'no MTA' >&2\nexit 75\n")?);

        let err = notifier.send("ops@example.com", "a@b", "s", "b").await.unwrap_err();
        assert!(err.to_string().contains("no MTA"));
        Ok(())
    }
}
