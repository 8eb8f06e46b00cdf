// dbbackup/src/backup/report.rs
use std::fmt::{self, Write};

use super::context::{Outcome, RunContext, RunStatus};

#[derive(Debug, Clone)]
pub struct Report {
    pub status: RunStatus,
    pub subject: String,
    pub body: String,
}

/// Human readable byte count, binary units.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn opt_size(bytes: Option<u64>) -> String {
    bytes.map(format_size).unwrap_or_else(|| "-".to_string())
}

/// Renders the outcome of a finished run. Reads the context only.
pub fn build_report(ctx: &RunContext) -> Report {
    let status = ctx.status();
    let subject = format!(
        "[{}] {} backup on {} ({})",
        status,
        ctx.backend,
        ctx.host,
        ctx.date().format("%Y-%m-%d")
    );

    let body = render_body(ctx, status)
        .unwrap_or_else(|e| format!("Backup report for {} could not be rendered: {}", ctx.host, e));

    Report { status, subject, body }
}

fn render_body(ctx: &RunContext, status: RunStatus) -> Result<String, fmt::Error> {
    let mut body = String::new();
    writeln!(body, "Backup report for {} ({})", ctx.host, ctx.backend)?;
    writeln!(body, "Run:        {}", ctx.run_id)?;
    writeln!(body, "Started:    {}", ctx.timestamp.format("%Y-%m-%d %H:%M:%S %:z"))?;
    writeln!(body, "Status:     {}", status)?;
    writeln!(
        body,
        "Settings:   strategy {}, compression {}, unique IDs {}, retention {}",
        ctx.strategy,
        ctx.compression.map(|f| f.to_string()).unwrap_or_else(|| "off".to_string()),
        if ctx.unique_id { "on" } else { "off" },
        if ctx.retention_active() { ctx.retention_count.to_string() } else { "off".to_string() },
    )?;

    let succeeded: Vec<_> = ctx.succeeded().collect();
    if !succeeded.is_empty() {
        writeln!(body, "\nSuccessful databases ({}):", succeeded.len())?;
        for unit in succeeded {
            writeln!(
                body,
                "  {:<24} {:>10} -> {:>10}  {}",
                unit.name,
                opt_size(unit.pre_compress_size),
                opt_size(unit.post_compress_size),
                unit.archive_path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_default()
            )?;
        }
    }

    let failed: Vec<_> = ctx.failed().collect();
    if !failed.is_empty() {
        writeln!(body, "\nFailed databases ({}):", failed.len())?;
        for unit in failed {
            match unit.outcome {
                Outcome::Failed => {
                    writeln!(body, "  {} (dump failed)", unit.name)?;
                    if let Some(detail) = &unit.error_detail {
                        for line in detail.lines() {
                            writeln!(body, "    {}", line)?;
                        }
                    }
                }
                _ => {
                    writeln!(body, "  {} (compression failed)", unit.name)?;
                    if let Some(detail) = &unit.compression_error {
                        for line in detail.lines() {
                            writeln!(body, "    {}", line)?;
                        }
                    }
                    if let Some(path) = &unit.archive_path {
                        writeln!(body, "    uncompressed dump kept at {}", path.display())?;
                    }
                }
            }
        }
    }

    if let Some(batch) = &ctx.batch {
        writeln!(
            body,
            "\nBatch artifact: {} ({} -> {})",
            batch.path.display(),
            format_size(batch.pre_compress_size),
            opt_size(batch.post_compress_size)
        )?;
    }

    if ctx.unique_id && !ctx.sweeps.is_empty() {
        writeln!(body, "\nRetention (keep {}):", ctx.retention_count)?;
        let mut total = 0;
        for sweep in &ctx.sweeps {
            total += sweep.retained_size();
            writeln!(
                body,
                "  {}: {} kept, {} deleted",
                sweep.scope,
                sweep.retained.len(),
                sweep.deleted.len()
            )?;
            for entry in &sweep.retained {
                writeln!(body, "    kept     {} ({})", entry.path.display(), format_size(entry.size))?;
            }
            for entry in &sweep.deleted {
                writeln!(body, "    deleted  {}", entry.path.display())?;
            }
            for (path, err) in &sweep.errors {
                writeln!(body, "    could not delete {}: {}", path.display(), err)?;
            }
        }
        writeln!(body, "  Total retained size: {}", format_size(total))?;
    }

    Ok(body)
}
