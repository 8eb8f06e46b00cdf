pub(crate) mod archive;
pub(crate) mod compress;
pub(crate) mod context;
pub(crate) mod db_dump;
pub(crate) mod logic;
pub(crate) mod naming;
pub(crate) mod report;
pub(crate) mod retention;

pub use context::RunStatus;
pub use logic::run_backup_flow;
