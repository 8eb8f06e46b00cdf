pub(crate) mod catalog;
mod logic;

pub use logic::{RestoreArgs, run_restore_flow};
