//! CLI command handlers, one file per command.

mod clean;
mod completions;
mod input;
mod probe;
mod run;

pub use clean::run_clean;
pub use completions::run_completions;
pub use probe::run_probe;
pub use run::{run_group, RunArgs};
