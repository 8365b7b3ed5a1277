//! CLI command implementations

mod control;
mod jobs;
mod run;

pub use control::{end, kill};
pub use jobs::jobs;
pub use run::run;
