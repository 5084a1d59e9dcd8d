//! CLI command implementations

pub mod finalize;
pub mod run;
