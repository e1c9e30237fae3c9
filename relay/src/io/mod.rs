//! I/O helpers for engine commands.

pub mod checks;
pub mod collaborator;
pub mod config;
pub mod git;
pub mod ledger;
pub mod paths;
pub mod process;
pub mod recall;
pub mod sprint_log;
pub mod task_store;
