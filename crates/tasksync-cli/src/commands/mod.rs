//! CLI command handlers

pub mod config;
pub mod conflicts;
pub mod doc;
pub mod status;
pub mod sync;
