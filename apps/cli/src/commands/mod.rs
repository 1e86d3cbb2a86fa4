//! Command implementations for the tuneforge CLI.

pub mod export;
pub mod import;
pub mod models;
pub mod train;
pub mod types;
pub mod validate;
