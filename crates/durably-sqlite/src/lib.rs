//! The SQLite-backed `Storage` implementation.

mod config;
mod error;
mod migrations;
mod storage;

pub use config::{DbConfig, CONFIG};
pub use storage::SqliteStorage;
