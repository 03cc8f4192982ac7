//! Callflow Storage crate - SQLite persistence for campaigns and calls.
//!
//! Provides a WAL-mode SQLite database with migrations and the
//! [`SqliteStore`] implementation of `callflow_core::CallflowStore`.

pub mod db;
pub mod migrations;
pub mod store;

pub use db::Database;
pub use store::SqliteStore;
