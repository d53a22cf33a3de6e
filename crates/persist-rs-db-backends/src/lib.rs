//! # persist-rs-db-backends
//!
//! Database drivers for persist-rs. Each driver implements the
//! [`Database`](persist_rs_db::Database) and
//! [`Transaction`](persist_rs_db::Transaction) traits the session runs on.
//!
//! Supported backends:
//! - `SQLite` (feature `sqlite`, enabled by default)

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteBackend, SqliteTransaction};
