//! # persist-rs
//!
//! An object-relational persistence layer for Rust.
//!
//! This is the meta-crate that re-exports all sub-crates for convenient access.
//! You can depend on `persist-rs` to get everything, or depend on individual
//! crates for finer-grained control.

/// Error types, settings, settings loading and logging setup.
pub use persist_rs_core as core;

/// Entity metadata, sessions, query collections and schema sync.
pub use persist_rs_db as db;

/// Database drivers: `SQLite`.
pub use persist_rs_db_backends as db_backends;

/// Signal dispatcher for persistence events.
pub use persist_rs_signals as signals;
