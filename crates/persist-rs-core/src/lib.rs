//! # persist-rs-core
//!
//! Core types shared by every persist-rs crate. This crate has no persistence
//! logic of its own; it provides the foundation the ORM and backends build on.
//!
//! ## Modules
//!
//! - [`error`] - The error taxonomy and result alias
//! - [`settings`] - Configuration for sessions and backends
//! - [`settings_loader`] - Loading settings from TOML and the environment
//! - [`logging`] - Tracing-based logging integration

pub mod error;
pub mod logging;
pub mod settings;
pub mod settings_loader;

// Re-export the most commonly used types at the crate root.
pub use error::{ErrorKind, PersistError, PersistResult, ValidationError};
pub use settings::{DatabaseSettings, Settings};
