//! Settings for persist-rs.
//!
//! [`Settings`] holds everything a session and its backend need to be
//! configured: logging, the database location and the column types used for
//! identifiers and mixin class discriminators.

use serde::{Deserialize, Serialize};

/// Database connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    /// The database file path, or `:memory:`.
    pub path: String,
    /// The SQLite journal mode applied to file databases (e.g. "WAL").
    pub journal_mode: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self {
            path: ":memory:".to_string(),
            journal_mode: "WAL".to_string(),
        }
    }
}

/// The complete set of persist-rs settings.
///
/// # Examples
///
/// ```
/// use persist_rs_core::settings::Settings;
///
/// let settings = Settings::default();
/// assert_eq!(settings.id_column_type, "VARCHAR(32)");
/// assert_eq!(settings.database.path, ":memory:");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Whether debug mode is enabled (pretty logs instead of JSON).
    pub debug: bool,
    /// The log level filter (e.g. "info", "persist_rs_db=debug").
    pub log_level: String,
    /// Database configuration.
    pub database: DatabaseSettings,
    /// SQL column type used for entity ids and has-one columns.
    pub id_column_type: String,
    /// SQL column type used for mixin class discriminator columns.
    pub class_name_type: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            debug: false,
            log_level: "info".to_string(),
            database: DatabaseSettings::default(),
            id_column_type: "VARCHAR(32)".to_string(),
            class_name_type: "TEXT".to_string(),
        }
    }
}
