//! Settings loading from configuration files.
//!
//! ## Loading Order
//!
//! 1. Start with default settings.
//! 2. Load from a TOML file (overriding defaults).
//! 3. Apply environment variable overrides (highest priority).
//!
//! ## Environment Variable Mapping
//!
//! | Env Var | Setting |
//! |---|---|
//! | `PERSIST_DEBUG` | `debug` |
//! | `PERSIST_LOG_LEVEL` | `log_level` |
//! | `PERSIST_DATABASE_PATH` | `database.path` |
//!
//! ## Examples
//!
//! ```rust,no_run
//! use persist_rs_core::settings_loader;
//!
//! let settings = settings_loader::from_toml_file_with_env("persist.toml").unwrap();
//! ```

use std::path::Path;

use crate::error::PersistError;
use crate::settings::Settings;

/// Loads settings from a TOML string.
///
/// Any settings not present in the TOML keep their default values.
///
/// # Errors
///
/// Returns an error if the TOML is malformed or cannot be deserialized.
pub fn from_toml_str(toml_str: &str) -> Result<Settings, PersistError> {
    // Merge through serde_json so that partial tables keep their defaults.
    let toml_value: toml::Value = toml::from_str(toml_str)
        .map_err(|e| PersistError::ConfigurationError(format!("Failed to parse TOML: {e}")))?;

    let json_value = toml_to_json(toml_value);
    let default_json = serde_json::to_value(Settings::default()).map_err(|e| {
        PersistError::ConfigurationError(format!("Failed to serialize default settings: {e}"))
    })?;

    let merged = merge_json(default_json, json_value);
    serde_json::from_value(merged).map_err(|e| {
        PersistError::ConfigurationError(format!("Failed to deserialize settings from TOML: {e}"))
    })
}

/// Loads settings from a TOML file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the TOML is malformed.
pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Settings, PersistError> {
    let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
        PersistError::ConfigurationError(format!(
            "Failed to read TOML file '{}': {e}",
            path.as_ref().display()
        ))
    })?;
    from_toml_str(&content)
}

/// Loads settings from a TOML file and then applies environment variable overrides.
///
/// # Errors
///
/// Returns an error if the file cannot be read or the TOML is malformed.
pub fn from_toml_file_with_env(path: impl AsRef<Path>) -> Result<Settings, PersistError> {
    let mut settings = from_toml_file(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Loads settings from just environment variables (starting from defaults).
pub fn from_env() -> Settings {
    let mut settings = Settings::default();
    apply_env_overrides(&mut settings);
    settings
}

/// Applies `PERSIST_*` environment variable overrides to a settings struct.
pub fn apply_env_overrides(settings: &mut Settings) {
    if let Ok(val) = std::env::var("PERSIST_DEBUG") {
        settings.debug = matches!(val.to_lowercase().as_str(), "true" | "1" | "yes");
    }

    if let Ok(val) = std::env::var("PERSIST_LOG_LEVEL") {
        settings.log_level = val;
    }

    if let Ok(val) = std::env::var("PERSIST_DATABASE_PATH") {
        settings.database.path = val;
    }
}

/// Converts a TOML value to a `serde_json::Value`.
fn toml_to_json(value: toml::Value) -> serde_json::Value {
    match value {
        toml::Value::String(s) => serde_json::Value::String(s),
        toml::Value::Integer(i) => serde_json::json!(i),
        toml::Value::Float(f) => serde_json::json!(f),
        toml::Value::Boolean(b) => serde_json::Value::Bool(b),
        toml::Value::Datetime(dt) => serde_json::Value::String(dt.to_string()),
        toml::Value::Array(arr) => {
            serde_json::Value::Array(arr.into_iter().map(toml_to_json).collect())
        }
        toml::Value::Table(table) => {
            let map: serde_json::Map<String, serde_json::Value> = table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect();
            serde_json::Value::Object(map)
        }
    }
}

/// Deep-merges two JSON values. The `override_val` takes precedence.
fn merge_json(base: serde_json::Value, override_val: serde_json::Value) -> serde_json::Value {
    match (base, override_val) {
        (serde_json::Value::Object(mut base_map), serde_json::Value::Object(override_map)) => {
            for (key, override_v) in override_map {
                let merged = if let Some(base_v) = base_map.remove(&key) {
                    merge_json(base_v, override_v)
                } else {
                    override_v
                };
                base_map.insert(key, merged);
            }
            serde_json::Value::Object(base_map)
        }
        (_, override_val) => override_val,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_toml_str_basic() {
        let toml = r#"
            debug = true
            log_level = "debug"
        "#;

        let settings = from_toml_str(toml).unwrap();
        assert!(settings.debug);
        assert_eq!(settings.log_level, "debug");
        // Defaults preserved
        assert_eq!(settings.id_column_type, "VARCHAR(32)");
    }

    #[test]
    fn test_from_toml_str_partial_database_table() {
        let toml = r#"
            [database]
            path = "app.db"
        "#;

        let settings = from_toml_str(toml).unwrap();
        assert_eq!(settings.database.path, "app.db");
        assert_eq!(settings.database.journal_mode, "WAL");
    }

    #[test]
    fn test_from_toml_str_empty() {
        let settings = from_toml_str("").unwrap();
        assert_eq!(settings.log_level, "info");
    }

    #[test]
    fn test_from_toml_str_invalid() {
        let result = from_toml_str("this is not = = toml");
        assert!(matches!(result, Err(PersistError::ConfigurationError(_))));
    }

    #[test]
    fn test_from_toml_file() {
        let dir = std::env::temp_dir().join("persist_rs_test_toml");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("persist.toml");
        std::fs::write(&path, "id_column_type = \"CHAR(32)\"\n").unwrap();

        let settings = from_toml_file(&path).unwrap();
        assert_eq!(settings.id_column_type, "CHAR(32)");

        std::fs::remove_file(&path).ok();
        std::fs::remove_dir(&dir).ok();
    }

    #[test]
    fn test_from_toml_file_missing() {
        let result = from_toml_file("/nonexistent/persist.toml");
        assert!(result.is_err());
    }

    #[test]
    fn test_apply_env_overrides() {
        let mut settings = Settings::default();
        std::env::set_var("PERSIST_DATABASE_PATH", "/tmp/env.db");
        std::env::set_var("PERSIST_DEBUG", "1");
        apply_env_overrides(&mut settings);
        assert_eq!(settings.database.path, "/tmp/env.db");
        assert!(settings.debug);
        std::env::remove_var("PERSIST_DATABASE_PATH");
        std::env::remove_var("PERSIST_DEBUG");
    }
}
