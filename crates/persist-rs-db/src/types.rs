//! Field types and the type mapper.
//!
//! A [`FieldType`] is the semantic type an entity declares for a field. The
//! [`TypeMapper`] translates between entity-level values and their column
//! representation, and renders the column types and id literals a dialect
//! needs. [`DefaultTypeMapper`] implements the conventions used by SQLite:
//! booleans as 0/1 integers, timestamps as second-resolution epochs and JSON
//! documents as text.

use std::fmt;

use chrono::{DateTime, Utc};
use persist_rs_core::{PersistError, PersistResult, Settings};
use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Epochs above this magnitude are read as milliseconds.
const MILLIS_THRESHOLD: i64 = 1_000_000_000_000;

/// The semantic type of an entity field.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    /// Unbounded text.
    Text,
    /// Bounded text, `VARCHAR(n)`.
    VarChar(u32),
    /// 32-bit integer.
    Int,
    /// 64-bit integer.
    BigInt,
    /// Floating point.
    Real,
    /// Boolean, stored as 0/1.
    Bool,
    /// Timestamp, stored as epoch seconds.
    Date,
    /// JSON document, stored as text.
    Json,
    /// An entity id (the id column and has-one columns).
    Id,
    /// A raw column type passed through to the dialect.
    Other(String),
}

impl FieldType {
    /// Whether values of this type compare as text.
    ///
    /// Case-insensitive ordering only applies to textual columns.
    pub const fn is_textual(&self) -> bool {
        matches!(
            self,
            Self::Text | Self::VarChar(_) | Self::Json | Self::Id | Self::Other(_)
        )
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "TEXT"),
            Self::VarChar(n) => write!(f, "VARCHAR({n})"),
            Self::Int => write!(f, "INT"),
            Self::BigInt => write!(f, "BIGINT"),
            Self::Real => write!(f, "REAL"),
            Self::Bool => write!(f, "BOOL"),
            Self::Date => write!(f, "DATE"),
            Self::Json => write!(f, "JSON"),
            Self::Id => write!(f, "ID"),
            Self::Other(s) => write!(f, "{s}"),
        }
    }
}

/// Translates between entity values and database values.
///
/// Implementations must map null to SQL NULL in both directions.
pub trait TypeMapper: Send + Sync {
    /// The column type used for ids and has-one columns.
    fn id_type(&self) -> &str;

    /// The column type used for mixin class discriminator columns.
    fn class_name_type(&self) -> &str;

    /// The dialect column type for a semantic field type.
    fn column_type(&self, field_type: &FieldType) -> String;

    /// Decodes a raw column value into an entity value.
    ///
    /// # Errors
    ///
    /// Returns [`PersistError::ConsistencyError`] when the stored value
    /// cannot be decoded (e.g. malformed JSON).
    fn db_to_entity(&self, raw: &Value, field_type: &FieldType) -> PersistResult<Value>;

    /// Encodes an entity value into the value bound for its column.
    fn entity_to_db(&self, value: &Value, field_type: &FieldType) -> Value;

    /// Renders an id as an SQL literal.
    fn id_literal(&self, id: &str) -> String;

    /// Wraps a selected column expression (e.g. with a cast).
    fn input_placeholder(&self, expr: &str, _field_type: &FieldType) -> String {
        expr.to_string()
    }

    /// Wraps a bound parameter placeholder (e.g. with a cast).
    fn output_placeholder(&self, placeholder: &str, _field_type: &FieldType) -> String {
        placeholder.to_string()
    }
}

/// The default type mapper.
///
/// # Examples
///
/// ```
/// use persist_rs_db::types::{DefaultTypeMapper, FieldType, TypeMapper};
/// use persist_rs_db::value::Value;
///
/// let mapper = DefaultTypeMapper::default();
/// assert_eq!(mapper.column_type(&FieldType::Bool), "INT");
/// assert_eq!(mapper.entity_to_db(&Value::Bool(true), &FieldType::Bool), Value::Int(1));
/// assert_eq!(mapper.id_literal("it's"), "'it''s'");
/// ```
#[derive(Debug, Clone)]
pub struct DefaultTypeMapper {
    id_type: String,
    class_name_type: String,
}

impl Default for DefaultTypeMapper {
    fn default() -> Self {
        Self {
            id_type: "VARCHAR(32)".to_string(),
            class_name_type: "TEXT".to_string(),
        }
    }
}

impl DefaultTypeMapper {
    /// Creates a mapper with explicit id and class-name column types.
    pub fn new(id_type: impl Into<String>, class_name_type: impl Into<String>) -> Self {
        Self {
            id_type: id_type.into(),
            class_name_type: class_name_type.into(),
        }
    }

    /// Creates a mapper using the column types configured in settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(&settings.id_column_type, &settings.class_name_type)
    }
}

fn epoch_to_datetime(epoch: i64) -> PersistResult<DateTime<Utc>> {
    let decoded = if epoch > MILLIS_THRESHOLD {
        DateTime::from_timestamp_millis(epoch)
    } else {
        DateTime::from_timestamp(epoch, 0)
    };
    decoded.ok_or_else(|| PersistError::ConsistencyError(format!("epoch {epoch} is out of range")))
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Int(i) => *i != 0,
        Value::Float(f) => *f != 0.0,
        Value::String(s) => !s.is_empty() && s != "false",
        _ => true,
    }
}

impl TypeMapper for DefaultTypeMapper {
    fn id_type(&self) -> &str {
        &self.id_type
    }

    fn class_name_type(&self) -> &str {
        &self.class_name_type
    }

    fn column_type(&self, field_type: &FieldType) -> String {
        match field_type {
            FieldType::Text | FieldType::Json => "TEXT".to_string(),
            FieldType::VarChar(n) => format!("VARCHAR({n})"),
            FieldType::Int | FieldType::Bool | FieldType::Date => "INT".to_string(),
            FieldType::BigInt => "BIGINT".to_string(),
            FieldType::Real => "REAL".to_string(),
            FieldType::Id => self.id_type.clone(),
            FieldType::Other(raw) => raw.clone(),
        }
    }

    fn db_to_entity(&self, raw: &Value, field_type: &FieldType) -> PersistResult<Value> {
        if raw.is_null() {
            return Ok(Value::Null);
        }
        match field_type {
            FieldType::Json => match raw {
                // An empty stored string decodes as itself.
                Value::String(text) if text.is_empty() => Ok(raw.clone()),
                Value::String(text) => serde_json::from_str(text).map(Value::Json).map_err(|e| {
                    PersistError::ConsistencyError(format!("malformed JSON in stored value: {e}"))
                }),
                Value::Json(doc) => Ok(Value::Json(doc.clone())),
                other => Ok(Value::Json(other.to_json())),
            },
            FieldType::Bool => Ok(Value::Bool(match raw {
                Value::Bool(b) => *b,
                Value::Int(i) => *i == 1,
                Value::Float(f) => (*f - 1.0).abs() < f64::EPSILON,
                Value::String(s) => s == "1",
                _ => false,
            })),
            FieldType::Date => {
                let epoch = match raw {
                    Value::DateTime(dt) => return Ok(Value::DateTime(*dt)),
                    Value::Int(i) => *i,
                    Value::Float(f) => *f as i64,
                    Value::String(s) => s.trim().parse::<i64>().map_err(|e| {
                        PersistError::ConsistencyError(format!("malformed timestamp '{s}': {e}"))
                    })?,
                    other => {
                        return Err(PersistError::ConsistencyError(format!(
                            "cannot decode {other} as a timestamp"
                        )))
                    }
                };
                epoch_to_datetime(epoch).map(Value::DateTime)
            }
            FieldType::Int | FieldType::BigInt => match raw {
                Value::String(s) => Ok(s.trim().parse::<i64>().map_or_else(|_| raw.clone(), Value::Int)),
                other => Ok(other.clone()),
            },
            FieldType::Id => match raw {
                Value::Int(i) => Ok(Value::String(i.to_string())),
                other => Ok(other.clone()),
            },
            _ => Ok(raw.clone()),
        }
    }

    fn entity_to_db(&self, value: &Value, field_type: &FieldType) -> Value {
        match value {
            Value::Null => Value::Null,
            Value::Entity(key) => Value::String(key.id.clone()),
            _ => match field_type {
                FieldType::Json => Value::String(value.to_json().to_string()),
                FieldType::Bool => Value::Int(i64::from(is_truthy(value))),
                FieldType::Date => match value {
                    Value::DateTime(dt) => Value::Int(dt.timestamp()),
                    other => other.clone(),
                },
                _ => value.clone(),
            },
        }
    }

    fn id_literal(&self, id: &str) -> String {
        format!("'{}'", id.replace('\'', "''"))
    }
}
