//! Filter expressions and their compilation to SQL.
//!
//! A [`Filter`] is an immutable expression tree. Compiling it renders a
//! predicate and appends the bound parameters in the exact order their
//! placeholders appear.
//!
//! # Examples
//!
//! ```
//! use persist_rs_db::filter::{Filter, Operator};
//! use persist_rs_db::meta::EntityMeta;
//! use persist_rs_db::types::{DefaultTypeMapper, FieldType};
//! use persist_rs_db::value::Value;
//!
//! let meta = EntityMeta::builder("Task")
//!     .field("title", FieldType::Text)
//!     .field("done", FieldType::Bool)
//!     .build();
//! let filter = Filter::eq("done", false) & Filter::property("title", Operator::Like, "50%");
//!
//! let mut params = Vec::new();
//! let sql = filter
//!     .compile(&meta, Some("root"), &mut params, &DefaultTypeMapper::default())
//!     .unwrap();
//! assert_eq!(sql, "(`root`.`done` = ? AND `root`.`title` LIKE ? ESCAPE '\\')");
//! assert_eq!(params, vec![Value::Int(0), Value::from("%50\\%%")]);
//! ```

use std::fmt;
use std::ops;
use std::str::FromStr;

use persist_rs_core::{PersistError, PersistResult, ValidationError};

use crate::meta::EntityMeta;
use crate::types::TypeMapper;
use crate::value::Value;

/// A comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `in`
    In,
    /// `not in`
    NotIn,
    /// `like`, a substring match
    Like,
}

impl Operator {
    /// The SQL spelling of a binary comparison.
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::In => "IN",
            Self::NotIn => "NOT IN",
            Self::Like => "LIKE",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl FromStr for Operator {
    type Err = PersistError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "=" | "==" => Ok(Self::Eq),
            "!=" | "<>" => Ok(Self::Ne),
            "<" => Ok(Self::Lt),
            "<=" => Ok(Self::Le),
            ">" => Ok(Self::Gt),
            ">=" => Ok(Self::Ge),
            "in" => Ok(Self::In),
            "not in" => Ok(Self::NotIn),
            "like" => Ok(Self::Like),
            other => Err(ValidationError::new(
                format!("unknown filter operator '{other}'"),
                "invalid_operator",
            )
            .into()),
        }
    }
}

/// A comparison of one property against a value.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyFilter {
    /// The property (column) name.
    pub property: String,
    /// The comparison operator.
    pub operator: Operator,
    /// The compared value; a [`Value::List`] for `in` / `not in`.
    pub value: Value,
}

/// A filter expression.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Filter {
    /// Matches everything.
    #[default]
    Null,
    /// A property comparison.
    Property(PropertyFilter),
    /// Both sides match.
    And(Box<Filter>, Box<Filter>),
    /// Either side matches.
    Or(Box<Filter>, Box<Filter>),
}

impl Filter {
    /// A property comparison.
    pub fn property(property: impl Into<String>, operator: Operator, value: impl Into<Value>) -> Self {
        Self::Property(PropertyFilter {
            property: property.into(),
            operator,
            value: value.into(),
        })
    }

    /// Shorthand for an `=` comparison.
    pub fn eq(property: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::property(property, Operator::Eq, value)
    }

    /// Conjunction of `self` and `other`.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        Self::And(Box::new(self), Box::new(other))
    }

    /// Disjunction of `self` and `other`.
    #[must_use]
    pub fn or(self, other: Self) -> Self {
        Self::Or(Box::new(self), Box::new(other))
    }

    /// Compiles the filter into an SQL predicate.
    ///
    /// Column references are qualified with `alias` when given. Bound values
    /// are converted through `mapper` and appended to `params` in placeholder
    /// order.
    ///
    /// # Errors
    ///
    /// Returns a validation error for properties `meta` does not map and for
    /// values that do not fit their operator.
    pub fn compile(
        &self,
        meta: &EntityMeta,
        alias: Option<&str>,
        params: &mut Vec<Value>,
        mapper: &dyn TypeMapper,
    ) -> PersistResult<String> {
        match self {
            Self::Null => Ok("1=1".to_string()),
            Self::Property(filter) => filter.compile(meta, alias, params, mapper),
            Self::And(left, right) => {
                let left = left.compile(meta, alias, params, mapper)?;
                let right = right.compile(meta, alias, params, mapper)?;
                Ok(format!("({left} AND {right})"))
            }
            Self::Or(left, right) => {
                let left = left.compile(meta, alias, params, mapper)?;
                let right = right.compile(meta, alias, params, mapper)?;
                Ok(format!("({left} OR {right})"))
            }
        }
    }
}

impl ops::BitAnd for Filter {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self::Output {
        self.and(rhs)
    }
}

impl ops::BitOr for Filter {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.or(rhs)
    }
}

/// Escapes LIKE wildcards and the escape character itself.
fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl PropertyFilter {
    fn invalid_value(&self, expected: &str) -> PersistError {
        ValidationError::new(
            format!(
                "operator '{}' on '{}' expects {expected}, got {}",
                self.operator, self.property, self.value
            ),
            "invalid_filter_value",
        )
        .with_subject(&self.property)
        .into()
    }

    fn compile(
        &self,
        meta: &EntityMeta,
        alias: Option<&str>,
        params: &mut Vec<Value>,
        mapper: &dyn TypeMapper,
    ) -> PersistResult<String> {
        let field_type = meta.require_column(&self.property)?;
        let column = match alias {
            Some(alias) => format!("`{alias}`.`{}`", self.property),
            None => format!("`{}`", self.property),
        };
        let placeholder = mapper.output_placeholder("?", &field_type);

        match (self.operator, &self.value) {
            (Operator::Eq, Value::Null) => Ok(format!("{column} IS NULL")),
            (Operator::Ne, Value::Null) => Ok(format!("{column} IS NOT NULL")),
            (Operator::In | Operator::NotIn, value) => {
                let Value::List(items) = value else {
                    return Err(self.invalid_value("a list"));
                };
                if items.is_empty() {
                    return Ok(if self.operator == Operator::In {
                        "1 = 0".to_string()
                    } else {
                        "1 = 1".to_string()
                    });
                }
                let placeholders: Vec<&str> = items
                    .iter()
                    .map(|item| {
                        params.push(mapper.entity_to_db(item, &field_type));
                        placeholder.as_str()
                    })
                    .collect();
                Ok(format!(
                    "{column} {} ({})",
                    self.operator.as_sql(),
                    placeholders.join(", ")
                ))
            }
            (Operator::Like, Value::String(needle)) => {
                let pattern = format!("%{}%", escape_like(needle));
                params.push(mapper.entity_to_db(&Value::String(pattern), &field_type));
                Ok(format!("{column} LIKE {placeholder} ESCAPE '\\'"))
            }
            (Operator::Like, _) => Err(self.invalid_value("a string")),
            (operator, value) => {
                let value = match value {
                    Value::Bool(b) => Value::Int(i64::from(*b)),
                    other => other.clone(),
                };
                params.push(mapper.entity_to_db(&value, &field_type));
                Ok(format!("{column} {} {placeholder}", operator.as_sql()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DefaultTypeMapper, FieldType};

    fn meta() -> EntityMeta {
        EntityMeta::builder("Task")
            .field("title", FieldType::Text)
            .field("done", FieldType::Bool)
            .field("priority", FieldType::Int)
            .has_one("owner", "Person")
            .build()
    }

    fn compile(filter: &Filter) -> (String, Vec<Value>) {
        let mut params = Vec::new();
        let sql = filter
            .compile(&meta(), None, &mut params, &DefaultTypeMapper::default())
            .unwrap();
        (sql, params)
    }

    #[test]
    fn test_null_filter() {
        assert_eq!(compile(&Filter::Null), ("1=1".to_string(), vec![]));
    }

    #[test]
    fn test_null_comparisons_bind_nothing() {
        let (sql, params) = compile(&Filter::eq("owner", Value::Null));
        assert_eq!(sql, "`owner` IS NULL");
        assert!(params.is_empty());
        let (sql, _) = compile(&Filter::property("title", Operator::Ne, Value::Null));
        assert_eq!(sql, "`title` IS NOT NULL");
    }

    #[test]
    fn test_empty_in_lists_are_constants() {
        let (sql, params) = compile(&Filter::property("title", Operator::In, Vec::<Value>::new()));
        assert_eq!(sql, "1 = 0");
        assert!(params.is_empty());
        let (sql, _) = compile(&Filter::property("title", Operator::NotIn, Vec::<Value>::new()));
        assert_eq!(sql, "1 = 1");
    }

    #[test]
    fn test_in_list_binds_each_value() {
        let filter = Filter::property(
            "done",
            Operator::NotIn,
            vec![Value::Bool(true), Value::Bool(false)],
        );
        let (sql, params) = compile(&filter);
        assert_eq!(sql, "`done` NOT IN (?, ?)");
        assert_eq!(params, vec![Value::Int(1), Value::Int(0)]);
    }

    #[test]
    fn test_like_escapes_wildcards() {
        let (sql, params) = compile(&Filter::property("title", Operator::Like, "a_b\\c"));
        assert_eq!(sql, "`title` LIKE ? ESCAPE '\\'");
        assert_eq!(params, vec![Value::from("%a\\_b\\\\c%")]);
    }

    #[test]
    fn test_bool_normalized_before_binding() {
        let (sql, params) = compile(&Filter::eq("done", true));
        assert_eq!(sql, "`done` = ?");
        assert_eq!(params, vec![Value::Int(1)]);
    }

    #[test]
    fn test_param_order_follows_placeholders() {
        let filter = (Filter::property("priority", Operator::Gt, 1) | Filter::eq("title", "b"))
            & Filter::property("priority", Operator::Le, 9);
        let (sql, params) = compile(&filter);
        assert_eq!(
            sql,
            "((`priority` > ? OR `title` = ?) AND `priority` <= ?)"
        );
        assert_eq!(params, vec![Value::Int(1), Value::from("b"), Value::Int(9)]);
    }

    #[test]
    fn test_alias_qualifies_columns() {
        let mut params = Vec::new();
        let sql = Filter::eq("id", "abc")
            .compile(&meta(), Some("root"), &mut params, &DefaultTypeMapper::default())
            .unwrap();
        assert_eq!(sql, "`root`.`id` = ?");
    }

    #[test]
    fn test_unknown_property_is_validation_error() {
        let mut params = Vec::new();
        let err = Filter::eq("colour", "red")
            .compile(&meta(), None, &mut params, &DefaultTypeMapper::default())
            .unwrap_err();
        assert!(matches!(err, PersistError::ValidationError(ref v) if v.code == "unknown_property"));
    }

    #[test]
    fn test_in_requires_list() {
        let mut params = Vec::new();
        let result = Filter::property("title", Operator::In, "x").compile(
            &meta(),
            None,
            &mut params,
            &DefaultTypeMapper::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_operator_parsing() {
        assert_eq!("=".parse::<Operator>().unwrap(), Operator::Eq);
        assert_eq!("NOT IN".parse::<Operator>().unwrap(), Operator::NotIn);
        assert_eq!("<>".parse::<Operator>().unwrap(), Operator::Ne);
        assert!("~".parse::<Operator>().is_err());
    }
}
