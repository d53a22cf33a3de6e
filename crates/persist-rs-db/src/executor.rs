//! The driver seam.
//!
//! The persistence core never talks to a database directly. It submits
//! parameterized statements to a [`Transaction`] obtained from a
//! [`Database`]; concrete drivers (see `persist-rs-db-backends`) implement
//! both traits. Result rows come back as [`Row`]s of column names and
//! [`Value`]s.

use std::sync::Arc;

use persist_rs_core::logging::statement_span;
use persist_rs_core::{PersistError, PersistResult};
use tracing::Instrument;

use crate::dialect::Dialect;
use crate::value::Value;

/// A single result row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    /// Creates a new row from column names and values.
    ///
    /// # Panics
    ///
    /// Panics if the number of columns does not match the number of values.
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        assert_eq!(
            columns.len(),
            values.len(),
            "Row column count must match value count"
        );
        Self { columns, values }
    }

    /// Returns the column names.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Returns the number of columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Returns `true` if the row has no columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Gets a typed value by column name.
    ///
    /// # Errors
    ///
    /// Returns an error if the column does not exist or the value cannot be
    /// converted to the requested type.
    pub fn get<T: FromValue>(&self, column: &str) -> PersistResult<T> {
        let value = self.get_value(column).ok_or_else(|| {
            PersistError::ConsistencyError(format!("Column '{column}' not found in row"))
        })?;
        T::from_value(value)
    }

    /// Returns a reference to the raw value at the given column name.
    pub fn get_value(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .map(|idx| &self.values[idx])
    }
}

/// Conversion from a [`Value`] to a concrete Rust type.
pub trait FromValue: Sized {
    /// Attempts to convert a value reference to this type.
    fn from_value(value: &Value) -> PersistResult<Self>;
}

impl FromValue for i64 {
    fn from_value(value: &Value) -> PersistResult<Self> {
        match value {
            Value::Int(i) => Ok(*i),
            Value::String(s) => s.parse().map_err(|e| {
                PersistError::ConsistencyError(format!("Expected Int, got '{s}': {e}"))
            }),
            _ => Err(PersistError::ConsistencyError(format!(
                "Expected Int, got {value:?}"
            ))),
        }
    }
}

impl FromValue for f64 {
    fn from_value(value: &Value) -> PersistResult<Self> {
        match value {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as f64),
            _ => Err(PersistError::ConsistencyError(format!(
                "Expected Float, got {value:?}"
            ))),
        }
    }
}

impl FromValue for String {
    fn from_value(value: &Value) -> PersistResult<Self> {
        match value {
            Value::String(s) => Ok(s.clone()),
            _ => Err(PersistError::ConsistencyError(format!(
                "Expected String, got {value:?}"
            ))),
        }
    }
}

impl FromValue for Value {
    fn from_value(value: &Value) -> PersistResult<Self> {
        Ok(value.clone())
    }
}

/// A statement and its positional parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    /// The SQL text with `?` placeholders.
    pub sql: String,
    /// The bound parameters, in placeholder order.
    pub params: Vec<Value>,
}

impl Statement {
    /// A statement without parameters.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// A statement with parameters.
    pub fn with_params(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }
}

/// An open transaction.
///
/// A transaction is finished by exactly one of [`commit`](Self::commit) or
/// [`rollback`](Self::rollback); using it afterwards is a
/// [`PersistError::TransactionError`].
#[async_trait::async_trait]
pub trait Transaction: Send + Sync {
    /// Executes a statement and returns its rows (empty for non-queries).
    async fn execute(&self, sql: &str, params: &[Value]) -> PersistResult<Vec<Row>>;

    /// Commits the transaction.
    async fn commit(&self) -> PersistResult<()>;

    /// Rolls the transaction back.
    async fn rollback(&self) -> PersistResult<()>;
}

/// A database that can open transactions.
#[async_trait::async_trait]
pub trait Database: Send + Sync {
    /// The dialect used to render DDL for this database.
    fn dialect(&self) -> Arc<dyn Dialect>;

    /// Opens a new transaction.
    async fn begin(&self) -> PersistResult<Box<dyn Transaction>>;
}

/// Executes one statement, logging it and any failure.
pub async fn execute_logged(
    tx: &dyn Transaction,
    sql: &str,
    params: &[Value],
) -> PersistResult<Vec<Row>> {
    async {
        tracing::debug!(params = params.len(), "executing statement");
        let result = tx.execute(sql, params).await;
        if let Err(e) = &result {
            tracing::error!(error = %e, "statement failed");
        }
        result
    }
    .instrument(statement_span(sql))
    .await
}

/// Executes statements in order, stopping at the first failure.
pub async fn execute_statements(tx: &dyn Transaction, statements: &[Statement]) -> PersistResult<()> {
    for statement in statements {
        execute_logged(tx, &statement.sql, &statement.params).await?;
    }
    Ok(())
}

/// Commits `tx` when `result` is a success and rolls it back otherwise.
///
/// Used for transactions the core opens on the caller's behalf.
pub async fn finish_implicit<T>(tx: Box<dyn Transaction>, result: PersistResult<T>) -> PersistResult<T> {
    match result {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!(error = %rollback_err, "rollback after failure also failed");
            }
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingDatabase;

    #[test]
    fn test_row_access() {
        let row = Row::new(
            vec!["cnt".into(), "name".into()],
            vec![Value::Int(3), Value::from("x")],
        );
        assert_eq!(row.len(), 2);
        assert_eq!(row.get::<i64>("cnt").unwrap(), 3);
        assert_eq!(row.get::<String>("name").unwrap(), "x");
        assert!(row.get::<String>("cnt").is_err());
        assert!(row.get::<Value>("missing").is_err());
    }

    #[test]
    #[should_panic(expected = "Row column count must match value count")]
    fn test_row_mismatch_panics() {
        let _ = Row::new(vec!["a".into()], vec![]);
    }

    #[tokio::test]
    async fn test_execute_statements_stops_at_failure() {
        let db = RecordingDatabase::new().failing_on("BROKEN");
        let tx = db.begin().await.unwrap();
        let statements = vec![
            Statement::new("CREATE TABLE a (x)"),
            Statement::new("BROKEN STATEMENT"),
            Statement::new("CREATE TABLE b (x)"),
        ];
        let err = execute_statements(tx.as_ref(), &statements).await.unwrap_err();
        assert!(matches!(err, PersistError::StatementError(_)));
        assert_eq!(db.executed(), vec!["CREATE TABLE a (x)", "BROKEN STATEMENT"]);
    }

    #[tokio::test]
    async fn test_finish_implicit() {
        let db = RecordingDatabase::new();
        let ok: PersistResult<u8> = Ok(1);
        assert_eq!(finish_implicit(db.begin().await.unwrap(), ok).await.unwrap(), 1);
        let failed: PersistResult<u8> = Err(PersistError::StatementError("x".into()));
        assert!(finish_implicit(db.begin().await.unwrap(), failed).await.is_err());
        assert_eq!(db.executed(), vec!["COMMIT", "ROLLBACK"]);
    }
}
