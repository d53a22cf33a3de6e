//! SQLite database backend using `rusqlite`.
//!
//! This module provides [`SqliteBackend`], which implements the
//! [`Database`] trait on one `rusqlite` connection, and
//! [`SqliteTransaction`], the handle returned by [`Database::begin`].
//! Every statement runs via `tokio::task::spawn_blocking` so the async
//! runtime is never blocked.
//!
//! Features:
//! - Configurable journal mode (WAL by default) for file databases
//! - In-memory database support via `:memory:` path (great for testing)
//! - Simple `Mutex`-based concurrency control; one transaction at a time

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use persist_rs_core::{PersistError, PersistResult, Settings};
use persist_rs_db::{Database, Dialect, Row, SqliteDialect, Transaction, Value};
use tokio::sync::Mutex;

/// A SQLite database.
///
/// Uses `rusqlite` with a `Mutex`-guarded connection. Transactions are
/// plain `BEGIN` / `COMMIT` / `ROLLBACK` on that connection, so only one
/// may be open at a time.
pub struct SqliteBackend {
    /// The path to the database file (or ":memory:").
    path: PathBuf,
    /// The connection, guarded by an async mutex.
    conn: Arc<Mutex<rusqlite::Connection>>,
    dialect: Arc<SqliteDialect>,
}

impl SqliteBackend {
    /// Opens a SQLite database at the given path with the WAL journal.
    ///
    /// If the path is `:memory:`, an in-memory database is created.
    pub fn open(path: impl Into<PathBuf>) -> PersistResult<Self> {
        Self::open_with(path.into(), "WAL", SqliteDialect::default())
    }

    /// Opens an in-memory database (convenience constructor).
    pub fn memory() -> PersistResult<Self> {
        Self::open(":memory:")
    }

    /// Opens the database configured in `settings`, with column types
    /// taken from the settings as well.
    pub fn from_settings(settings: &Settings) -> PersistResult<Self> {
        Self::open_with(
            PathBuf::from(&settings.database.path),
            &settings.database.journal_mode,
            SqliteDialect::from_settings(settings),
        )
    }

    fn open_with(path: PathBuf, journal_mode: &str, dialect: SqliteDialect) -> PersistResult<Self> {
        let in_memory = path.to_str() == Some(":memory:");
        let conn = if in_memory {
            rusqlite::Connection::open_in_memory()
        } else {
            rusqlite::Connection::open(&path)
        }
        .map_err(|e| PersistError::ConfigurationError(format!("SQLite open failed: {e}")))?;

        if !in_memory {
            if journal_mode.is_empty() || !journal_mode.chars().all(|c| c.is_ascii_alphabetic()) {
                return Err(PersistError::ConfigurationError(format!(
                    "invalid journal mode '{journal_mode}'"
                )));
            }
            conn.execute_batch(&format!("PRAGMA journal_mode={journal_mode};"))
                .map_err(|e| {
                    PersistError::ConfigurationError(format!("Failed to set journal mode: {e}"))
                })?;
        }
        tracing::info!(path = %path.display(), "opened SQLite database");

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
            dialect: Arc::new(dialect),
        })
    }

    /// Returns the database file path.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

/// Binds persist `Value`s to a `rusqlite` statement.
fn bind_params(stmt: &mut rusqlite::Statement<'_>, params: &[Value]) -> PersistResult<()> {
    for (i, param) in params.iter().enumerate() {
        let idx = i + 1;
        match param {
            Value::Null => stmt.raw_bind_parameter(idx, rusqlite::types::Null),
            Value::Bool(b) => stmt.raw_bind_parameter(idx, i64::from(*b)),
            Value::Int(v) => stmt.raw_bind_parameter(idx, v),
            Value::Float(v) => stmt.raw_bind_parameter(idx, v),
            Value::String(s) => stmt.raw_bind_parameter(idx, s.as_str()),
            Value::Bytes(b) => stmt.raw_bind_parameter(idx, b.as_slice()),
            Value::DateTime(dt) => stmt.raw_bind_parameter(idx, dt.timestamp()),
            Value::Json(j) => stmt.raw_bind_parameter(idx, j.to_string().as_str()),
            Value::Entity(key) => stmt.raw_bind_parameter(idx, key.id.as_str()),
            Value::List(_) => {
                return Err(PersistError::StatementError(format!(
                    "cannot bind a list to parameter {idx}"
                )))
            }
        }
        .map_err(|e| PersistError::StatementError(format!("Bind error: {e}")))?;
    }
    Ok(())
}

/// Converts a `rusqlite::Row` to our generic `Row`.
fn convert_row(sqlite_row: &rusqlite::Row<'_>, column_names: &[String]) -> Row {
    let values: Vec<Value> = (0..column_names.len())
        .map(|i| {
            let val_ref = sqlite_row.get_ref(i).unwrap_or(rusqlite::types::ValueRef::Null);
            match val_ref {
                rusqlite::types::ValueRef::Null => Value::Null,
                rusqlite::types::ValueRef::Integer(v) => Value::Int(v),
                rusqlite::types::ValueRef::Real(v) => Value::Float(v),
                rusqlite::types::ValueRef::Text(b) => {
                    Value::String(String::from_utf8_lossy(b).to_string())
                }
                rusqlite::types::ValueRef::Blob(b) => Value::Bytes(b.to_vec()),
            }
        })
        .collect();
    Row::new(column_names.to_vec(), values)
}

/// Runs one statement on a locked connection.
///
/// Statements that produce columns are read to completion; anything else
/// is executed and yields no rows.
fn run(conn: &rusqlite::Connection, sql: &str, params: &[Value]) -> PersistResult<Vec<Row>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| PersistError::StatementError(format!("{e}")))?;
    bind_params(&mut stmt, params)?;

    if stmt.column_count() == 0 {
        stmt.raw_execute()
            .map_err(|e| PersistError::StatementError(format!("{e}")))?;
        return Ok(Vec::new());
    }

    let column_names: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
    let mut raw_rows = stmt.raw_query();
    let mut rows = Vec::new();
    while let Some(row) = raw_rows
        .next()
        .map_err(|e| PersistError::StatementError(format!("{e}")))?
    {
        rows.push(convert_row(row, &column_names));
    }
    Ok(rows)
}

async fn run_blocking(
    conn: &Arc<Mutex<rusqlite::Connection>>,
    sql: &str,
    params: &[Value],
) -> PersistResult<Vec<Row>> {
    let conn = Arc::clone(conn);
    let sql = sql.to_string();
    let params = params.to_vec();

    tokio::task::spawn_blocking(move || {
        let conn = conn.blocking_lock();
        run(&conn, &sql, &params)
    })
    .await
    .map_err(|e| PersistError::StatementError(format!("Task join error: {e}")))?
}

#[async_trait::async_trait]
impl Database for SqliteBackend {
    fn dialect(&self) -> Arc<dyn Dialect> {
        self.dialect.clone()
    }

    async fn begin(&self) -> PersistResult<Box<dyn Transaction>> {
        run_blocking(&self.conn, "BEGIN", &[])
            .await
            .map_err(|e| PersistError::TransactionError(format!("BEGIN failed: {e}")))?;
        Ok(Box::new(SqliteTransaction {
            conn: Arc::clone(&self.conn),
            finished: AtomicBool::new(false),
        }))
    }
}

/// An open SQLite transaction.
///
/// Dropping a transaction that was neither committed nor rolled back rolls
/// it back.
pub struct SqliteTransaction {
    conn: Arc<Mutex<rusqlite::Connection>>,
    finished: AtomicBool,
}

impl SqliteTransaction {
    fn ensure_open(&self) -> PersistResult<()> {
        if self.finished.load(Ordering::SeqCst) {
            return Err(PersistError::TransactionError(
                "transaction already finished".to_string(),
            ));
        }
        Ok(())
    }

    async fn finish(&self, sql: &str) -> PersistResult<()> {
        self.ensure_open()?;
        self.finished.store(true, Ordering::SeqCst);
        run_blocking(&self.conn, sql, &[])
            .await
            .map(|_| ())
            .map_err(|e| PersistError::TransactionError(format!("{sql} failed: {e}")))
    }
}

#[async_trait::async_trait]
impl Transaction for SqliteTransaction {
    async fn execute(&self, sql: &str, params: &[Value]) -> PersistResult<Vec<Row>> {
        self.ensure_open()?;
        run_blocking(&self.conn, sql, params).await
    }

    async fn commit(&self) -> PersistResult<()> {
        self.finish("COMMIT").await
    }

    async fn rollback(&self) -> PersistResult<()> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if self.finished.load(Ordering::SeqCst) {
            return;
        }
        match self.conn.try_lock() {
            Ok(conn) => {
                if let Err(e) = conn.execute_batch("ROLLBACK") {
                    tracing::warn!(error = %e, "rollback of dropped transaction failed");
                }
            }
            Err(_) => tracing::warn!("dropped transaction could not be rolled back: connection busy"),
        }
    }
}
