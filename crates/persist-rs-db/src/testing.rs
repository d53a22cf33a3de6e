//! A statement-recording database double for unit tests.

use std::sync::{Arc, Mutex};

use persist_rs_core::{PersistError, PersistResult};

use crate::dialect::{Dialect, SqliteDialect};
use crate::executor::{Database, Row, Statement, Transaction};
use crate::value::Value;

#[derive(Default)]
struct Shared {
    log: Vec<Statement>,
    responses: Vec<(String, Vec<Row>)>,
    fail_on: Option<String>,
}

/// Records every statement and answers queries with canned rows.
#[derive(Clone, Default)]
pub struct RecordingDatabase {
    shared: Arc<Mutex<Shared>>,
}

impl RecordingDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every statement containing `pattern` fail.
    #[must_use]
    pub fn failing_on(self, pattern: &str) -> Self {
        self.set_failure(Some(pattern));
        self
    }

    pub fn set_failure(&self, pattern: Option<&str>) {
        self.shared.lock().unwrap().fail_on = pattern.map(ToString::to_string);
    }

    /// Answers statements containing `pattern` with `rows`.
    pub fn respond(&self, pattern: &str, rows: Vec<Row>) {
        self.shared
            .lock()
            .unwrap()
            .responses
            .push((pattern.to_string(), rows));
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.shared.lock().unwrap().log.clone()
    }

    pub fn executed(&self) -> Vec<String> {
        self.statements().into_iter().map(|s| s.sql).collect()
    }

    pub fn clear(&self) {
        self.shared.lock().unwrap().log.clear();
    }
}

/// Builds a row from `(column, value)` pairs.
pub fn row(pairs: &[(&str, Value)]) -> Row {
    Row::new(
        pairs.iter().map(|(c, _)| (*c).to_string()).collect(),
        pairs.iter().map(|(_, v)| v.clone()).collect(),
    )
}

struct RecordingTransaction {
    shared: Arc<Mutex<Shared>>,
}

#[async_trait::async_trait]
impl Transaction for RecordingTransaction {
    async fn execute(&self, sql: &str, params: &[Value]) -> PersistResult<Vec<Row>> {
        let mut shared = self.shared.lock().unwrap();
        shared.log.push(Statement::with_params(sql, params.to_vec()));
        if shared.fail_on.as_deref().is_some_and(|p| sql.contains(p)) {
            return Err(PersistError::StatementError(format!("rejected: {sql}")));
        }
        Ok(shared
            .responses
            .iter()
            .find(|(pattern, _)| sql.contains(pattern.as_str()))
            .map(|(_, rows)| rows.clone())
            .unwrap_or_default())
    }

    async fn commit(&self) -> PersistResult<()> {
        self.shared.lock().unwrap().log.push(Statement::new("COMMIT"));
        Ok(())
    }

    async fn rollback(&self) -> PersistResult<()> {
        self.shared.lock().unwrap().log.push(Statement::new("ROLLBACK"));
        Ok(())
    }
}

#[async_trait::async_trait]
impl Database for RecordingDatabase {
    fn dialect(&self) -> Arc<dyn Dialect> {
        Arc::new(SqliteDialect::default())
    }

    async fn begin(&self) -> PersistResult<Box<dyn Transaction>> {
        Ok(Box::new(RecordingTransaction {
            shared: Arc::clone(&self.shared),
        }))
    }
}
