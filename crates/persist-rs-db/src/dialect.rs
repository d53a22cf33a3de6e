//! DDL rendering.
//!
//! The schema synchronizer only needs two primitives from a dialect:
//! rendering a `CREATE TABLE` and a `CREATE INDEX`. Both are idempotent
//! (`IF NOT EXISTS`) so that synchronization is purely additive.

use std::sync::Arc;

use persist_rs_core::Settings;

use crate::types::{DefaultTypeMapper, TypeMapper};

/// One column of a `CREATE TABLE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// The column name.
    pub name: String,
    /// The rendered SQL column type.
    pub sql_type: String,
    /// An optional column constraint (e.g. `PRIMARY KEY`).
    pub constraint: Option<String>,
}

impl ColumnDef {
    /// A column without constraints.
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
            constraint: None,
        }
    }

    /// Attaches a column constraint.
    #[must_use]
    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraint = Some(constraint.into());
        self
    }
}

/// Renders dialect-specific DDL.
pub trait Dialect: Send + Sync {
    /// The type mapper matching this dialect.
    fn type_mapper(&self) -> Arc<dyn TypeMapper>;

    /// Quotes an identifier.
    fn quote(&self, identifier: &str) -> String {
        format!("`{identifier}`")
    }

    /// Renders `CREATE TABLE IF NOT EXISTS`.
    fn create_table(&self, table: &str, columns: &[ColumnDef], constraints: &[String]) -> String;

    /// Renders `CREATE [UNIQUE] INDEX IF NOT EXISTS`.
    fn create_index(&self, table: &str, columns: &[String], unique: bool) -> String;

    /// Renders `DROP TABLE IF EXISTS`.
    fn drop_table(&self, table: &str) -> String {
        format!("DROP TABLE IF EXISTS {}", self.quote(table))
    }
}

/// The SQLite dialect.
#[derive(Debug, Clone, Default)]
pub struct SqliteDialect {
    mapper: Arc<DefaultTypeMapper>,
}

impl SqliteDialect {
    /// A dialect using the given type mapper.
    pub fn with_mapper(mapper: DefaultTypeMapper) -> Self {
        Self {
            mapper: Arc::new(mapper),
        }
    }

    /// A dialect whose mapper uses the column types from settings.
    pub fn from_settings(settings: &Settings) -> Self {
        Self::with_mapper(DefaultTypeMapper::from_settings(settings))
    }
}

impl Dialect for SqliteDialect {
    fn type_mapper(&self) -> Arc<dyn TypeMapper> {
        self.mapper.clone()
    }

    fn create_table(&self, table: &str, columns: &[ColumnDef], constraints: &[String]) -> String {
        let mut parts: Vec<String> = columns
            .iter()
            .map(|c| {
                let mut def = format!("{} {}", self.quote(&c.name), c.sql_type);
                if let Some(constraint) = &c.constraint {
                    def.push(' ');
                    def.push_str(constraint);
                }
                def
            })
            .collect();
        parts.extend(constraints.iter().cloned());
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({})",
            self.quote(table),
            parts.join(", ")
        )
    }

    fn create_index(&self, table: &str, columns: &[String], unique: bool) -> String {
        let name = format!("{table}__{}", columns.join("_"));
        let quoted: Vec<String> = columns.iter().map(|c| self.quote(c)).collect();
        format!(
            "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
            if unique { "UNIQUE " } else { "" },
            self.quote(&name),
            self.quote(table),
            quoted.join(", ")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_table() {
        let dialect = SqliteDialect::default();
        let sql = dialect.create_table(
            "Task",
            &[
                ColumnDef::new("title", "TEXT"),
                ColumnDef::new("id", "VARCHAR(32)").with_constraint("PRIMARY KEY"),
            ],
            &[],
        );
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS `Task` (`title` TEXT, `id` VARCHAR(32) PRIMARY KEY)"
        );
    }

    #[test]
    fn test_create_table_with_constraints() {
        let dialect = SqliteDialect::default();
        let sql = dialect.create_table(
            "A_b_B",
            &[ColumnDef::new("A_b", "VARCHAR(32)"), ColumnDef::new("B_a", "VARCHAR(32)")],
            &["UNIQUE (`A_b`, `B_a`)".to_string()],
        );
        assert!(sql.ends_with("`B_a` VARCHAR(32), UNIQUE (`A_b`, `B_a`))"));
    }

    #[test]
    fn test_create_index() {
        let dialect = SqliteDialect::default();
        assert_eq!(
            dialect.create_index("Task", &["title".into(), "done".into()], false),
            "CREATE INDEX IF NOT EXISTS `Task__title_done` ON `Task` (`title`, `done`)"
        );
        assert!(dialect
            .create_index("Task", &["slug".into()], true)
            .starts_with("CREATE UNIQUE INDEX"));
    }

    #[test]
    fn test_drop_table() {
        assert_eq!(
            SqliteDialect::default().drop_table("Task"),
            "DROP TABLE IF EXISTS `Task`"
        );
    }

    #[test]
    fn test_mapper_from_settings() {
        let settings = Settings {
            id_column_type: "CHAR(32)".into(),
            ..Settings::default()
        };
        assert_eq!(SqliteDialect::from_settings(&settings).type_mapper().id_type(), "CHAR(32)");
    }
}
