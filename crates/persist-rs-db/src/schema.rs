//! Schema synchronization.
//!
//! [`plan`] walks the registry once and renders the DDL for every table that
//! has not been generated yet: one table per concrete entity (field columns,
//! a column and index per has-one relation, declared indexes, and a trailing
//! `id` primary key) and one junction table per many-to-many relation.
//!
//! A junction table is reachable from both sides of its relation, so it is
//! keyed by name and only rendered from a side whose inverse actually points
//! back at the entity being visited. For relations inherited from a mixin
//! that side is the mixin itself, which keeps the columns named after the
//! mixin no matter which member is visited first. Mixins get no table of
//! their own.
//!
//! Statements are additive (`IF NOT EXISTS`); nothing is ever altered or
//! dropped here. [`Session::schema_sync`](crate::session::Session::schema_sync)
//! executes a plan and [`Session::reset`](crate::session::Session::reset)
//! uses an emulated one to find the tables to drop.

use persist_rs_core::PersistResult;

use crate::dialect::{ColumnDef, Dialect};
use crate::executor::Statement;
use crate::meta::MetaRegistry;
use crate::types::FieldType;

/// The outcome of planning a schema sync.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SchemaPlan {
    /// DDL in execution order.
    pub statements: Vec<Statement>,
    /// Tables this plan creates, in creation order.
    pub tables: Vec<String>,
}

/// Plans the DDL for every table not listed in `generated`.
pub fn plan(registry: &MetaRegistry, dialect: &dyn Dialect, generated: &[String]) -> PersistResult<SchemaPlan> {
    let mapper = dialect.type_mapper();
    let id_type = mapper.id_type().to_string();
    let class_type = mapper.class_name_type().to_string();
    let mut plan = SchemaPlan::default();
    let is_generated = |plan: &SchemaPlan, table: &str| {
        generated.iter().chain(plan.tables.iter()).any(|t| t == table)
    };

    for meta in registry.iter() {
        for rel in meta.has_many.iter().filter(|r| r.many_to_many) {
            let Some(table) = rel.table_name.as_deref() else {
                continue;
            };
            if is_generated(&plan, table) {
                continue;
            }
            let owns = registry
                .lookup(&rel.target)
                .and_then(|target| target.find_has_many(&rel.inverse))
                .is_some_and(|inverse| inverse.target == meta.name);
            if !owns {
                continue;
            }

            let junction = registry.junction(&meta.name, &rel.name)?;
            let mut columns = vec![
                ColumnDef::new(&junction.member, &id_type),
                ColumnDef::new(&junction.owner, &id_type),
            ];
            for class_column in [&junction.owner_class, &junction.member_class].into_iter().flatten() {
                columns.push(ColumnDef::new(class_column, &class_type));
            }
            let unique = format!(
                "UNIQUE ({}, {})",
                dialect.quote(&junction.member),
                dialect.quote(&junction.owner)
            );
            plan.statements
                .push(Statement::new(dialect.create_table(table, &columns, &[unique])));
            plan.statements.push(Statement::new(dialect.create_index(
                table,
                &[junction.member.clone()],
                false,
            )));
            plan.statements.push(Statement::new(dialect.create_index(
                table,
                &[junction.owner.clone()],
                false,
            )));
            plan.tables.push(table.to_string());
        }

        if meta.is_mixin() || is_generated(&plan, &meta.name) {
            continue;
        }

        let mut columns: Vec<ColumnDef> = meta
            .fields
            .iter()
            .map(|(name, ty)| ColumnDef::new(name, mapper.column_type(ty)))
            .collect();
        let mut indexes = Vec::new();
        for rel in &meta.has_one {
            columns.push(ColumnDef::new(&rel.name, mapper.column_type(&FieldType::Id)));
            indexes.push(dialect.create_index(&meta.name, &[rel.name.clone()], false));
        }
        for index in &meta.indexes {
            indexes.push(dialect.create_index(&meta.name, &index.columns, index.unique));
        }
        columns.push(ColumnDef::new("id", &id_type).with_constraint("PRIMARY KEY"));

        plan.statements
            .push(Statement::new(dialect.create_table(&meta.name, &columns, &[])));
        plan.statements.extend(indexes.into_iter().map(Statement::new));
        plan.tables.push(meta.name.clone());
    }

    tracing::debug!(
        tables = plan.tables.len(),
        statements = plan.statements.len(),
        "planned schema sync"
    );
    Ok(plan)
}
