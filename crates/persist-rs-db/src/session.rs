//! The unit of work.
//!
//! A [`Session`] owns an identity map of the entities it has created or
//! loaded, the entities staged for removal, and the set of tables its schema
//! syncs have generated. Mutations stay in memory until a flush, which runs
//! the registered flush hooks, deletes the staged removals and then inserts
//! or updates every tracked entity whose state changed, writing staged
//! many-to-many links along the way. Queries flush first, so a session
//! always reads its own writes.
//!
//! Every operation that touches the database takes an optional transaction.
//! With `None` the session opens one, commits it on success and rolls it
//! back on failure.
//!
//! A session is meant for one logical flow at a time; concurrent callers
//! should use separate sessions.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use persist_rs_db::{Database, MetaRegistry, Session, Value};
//! # async fn demo(db: Arc<dyn Database>, registry: Arc<MetaRegistry>) -> persist_rs_core::PersistResult<()> {
//! let mut session = Session::new(db, registry);
//! session.schema_sync(None).await?;
//! let task = session.create("Task", &[("title", Value::from("write docs"))])?;
//! task.set("done", true)?;
//! session.flush(None).await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use persist_rs_core::{PersistError, PersistResult, ValidationError};
use persist_rs_signals::{Flushed, SIGNALS};

use crate::dialect::Dialect;
use crate::entity::{Entity, EntityRef, StagedLinks};
use crate::executor::{
    execute_logged, execute_statements, finish_implicit, Database, Row, Statement, Transaction,
};
use std::future::Future;
use std::pin::Pin;
use crate::filter::Filter;
use crate::identity_map::IdentityMap;
use crate::meta::{EntityMeta, MetaRegistry};
use crate::query::QueryCollection;
use crate::schema;
use crate::types::{FieldType, TypeMapper};
use crate::value::Value;

/// The future returned by a [`FlushHook`].
pub type HookFuture<'a> = Pin<Box<dyn Future<Output = PersistResult<()>> + Send + 'a>>;

/// A hook run at the start of every flush, before anything is written.
///
/// It receives the flush's transaction, so any SQL it issues commits or
/// rolls back together with the flush.
pub type FlushHook = Arc<dyn for<'a> Fn(&'a mut Session, &'a dyn Transaction) -> HookFuture<'a> + Send + Sync>;

/// A hook that may append DDL to a schema sync before it executes.
pub type SchemaHook = Arc<dyn Fn(&mut Vec<Statement>) + Send + Sync>;

/// How a flush sequences its writes and reports failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FlushMode {
    /// Removals first, then saves; the first failure stops the flush.
    #[default]
    Ordered,
    /// Saves then removals, all attempted; failures are logged and the
    /// first one is returned after the whole batch has been issued.
    BestEffort,
}

/// The unit of work.
pub struct Session {
    db: Arc<dyn Database>,
    registry: Arc<MetaRegistry>,
    dialect: Arc<dyn Dialect>,
    mapper: Arc<dyn TypeMapper>,
    tracked: IdentityMap,
    to_remove: IdentityMap,
    generated_tables: Vec<String>,
    flush_hooks: Vec<FlushHook>,
    schema_hooks: Vec<SchemaHook>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("tracked", &self.tracked.len())
            .field("to_remove", &self.to_remove.len())
            .field("generated_tables", &self.generated_tables)
            .field("flush_hooks", &self.flush_hooks.len())
            .field("schema_hooks", &self.schema_hooks.len())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Opens a session over `db` for the entities in `registry`.
    pub fn new(db: Arc<dyn Database>, registry: Arc<MetaRegistry>) -> Self {
        let dialect = db.dialect();
        let mapper = dialect.type_mapper();
        Self {
            db,
            registry,
            dialect,
            mapper,
            tracked: IdentityMap::new(),
            to_remove: IdentityMap::new(),
            generated_tables: Vec::new(),
            flush_hooks: Vec::new(),
            schema_hooks: Vec::new(),
        }
    }

    /// The entity metadata this session works with.
    pub fn registry(&self) -> &Arc<MetaRegistry> {
        &self.registry
    }

    /// The type mapper of the underlying database.
    pub fn mapper(&self) -> &Arc<dyn TypeMapper> {
        &self.mapper
    }

    /// The tracked instance for an id.
    pub fn get(&self, id: &str) -> Option<EntityRef> {
        self.tracked.get(id).cloned()
    }

    /// Whether an id is tracked.
    pub fn is_tracked(&self, id: &str) -> bool {
        self.tracked.contains(id)
    }

    /// Number of tracked entities.
    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    /// Tables created by this session's schema syncs.
    pub fn generated_tables(&self) -> &[String] {
        &self.generated_tables
    }

    // ── Entities ─────────────────────────────────────────────────────

    /// Creates and tracks a new entity with a fresh id.
    pub fn create(&mut self, entity: &str, data: &[(&str, Value)]) -> PersistResult<EntityRef> {
        let meta = self.registry.get(entity)?;
        if meta.is_mixin() {
            return Err(ValidationError::new(
                format!("cannot instantiate mixin '{entity}'"),
                "mixin_instantiation",
            )
            .with_subject(entity)
            .into());
        }
        let mut instance = Entity::new(Arc::clone(meta), uuid::Uuid::new_v4().simple().to_string());
        for (property, value) in data {
            instance.set(property, value.clone())?;
        }
        Ok(self.add(&EntityRef::new(instance)))
    }

    /// Tracks an entity, cancelling a staged removal of it.
    ///
    /// Returns the tracked instance, which is an earlier one if the id was
    /// already tracked.
    pub fn add(&mut self, entity: &EntityRef) -> EntityRef {
        self.to_remove.remove(&entity.id());
        self.tracked.insert(entity)
    }

    /// Stages an entity for deletion at the next flush and stops tracking it.
    pub fn remove(&mut self, entity: &EntityRef) {
        let id = entity.id();
        let staged = self.tracked.remove(&id).unwrap_or_else(|| entity.clone());
        self.to_remove.insert(&staged);
    }

    pub(crate) fn untrack(&mut self, id: &str) {
        self.tracked.remove(id);
        self.to_remove.remove(id);
    }

    /// Forgets every tracked entity, every staged removal and the record of
    /// generated tables.
    pub fn clean(&mut self) {
        self.tracked.clear();
        self.to_remove.clear();
        self.generated_tables.clear();
    }

    /// Loads one entity by id, returning the tracked instance when there is
    /// one.
    pub async fn load(
        &mut self,
        entity: &str,
        id: &str,
        tx: Option<&dyn Transaction>,
    ) -> PersistResult<Option<EntityRef>> {
        if let Some(tracked) = self.tracked.get(id) {
            return Ok(Some(tracked.clone()));
        }
        self.query(entity)?
            .filter(Filter::eq("id", id))
            .one(self, tx)
            .await
    }

    /// A collection of every `entity`.
    pub fn query(&self, entity: &str) -> PersistResult<QueryCollection> {
        self.registry.get(entity)?;
        Ok(QueryCollection::new(entity))
    }

    /// The collection behind a has-many relation of `owner`.
    pub fn relation(&self, owner: &EntityRef, relation: &str) -> PersistResult<QueryCollection> {
        let meta = Arc::clone(owner.read().meta());
        let rel = meta.find_has_many(relation).ok_or_else(|| -> PersistError {
            ValidationError::new(
                format!("{} has no has-many relation '{relation}'", meta.name),
                "unknown_relation",
            )
            .with_subject(format!("{}.{relation}", meta.name))
            .into()
        })?;
        if rel.many_to_many {
            let junction = self.registry.junction(&meta.name, relation)?;
            Ok(QueryCollection::many_to_many(
                &rel.target,
                relation,
                Some(owner.clone()),
                junction,
            ))
        } else {
            Ok(QueryCollection::one_to_many(&rel.target, owner.clone(), &rel.inverse))
        }
    }

    /// The targets of `entity.relation` that are linked to no owner at all.
    pub fn unlinked(&self, entity: &str, relation: &str) -> PersistResult<QueryCollection> {
        let junction = self.registry.junction(entity, relation)?;
        let meta = self.registry.get(entity)?;
        let target = meta
            .find_has_many(relation)
            .map(|rel| rel.target.clone())
            .unwrap_or_default();
        Ok(QueryCollection::many_to_many(&target, relation, None, junction))
    }

    // ── Transactions ─────────────────────────────────────────────────

    /// Opens a transaction.
    pub async fn transaction(&self) -> PersistResult<Box<dyn Transaction>> {
        self.db.begin().await
    }

    /// Flushes pending work into `tx` and commits it.
    ///
    /// If the flush fails the transaction is rolled back instead.
    pub async fn commit(&mut self, tx: Box<dyn Transaction>) -> PersistResult<()> {
        match self.flush_in(tx.as_ref(), FlushMode::Ordered).await {
            Ok(()) => {
                let result = tx.commit().await;
                if result.is_err() {
                    self.clean();
                }
                result
            }
            Err(e) => {
                if let Err(rollback_err) = self.rollback(tx).await {
                    tracing::warn!(error = %rollback_err, "rollback after failed flush also failed");
                }
                Err(e)
            }
        }
    }

    /// Rolls `tx` back and forgets everything the session was tracking.
    pub async fn rollback(&mut self, tx: Box<dyn Transaction>) -> PersistResult<()> {
        let result = tx.rollback().await;
        self.clean();
        result
    }

    /// Finishes a transaction the session opened itself.
    ///
    /// A failure rolls it back and, like [`rollback`](Self::rollback),
    /// forgets everything the session was tracking: entities written before
    /// the failing statement no longer match the database.
    pub(crate) async fn finish_implicit<T>(
        &mut self,
        tx: Box<dyn Transaction>,
        result: PersistResult<T>,
    ) -> PersistResult<T> {
        let result = finish_implicit(tx, result).await;
        if let Err(e) = &result {
            tracing::warn!(error = %e, "implicit transaction failed; clearing session");
            self.clean();
        }
        result
    }

    // ── Flush ────────────────────────────────────────────────────────

    /// Registers a hook run at the start of every flush.
    ///
    /// ```no_run
    /// # use persist_rs_db::Session;
    /// # fn demo(session: &mut Session) {
    /// session.add_flush_hook(|_session, tx| {
    ///     Box::pin(async move {
    ///         tx.execute("UPDATE `Counter` SET `flushes` = `flushes` + 1", &[]).await?;
    ///         Ok(())
    ///     })
    /// });
    /// # }
    /// ```
    pub fn add_flush_hook<F>(&mut self, hook: F)
    where
        F: for<'a> Fn(&'a mut Self, &'a dyn Transaction) -> HookFuture<'a> + Send + Sync + 'static,
    {
        self.flush_hooks.push(Arc::new(hook));
    }

    /// Writes every pending change, removals first.
    pub async fn flush(&mut self, tx: Option<&dyn Transaction>) -> PersistResult<()> {
        self.flush_with_mode(tx, FlushMode::Ordered).await
    }

    /// Writes every pending change using `mode`.
    pub async fn flush_with_mode(&mut self, tx: Option<&dyn Transaction>, mode: FlushMode) -> PersistResult<()> {
        match tx {
            Some(tx) => self.flush_in(tx, mode).await,
            None => {
                let tx = self.db.begin().await?;
                let result = self.flush_in(tx.as_ref(), mode).await;
                self.finish_implicit(tx, result).await
            }
        }
    }

    pub(crate) async fn flush_in(&mut self, tx: &dyn Transaction, mode: FlushMode) -> PersistResult<()> {
        let hooks = self.flush_hooks.clone();
        for hook in &hooks {
            hook(self, tx).await?;
        }

        let persist: Vec<EntityRef> = self.tracked.values().cloned().collect();
        let remove = self.to_remove.drain();
        let mut written = 0;

        match mode {
            FlushMode::Ordered => {
                for entity in &remove {
                    self.remove_entity(tx, entity).await?;
                }
                for entity in &persist {
                    if self.save(tx, entity).await? {
                        written += 1;
                    }
                }
            }
            FlushMode::BestEffort => {
                let mut first_error = None;
                for entity in &persist {
                    match self.save(tx, entity).await {
                        Ok(true) => written += 1,
                        Ok(false) => {}
                        Err(e) => {
                            tracing::warn!(id = %entity.id(), error = %e, "save failed during flush");
                            first_error.get_or_insert(e);
                        }
                    }
                }
                for entity in &remove {
                    if let Err(e) = self.remove_entity(tx, entity).await {
                        tracing::warn!(id = %entity.id(), error = %e, "removal failed during flush");
                        first_error.get_or_insert(e);
                    }
                }
                if let Some(e) = first_error {
                    return Err(e);
                }
            }
        }

        if written > 0 || !remove.is_empty() {
            tracing::debug!(persisted = written, removed = remove.len(), "flushed session");
            SIGNALS.flushed.send(&Flushed {
                persisted: written,
                removed: remove.len(),
            });
        }
        Ok(())
    }

    /// Inserts or updates one entity, writing its staged links first.
    ///
    /// Returns whether an entity row was written.
    ///
    /// If anything fails, the staged links are put back on the entity so
    /// that the next flush writes them again.
    async fn save(&self, tx: &dyn Transaction, entity: &EntityRef) -> PersistResult<bool> {
        let taken: Vec<(String, StagedLinks)> = {
            let state = entity.read();
            state
                .meta()
                .has_many
                .iter()
                .filter(|r| r.many_to_many)
                .filter_map(|r| state.staged_links(&r.name).map(|l| (r.name.clone(), l.clone())))
                .collect()
        };
        let result = self.save_row(tx, entity).await;
        if result.is_err() {
            let mut state = entity.write();
            for (relation, links) in taken {
                state.restore_links(&relation, links);
            }
        }
        result
    }

    async fn save_row(&self, tx: &dyn Transaction, entity: &EntityRef) -> PersistResult<bool> {
        let meta = Arc::clone(entity.read().meta());
        for rel in meta.has_many.iter().filter(|r| r.many_to_many) {
            let statements = self.relation(entity, &rel.name)?.persist_queries(self);
            execute_statements(tx, &statements).await?;
        }

        let (id, was_new, properties, params) = {
            let mut state = entity.write();
            let was_new = state.is_new();
            if was_new {
                state.mark_all_fields_dirty();
            }
            let properties = state.take_dirty();
            if !was_new && properties.is_empty() {
                return Ok(false);
            }
            let mut params = Vec::with_capacity(properties.len() + 1);
            for property in &properties {
                let field_type = meta.require_column(property)?;
                params.push(self.mapper.entity_to_db(&state.get(property), &field_type));
            }
            state.mark_inserted();
            (state.id().to_string(), was_new, properties, params)
        };

        let slot = |property: &str| {
            let field_type = meta.column_type(property).unwrap_or(FieldType::Id);
            self.mapper.output_placeholder("?", &field_type)
        };
        let (sql, params) = if was_new {
            let mut columns: Vec<String> = properties.iter().map(|p| format!("`{p}`")).collect();
            let mut slots: Vec<String> = properties.iter().map(|p| slot(p)).collect();
            columns.push("`id`".to_string());
            slots.push(slot("id"));
            let mut params = params;
            params.push(Value::String(id.clone()));
            (
                format!(
                    "INSERT INTO `{}` ({}) VALUES ({})",
                    meta.name,
                    columns.join(", "),
                    slots.join(", ")
                ),
                params,
            )
        } else {
            let assignments: Vec<String> = properties.iter().map(|p| format!("`{p}` = {}", slot(p))).collect();
            (
                format!(
                    "UPDATE `{}` SET {} WHERE `id` = {}",
                    meta.name,
                    assignments.join(", "),
                    self.mapper.id_literal(&id)
                ),
                params,
            )
        };

        if let Err(e) = execute_logged(tx, &sql, &params).await {
            entity.write().restore_pending(&properties, was_new);
            return Err(e);
        }
        Ok(true)
    }

    /// Deletes one entity row and every junction row referencing it.
    async fn remove_entity(&self, tx: &dyn Transaction, entity: &EntityRef) -> PersistResult<()> {
        let (meta, id) = {
            let state = entity.read();
            (Arc::clone(state.meta()), state.id().to_string())
        };
        let sql = format!("DELETE FROM `{}` WHERE `id` = {}", meta.name, self.mapper.id_literal(&id));
        execute_logged(tx, &sql, &[]).await?;
        execute_statements(tx, &self.junction_cleanup(&meta, &[id])?).await
    }

    /// Deletes the junction rows whose owner column holds one of `ids`.
    pub(crate) fn junction_cleanup(&self, meta: &EntityMeta, ids: &[String]) -> PersistResult<Vec<Statement>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let slot = self.mapper.output_placeholder("?", &FieldType::Id);
        let slots = vec![slot.as_str(); ids.len()].join(", ");
        let params: Vec<Value> = ids.iter().map(|id| Value::String(id.clone())).collect();

        let mut statements = Vec::new();
        for rel in meta.has_many.iter().filter(|r| r.many_to_many) {
            let junction = self.registry.junction(&meta.name, &rel.name)?;
            statements.push(Statement::with_params(
                format!(
                    "DELETE FROM `{}` WHERE `{}` IN ({slots})",
                    junction.table, junction.owner
                ),
                params.clone(),
            ));
        }
        Ok(statements)
    }

    /// Materializes the entity whose columns carry `prefix` in `row`.
    ///
    /// Returns `None` when the id column is null (an empty prefetch join).
    /// An already tracked instance is returned as is.
    pub(crate) fn row_to_entity(
        &mut self,
        meta: &Arc<EntityMeta>,
        row: &Row,
        prefix: &str,
    ) -> PersistResult<Option<EntityRef>> {
        let id = match row.get_value(&format!("{prefix}id")) {
            None | Some(Value::Null) => return Ok(None),
            Some(raw) => match self.mapper.db_to_entity(raw, &FieldType::Id)? {
                Value::String(id) => id,
                other => other.to_string(),
            },
        };
        if let Some(tracked) = self.tracked.get(&id) {
            return Ok(Some(tracked.clone()));
        }

        let mut data = HashMap::new();
        for (column, field_type) in meta.stored_columns() {
            if column == "id" {
                continue;
            }
            let raw = row
                .get_value(&format!("{prefix}{column}"))
                .cloned()
                .unwrap_or(Value::Null);
            data.insert(column, self.mapper.db_to_entity(&raw, &field_type)?);
        }
        let entity = EntityRef::new(Entity::loaded(Arc::clone(meta), id, data));
        Ok(Some(self.tracked.insert(&entity)))
    }

    // ── Schema ───────────────────────────────────────────────────────

    /// Registers a hook that may append DDL to every schema sync.
    pub fn add_schema_hook<F>(&mut self, hook: F)
    where
        F: Fn(&mut Vec<Statement>) + Send + Sync + 'static,
    {
        self.schema_hooks.push(Arc::new(hook));
    }

    /// Creates every missing table and index, returning the tables created.
    ///
    /// On failure the remaining DDL is abandoned and the failing statement's
    /// error is returned.
    pub async fn schema_sync(&mut self, tx: Option<&dyn Transaction>) -> PersistResult<Vec<String>> {
        match tx {
            Some(tx) => self.schema_sync_in(tx).await,
            None => {
                let tx = self.db.begin().await?;
                let result = self.schema_sync_in(tx.as_ref()).await;
                self.finish_implicit(tx, result).await
            }
        }
    }

    async fn schema_sync_in(&mut self, tx: &dyn Transaction) -> PersistResult<Vec<String>> {
        let plan = schema::plan(&self.registry, self.dialect.as_ref(), &self.generated_tables)?;
        let mut statements = plan.statements;
        for hook in &self.schema_hooks {
            hook(&mut statements);
        }

        let previous = self.generated_tables.clone();
        self.generated_tables.extend(plan.tables.iter().cloned());
        if let Err(e) = execute_statements(tx, &statements).await {
            self.generated_tables = previous;
            return Err(e);
        }
        tracing::info!(tables = plan.tables.len(), statements = statements.len(), "schema synchronized");
        Ok(plan.tables)
    }

    /// Every table a schema sync would create, without issuing anything.
    pub fn emulate_schema_sync(&self) -> PersistResult<Vec<String>> {
        Ok(schema::plan(&self.registry, self.dialect.as_ref(), &[])?.tables)
    }

    /// Drops every table the schema defines and forgets all session state.
    pub async fn reset(&mut self, tx: Option<&dyn Transaction>) -> PersistResult<()> {
        match tx {
            Some(tx) => self.reset_in(tx).await,
            None => {
                let tx = self.db.begin().await?;
                let result = self.reset_in(tx.as_ref()).await;
                self.finish_implicit(tx, result).await
            }
        }
    }

    async fn reset_in(&mut self, tx: &dyn Transaction) -> PersistResult<()> {
        let tables = self.emulate_schema_sync()?;
        for table in tables.iter().rev() {
            execute_logged(tx, &self.dialect.drop_table(table), &[]).await?;
        }
        self.clean();
        tracing::info!(tables = tables.len(), "schema reset");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingDatabase;
    use persist_rs_core::ErrorKind;

    fn registry() -> Arc<MetaRegistry> {
        let mut registry = MetaRegistry::new();
        registry
            .define(
                EntityMeta::builder("Task")
                    .field("title", FieldType::Text)
                    .field("done", FieldType::Bool)
                    .field("meta", FieldType::Json)
                    .build(),
            )
            .unwrap();
        registry
            .define(EntityMeta::builder("Tag").field("name", FieldType::Text).build())
            .unwrap();
        registry.many_to_many(("Task", "tags"), ("Tag", "tasks")).unwrap();
        registry
            .define(EntityMeta::builder("Shape").mixin().build())
            .unwrap();
        Arc::new(registry)
    }

    fn session(db: &RecordingDatabase) -> Session {
        Session::new(Arc::new(db.clone()), registry())
    }

    #[test]
    fn test_create_tracks_with_fresh_id() {
        let db = RecordingDatabase::new();
        let mut session = session(&db);
        let a = session.create("Task", &[("title", Value::from("x"))]).unwrap();
        let b = session.create("Task", &[]).unwrap();
        assert_eq!(a.id().len(), 32);
        assert_ne!(a.id(), b.id());
        assert!(a.is_new());
        assert!(session.is_tracked(&a.id()));
        assert_eq!(a.dirty_properties(), vec!["title"]);
    }

    #[test]
    fn test_create_rejects_mixins_and_unknown_properties() {
        let db = RecordingDatabase::new();
        let mut session = session(&db);
        let err = session.create("Shape", &[]).unwrap_err();
        assert!(matches!(err, PersistError::ValidationError(ref v) if v.code == "mixin_instantiation"));
        let err = session.create("Task", &[("colour", Value::from("red"))]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(session.tracked_count(), 0);
    }

    #[tokio::test]
    async fn test_flush_inserts_new_then_updates_dirty_only() {
        let db = RecordingDatabase::new();
        let mut session = session(&db);
        let task = session
            .create("Task", &[("title", Value::from("x")), ("done", Value::Bool(false))])
            .unwrap();
        session.flush(None).await.unwrap();

        let statements = db.statements();
        assert_eq!(
            statements[0].sql,
            "INSERT INTO `Task` (`title`, `done`, `meta`, `id`) VALUES (?, ?, ?, ?)"
        );
        assert_eq!(
            statements[0].params,
            vec![Value::from("x"), Value::Int(0), Value::Null, Value::from(task.id())]
        );
        assert_eq!(statements[1].sql, "COMMIT");
        assert!(!task.is_new());
        assert!(task.dirty_properties().is_empty());

        db.clear();
        session.flush(None).await.unwrap();
        assert_eq!(db.executed(), vec!["COMMIT"]);

        task.set("done", true).unwrap();
        session.flush(None).await.unwrap();
        let update = &db.statements()[1];
        assert_eq!(
            update.sql,
            format!("UPDATE `Task` SET `done` = ? WHERE `id` = '{}'", task.id())
        );
        assert_eq!(update.params, vec![Value::Int(1)]);
    }

    #[tokio::test]
    async fn test_json_field_is_serialized() {
        let db = RecordingDatabase::new();
        let mut session = session(&db);
        session
            .create("Task", &[("meta", Value::Json(serde_json::json!({"a": [1, 2]})))])
            .unwrap();
        session.flush(None).await.unwrap();
        // Given properties come first, then the remaining fields.
        assert_eq!(db.statements()[0].params[0], Value::from(r#"{"a":[1,2]}"#));
    }

    #[tokio::test]
    async fn test_ordered_flush_removes_before_saving() {
        let db = RecordingDatabase::new();
        let mut session = session(&db);
        let old = session.create("Task", &[]).unwrap();
        session.flush(None).await.unwrap();
        db.clear();

        session.remove(&old);
        assert!(!session.is_tracked(&old.id()));
        let new = session.create("Task", &[]).unwrap();
        session.flush(None).await.unwrap();

        let executed = db.executed();
        assert_eq!(
            executed[0],
            format!("DELETE FROM `Task` WHERE `id` = '{}'", old.id())
        );
        assert_eq!(executed[1], "DELETE FROM `Tag_tasks_Task` WHERE `Tag_tasks` IN (?)");
        assert!(executed[2].starts_with("INSERT INTO `Task`"));
        assert_eq!(db.statements()[2].params.last(), Some(&Value::from(new.id())));

        // A staged removal is written once.
        db.clear();
        session.flush(None).await.unwrap();
        assert_eq!(db.executed(), vec!["COMMIT"]);
    }

    #[tokio::test]
    async fn test_add_cancels_staged_removal() {
        let db = RecordingDatabase::new();
        let mut session = session(&db);
        let task = session.create("Task", &[]).unwrap();
        session.remove(&task);
        session.add(&task);
        session.flush(None).await.unwrap();
        assert!(db.executed()[0].starts_with("INSERT INTO `Task`"));
        assert!(!db.executed().iter().any(|s| s.starts_with("DELETE")));
    }

    #[tokio::test]
    async fn test_ordered_flush_stops_at_first_failure() {
        let db = RecordingDatabase::new().failing_on("INSERT INTO `Task`");
        let mut session = session(&db);
        let task = session.create("Task", &[("title", Value::from("x"))]).unwrap();
        session.create("Tag", &[]).unwrap();

        let err = session.flush(None).await.unwrap_err();
        assert!(matches!(err, PersistError::StatementError(_)));
        assert!(!db.executed().iter().any(|s| s.starts_with("INSERT INTO `Tag`")));
        assert_eq!(db.executed().last().unwrap(), "ROLLBACK");
        // The failed insert is put back on the instance, but the rolled back
        // session forgets it.
        assert!(task.is_new());
        assert!(task.dirty_properties().contains(&"title".to_string()));
        assert_eq!(session.tracked_count(), 0);
        assert!(!session.is_tracked(&task.id()));
    }

    #[tokio::test]
    async fn test_failed_implicit_flush_clears_session() {
        let db = RecordingDatabase::new().failing_on("INSERT INTO `Tag`");
        let mut session = session(&db);
        let task = session.create("Task", &[("title", Value::from("x"))]).unwrap();
        session.create("Tag", &[]).unwrap();

        assert!(session.flush(None).await.is_err());
        // The task row went out before the failure and was rolled back with it.
        assert!(db.executed().iter().any(|s| s.starts_with("INSERT INTO `Task`")));
        assert_eq!(session.tracked_count(), 0);
        assert!(session.get(&task.id()).is_none());

        db.set_failure(None);
        db.clear();
        session.flush(None).await.unwrap();
        assert_eq!(db.executed(), vec!["COMMIT"]);
    }

    #[tokio::test]
    async fn test_failed_link_write_keeps_links_staged() {
        let db = RecordingDatabase::new().failing_on("INSERT OR IGNORE");
        let mut session = session(&db);
        let task = session.create("Task", &[]).unwrap();
        let tag = session.create("Tag", &[]).unwrap();
        session.relation(&task, "tags").unwrap().add(&mut session, &tag).unwrap();

        let tx = session.transaction().await.unwrap();
        assert!(session.flush(Some(tx.as_ref())).await.is_err());
        let staged = task.read().staged_links("tags").cloned().unwrap();
        assert_eq!(staged.added, vec![tag.key()]);

        db.set_failure(None);
        db.clear();
        session.flush(Some(tx.as_ref())).await.unwrap();
        assert_eq!(
            db.executed().iter().filter(|s| s.starts_with("INSERT OR IGNORE")).count(),
            1
        );
        assert!(task.read().staged_links("tags").is_none());
    }

    #[tokio::test]
    async fn test_best_effort_flush_attempts_everything() {
        let db = RecordingDatabase::new().failing_on("INSERT INTO `Task`");
        let mut session = session(&db);
        session.create("Task", &[]).unwrap();
        session.create("Tag", &[]).unwrap();

        let err = session
            .flush_with_mode(None, FlushMode::BestEffort)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Statement);
        assert!(db.executed().iter().any(|s| s.starts_with("INSERT INTO `Tag`")));
    }

    #[tokio::test]
    async fn test_links_are_written_before_the_owner_row() {
        let db = RecordingDatabase::new();
        let mut session = session(&db);
        let task = session.create("Task", &[]).unwrap();
        let tag = session.create("Tag", &[]).unwrap();
        session.relation(&task, "tags").unwrap().add(&mut session, &tag).unwrap();
        session.flush(None).await.unwrap();

        let executed = db.executed();
        let link = executed.iter().position(|s| s.starts_with("INSERT OR IGNORE")).unwrap();
        let owner = executed.iter().position(|s| s.starts_with("INSERT INTO `Task`")).unwrap();
        assert!(link < owner);
        assert_eq!(executed.iter().filter(|s| s.starts_with("INSERT OR IGNORE")).count(), 1);
    }

    #[tokio::test]
    async fn test_flush_hooks_run_first() {
        let db = RecordingDatabase::new();
        let mut session = session(&db);
        let task = session.create("Task", &[]).unwrap();
        session.flush(None).await.unwrap();

        session.add_flush_hook(|session, tx| {
            Box::pin(async move {
                tx.execute("UPDATE `Audit` SET `flushes` = `flushes` + 1", &[]).await?;
                let tasks: Vec<EntityRef> = session.tracked.values().cloned().collect();
                for task in tasks {
                    task.set("title", "stamped")?;
                }
                Ok(())
            })
        });
        db.clear();
        session.flush(None).await.unwrap();
        assert_eq!(task.get("title"), Value::from("stamped"));
        let executed = db.executed();
        assert!(executed[0].starts_with("UPDATE `Audit`"));
        assert!(executed[1].starts_with("UPDATE `Task` SET `title` = ?"));
        assert_eq!(executed.last().unwrap(), "COMMIT");
    }

    #[tokio::test]
    async fn test_load_prefers_tracked_instance() {
        let db = RecordingDatabase::new();
        let mut session = session(&db);
        let task = session.create("Task", &[]).unwrap();
        let loaded = session.load("Task", &task.id(), None).await.unwrap().unwrap();
        assert!(EntityRef::ptr_eq(&task, &loaded));
        assert!(db.executed().is_empty());

        assert!(session.load("Task", "missing", None).await.unwrap().is_none());
        assert!(db
            .executed()
            .iter()
            .any(|s| s.contains("WHERE `root`.`id` = ?") && s.ends_with("LIMIT 1")));
    }

    #[tokio::test]
    async fn test_schema_sync_once_and_hooks() {
        let db = RecordingDatabase::new();
        let mut session = session(&db);
        session.add_schema_hook(|statements: &mut Vec<Statement>| {
            statements.push(Statement::new("CREATE VIEW IF NOT EXISTS `open_tasks` AS SELECT 1"));
        });
        let created = session.schema_sync(None).await.unwrap();
        assert_eq!(created, vec!["Tag_tasks_Task", "Task", "Tag"]);
        assert_eq!(session.generated_tables(), created.as_slice());
        let executed = db.executed();
        assert_eq!(
            executed.iter().filter(|s| s.contains("CREATE TABLE IF NOT EXISTS `Tag_tasks_Task`")).count(),
            1
        );
        assert_eq!(executed[executed.len() - 2], "CREATE VIEW IF NOT EXISTS `open_tasks` AS SELECT 1");

        db.clear();
        assert!(session.schema_sync(None).await.unwrap().is_empty());
        assert!(!db.executed().iter().any(|s| s.starts_with("CREATE TABLE")));
    }

    #[tokio::test]
    async fn test_failed_schema_sync_keeps_generated_set() {
        let db = RecordingDatabase::new().failing_on("CREATE TABLE IF NOT EXISTS `Task`");
        let mut session = session(&db);
        assert!(session.schema_sync(None).await.is_err());
        assert!(session.generated_tables().is_empty());
        assert!(!db.executed().iter().any(|s| s.contains("`Tag` (")));

        db.set_failure(None);
        assert_eq!(session.schema_sync(None).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_emulate_issues_nothing() {
        let db = RecordingDatabase::new();
        let session = session(&db);
        assert_eq!(
            session.emulate_schema_sync().unwrap(),
            vec!["Tag_tasks_Task", "Task", "Tag"]
        );
        assert!(db.executed().is_empty());
        assert!(session.generated_tables().is_empty());
    }

    #[tokio::test]
    async fn test_reset_drops_in_reverse_and_cleans() {
        let db = RecordingDatabase::new();
        let mut session = session(&db);
        session.schema_sync(None).await.unwrap();
        session.create("Task", &[]).unwrap();
        db.clear();

        session.reset(None).await.unwrap();
        assert_eq!(
            db.executed(),
            vec![
                "DROP TABLE IF EXISTS `Tag`",
                "DROP TABLE IF EXISTS `Task`",
                "DROP TABLE IF EXISTS `Tag_tasks_Task`",
                "COMMIT",
            ]
        );
        assert_eq!(session.tracked_count(), 0);
        assert!(session.generated_tables().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_clears_session() {
        let db = RecordingDatabase::new();
        let mut session = session(&db);
        let tx = session.transaction().await.unwrap();
        session.schema_sync(Some(tx.as_ref())).await.unwrap();
        session.create("Task", &[]).unwrap();
        session.flush(Some(tx.as_ref())).await.unwrap();

        session.rollback(tx).await.unwrap();
        assert_eq!(session.tracked_count(), 0);
        assert!(session.generated_tables().is_empty());
        assert_eq!(db.executed().last().unwrap(), "ROLLBACK");
    }

    #[tokio::test]
    async fn test_commit_flushes_then_commits() {
        let db = RecordingDatabase::new();
        let mut session = session(&db);
        let tx = session.transaction().await.unwrap();
        let task = session.create("Task", &[]).unwrap();
        session.commit(tx).await.unwrap();
        assert_eq!(db.executed().len(), 2);
        assert!(db.executed()[0].starts_with("INSERT INTO `Task`"));
        assert_eq!(db.executed()[1], "COMMIT");
        assert!(session.is_tracked(&task.id()));
    }
}
