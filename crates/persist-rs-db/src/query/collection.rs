//! Query collections.
//!
//! A [`QueryCollection`] is a lazy description of a set of entities: the
//! target entity, a [`Filter`], ordering, paging and the has-one relations to
//! prefetch. Nothing is executed until a terminal method is awaited
//! ([`list`](QueryCollection::list), [`count`](QueryCollection::count),
//! [`destroy_all`](QueryCollection::destroy_all), [`one`](QueryCollection::one)).
//! Every terminal method flushes the session first so that queries observe
//! the session's own pending writes.
//!
//! Collections returned by [`Session::relation`] are scoped to an owner. For
//! one-to-many relations that is just a filter on the inverse column; for
//! many-to-many relations the query joins the junction table and
//! [`add`](QueryCollection::add) / [`remove`](QueryCollection::remove) stage
//! link changes on the owner until the next flush.
//!
//! When the target is a mixin the query runs once per concrete member and
//! the results are merged and sorted in memory. Paging is applied per member,
//! not across the merged list.
//!
//! # Examples
//!
//! ```
//! use persist_rs_db::filter::{Filter, Operator};
//! use persist_rs_db::query::QueryCollection;
//!
//! // Collections are lazy; building one runs nothing.
//! let open_tasks = QueryCollection::new("Task")
//!     .filter(Filter::eq("done", false))
//!     .filter(Filter::property("title", Operator::Like, "report"))
//!     .order("title", true)
//!     .limit(10);
//! assert_eq!(open_tasks.entity(), "Task");
//! ```

use std::cmp::Ordering;
use std::sync::Arc;

use persist_rs_core::{PersistError, PersistResult, ValidationError};
use persist_rs_signals::{CollectionListed, EntityRemoved, SIGNALS};

use crate::entity::EntityRef;
use crate::executor::{execute_logged, execute_statements, Statement, Transaction};
use crate::filter::Filter;
use crate::meta::{EntityMeta, JunctionColumns};
use crate::session::{FlushMode, Session};
use crate::types::{FieldType, TypeMapper};
use crate::value::Value;

const ROOT: &str = "root";
const JUNCTION: &str = "mtm";

/// One `ORDER BY` column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderColumn {
    /// The property to order by.
    pub property: String,
    /// Ascending when `true`.
    pub ascending: bool,
    /// Compare text exactly instead of lower-casing it first.
    pub case_sensitive: bool,
}

#[derive(Debug, Clone)]
enum RelationScope {
    OneToMany {
        owner: EntityRef,
        inverse: String,
    },
    ManyToMany {
        relation: String,
        /// `None` for the collection of entities linked to nothing.
        owner: Option<EntityRef>,
        junction: JunctionColumns,
    },
}

/// A lazy query over one entity type.
#[derive(Debug, Clone)]
pub struct QueryCollection {
    entity: String,
    filter: Filter,
    order: Vec<OrderColumn>,
    skip: usize,
    limit: Option<usize>,
    reverse: bool,
    prefetch: Vec<String>,
    scope: Option<RelationScope>,
}

fn not_a_relation(entity: &str) -> PersistError {
    ValidationError::new(
        format!("this {entity} collection is not bound to an owner"),
        "not_a_relation",
    )
    .with_subject(entity)
    .into()
}

impl QueryCollection {
    /// A collection of every `entity`.
    pub fn new(entity: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            filter: Filter::Null,
            order: Vec::new(),
            skip: 0,
            limit: None,
            reverse: false,
            prefetch: Vec::new(),
            scope: None,
        }
    }

    /// The target entities of a one-to-many relation on `owner`.
    pub(crate) fn one_to_many(entity: &str, owner: EntityRef, inverse: &str) -> Self {
        Self {
            filter: Filter::eq(inverse, owner.id()),
            scope: Some(RelationScope::OneToMany {
                owner,
                inverse: inverse.to_string(),
            }),
            ..Self::new(entity)
        }
    }

    /// The members of a many-to-many relation on `owner`, or the entities
    /// with no link at all when `owner` is `None`.
    pub(crate) fn many_to_many(
        entity: &str,
        relation: &str,
        owner: Option<EntityRef>,
        junction: JunctionColumns,
    ) -> Self {
        Self {
            scope: Some(RelationScope::ManyToMany {
                relation: relation.to_string(),
                owner,
                junction,
            }),
            ..Self::new(entity)
        }
    }

    /// The target entity name.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// The current filter.
    pub fn current_filter(&self) -> &Filter {
        &self.filter
    }

    /// Narrows the collection; successive filters are combined with `AND`.
    #[must_use]
    pub fn filter(mut self, filter: Filter) -> Self {
        self.filter = match self.filter {
            Filter::Null => filter,
            existing => existing.and(filter),
        };
        self
    }

    /// Orders by a property, lower-casing text columns.
    #[must_use]
    pub fn order(mut self, property: impl Into<String>, ascending: bool) -> Self {
        self.order.push(OrderColumn {
            property: property.into(),
            ascending,
            case_sensitive: false,
        });
        self
    }

    /// Orders by a property, comparing text exactly.
    #[must_use]
    pub fn order_case_sensitive(mut self, property: impl Into<String>, ascending: bool) -> Self {
        self.order.push(OrderColumn {
            property: property.into(),
            ascending,
            case_sensitive: true,
        });
        self
    }

    /// Skips the first `n` results.
    #[must_use]
    pub const fn skip(mut self, n: usize) -> Self {
        self.skip = n;
        self
    }

    /// Returns at most `n` results.
    #[must_use]
    pub const fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Inverts the result order after fetching.
    #[must_use]
    pub const fn reverse(mut self) -> Self {
        self.reverse = !self.reverse;
        self
    }

    /// Loads the target of a has-one relation in the same query.
    #[must_use]
    pub fn prefetch(mut self, relation: impl Into<String>) -> Self {
        self.prefetch.push(relation.into());
        self
    }

    // ── terminal operations ──────────────────────────────────────────

    /// Fetches the matching entities.
    ///
    /// Rows whose id is already tracked by the session resolve to the
    /// tracked instance, which is not refreshed from the row.
    pub async fn list(
        &self,
        session: &mut Session,
        tx: Option<&dyn Transaction>,
    ) -> PersistResult<Vec<EntityRef>> {
        match tx {
            Some(tx) => self.list_in(session, tx).await,
            None => {
                let tx = session.transaction().await?;
                let result = self.list_in(session, tx.as_ref()).await;
                session.finish_implicit(tx, result).await
            }
        }
    }

    /// Fetches the first matching entity.
    pub async fn one(
        &self,
        session: &mut Session,
        tx: Option<&dyn Transaction>,
    ) -> PersistResult<Option<EntityRef>> {
        let first = self.clone().limit(1).list(session, tx).await?;
        Ok(first.into_iter().next())
    }

    /// Counts the matching entities, honoring skip and limit.
    pub async fn count(&self, session: &mut Session, tx: Option<&dyn Transaction>) -> PersistResult<usize> {
        match tx {
            Some(tx) => self.count_in(session, tx).await,
            None => {
                let tx = session.transaction().await?;
                let result = self.count_in(session, tx.as_ref()).await;
                session.finish_implicit(tx, result).await
            }
        }
    }

    /// Deletes every matching entity and returns how many were deleted.
    ///
    /// Skip and limit are ignored. Deleted ids are evicted from the session
    /// and announced on [`SIGNALS.entity_removed`](persist_rs_signals::SignalRegistry).
    pub async fn destroy_all(
        &self,
        session: &mut Session,
        tx: Option<&dyn Transaction>,
    ) -> PersistResult<usize> {
        match tx {
            Some(tx) => self.destroy_all_in(session, tx).await,
            None => {
                let tx = session.transaction().await?;
                let result = self.destroy_all_in(session, tx.as_ref()).await;
                session.finish_implicit(tx, result).await
            }
        }
    }

    async fn list_in(&self, session: &mut Session, tx: &dyn Transaction) -> PersistResult<Vec<EntityRef>> {
        session.flush_in(tx, FlushMode::Ordered).await?;
        let meta = session.registry().get(&self.entity)?.clone();

        let mut results = if meta.is_mixin() {
            let mut merged = Vec::new();
            for member in meta.members() {
                let member_meta = session.registry().get(member)?.clone();
                merged.extend(self.fetch(session, tx, &member_meta).await?);
            }
            self.sort_merged(&mut merged);
            merged
        } else {
            self.fetch(session, tx, &meta).await?
        };
        if self.reverse {
            results.reverse();
        }

        SIGNALS.collection_listed.send(&CollectionListed {
            entity: self.entity.clone(),
            count: results.len(),
        });
        Ok(results)
    }

    async fn count_in(&self, session: &mut Session, tx: &dyn Transaction) -> PersistResult<usize> {
        session.flush_in(tx, FlushMode::Ordered).await?;
        let meta = session.registry().get(&self.entity)?.clone();
        if !meta.is_mixin() {
            return self.count_concrete(session, tx, &meta).await;
        }
        let mut total = 0;
        for member in meta.members() {
            let member_meta = session.registry().get(member)?.clone();
            total += self.count_concrete(session, tx, &member_meta).await?;
        }
        Ok(total)
    }

    async fn destroy_all_in(&self, session: &mut Session, tx: &dyn Transaction) -> PersistResult<usize> {
        session.flush_in(tx, FlushMode::Ordered).await?;
        let meta = session.registry().get(&self.entity)?.clone();
        if !meta.is_mixin() {
            return self.destroy_concrete(session, tx, &meta).await;
        }
        let mut total = 0;
        for member in meta.members() {
            let member_meta = session.registry().get(member)?.clone();
            total += self.destroy_concrete(session, tx, &member_meta).await?;
        }
        Ok(total)
    }

    // ── per-table execution ──────────────────────────────────────────

    async fn fetch(
        &self,
        session: &mut Session,
        tx: &dyn Transaction,
        meta: &Arc<EntityMeta>,
    ) -> PersistResult<Vec<EntityRef>> {
        let mapper = Arc::clone(session.mapper());

        let mut prefetches = Vec::with_capacity(self.prefetch.len());
        for relation in &self.prefetch {
            let rel = meta.find_has_one(relation).ok_or_else(|| -> PersistError {
                ValidationError::new(
                    format!("{} has no has-one relation '{relation}' to prefetch", meta.name),
                    "unknown_relation",
                )
                .with_subject(format!("{}.{relation}", meta.name))
                .into()
            })?;
            let target = session.registry().get(&rel.target)?.clone();
            if target.is_mixin() {
                return Err(ValidationError::new(
                    format!("cannot prefetch '{relation}': {} is a mixin", target.name),
                    "mixin_prefetch",
                )
                .with_subject(format!("{}.{relation}", meta.name))
                .into());
            }
            prefetches.push((relation.clone(), target));
        }

        let root_prefix = format!("{}_", meta.name);
        let mut columns = select_columns(meta, ROOT, &root_prefix, mapper.as_ref());
        let mut prefetch_joins = String::new();
        for (relation, target) in &prefetches {
            let alias = format!("{relation}_tbl");
            columns.extend(select_columns(target, &alias, &format!("{relation}__"), mapper.as_ref()));
            prefetch_joins.push_str(&format!(
                " LEFT JOIN `{}` AS `{alias}` ON `{alias}`.`id` = `{ROOT}`.`{relation}`",
                target.name
            ));
        }

        let mut params = Vec::new();
        let (joins, condition) = self.scope_sql(meta, mapper.as_ref(), &mut params)?;
        let sql = format!(
            "SELECT {} FROM `{}` AS `{ROOT}`{joins}{prefetch_joins} WHERE {condition}{}{}",
            columns.join(", "),
            meta.name,
            self.order_sql(meta)?,
            self.paging_sql(),
        );
        let rows = execute_logged(tx, &sql, &params).await?;

        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            let Some(entity) = session.row_to_entity(meta, row, &root_prefix)? else {
                continue;
            };
            for (relation, target) in &prefetches {
                let related = session.row_to_entity(target, row, &format!("{relation}__"))?;
                entity.write().set_prefetched(relation, related);
            }
            results.push(entity);
        }
        tracing::debug!(entity = %meta.name, rows = results.len(), "fetched collection");
        Ok(results)
    }

    async fn count_concrete(
        &self,
        session: &Session,
        tx: &dyn Transaction,
        meta: &EntityMeta,
    ) -> PersistResult<usize> {
        let mut params = Vec::new();
        let (joins, condition) = self.scope_sql(meta, session.mapper().as_ref(), &mut params)?;
        let sql = if self.limit.is_some() || self.skip > 0 {
            format!(
                "SELECT COUNT(*) AS `cnt` FROM (SELECT `{ROOT}`.`id` FROM `{}` AS `{ROOT}`{joins} WHERE {condition}{}{})",
                meta.name,
                self.order_sql(meta)?,
                self.paging_sql(),
            )
        } else {
            format!(
                "SELECT COUNT(*) AS `cnt` FROM `{}` AS `{ROOT}`{joins} WHERE {condition}",
                meta.name
            )
        };
        let rows = execute_logged(tx, &sql, &params).await?;
        let count = rows.first().map(|row| row.get::<i64>("cnt")).transpose()?;
        Ok(count.unwrap_or(0).max(0) as usize)
    }

    async fn destroy_concrete(
        &self,
        session: &mut Session,
        tx: &dyn Transaction,
        meta: &EntityMeta,
    ) -> PersistResult<usize> {
        let mut params = Vec::new();
        let (joins, condition) = self.scope_sql(meta, session.mapper().as_ref(), &mut params)?;
        let matching = format!(
            "SELECT `{ROOT}`.`id` FROM `{}` AS `{ROOT}`{joins} WHERE {condition}",
            meta.name
        );

        let rows = execute_logged(tx, &matching, &params).await?;
        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            let id = row.get::<Value>("id")?;
            ids.push(id.as_id().map_or_else(|| id.to_string(), ToString::to_string));
        }
        for id in &ids {
            session.untrack(id);
            SIGNALS.entity_removed.send(&EntityRemoved {
                entity: meta.name.clone(),
                id: id.clone(),
            });
        }

        let delete = format!("DELETE FROM `{}` WHERE `id` IN ({matching})", meta.name);
        execute_logged(tx, &delete, &params).await?;
        execute_statements(tx, &session.junction_cleanup(meta, &ids)?).await?;

        tracing::debug!(entity = %meta.name, removed = ids.len(), "destroyed collection");
        Ok(ids.len())
    }

    // ── SQL fragments ────────────────────────────────────────────────

    /// The junction join and the `WHERE` predicate for `meta`.
    fn scope_sql(
        &self,
        meta: &EntityMeta,
        mapper: &dyn TypeMapper,
        params: &mut Vec<Value>,
    ) -> PersistResult<(String, String)> {
        let condition = self.filter.compile(meta, Some(ROOT), params, mapper)?;
        let Some(RelationScope::ManyToMany { owner, junction, .. }) = &self.scope else {
            return Ok((String::new(), condition));
        };
        let join = format!(
            " LEFT JOIN `{}` AS `{JUNCTION}` ON `{JUNCTION}`.`{}` = `{ROOT}`.`id`",
            junction.table, junction.member
        );
        let owner_condition = match owner {
            Some(owner) => format!(
                "`{JUNCTION}`.`{}` = {}",
                junction.owner,
                mapper.id_literal(&owner.id())
            ),
            None => format!("`{JUNCTION}`.`{}` IS NULL", junction.owner),
        };
        Ok((join, format!("{condition} AND {owner_condition}")))
    }

    fn order_sql(&self, meta: &EntityMeta) -> PersistResult<String> {
        if self.order.is_empty() {
            return Ok(String::new());
        }
        let mut parts = Vec::with_capacity(self.order.len());
        for column in &self.order {
            let field_type = meta.require_column(&column.property)?;
            let mut expr = format!("`{ROOT}`.`{}`", column.property);
            if !column.case_sensitive && field_type.is_textual() {
                expr = format!("LOWER({expr})");
            }
            parts.push(format!("{expr} {}", if column.ascending { "ASC" } else { "DESC" }));
        }
        Ok(format!(" ORDER BY {}", parts.join(", ")))
    }

    fn paging_sql(&self) -> String {
        match (self.limit, self.skip) {
            (Some(limit), 0) => format!(" LIMIT {limit}"),
            (Some(limit), skip) => format!(" LIMIT {limit} OFFSET {skip}"),
            (None, 0) => String::new(),
            (None, skip) => format!(" LIMIT -1 OFFSET {skip}"),
        }
    }

    fn sort_merged(&self, entities: &mut [EntityRef]) {
        if self.order.is_empty() {
            return;
        }
        entities.sort_by(|a, b| {
            for column in &self.order {
                let ordering = compare_values(
                    &a.get(&column.property),
                    &b.get(&column.property),
                    column.case_sensitive,
                );
                let ordering = if column.ascending { ordering } else { ordering.reverse() };
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            Ordering::Equal
        });
    }

    // ── relation collections ─────────────────────────────────────────

    fn check_member(&self, session: &Session, entity: &EntityRef) -> PersistResult<()> {
        let actual = entity.entity_type();
        if session.registry().is_a(&actual, &self.entity) {
            return Ok(());
        }
        Err(ValidationError::new(
            format!("expected {}, got {actual}", self.entity),
            "type_mismatch",
        )
        .with_subject(actual)
        .into())
    }

    /// Adds `entity` to a relation collection.
    ///
    /// For a one-to-many relation this points the entity's inverse has-one
    /// at the owner. For a many-to-many relation the link is staged on the
    /// owner and written by the next flush; adding twice stages one link.
    pub fn add(&self, session: &mut Session, entity: &EntityRef) -> PersistResult<()> {
        self.check_member(session, entity)?;
        match &self.scope {
            Some(RelationScope::OneToMany { owner, inverse }) => {
                entity.set_ref(inverse, Some(owner))?;
                session.add(entity);
                Ok(())
            }
            Some(RelationScope::ManyToMany {
                relation,
                owner: Some(owner),
                ..
            }) => {
                let key = entity.key();
                {
                    let mut owner = owner.write();
                    let links = owner.links_mut(relation);
                    links.removed.retain(|k| k.id != key.id);
                    if !links.added.iter().any(|k| k.id == key.id) {
                        links.added.push(key);
                    }
                }
                session.add(entity);
                session.add(owner);
                Ok(())
            }
            _ => Err(not_a_relation(&self.entity)),
        }
    }

    /// Removes `entity` from a relation collection.
    pub fn remove(&self, session: &mut Session, entity: &EntityRef) -> PersistResult<()> {
        self.check_member(session, entity)?;
        match &self.scope {
            Some(RelationScope::OneToMany { inverse, .. }) => {
                entity.set_ref(inverse, None)?;
                session.add(entity);
                Ok(())
            }
            Some(RelationScope::ManyToMany {
                relation,
                owner: Some(owner),
                ..
            }) => {
                let key = entity.key();
                {
                    let mut owner = owner.write();
                    let links = owner.links_mut(relation);
                    links.added.retain(|k| k.id != key.id);
                    if !links.removed.iter().any(|k| k.id == key.id) {
                        links.removed.push(key);
                    }
                }
                session.add(owner);
                Ok(())
            }
            _ => Err(not_a_relation(&self.entity)),
        }
    }

    /// Drains the owner's staged link changes into junction table writes.
    ///
    /// Additions become `INSERT OR IGNORE` so that re-adding an existing
    /// link is a no-op. Empty for anything but an owned many-to-many
    /// collection.
    pub fn persist_queries(&self, session: &Session) -> Vec<Statement> {
        let Some(RelationScope::ManyToMany {
            relation,
            owner: Some(owner),
            junction,
        }) = &self.scope
        else {
            return Vec::new();
        };
        let staged = owner.write().take_links(relation);
        if staged.is_empty() {
            return Vec::new();
        }

        let mapper = session.mapper();
        let owner_key = owner.key();
        let id_slot = mapper.output_placeholder("?", &FieldType::Id);
        let class_slot = mapper.output_placeholder("?", &FieldType::Text);
        let mut statements = Vec::with_capacity(staged.added.len() + staged.removed.len());

        for member in &staged.added {
            let mut columns = vec![junction.owner.as_str(), junction.member.as_str()];
            let mut slots = vec![id_slot.as_str(), id_slot.as_str()];
            let mut params = vec![
                Value::String(owner_key.id.clone()),
                Value::String(member.id.clone()),
            ];
            if let Some(column) = &junction.owner_class {
                columns.push(column);
                slots.push(&class_slot);
                params.push(Value::String(owner_key.entity.clone()));
            }
            if let Some(column) = &junction.member_class {
                columns.push(column);
                slots.push(&class_slot);
                params.push(Value::String(member.entity.clone()));
            }
            let quoted: Vec<String> = columns.iter().map(|c| format!("`{c}`")).collect();
            statements.push(Statement::with_params(
                format!(
                    "INSERT OR IGNORE INTO `{}` ({}) VALUES ({})",
                    junction.table,
                    quoted.join(", "),
                    slots.join(", ")
                ),
                params,
            ));
        }
        for member in &staged.removed {
            statements.push(Statement::with_params(
                format!(
                    "DELETE FROM `{}` WHERE `{}` = {id_slot} AND `{}` = {id_slot}",
                    junction.table, junction.owner, junction.member
                ),
                vec![
                    Value::String(owner_key.id.clone()),
                    Value::String(member.id.clone()),
                ],
            ));
        }
        statements
    }
}

/// The `SELECT` list for `meta`'s stored columns, aliased with `prefix`.
fn select_columns(meta: &EntityMeta, alias: &str, prefix: &str, mapper: &dyn TypeMapper) -> Vec<String> {
    meta.stored_columns()
        .into_iter()
        .map(|(column, field_type)| {
            let expr = mapper.input_placeholder(&format!("`{alias}`.`{column}`"), &field_type);
            format!("{expr} AS `{prefix}{column}`")
        })
        .collect()
}

/// Orders two property values the way SQLite orders the stored columns:
/// nulls first, numbers numerically, text optionally case-folded.
fn compare_values(a: &Value, b: &Value, case_sensitive: bool) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::String(x), Value::String(y)) => {
            if case_sensitive {
                x.cmp(y)
            } else {
                x.to_lowercase().cmp(&y.to_lowercase())
            }
        }
        (Value::Int(x), Value::Int(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::DateTime(x), Value::DateTime(y)) => x.cmp(y),
        (Value::Float(_) | Value::Int(_), Value::Float(_) | Value::Int(_)) => {
            let as_f64 = |v: &Value| match v {
                Value::Int(i) => *i as f64,
                Value::Float(f) => *f,
                _ => 0.0,
            };
            as_f64(a).partial_cmp(&as_f64(b)).unwrap_or(Ordering::Equal)
        }
        _ => a.to_string().cmp(&b.to_string()),
    }
}
