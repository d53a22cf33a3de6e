//! Entity instances.
//!
//! An [`Entity`] is one row's worth of in-memory state: its id, current
//! property values, the set of properties changed since the last flush, and
//! whether it has been inserted yet. Entities are shared through
//! [`EntityRef`] handles so that the identity map and every query result
//! observe the same instance. Guards returned by [`EntityRef::read`] and
//! [`EntityRef::write`] must never be held across an `.await`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use persist_rs_core::{PersistResult, ValidationError};

use crate::meta::EntityMeta;
use crate::types::FieldType;
use crate::value::{EntityKey, Value};

/// Many-to-many link changes staged on an owner and not yet flushed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StagedLinks {
    /// Entities linked since the last flush.
    pub added: Vec<EntityKey>,
    /// Entities unlinked since the last flush.
    pub removed: Vec<EntityKey>,
}

impl StagedLinks {
    /// Returns `true` when nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// In-memory state of one entity.
#[derive(Debug)]
pub struct Entity {
    id: String,
    meta: Arc<EntityMeta>,
    data: HashMap<String, Value>,
    dirty: Vec<String>,
    is_new: bool,
    prefetched: HashMap<String, Option<EntityRef>>,
    links: HashMap<String, StagedLinks>,
}

impl Entity {
    /// Creates a new, not yet inserted entity.
    pub fn new(meta: Arc<EntityMeta>, id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            meta,
            data: HashMap::new(),
            dirty: Vec::new(),
            is_new: true,
            prefetched: HashMap::new(),
            links: HashMap::new(),
        }
    }

    /// Creates an entity materialized from a stored row.
    pub fn loaded(meta: Arc<EntityMeta>, id: impl Into<String>, data: HashMap<String, Value>) -> Self {
        Self {
            data,
            is_new: false,
            ..Self::new(meta, id)
        }
    }

    /// The entity id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The concrete entity type name.
    pub fn entity_type(&self) -> &str {
        &self.meta.name
    }

    /// The metadata of this entity's type.
    pub fn meta(&self) -> &Arc<EntityMeta> {
        &self.meta
    }

    /// Whether the entity has not been inserted yet.
    pub const fn is_new(&self) -> bool {
        self.is_new
    }

    /// Properties changed since the last flush, in change order.
    pub fn dirty_properties(&self) -> &[String] {
        &self.dirty
    }

    /// The current value of a property, `Null` when unset.
    pub fn get(&self, property: &str) -> Value {
        self.data.get(property).cloned().unwrap_or(Value::Null)
    }

    /// Sets a field or has-one property and marks it dirty.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the entity has no such property.
    pub fn set(&mut self, property: &str, value: Value) -> PersistResult<()> {
        if !self.meta.has_property(property) {
            return Err(ValidationError::new(
                format!("{} has no property '{property}'", self.meta.name),
                "unknown_property",
            )
            .with_subject(format!("{}.{property}", self.meta.name))
            .into());
        }
        let value = if self.meta.find_has_one(property).is_some() {
            // Has-one columns hold the bare id.
            self.prefetched.remove(property);
            match value {
                Value::Entity(key) => Value::String(key.id),
                other => other,
            }
        } else if self.meta.field_type(property) == Some(&FieldType::Json) {
            // JSON fields always hold a document, so scalars are wrapped.
            match value {
                Value::Null | Value::Json(_) => value,
                other => Value::Json(other.to_json()),
            }
        } else {
            value
        };
        self.data.insert(property.to_string(), value);
        self.mark_dirty(property);
        Ok(())
    }

    fn mark_dirty(&mut self, property: &str) {
        if !self.dirty.iter().any(|p| p == property) {
            self.dirty.push(property.to_string());
        }
    }

    /// Marks every declared field dirty, for a full-row insert.
    pub(crate) fn mark_all_fields_dirty(&mut self) {
        let fields: Vec<String> = self.meta.fields.iter().map(|(f, _)| f.clone()).collect();
        for field in fields {
            self.mark_dirty(&field);
        }
    }

    /// Takes the dirty set, leaving it empty.
    pub(crate) fn take_dirty(&mut self) -> Vec<String> {
        std::mem::take(&mut self.dirty)
    }

    pub(crate) fn mark_inserted(&mut self) {
        self.is_new = false;
    }

    /// Puts back the write state taken for a statement that failed.
    pub(crate) fn restore_pending(&mut self, dirty: &[String], was_new: bool) {
        for property in dirty {
            self.mark_dirty(property);
        }
        self.is_new = was_new;
    }

    /// Staged link changes for a many-to-many relation.
    pub fn staged_links(&self, relation: &str) -> Option<&StagedLinks> {
        self.links.get(relation)
    }

    pub(crate) fn links_mut(&mut self, relation: &str) -> &mut StagedLinks {
        self.links.entry(relation.to_string()).or_default()
    }

    /// Takes the staged link changes for a relation, leaving them empty.
    pub(crate) fn take_links(&mut self, relation: &str) -> StagedLinks {
        self.links.remove(relation).unwrap_or_default()
    }

    /// Puts back link changes taken for writes that failed.
    ///
    /// Changes staged since then win over the restored ones.
    pub(crate) fn restore_links(&mut self, relation: &str, taken: StagedLinks) {
        let links = self.links_mut(relation);
        let staged_since = |links: &StagedLinks, key: &EntityKey| {
            links.added.iter().chain(&links.removed).any(|k| k.id == key.id)
        };
        for key in taken.added {
            if !staged_since(links, &key) {
                links.added.push(key);
            }
        }
        for key in taken.removed {
            if !staged_since(links, &key) {
                links.removed.push(key);
            }
        }
    }

    pub(crate) fn set_prefetched(&mut self, relation: &str, target: Option<EntityRef>) {
        self.prefetched.insert(relation.to_string(), target);
    }
}

/// A shared handle to an [`Entity`].
#[derive(Clone)]
pub struct EntityRef(Arc<RwLock<Entity>>);

impl EntityRef {
    /// Wraps an entity in a shared handle.
    pub fn new(entity: Entity) -> Self {
        Self(Arc::new(RwLock::new(entity)))
    }

    /// Read access to the entity.
    pub fn read(&self) -> RwLockReadGuard<'_, Entity> {
        self.0.read().expect("entity lock poisoned")
    }

    /// Write access to the entity.
    pub fn write(&self) -> RwLockWriteGuard<'_, Entity> {
        self.0.write().expect("entity lock poisoned")
    }

    /// The entity id.
    pub fn id(&self) -> String {
        self.read().id.clone()
    }

    /// The concrete entity type name.
    pub fn entity_type(&self) -> String {
        self.read().meta.name.clone()
    }

    /// The type name and id of this entity.
    pub fn key(&self) -> EntityKey {
        let entity = self.read();
        EntityKey::new(entity.meta.name.clone(), entity.id.clone())
    }

    /// The current value of a property.
    pub fn get(&self, property: &str) -> Value {
        self.read().get(property)
    }

    /// Sets a property and marks it dirty.
    pub fn set(&self, property: &str, value: impl Into<Value>) -> PersistResult<()> {
        self.write().set(property, value.into())
    }

    /// Points a has-one relation at `target` (or clears it).
    pub fn set_ref(&self, relation: &str, target: Option<&Self>) -> PersistResult<()> {
        let value = target.map_or(Value::Null, |t| Value::String(t.id()));
        let mut entity = self.write();
        if entity.meta.find_has_one(relation).is_none() {
            return Err(ValidationError::new(
                format!("{} has no has-one relation '{relation}'", entity.meta.name),
                "unknown_relation",
            )
            .with_subject(format!("{}.{relation}", entity.meta.name))
            .into());
        }
        entity.set(relation, value)?;
        entity.set_prefetched(relation, target.cloned());
        Ok(())
    }

    /// The related entity loaded by a prefetch (or by [`set_ref`](Self::set_ref)).
    pub fn prefetched(&self, relation: &str) -> Option<Self> {
        self.read().prefetched.get(relation).cloned().flatten()
    }

    /// Whether the entity has not been inserted yet.
    pub fn is_new(&self) -> bool {
        self.read().is_new
    }

    /// Properties changed since the last flush.
    pub fn dirty_properties(&self) -> Vec<String> {
        self.read().dirty.clone()
    }

    /// Whether two handles refer to the same instance.
    pub fn ptr_eq(a: &Self, b: &Self) -> bool {
        Arc::ptr_eq(&a.0, &b.0)
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_read() {
            Ok(entity) => write!(f, "EntityRef({}:{})", entity.meta.name, entity.id),
            Err(_) => write!(f, "EntityRef(<locked>)"),
        }
    }
}

impl From<&EntityRef> for Value {
    fn from(entity: &EntityRef) -> Self {
        Self::Entity(entity.key())
    }
}
