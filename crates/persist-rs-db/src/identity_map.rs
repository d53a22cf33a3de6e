//! Per-session identity map.
//!
//! The identity map guarantees that, within one session, a given id always
//! resolves to the same [`EntityRef`]. It also remembers insertion order so
//! that flushes write entities in the order they were tracked.

use std::collections::HashMap;

use crate::entity::EntityRef;

/// Maps entity ids to their tracked instances.
#[derive(Debug, Default, Clone)]
pub struct IdentityMap {
    entries: HashMap<String, EntityRef>,
    order: Vec<String>,
}

impl IdentityMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks an entity and returns the tracked instance.
    ///
    /// If another instance with the same id is already tracked, that
    /// instance wins and is returned unchanged.
    pub fn insert(&mut self, entity: &EntityRef) -> EntityRef {
        let id = entity.id();
        if let Some(existing) = self.entries.get(&id) {
            return existing.clone();
        }
        self.order.push(id.clone());
        self.entries.insert(id, entity.clone());
        entity.clone()
    }

    /// Returns the tracked instance for an id.
    pub fn get(&self, id: &str) -> Option<&EntityRef> {
        self.entries.get(id)
    }

    /// Whether an id is tracked.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Stops tracking an id.
    pub fn remove(&mut self, id: &str) -> Option<EntityRef> {
        let removed = self.entries.remove(id)?;
        self.order.retain(|tracked| tracked != id);
        Some(removed)
    }

    /// Number of tracked entities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forgets every tracked entity.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Tracked entities in insertion order.
    pub fn values(&self) -> impl Iterator<Item = &EntityRef> {
        self.order.iter().filter_map(|id| self.entries.get(id))
    }

    /// Removes and returns every tracked entity in insertion order.
    pub fn drain(&mut self) -> Vec<EntityRef> {
        let order = std::mem::take(&mut self.order);
        let mut entries = std::mem::take(&mut self.entries);
        order.iter().filter_map(|id| entries.remove(id)).collect()
    }
}
