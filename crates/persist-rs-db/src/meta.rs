//! Entity metadata.
//!
//! An [`EntityMeta`] describes one entity type: its table name, typed
//! fields, has-one and has-many relations, indexes, and whether it is a
//! concrete table or a mixin (an abstract family realized by several
//! concrete member tables). Metadata is collected in a [`MetaRegistry`]
//! before any session is opened and is read-only afterwards.
//!
//! ```
//! use persist_rs_db::meta::{EntityMeta, MetaRegistry};
//! use persist_rs_db::types::FieldType;
//!
//! let mut registry = MetaRegistry::new();
//! registry
//!     .define(
//!         EntityMeta::builder("Task")
//!             .field("title", FieldType::Text)
//!             .field("done", FieldType::Bool)
//!             .build(),
//!     )
//!     .unwrap();
//! registry.define(EntityMeta::builder("Tag").field("name", FieldType::Text).build()).unwrap();
//! registry.many_to_many(("Task", "tags"), ("Tag", "tasks")).unwrap();
//!
//! let task = registry.get("Task").unwrap();
//! assert_eq!(task.find_has_many("tags").unwrap().table_name.as_deref(), Some("Tag_tasks_Task"));
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use persist_rs_core::{PersistError, PersistResult, ValidationError};

use crate::types::FieldType;

/// A has-one relation: a column holding the id of another entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HasOne {
    /// The relation (and column) name.
    pub name: String,
    /// The target entity name.
    pub target: String,
}

/// A has-many relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HasMany {
    /// The relation name.
    pub name: String,
    /// The target entity name.
    pub target: String,
    /// The inverse relation name on the target.
    pub inverse: String,
    /// Whether this relation is realized by a junction table.
    pub many_to_many: bool,
    /// The junction table name, for many-to-many relations.
    pub table_name: Option<String>,
    /// The mixin this relation was inherited from, if any.
    pub mixin: Option<String>,
}

/// An index over one or more columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexDef {
    /// The indexed columns, in order.
    pub columns: Vec<String>,
    /// Whether the index is unique.
    pub unique: bool,
}

/// Whether an entity is a concrete table or a polymorphic family.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityKind {
    /// A concrete entity backed by its own table.
    Concrete,
    /// An abstract family realized by the listed concrete members.
    Mixin {
        /// Member entity names, in definition order.
        members: Vec<String>,
    },
}

/// Metadata for one entity type.
#[derive(Debug, Clone)]
pub struct EntityMeta {
    /// The entity name, which is also its table name.
    pub name: String,
    /// Declared fields with their semantic types, in declaration order.
    pub fields: Vec<(String, FieldType)>,
    /// Has-one relations.
    pub has_one: Vec<HasOne>,
    /// Has-many relations.
    pub has_many: Vec<HasMany>,
    /// Explicit indexes.
    pub indexes: Vec<IndexDef>,
    /// Concrete or mixin.
    pub kind: EntityKind,
    /// The mixins this entity is a member of.
    pub mixins: Vec<String>,
}

impl EntityMeta {
    /// Starts building metadata for a concrete entity.
    pub fn builder(name: impl Into<String>) -> EntityMetaBuilder {
        EntityMetaBuilder {
            meta: Self {
                name: name.into(),
                fields: Vec::new(),
                has_one: Vec::new(),
                has_many: Vec::new(),
                indexes: Vec::new(),
                kind: EntityKind::Concrete,
                mixins: Vec::new(),
            },
        }
    }

    /// Returns `true` for mixin families.
    pub const fn is_mixin(&self) -> bool {
        matches!(self.kind, EntityKind::Mixin { .. })
    }

    /// The concrete members of a mixin; empty for concrete entities.
    pub fn members(&self) -> &[String] {
        match &self.kind {
            EntityKind::Mixin { members } => members,
            EntityKind::Concrete => &[],
        }
    }

    /// The declared type of a field.
    pub fn field_type(&self, name: &str) -> Option<&FieldType> {
        self.fields.iter().find(|(f, _)| f == name).map(|(_, t)| t)
    }

    /// Looks up a has-one relation.
    pub fn find_has_one(&self, name: &str) -> Option<&HasOne> {
        self.has_one.iter().find(|r| r.name == name)
    }

    /// Looks up a has-many relation.
    pub fn find_has_many(&self, name: &str) -> Option<&HasMany> {
        self.has_many.iter().find(|r| r.name == name)
    }

    /// The column type of a stored property: a field, `id`, or a has-one
    /// column.
    pub fn column_type(&self, property: &str) -> Option<FieldType> {
        if let Some(ty) = self.field_type(property) {
            return Some(ty.clone());
        }
        if property == "id" || self.find_has_one(property).is_some() {
            return Some(FieldType::Id);
        }
        None
    }

    /// Like [`column_type`](Self::column_type), failing with a validation
    /// error for unmapped properties.
    pub fn require_column(&self, property: &str) -> PersistResult<FieldType> {
        self.column_type(property).ok_or_else(|| {
            ValidationError::new(
                format!("{} has no property '{property}'", self.name),
                "unknown_property",
            )
            .with_subject(format!("{}.{property}", self.name))
            .into()
        })
    }

    /// Whether `property` is a settable field or has-one relation.
    pub fn has_property(&self, property: &str) -> bool {
        self.field_type(property).is_some() || self.find_has_one(property).is_some()
    }

    /// Every stored column with its type: `id`, the fields, then the has-one
    /// columns.
    pub fn stored_columns(&self) -> Vec<(String, FieldType)> {
        std::iter::once(("id".to_string(), FieldType::Id))
            .chain(self.fields.iter().cloned())
            .chain(self.has_one.iter().map(|r| (r.name.clone(), FieldType::Id)))
            .collect()
    }
}

/// Builder for [`EntityMeta`].
#[derive(Debug)]
pub struct EntityMetaBuilder {
    meta: EntityMeta,
}

impl EntityMetaBuilder {
    /// Declares a field.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, field_type: FieldType) -> Self {
        self.meta.fields.push((name.into(), field_type));
        self
    }

    /// Declares a has-one relation to `target`.
    #[must_use]
    pub fn has_one(mut self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.meta.has_one.push(HasOne {
            name: name.into(),
            target: target.into(),
        });
        self
    }

    /// Declares a non-unique index.
    #[must_use]
    pub fn index(mut self, columns: &[&str]) -> Self {
        self.meta.indexes.push(IndexDef {
            columns: columns.iter().map(ToString::to_string).collect(),
            unique: false,
        });
        self
    }

    /// Declares a unique index.
    #[must_use]
    pub fn unique_index(mut self, columns: &[&str]) -> Self {
        self.meta.indexes.push(IndexDef {
            columns: columns.iter().map(ToString::to_string).collect(),
            unique: true,
        });
        self
    }

    /// Marks this entity as a mixin family.
    #[must_use]
    pub fn mixin(mut self) -> Self {
        self.meta.kind = EntityKind::Mixin {
            members: Vec::new(),
        };
        self
    }

    /// Makes this entity a member of `mixin`, inheriting its schema.
    #[must_use]
    pub fn is(mut self, mixin: impl Into<String>) -> Self {
        self.meta.mixins.push(mixin.into());
        self
    }

    /// Finishes the metadata.
    pub fn build(self) -> EntityMeta {
        self.meta
    }
}

/// The junction table layout of one side of a many-to-many relation.
///
/// `member` holds the ids of the entities in the relation collection and
/// `owner` holds the ids of the entities owning it. Columns are named after
/// the mixin when the relation was declared on one, so every member of the
/// family shares the same junction table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JunctionColumns {
    /// The junction table name.
    pub table: String,
    /// Column holding the collection members' ids.
    pub member: String,
    /// Column holding the owners' ids.
    pub owner: String,
    /// Class discriminator for polymorphic members.
    pub member_class: Option<String>,
    /// Class discriminator for polymorphic owners.
    pub owner_class: Option<String>,
}

/// All entity metadata, in definition order.
#[derive(Debug, Clone, Default)]
pub struct MetaRegistry {
    metas: Vec<Arc<EntityMeta>>,
    index: HashMap<String, usize>,
}

fn unknown_entity(name: &str) -> PersistError {
    ValidationError::new(format!("unknown entity '{name}'"), "unknown_entity")
        .with_subject(name)
        .into()
}

impl MetaRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up an entity, failing with a validation error.
    pub fn get(&self, name: &str) -> PersistResult<&Arc<EntityMeta>> {
        self.lookup(name).ok_or_else(|| unknown_entity(name))
    }

    /// Looks up an entity.
    pub fn lookup(&self, name: &str) -> Option<&Arc<EntityMeta>> {
        self.index.get(name).map(|&i| &self.metas[i])
    }

    /// Iterates over every entity in definition order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<EntityMeta>> {
        self.metas.iter()
    }

    /// Number of defined entities.
    pub fn len(&self) -> usize {
        self.metas.len()
    }

    /// Returns `true` if nothing has been defined.
    pub fn is_empty(&self) -> bool {
        self.metas.is_empty()
    }

    /// Whether `entity` is `expected` or a member of the mixin `expected`.
    pub fn is_a(&self, entity: &str, expected: &str) -> bool {
        entity == expected
            || self
                .lookup(expected)
                .is_some_and(|m| m.members().iter().any(|member| member == entity))
    }

    /// Resolves the junction table columns for `entity.relation`.
    pub fn junction(&self, entity: &str, relation: &str) -> PersistResult<JunctionColumns> {
        let meta = self.get(entity)?;
        let not_many_to_many = || -> PersistError {
            ValidationError::new(
                format!("{entity}.{relation} is not a many-to-many relation"),
                "not_many_to_many",
            )
            .with_subject(format!("{entity}.{relation}"))
            .into()
        };
        let rel = meta
            .find_has_many(relation)
            .filter(|r| r.many_to_many)
            .ok_or_else(not_many_to_many)?;
        let table = rel.table_name.clone().ok_or_else(not_many_to_many)?;
        let target = self.get(&rel.target)?;
        let inverse = target
            .find_has_many(&rel.inverse)
            .ok_or_else(not_many_to_many)?;

        let owner_side = rel.mixin.as_deref().unwrap_or(&meta.name);
        let member_side = inverse.mixin.as_deref().unwrap_or(&target.name);
        let member = format!("{owner_side}_{relation}");
        let owner = format!("{member_side}_{}", rel.inverse);
        let is_mixin = |name: &str| self.lookup(name).is_some_and(|m| m.is_mixin());

        Ok(JunctionColumns {
            member_class: is_mixin(member_side).then(|| format!("{member}_class")),
            owner_class: is_mixin(owner_side).then(|| format!("{owner}_class")),
            table,
            member,
            owner,
        })
    }

    fn meta_mut(&mut self, name: &str) -> PersistResult<&mut EntityMeta> {
        let i = *self.index.get(name).ok_or_else(|| unknown_entity(name))?;
        Ok(Arc::make_mut(&mut self.metas[i]))
    }

    /// Defines an entity.
    ///
    /// Members of a mixin inherit the mixin's fields, relations and indexes,
    /// so the mixin has to be defined first.
    pub fn define(&mut self, mut meta: EntityMeta) -> PersistResult<()> {
        if self.index.contains_key(&meta.name) {
            return Err(ValidationError::new(
                format!("entity '{}' is already defined", meta.name),
                "duplicate_entity",
            )
            .with_subject(&meta.name)
            .into());
        }

        for mixin_name in meta.mixins.clone() {
            let mixin = self.get(&mixin_name)?.clone();
            if !mixin.is_mixin() {
                return Err(ValidationError::new(
                    format!("'{mixin_name}' is not a mixin"),
                    "not_a_mixin",
                )
                .with_subject(&mixin_name)
                .into());
            }
            for (field, ty) in &mixin.fields {
                if meta.field_type(field).is_none() {
                    meta.fields.push((field.clone(), ty.clone()));
                }
            }
            for rel in &mixin.has_one {
                if meta.find_has_one(&rel.name).is_none() {
                    meta.has_one.push(rel.clone());
                }
            }
            for rel in &mixin.has_many {
                if meta.find_has_many(&rel.name).is_none() {
                    meta.has_many.push(HasMany {
                        mixin: Some(rel.mixin.clone().unwrap_or_else(|| mixin_name.clone())),
                        ..rel.clone()
                    });
                }
            }
            meta.indexes.extend(mixin.indexes.iter().cloned());
            if let EntityKind::Mixin { members } = &mut self.meta_mut(&mixin_name)?.kind {
                members.push(meta.name.clone());
            }
        }

        tracing::debug!(entity = %meta.name, fields = meta.fields.len(), "defined entity");
        self.index.insert(meta.name.clone(), self.metas.len());
        self.metas.push(Arc::new(meta));
        Ok(())
    }

    fn add_has_one(&mut self, entity: &str, rel: &HasOne) -> PersistResult<()> {
        let members = self.get(entity)?.members().to_vec();
        self.meta_mut(entity)?.has_one.push(rel.clone());
        for member in members {
            self.meta_mut(&member)?.has_one.push(rel.clone());
        }
        Ok(())
    }

    fn add_has_many(&mut self, entity: &str, rel: &HasMany) -> PersistResult<()> {
        let members = self.get(entity)?.members().to_vec();
        self.meta_mut(entity)?.has_many.push(rel.clone());
        for member in members {
            self.meta_mut(&member)?.has_many.push(HasMany {
                mixin: Some(entity.to_string()),
                ..rel.clone()
            });
        }
        Ok(())
    }

    /// Declares a one-to-many relation: `owner.rel` lists the `target`
    /// entities whose has-one `inverse` points at the owner.
    pub fn has_many(
        &mut self,
        owner: &str,
        rel: &str,
        target: &str,
        inverse: &str,
    ) -> PersistResult<()> {
        self.get(owner)?;
        self.get(target)?;
        self.add_has_many(
            owner,
            &HasMany {
                name: rel.to_string(),
                target: target.to_string(),
                inverse: inverse.to_string(),
                many_to_many: false,
                table_name: None,
                mixin: None,
            },
        )?;
        self.add_has_one(
            target,
            &HasOne {
                name: inverse.to_string(),
                target: owner.to_string(),
            },
        )
    }

    /// Declares a many-to-many relation between `a.rel` and `b.inv`.
    ///
    /// Both sides share one junction table, named after whichever of
    /// `<A>_<rel>_<B>` and `<B>_<inv>_<A>` sorts first so that the name does
    /// not depend on which side is declared first.
    pub fn many_to_many(&mut self, (a, rel): (&str, &str), (b, inv): (&str, &str)) -> PersistResult<()> {
        self.get(a)?;
        self.get(b)?;
        if a == b && rel == inv {
            return Err(ValidationError::new(
                format!("relation {a}.{rel} cannot be its own inverse"),
                "ambiguous_relation",
            )
            .with_subject(format!("{a}.{rel}"))
            .into());
        }
        let forward = format!("{a}_{rel}_{b}");
        let backward = format!("{b}_{inv}_{a}");
        let table = if forward < backward { forward } else { backward };

        self.add_has_many(
            a,
            &HasMany {
                name: rel.to_string(),
                target: b.to_string(),
                inverse: inv.to_string(),
                many_to_many: true,
                table_name: Some(table.clone()),
                mixin: None,
            },
        )?;
        self.add_has_many(
            b,
            &HasMany {
                name: inv.to_string(),
                target: a.to_string(),
                inverse: rel.to_string(),
                many_to_many: true,
                table_name: Some(table),
                mixin: None,
            },
        )
    }
}
