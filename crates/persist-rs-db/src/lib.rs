//! # persist-rs-db
//!
//! The persistence core of persist-rs. Entities are described by
//! [`EntityMeta`](meta::EntityMeta) records collected in a
//! [`MetaRegistry`](meta::MetaRegistry); a [`Session`](session::Session) is
//! the unit of work that tracks loaded entities, records dirty fields and
//! flushes them inside a transaction; [`QueryCollection`](query::QueryCollection)
//! compiles filters, ordering, paging and prefetches into SQL.
//!
//! The SQL driver is abstracted by the [`Database`](executor::Database) and
//! [`Transaction`](executor::Transaction) traits, and dialect-specific DDL by
//! [`Dialect`](dialect::Dialect). Concrete drivers live in
//! `persist-rs-db-backends`.
//!
//! ## Modules
//!
//! - [`value`] - Backend-agnostic value type
//! - [`types`] - Field types and the type mapper
//! - [`meta`] - Entity metadata and the registry
//! - [`entity`] - Entity instances
//! - [`identity_map`] - Per-session identity map
//! - [`filter`] - Filter expressions and their SQL compilation
//! - [`query`] - Query collections
//! - [`session`] - The unit of work
//! - [`schema`] - Schema synchronization
//! - [`dialect`] - DDL rendering
//! - [`executor`] - The driver seam

// These pedantic lints fire on the SQL string building throughout the crate.
#![allow(clippy::format_push_string)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::missing_const_for_fn)]

pub mod dialect;
pub mod entity;
pub mod executor;
pub mod filter;
pub mod identity_map;
pub mod meta;
pub mod query;
pub mod schema;
pub mod session;
pub mod types;
pub mod value;

#[cfg(test)]
pub(crate) mod testing;

pub use dialect::{ColumnDef, Dialect, SqliteDialect};
pub use entity::{Entity, EntityRef};
pub use executor::{Database, FromValue, Row, Statement, Transaction};
pub use filter::{Filter, Operator, PropertyFilter};
pub use identity_map::IdentityMap;
pub use meta::{EntityKind, EntityMeta, HasMany, HasOne, IndexDef, MetaRegistry};
pub use query::{OrderColumn, QueryCollection};
pub use session::{FlushMode, Session};
pub use types::{DefaultTypeMapper, FieldType, TypeMapper};
pub use value::{EntityKey, Value};
