//! Query building and execution.
//!
//! - [`collection`] - Query collections, including relation collections

pub mod collection;

pub use collection::{OrderColumn, QueryCollection};
