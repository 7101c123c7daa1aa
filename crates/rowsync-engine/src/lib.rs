//! Mapping, apply, and conflict resolution.
//!
//! This crate is the dialect-agnostic middle of the sync engine. It
//! rewrites change log entries between heterogeneous schemas
//! ([`apply_mapping`]), applies mapped batches under a suppressed store
//! session in foreign-key order ([`ApplyEngine`]), and resolves write
//! conflicts deterministically ([`conflict::resolve`]).

pub mod apply;
pub mod config;
pub mod conflict;
pub mod error;
pub mod expr;
pub mod mapping;

pub use apply::{ApplyEngine, BatchOutcome, EntryOutcome, EntryStatus, MissingParent};
pub use config::{
   ColumnMapping, Direction, MappingConfig, PkMapping, TableMapping, TargetConfig, Transform,
   UnmappedBehavior,
};
pub use conflict::{HashMismatch, Winner};
pub use error::Error;
pub use mapping::{apply_mapping, map_batch};

pub type Result<T> = std::result::Result<T, Error>;
