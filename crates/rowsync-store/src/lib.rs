//! Change capture and the append-only change log.
//!
//! This crate owns the database-facing half of the sync engine: schema
//! installation, trigger generation, the monotonic change log, per-peer
//! watermarks, and the suppressed apply sessions that let remote changes
//! be written without re-capturing them.
//!
//! Two dialect adapters ship behind the [`SyncStore`] trait:
//!
//! - [`SqliteStore`] for the embedded file dialect (suppression via a
//!   per-connection temp table, versions via `MAX(version)+1` under the
//!   serialized writer)
//! - [`PgStore`] for the centralized dialect (suppression via a
//!   transaction-local setting, versions via a sequence)
//!
//! Everything above this crate is dialect-agnostic.

pub mod entry;
pub mod error;
pub mod postgres;
pub mod schema;
pub mod sqlite;
pub mod store;

pub use entry::{
   ChangeBatch, ChangeEntry, Operation, Watermark, WatermarkField, canonical_json_str,
   canonicalize, parse_timestamp, row_hash,
};
pub use error::Error;
pub use postgres::PgStore;
pub use schema::{ForeignKey, SyncTable, TableSchema};
pub use sqlite::SqliteStore;
pub use store::{ApplySession, MAX_FETCH_LIMIT, SyncStore, clamp_limit, connect};

pub type Result<T> = std::result::Result<T, Error>;
