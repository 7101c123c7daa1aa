//! The dialect seam.
//!
//! Everything above this trait is dialect-agnostic: the apply engine, the
//! coordinator, and the HTTP surface only ever see `dyn SyncStore`. The two
//! shipped adapters are [`SqliteStore`](crate::SqliteStore) for the embedded
//! file dialect and [`PgStore`](crate::PgStore) for the centralized dialect.

use std::sync::Arc;

use async_trait::async_trait;

use crate::entry::{ChangeBatch, ChangeEntry, Watermark, WatermarkField};
use crate::error::{Error, Result};
use crate::schema::{ForeignKey, SyncTable, TableSchema};

/// Upper bound a dialect will ever return from one `fetch_changes` call.
pub const MAX_FETCH_LIMIT: i64 = 1000;

/// Clamps a caller-supplied batch limit into `1..=MAX_FETCH_LIMIT`.
pub fn clamp_limit(limit: i64) -> i64 {
   limit.clamp(1, MAX_FETCH_LIMIT)
}

/// One store-backed node: schema installation, change capture, the log
/// repository, and suppressed apply sessions.
#[async_trait]
pub trait SyncStore: Send + Sync {
   /// Creates the log and state tables and assigns the node origin id on
   /// first install. Idempotent.
   async fn install_schema(&self) -> Result<()>;

   /// Introspects a user table, honoring the configured excluded columns.
   async fn table_schema(&self, table: &SyncTable) -> Result<TableSchema>;

   /// Installs the three capture triggers for one table. Re-installation
   /// drops and recreates byte-identical bodies.
   async fn install_triggers(&self, schema: &TableSchema) -> Result<()>;

   /// The stable origin id of this node.
   async fn origin(&self) -> Result<String>;

   /// Returns up to `limit` (clamped) entries with `version > from_version`
   /// in ascending version order, excluding entries whose origin equals
   /// `echo_filter`.
   async fn fetch_changes(
      &self,
      from_version: i64,
      limit: i64,
      echo_filter: Option<&str>,
   ) -> Result<ChangeBatch>;

   /// Highest version currently in the log, or 0 when empty.
   async fn latest_version(&self) -> Result<i64>;

   /// Most recent log entry for one row, used for conflict detection.
   async fn latest_entry_for(&self, table: &str, pk_value: &str) -> Result<Option<ChangeEntry>>;

   async fn watermark(&self, peer: &str) -> Result<Watermark>;

   /// Advances one watermark cursor. Idempotent; a regressing value is an
   /// error.
   async fn set_watermark(&self, peer: &str, field: WatermarkField, value: i64) -> Result<()>;

   /// Registers (or re-registers) a peer in the peer table.
   async fn upsert_peer(&self, peer_id: &str, origin: Option<&str>, endpoint: &str) -> Result<()>;

   /// Records how far the node with `origin` has consumed this log.
   /// Monotonic; stale acks are ignored.
   async fn record_peer_ack(&self, origin: &str, version: i64) -> Result<()>;

   /// Highest version every known consumer has acked, or `None` while any
   /// registered peer has not acked yet. Entries at or below this bound
   /// (tombstones included) are safe to prune.
   async fn prunable_version(&self) -> Result<Option<i64>>;

   /// Deletes log entries at or below `min_watermark`, keeping tombstones
   /// alive until every tracked peer has pulled past them.
   async fn prune_log(&self, min_watermark: i64) -> Result<u64>;

   /// Foreign-key edges among the given tables, for topological apply order.
   async fn foreign_keys(&self, tables: &[String]) -> Result<Vec<ForeignKey>>;

   /// Reads one row back as canonical JSON over `columns`, for post-apply
   /// hash verification. Returns `None` when the row does not exist.
   async fn read_row(
      &self,
      table: &str,
      pk_value: &str,
      columns: &[String],
   ) -> Result<Option<String>>;

   /// Opens a write transaction with capture suppression enabled on the
   /// session's connection. Suppression stays set for the life of the
   /// session and is cleared on every exit path.
   async fn begin_apply(&self) -> Result<Box<dyn ApplySession>>;
}

/// A suppressed write transaction against the local store.
///
/// Dropping a session without finalizing it discards the connection, which
/// rolls the transaction back and releases the suppression flag with it.
#[async_trait]
pub trait ApplySession: Send {
   /// Inserts or fully updates one row, keyed by its canonical PK JSON.
   async fn upsert(&mut self, table: &str, pk_value: &str, payload: &str) -> Result<()>;

   /// Deletes one row by canonical PK JSON. Deleting a missing row is a
   /// success.
   async fn delete(&mut self, table: &str, pk_value: &str) -> Result<()>;

   async fn commit(self: Box<Self>) -> Result<()>;

   async fn rollback(self: Box<Self>) -> Result<()>;
}

/// Opens the store matching the database URL: `postgres://` selects the
/// centralized dialect, everything else is treated as an embedded SQLite
/// path or URL.
pub async fn connect(url: &str) -> Result<Arc<dyn SyncStore>> {
   if url.starts_with("postgres://") || url.starts_with("postgresql://") {
      Ok(Arc::new(crate::postgres::PgStore::connect(url).await?))
   } else if url.is_empty() {
      Err(Error::UnsupportedUrl(url.to_string()))
   } else {
      Ok(Arc::new(crate::sqlite::SqliteStore::connect(url).await?))
   }
}

/// Shared ack arithmetic for both dialects: the prunable bound is the
/// minimum over every recorded ack, and only exists once every registered
/// peer has acked at least once.
pub(crate) fn compute_prunable(
   registered_origins: &[Option<String>],
   acks: &std::collections::HashMap<String, i64>,
) -> Option<i64> {
   for origin in registered_origins {
      match origin {
         Some(origin) if acks.contains_key(origin) => {}
         // A peer whose origin is unknown or silent pins the whole log.
         _ => return None,
      }
   }
   acks.values().copied().min()
}
