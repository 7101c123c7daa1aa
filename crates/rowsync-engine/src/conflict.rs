//! Deterministic conflict resolution and post-apply hash verification.

use serde::Serialize;
use tracing::warn;

use rowsync_store::{ChangeEntry, SyncStore, row_hash};

use crate::error::Result;

/// Which side of a conflicting row wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Winner {
   Incoming,
   Local,
}

/// Last-writer-wins: the larger `(timestamp, origin)` tuple takes the row.
///
/// Timestamps are compared as RFC 3339 UTC strings, so lexicographic and
/// chronological order coincide; ties on the timestamp fall back to the
/// origin id, which totals the order without a clock authority. A mapping
/// may force the incoming side with `server_wins`.
pub fn resolve(incoming: &ChangeEntry, local: &ChangeEntry, server_wins: bool) -> Winner {
   if server_wins {
      return Winner::Incoming;
   }
   let incoming_key = (incoming.timestamp_str(), incoming.origin.as_str());
   let local_key = (local.timestamp_str(), local.origin.as_str());
   if incoming_key >= local_key {
      Winner::Incoming
   } else {
      Winner::Local
   }
}

/// A stored row whose recomputed hash disagrees with the entry that wrote
/// it. Diagnostic only; the entry is not re-applied.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HashMismatch {
   pub table: String,
   pub pk_value: String,
   pub version: i64,
   pub expected: String,
   /// Hash over the stored row, or `None` when the row is gone.
   pub actual: Option<String>,
}

/// Recomputes the hash over the stored row and compares it with the
/// entry's. `None` means the row verified clean (or carried no hash).
pub async fn verify_row_hash(
   store: &dyn SyncStore,
   entry: &ChangeEntry,
) -> Result<Option<HashMismatch>> {
   let (Some(expected), Some(payload)) = (entry.row_hash.as_deref(), entry.payload.as_deref())
   else {
      return Ok(None);
   };

   let columns: Vec<String> = match serde_json::from_str::<serde_json::Value>(payload) {
      Ok(serde_json::Value::Object(map)) => map.keys().cloned().collect(),
      _ => return Ok(None),
   };

   let stored = store
      .read_row(&entry.table_name, &entry.pk_value, &columns)
      .await?;
   let actual = stored
      .as_deref()
      .map(|row| row_hash(&entry.table_name, &entry.pk_value, row));

   if actual.as_deref() == Some(expected) {
      return Ok(None);
   }

   warn!(
      table = %entry.table_name,
      pk = %entry.pk_value,
      version = entry.version,
      "row hash mismatch after apply"
   );
   Ok(Some(HashMismatch {
      table: entry.table_name.clone(),
      pk_value: entry.pk_value.clone(),
      version: entry.version,
      expected: expected.to_string(),
      actual,
   }))
}
