//! Applies batches of mapped entries to the local store.
//!
//! The whole batch runs inside one suppressed write transaction. Tables
//! are visited in foreign-key topological order and entries within a
//! table in ascending source-version order. Entries rejected for a
//! missing parent are deferred and retried; the per-peer watermark only
//! advances over the contiguous prefix of versions that fully succeeded.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use rowsync_store::{ApplySession, ChangeEntry, ForeignKey, Operation, SyncStore, WatermarkField};

use crate::conflict::{self, HashMismatch, Winner};
use crate::error::{Error, Result};

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// What happened to one entry of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EntryStatus {
   Applied,
   /// A newer local change won the conflict; the entry was deliberately
   /// not applied.
   ConflictSkipped,
   /// Deferred past every retry because a parent row never arrived.
   Unresolved,
}

/// The parent row a deferred entry was waiting for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MissingParent {
   pub table: String,
   pub key: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EntryOutcome {
   pub version: i64,
   pub table: String,
   pub pk_value: String,
   pub status: EntryStatus,
   #[serde(skip_serializing_if = "Option::is_none")]
   pub missing_parent: Option<MissingParent>,
}

/// Per-entry outcomes plus the cumulative cursor for one applied batch.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
   pub outcomes: Vec<EntryOutcome>,
   pub applied: usize,
   pub skipped: usize,
   pub unresolved: usize,
   /// The peer watermark after this batch.
   pub watermark: i64,
   pub hash_mismatches: Vec<HashMismatch>,
}

/// Applies mapped batches from one remote peer to the local store.
pub struct ApplyEngine {
   store: Arc<dyn SyncStore>,
   max_retries: u32,
}

impl ApplyEngine {
   pub fn new(store: Arc<dyn SyncStore>) -> Self {
      Self {
         store,
         max_retries: DEFAULT_MAX_RETRIES,
      }
   }

   pub fn with_max_retries(mut self, max_retries: u32) -> Self {
      self.max_retries = max_retries;
      self
   }

   /// Applies one batch for `peer`, resolving conflicts against the local
   /// log and advancing `last_pulled_version{peer}` over the contiguous
   /// succeeded prefix.
   pub async fn apply_batch(
      &self,
      entries: Vec<ChangeEntry>,
      peer: &str,
      server_wins_tables: &HashSet<String>,
      cancel: &CancellationToken,
   ) -> Result<BatchOutcome> {
      let last_pulled = self.store.watermark(peer).await?.last_pulled;
      if entries.is_empty() {
         return Ok(BatchOutcome {
            watermark: last_pulled,
            ..BatchOutcome::default()
         });
      }

      // Conflict pass: the latest locally captured entry for the same row
      // contends with the incoming one whenever the origins differ. The
      // comparison is independent of delivery order, so every node picks
      // the same winner. Losers are skipped, never applied.
      let mut skipped: Vec<EntryOutcome> = Vec::new();
      let mut to_apply: Vec<ChangeEntry> = Vec::new();
      for entry in entries {
         let local = self
            .store
            .latest_entry_for(&entry.table_name, &entry.pk_value)
            .await?;
         let conflicting = local.as_ref().filter(|l| l.origin != entry.origin);
         if let Some(local) = conflicting {
            let server_wins = server_wins_tables.contains(&entry.table_name);
            if conflict::resolve(&entry, local, server_wins) == Winner::Local {
               debug!(
                  table = %entry.table_name,
                  pk = %entry.pk_value,
                  incoming = entry.version,
                  local = local.version,
                  "local change wins conflict; incoming entry skipped"
               );
               skipped.push(EntryOutcome {
                  version: entry.version,
                  table: entry.table_name.clone(),
                  pk_value: entry.pk_value.clone(),
                  status: EntryStatus::ConflictSkipped,
                  missing_parent: None,
               });
               continue;
            }
         }
         to_apply.push(entry);
      }

      // Table order: foreign-key parents before children.
      let tables: Vec<String> = {
         let mut seen = HashSet::new();
         to_apply
            .iter()
            .filter(|e| seen.insert(e.table_name.clone()))
            .map(|e| e.table_name.clone())
            .collect()
      };
      let edges = self.store.foreign_keys(&tables).await?;
      let order = topo_order(&tables, &edges);
      let rank: HashMap<&str, usize> = order
         .iter()
         .enumerate()
         .map(|(i, t)| (t.as_str(), i))
         .collect();
      to_apply.sort_by(|a, b| {
         let ta = rank.get(a.table_name.as_str()).copied().unwrap_or(usize::MAX);
         let tb = rank.get(b.table_name.as_str()).copied().unwrap_or(usize::MAX);
         ta.cmp(&tb).then(a.version.cmp(&b.version))
      });

      let mut session = self.store.begin_apply().await?;
      let mut applied: Vec<ChangeEntry> = Vec::new();
      let mut deferred: Vec<(ChangeEntry, MissingParent)> = Vec::new();

      for entry in to_apply {
         if cancel.is_cancelled() {
            session.rollback().await?;
            return Err(Error::Cancelled);
         }
         match apply_one(session.as_mut(), &entry).await {
            Ok(()) => applied.push(entry),
            Err(Error::Store(e)) if e.is_foreign_key_violation() => {
               let parent = missing_parent(&entry, &edges);
               trace!(
                  table = %entry.table_name,
                  version = entry.version,
                  parent = %parent.table,
                  "entry deferred on missing parent"
               );
               deferred.push((entry, parent));
            }
            Err(e) => {
               session.rollback().await?;
               return Err(e);
            }
         }
      }

      // Retry deferred entries; each pass may have applied a parent the
      // previous pass was missing.
      let mut attempt = 0;
      while !deferred.is_empty() && attempt < self.max_retries {
         attempt += 1;
         if cancel.is_cancelled() {
            session.rollback().await?;
            return Err(Error::Cancelled);
         }
         let mut still_deferred = Vec::new();
         let before = deferred.len();
         for (entry, parent) in deferred {
            match apply_one(session.as_mut(), &entry).await {
               Ok(()) => applied.push(entry),
               Err(Error::Store(e)) if e.is_foreign_key_violation() => {
                  still_deferred.push((entry, parent));
               }
               Err(e) => {
                  session.rollback().await?;
                  return Err(e);
               }
            }
         }
         deferred = still_deferred;
         if deferred.len() == before {
            break;
         }
      }

      session.commit().await?;

      let mut outcomes: Vec<EntryOutcome> = applied
         .iter()
         .map(|e| EntryOutcome {
            version: e.version,
            table: e.table_name.clone(),
            pk_value: e.pk_value.clone(),
            status: EntryStatus::Applied,
            missing_parent: None,
         })
         .collect();
      outcomes.extend(skipped);
      for (entry, parent) in &deferred {
         warn!(
            table = %entry.table_name,
            version = entry.version,
            parent = %parent.table,
            "dependency unresolved after {} retries",
            self.max_retries
         );
         outcomes.push(EntryOutcome {
            version: entry.version,
            table: entry.table_name.clone(),
            pk_value: entry.pk_value.clone(),
            status: EntryStatus::Unresolved,
            missing_parent: Some(parent.clone()),
         });
      }
      outcomes.sort_by_key(|o| o.version);

      // Post-apply hash verification; diagnostic only.
      let mut hash_mismatches = Vec::new();
      for entry in &applied {
         if entry.operation != Operation::Delete
            && let Some(mismatch) = conflict::verify_row_hash(self.store.as_ref(), entry).await?
         {
            hash_mismatches.push(mismatch);
         }
      }

      let watermark = contiguous_watermark(last_pulled, &outcomes);
      if watermark > last_pulled {
         self
            .store
            .set_watermark(peer, WatermarkField::LastPulled, watermark)
            .await?;
      }

      let applied_count = outcomes
         .iter()
         .filter(|o| o.status == EntryStatus::Applied)
         .count();
      let skipped_count = outcomes
         .iter()
         .filter(|o| o.status == EntryStatus::ConflictSkipped)
         .count();
      let unresolved_count = outcomes
         .iter()
         .filter(|o| o.status == EntryStatus::Unresolved)
         .count();
      debug!(
         peer = %peer,
         applied = applied_count,
         skipped = skipped_count,
         unresolved = unresolved_count,
         watermark,
         "batch applied"
      );

      Ok(BatchOutcome {
         outcomes,
         applied: applied_count,
         skipped: skipped_count,
         unresolved: unresolved_count,
         watermark,
         hash_mismatches,
      })
   }
}

async fn apply_one(session: &mut dyn ApplySession, entry: &ChangeEntry) -> Result<()> {
   match entry.operation {
      Operation::Insert | Operation::Update => {
         let payload = entry.payload.as_deref().unwrap_or("{}");
         session
            .upsert(&entry.table_name, &entry.pk_value, payload)
            .await?;
      }
      Operation::Delete => {
         session.delete(&entry.table_name, &entry.pk_value).await?;
      }
   }
   Ok(())
}

/// Best-effort identification of the parent a rejected entry was missing.
fn missing_parent(entry: &ChangeEntry, edges: &[ForeignKey]) -> MissingParent {
   let payload: Option<serde_json::Value> = entry
      .payload
      .as_deref()
      .and_then(|p| serde_json::from_str(p).ok());

   for edge in edges.iter().filter(|e| e.table == entry.table_name) {
      let key = payload
         .as_ref()
         .and_then(|p| p.get(&edge.column))
         .map(|v| v.to_string());
      return MissingParent {
         table: edge.references.clone(),
         key,
      };
   }
   MissingParent {
      table: "unknown".to_string(),
      key: None,
   }
}

/// Kahn's algorithm over the foreign-key graph, parents first. A cycle is
/// broken at the member with the fewest inbound edges, whose entries then
/// rely on the deferred-retry path.
fn topo_order(tables: &[String], edges: &[ForeignKey]) -> Vec<String> {
   let table_set: HashSet<&str> = tables.iter().map(String::as_str).collect();
   // child -> set of parents it waits for
   let mut parents: HashMap<&str, HashSet<&str>> = HashMap::new();
   for table in tables {
      parents.insert(table.as_str(), HashSet::new());
   }
   for edge in edges {
      if edge.table != edge.references
         && table_set.contains(edge.table.as_str())
         && table_set.contains(edge.references.as_str())
      {
         parents
            .get_mut(edge.table.as_str())
            .expect("child table registered above")
            .insert(edge.references.as_str());
      }
   }

   let mut order = Vec::with_capacity(tables.len());
   let mut remaining: Vec<&str> = tables.iter().map(String::as_str).collect();
   while !remaining.is_empty() {
      let next = remaining
         .iter()
         .position(|t| parents[t].is_empty())
         .unwrap_or_else(|| {
            // Cycle: fall back to the member with the fewest unmet parents.
            let (idx, table) = remaining
               .iter()
               .enumerate()
               .min_by_key(|(_, t)| parents[*t].len())
               .expect("remaining is non-empty");
            warn!(table = %table, "foreign-key cycle broken for apply ordering");
            idx
         });
      let table = remaining.remove(next);
      for waiting in parents.values_mut() {
         waiting.remove(table);
      }
      order.push(table.to_string());
   }
   order
}

/// Largest version whose whole prefix succeeded (applied or deliberately
/// skipped). An unresolved entry pins the watermark below itself so the
/// entry is re-delivered.
fn contiguous_watermark(current: i64, outcomes: &[EntryOutcome]) -> i64 {
   let mut by_version: Vec<(i64, bool)> = Vec::new();
   for outcome in outcomes {
      let ok = outcome.status != EntryStatus::Unresolved;
      match by_version.last_mut() {
         // Multi-target fan-out yields several outcomes per version; the
         // version succeeds only if all of them do.
         Some((version, all_ok)) if *version == outcome.version => *all_ok &= ok,
         _ => by_version.push((outcome.version, ok)),
      }
   }

   let mut watermark = current;
   for (version, ok) in by_version {
      if !ok {
         break;
      }
      if version > watermark {
         watermark = version;
      }
   }
   watermark
}
