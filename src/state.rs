//! Shared process state and operator-facing diagnostics.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::RwLock;

use rowsync_engine::{ApplyEngine, BatchOutcome, EntryOutcome, EntryStatus, HashMismatch, MappingConfig};
use rowsync_hub::SubscriptionHub;
use rowsync_store::SyncStore;

/// Bound on how many diagnostic records are retained.
const DIAGNOSTICS_CAP: usize = 100;

/// Operator-facing trouble: hash mismatches, unresolved dependencies, and
/// quarantined peers, surfaced at `GET /sync/diagnostics`.
#[derive(Default)]
pub struct Diagnostics {
   hash_mismatches: RwLock<Vec<HashMismatch>>,
   unresolved: RwLock<Vec<EntryOutcome>>,
   quarantined: RwLock<HashMap<String, String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsReport {
   pub hash_mismatches: Vec<HashMismatch>,
   pub unresolved: Vec<EntryOutcome>,
   pub quarantined_peers: HashMap<String, String>,
}

impl Diagnostics {
   pub async fn record_batch(&self, outcome: &BatchOutcome) {
      if !outcome.hash_mismatches.is_empty() {
         let mut mismatches = self.hash_mismatches.write().await;
         mismatches.extend(outcome.hash_mismatches.iter().cloned());
         cap(&mut mismatches);
      }
      let failed: Vec<EntryOutcome> = outcome
         .outcomes
         .iter()
         .filter(|o| o.status == EntryStatus::Unresolved)
         .cloned()
         .collect();
      if !failed.is_empty() {
         let mut unresolved = self.unresolved.write().await;
         unresolved.extend(failed);
         cap(&mut unresolved);
      }
   }

   pub async fn record_quarantine(&self, peer: &str, reason: String) {
      self.quarantined.write().await.insert(peer.to_string(), reason);
   }

   pub async fn has_unresolved(&self) -> bool {
      !self.unresolved.read().await.is_empty()
   }

   pub async fn report(&self) -> DiagnosticsReport {
      DiagnosticsReport {
         hash_mismatches: self.hash_mismatches.read().await.clone(),
         unresolved: self.unresolved.read().await.clone(),
         quarantined_peers: self.quarantined.read().await.clone(),
      }
   }
}

fn cap<T>(records: &mut Vec<T>) {
   if records.len() > DIAGNOSTICS_CAP {
      let excess = records.len() - DIAGNOSTICS_CAP;
      records.drain(..excess);
   }
}

/// Everything the HTTP handlers and coordinators share.
#[derive(Clone)]
pub struct AppState {
   pub store: Arc<dyn SyncStore>,
   pub engine: Arc<ApplyEngine>,
   pub hub: Arc<SubscriptionHub>,
   /// Read-mostly mapping config; reloads swap the pointer atomically.
   pub mapping: Arc<ArcSwap<MappingConfig>>,
   pub diagnostics: Arc<Diagnostics>,
   pub origin: String,
   pub batch_limit: i64,
}

impl AppState {
   /// Current mapping config snapshot.
   pub fn mapping_config(&self) -> Arc<MappingConfig> {
      self.mapping.load_full()
   }

   /// Atomically replaces the mapping config.
   pub fn swap_mapping(&self, config: MappingConfig) {
      self.mapping.store(Arc::new(config));
   }
}
