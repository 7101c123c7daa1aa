//! Per-peer pull/push cycles.
//!
//! One coordinator task runs per configured peer. Each cycle pulls the
//! peer's new changes, maps them for direction `pull`, applies them, then
//! pushes the local log tail mapped for direction `push`. Transport
//! failures back off exponentially; a permanent 4xx quarantines the peer
//! until an operator intervenes. Cancellation is honored between phases
//! and between batches.

use std::collections::HashSet;
use std::time::Duration;

use reqwest::StatusCode;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rowsync_engine::{Direction, EntryStatus, map_batch};
use rowsync_store::{ChangeEntry, SyncStore as _, WatermarkField};

use crate::config::PeerConfig;
use crate::error::{Error, Result};
use crate::state::AppState;
use crate::wire::{ChangesResponse, PushRequest, PushResponse, StateResponse};

/// HTTP timeout for any single call to a peer.
const PEER_TIMEOUT: Duration = Duration::from_secs(30);

const BACKOFF_BASE: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// Exponential backoff: 100 ms × 2ⁿ, capped, reset on success.
#[derive(Debug, Default)]
struct Backoff {
   failures: u32,
}

impl Backoff {
   fn next(&mut self) -> Duration {
      let delay = BACKOFF_BASE
         .saturating_mul(2u32.saturating_pow(self.failures))
         .min(BACKOFF_CAP);
      self.failures = self.failures.saturating_add(1);
      delay
   }

   fn reset(&mut self) {
      self.failures = 0;
   }
}

pub struct Coordinator {
   peer: PeerConfig,
   state: AppState,
   client: reqwest::Client,
   interval: Duration,
   peer_origin: Option<String>,
   backoff: Backoff,
}

impl Coordinator {
   pub fn new(peer: PeerConfig, state: AppState, interval: Duration) -> Self {
      let client = reqwest::Client::builder()
         .timeout(PEER_TIMEOUT)
         .build()
         .expect("reqwest client construction cannot fail with static options");
      Self {
         peer,
         state,
         client,
         interval,
         peer_origin: None,
         backoff: Backoff::default(),
      }
   }

   /// Runs cycles until cancelled or the peer is quarantined.
   pub async fn run(mut self, cancel: CancellationToken) {
      info!(peer = %self.peer.name, endpoint = %self.peer.endpoint, "coordinator started");
      let mut delay = Duration::ZERO;
      loop {
         tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
         }

         match self.cycle(&cancel).await {
            Ok(()) => {
               self.backoff.reset();
               delay = self.interval;
            }
            Err(Error::Engine(rowsync_engine::Error::Cancelled)) => break,
            Err(Error::PeerQuarantined { peer, status }) => {
               warn!(peer = %peer, status, "peer quarantined; coordinator stopping");
               self
                  .state
                  .diagnostics
                  .record_quarantine(&peer, format!("permanent status {status}"))
                  .await;
               break;
            }
            Err(e) => {
               delay = self.backoff.next();
               warn!(
                  peer = %self.peer.name,
                  error = %e,
                  retry_in_ms = delay.as_millis() as u64,
                  "cycle failed, backing off"
               );
            }
         }
      }
      info!(peer = %self.peer.name, "coordinator stopped");
   }

   /// One pull phase followed by one push phase.
   pub async fn cycle(&mut self, cancel: &CancellationToken) -> Result<()> {
      self.ensure_peer_origin().await?;
      self.pull(cancel).await?;
      if cancel.is_cancelled() {
         return Ok(());
      }
      self.push(cancel).await?;
      Ok(())
   }

   /// Learns the peer's origin id (once) and registers the peer.
   async fn ensure_peer_origin(&mut self) -> Result<()> {
      if self.peer_origin.is_some() {
         return Ok(());
      }
      let url = format!("{}/sync/state", self.peer.endpoint);
      let response = self.send(self.client.get(&url)).await?;
      let state: StateResponse = response
         .json()
         .await
         .map_err(|e| self.transient(e.to_string()))?;
      debug!(peer = %self.peer.name, origin = %state.origin_id, "peer origin learned");
      self
         .state
         .store
         .upsert_peer(&self.peer.name, Some(&state.origin_id), &self.peer.endpoint)
         .await?;
      self.peer_origin = Some(state.origin_id);
      Ok(())
   }

   async fn pull(&self, cancel: &CancellationToken) -> Result<()> {
      loop {
         if cancel.is_cancelled() {
            return Ok(());
         }
         let from = self.state.store.watermark(&self.peer.name).await?.last_pulled;
         let url = format!(
            "{}/sync/changes?fromVersion={}&limit={}&origin={}",
            self.peer.endpoint, from, self.state.batch_limit, self.state.origin,
         );
         let response = self.send(self.client.get(&url)).await?;
         let body: ChangesResponse = response
            .json()
            .await
            .map_err(|e| self.transient(e.to_string()))?;
         if body.changes.is_empty() {
            return Ok(());
         }

         let config = self.state.mapping_config();
         let mapped = map_batch(&body.changes, &config, Direction::Pull)?;
         let server_wins = config.server_wins_tables(Direction::Pull);
         let outcome = self
            .state
            .engine
            .apply_batch(mapped.clone(), &self.peer.name, &server_wins, cancel)
            .await?;
         self.state.diagnostics.record_batch(&outcome).await;

         // Applied remote entries feed local subscribers with their
         // remote origin intact.
         let applied: HashSet<(i64, &str)> = outcome
            .outcomes
            .iter()
            .filter(|o| o.status == EntryStatus::Applied)
            .map(|o| (o.version, o.table.as_str()))
            .collect();
         let delivered: Vec<ChangeEntry> = mapped
            .iter()
            .filter(|e| applied.contains(&(e.version, e.table_name.as_str())))
            .cloned()
            .collect();
         if !delivered.is_empty() {
            self.state.hub.publish(&delivered);
         }

         // Entries the mapping dropped or filtered out produced no engine
         // outcome but are consumed all the same; with nothing unresolved
         // the cursor can cover the whole fetched range.
         let consumed = if outcome.unresolved == 0 {
            body.to_version.max(outcome.watermark)
         } else {
            outcome.watermark
         };
         if consumed > from {
            self
               .state
               .store
               .set_watermark(&self.peer.name, WatermarkField::LastPulled, consumed)
               .await?;
         }

         debug!(
            peer = %self.peer.name,
            pulled = body.changes.len(),
            watermark = consumed,
            "pull batch done"
         );
         if !body.has_more || consumed <= from {
            return Ok(());
         }
      }
   }

   async fn push(&self, cancel: &CancellationToken) -> Result<()> {
      loop {
         if cancel.is_cancelled() {
            return Ok(());
         }
         let from = self.state.store.watermark(&self.peer.name).await?.last_pushed;
         let batch = self
            .state
            .store
            .fetch_changes(from, self.state.batch_limit, self.peer_origin.as_deref())
            .await?;
         if batch.entries.is_empty() {
            return Ok(());
         }

         let config = self.state.mapping_config();
         let mapped = map_batch(&batch.entries, &config, Direction::Push)?;
         if !mapped.is_empty() {
            let url = format!("{}/sync/changes", self.peer.endpoint);
            let request = PushRequest {
               origin_id: self.state.origin.clone(),
               changes: mapped,
            };
            let response = self.send(self.client.post(&url).json(&request)).await?;
            let accepted: PushResponse = response
               .json()
               .await
               .map_err(|e| self.transient(e.to_string()))?;
            debug!(
               peer = %self.peer.name,
               pushed = batch.entries.len(),
               applied = accepted.applied,
               to_version = batch.to_version,
               "push batch done"
            );
         }

         self
            .state
            .store
            .set_watermark(&self.peer.name, WatermarkField::LastPushed, batch.to_version)
            .await?;
         // The peer has applied this prefix of our log.
         if let Some(origin) = self.peer_origin.as_deref() {
            self.state.store.record_peer_ack(origin, batch.to_version).await?;
         }
         if !batch.has_more {
            return Ok(());
         }
      }
   }

   /// Sends one request, classifying failures into transient (retry with
   /// backoff) and permanent (quarantine).
   async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response> {
      let response = request
         .send()
         .await
         .map_err(|e| self.transient(e.to_string()))?;
      let status = response.status();
      if status.is_success() {
         return Ok(response);
      }
      if is_permanent(status) {
         return Err(Error::PeerQuarantined {
            peer: self.peer.name.clone(),
            status: status.as_u16(),
         });
      }
      Err(self.transient(format!("status {status}")))
   }

   fn transient(&self, message: String) -> Error {
      Error::TransientNetwork {
         peer: self.peer.name.clone(),
         message,
      }
   }
}

/// 4xx statuses that will not heal on their own. Timeouts and rate limits
/// stay transient.
fn is_permanent(status: StatusCode) -> bool {
   status.is_client_error()
      && status != StatusCode::REQUEST_TIMEOUT
      && status != StatusCode::TOO_MANY_REQUESTS
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_backoff_doubles_and_caps() {
      let mut backoff = Backoff::default();
      assert_eq!(backoff.next(), Duration::from_millis(100));
      assert_eq!(backoff.next(), Duration::from_millis(200));
      assert_eq!(backoff.next(), Duration::from_millis(400));
      for _ in 0..20 {
         backoff.next();
      }
      assert_eq!(backoff.next(), BACKOFF_CAP);

      backoff.reset();
      assert_eq!(backoff.next(), Duration::from_millis(100));
   }

   #[test]
   fn test_permanent_status_classification() {
      assert!(is_permanent(StatusCode::BAD_REQUEST));
      assert!(is_permanent(StatusCode::FORBIDDEN));
      assert!(is_permanent(StatusCode::NOT_FOUND));
      assert!(!is_permanent(StatusCode::REQUEST_TIMEOUT));
      assert!(!is_permanent(StatusCode::TOO_MANY_REQUESTS));
      assert!(!is_permanent(StatusCode::INTERNAL_SERVER_ERROR));
      assert!(!is_permanent(StatusCode::OK));
   }
}
