//! Fan-out of committed log entries to registered subscribers.
//!
//! Each subscription owns a bounded mpsc channel with a single producer
//! (the hub) and a single consumer (the stream writer). A full sink marks
//! the subscriber lagging and closes it with [`CloseReason::Overflow`]
//! rather than blocking the publisher or dropping entries silently.
//!
//! A detached stream leaves its receiver parked in the hub for a linger
//! window, so a reconnecting client resumes exactly where the previous
//! stream stopped.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use rowsync_store::ChangeEntry;

use crate::error::{Error, Result};
use crate::stream::ChangeStream;
use crate::subscription::{CloseReason, Subscription, SubscriptionKind, SubscriptionSpec};

pub const DEFAULT_QUEUE_CAPACITY: usize = 256;
pub const DEFAULT_LINGER: Duration = Duration::from_secs(30);

/// Hub configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
   /// Per-subscription sink capacity.
   pub queue_capacity: usize,
   /// How long a disconnected subscription survives awaiting a reconnect.
   pub linger: Duration,
}

impl Default for HubConfig {
   fn default() -> Self {
      Self {
         queue_capacity: DEFAULT_QUEUE_CAPACITY,
         linger: DEFAULT_LINGER,
      }
   }
}

struct SubEntry {
   spec: SubscriptionSpec,
   tx: mpsc::Sender<ChangeEntry>,
   /// Receiver, present while no stream is attached.
   parked: Option<mpsc::Receiver<ChangeEntry>>,
   /// Bumped on every attach/release so a stale linger reaper cannot
   /// close a subscription that reconnected in time.
   epoch: u64,
   lagging: bool,
}

/// The subscription registry and publisher.
pub struct SubscriptionHub {
   subs: RwLock<HashMap<Uuid, SubEntry>>,
   closed: Mutex<HashMap<Uuid, CloseReason>>,
   config: HubConfig,
}

impl SubscriptionHub {
   pub fn new(config: HubConfig) -> Arc<Self> {
      Arc::new(Self {
         subs: RwLock::new(HashMap::new()),
         closed: Mutex::new(HashMap::new()),
         config,
      })
   }

   /// Registers a subscriber and returns its stable id.
   pub fn subscribe(&self, spec: SubscriptionSpec) -> Subscription {
      let id = Uuid::new_v4();
      let (tx, rx) = mpsc::channel(self.config.queue_capacity);
      debug!(
         subscription = %id,
         table = %spec.table_name,
         kind = ?spec.kind,
         "subscription registered"
      );
      self.subs.write().insert(
         id,
         SubEntry {
            spec: spec.clone(),
            tx,
            parked: Some(rx),
            epoch: 0,
            lagging: false,
         },
      );
      Subscription { id, spec }
   }

   /// Removes a subscription and closes its sink.
   pub fn unsubscribe(&self, id: Uuid) -> bool {
      let removed = self.subs.write().remove(&id).is_some();
      if removed {
         debug!(subscription = %id, "subscription removed");
         self.closed.lock().insert(id, CloseReason::Unsubscribed);
      }
      removed
   }

   /// Number of registered subscriptions.
   pub fn active_count(&self) -> usize {
      self.subs.read().len()
   }

   /// Why a subscription is gone, if the hub closed it.
   pub fn close_reason(&self, id: Uuid) -> Option<CloseReason> {
      self.closed.lock().get(&id).copied()
   }

   /// Fans a batch of committed entries out to every matching subscriber.
   ///
   /// Entries must be passed in ascending version order per origin; the
   /// per-subscription channel preserves that order.
   pub fn publish(&self, entries: &[ChangeEntry]) {
      let mut overflowed: Vec<Uuid> = Vec::new();
      {
         let mut subs = self.subs.write();
         for (id, sub) in subs.iter_mut() {
            for entry in entries {
               if !matches(&sub.spec, entry) {
                  continue;
               }
               match sub.tx.try_send(entry.clone()) {
                  Ok(()) => {
                     sub.lagging = false;
                     trace!(subscription = %id, version = entry.version, "entry enqueued");
                  }
                  Err(mpsc::error::TrySendError::Full(_)) => {
                     if sub.lagging {
                        overflowed.push(*id);
                        break;
                     }
                     // One full-sink strike; the subscriber gets a chance
                     // to drain before the next publish closes it.
                     sub.lagging = true;
                     warn!(subscription = %id, "subscription sink full, marked lagging");
                     break;
                  }
                  Err(mpsc::error::TrySendError::Closed(_)) => {
                     overflowed.push(*id);
                     break;
                  }
               }
            }
         }
         for id in &overflowed {
            subs.remove(id);
         }
      }
      for id in overflowed {
         warn!(subscription = %id, "subscription closed with overflow");
         self.closed.lock().insert(id, CloseReason::Overflow);
      }
   }

   /// Returns a receiver to the hub when its stream is dropped, and arms
   /// the linger reaper.
   pub(crate) fn release(hub: &Arc<Self>, id: Uuid, rx: mpsc::Receiver<ChangeEntry>) {
      let epoch = {
         let mut subs = hub.subs.write();
         let Some(sub) = subs.get_mut(&id) else {
            return;
         };
         sub.parked = Some(rx);
         sub.epoch += 1;
         sub.epoch
      };
      trace!(subscription = %id, "stream released, linger started");

      let hub = Arc::clone(hub);
      let linger = hub.config.linger;
      if let Ok(handle) = tokio::runtime::Handle::try_current() {
         handle.spawn(async move {
            tokio::time::sleep(linger).await;
            hub.reap_if_parked(id, epoch);
         });
      }
   }

   fn reap_if_parked(&self, id: Uuid, epoch: u64) {
      let mut subs = self.subs.write();
      let reap = subs
         .get(&id)
         .is_some_and(|sub| sub.parked.is_some() && sub.epoch == epoch);
      if reap {
         subs.remove(&id);
         drop(subs);
         debug!(subscription = %id, "subscription reaped after linger");
         self.closed.lock().insert(id, CloseReason::LingerExpired);
      }
   }
}

fn matches(spec: &SubscriptionSpec, entry: &ChangeEntry) -> bool {
   if spec.table_name != entry.table_name {
      return false;
   }
   if let Some(origin) = &spec.origin_filter
      && *origin == entry.origin
   {
      return false;
   }
   match spec.kind {
      SubscriptionKind::Table => true,
      SubscriptionKind::Record => spec
         .record_keys
         .as_ref()
         .is_some_and(|keys| keys.contains(&entry.pk_value)),
   }
}

impl std::fmt::Debug for SubscriptionHub {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("SubscriptionHub")
         .field("subscriptions", &self.subs.read().len())
         .finish()
   }
}

/// Extension trait for attaching stream consumers through the shared hub
/// handle. The stream keeps a clone of the handle so it can park its
/// receiver back on drop.
pub trait SubscriptionStreams {
   /// Attaches the stream consumer to a subscription, taking its parked
   /// receiver.
   fn attach(&self, id: Uuid) -> Result<ChangeStream>;
}

impl SubscriptionStreams for Arc<SubscriptionHub> {
   fn attach(&self, id: Uuid) -> Result<ChangeStream> {
      let mut subs = self.subs.write();
      let sub = subs.get_mut(&id).ok_or(Error::UnknownSubscription(id))?;
      let rx = sub.parked.take().ok_or(Error::StreamActive(id))?;
      sub.epoch += 1;
      sub.lagging = false;
      trace!(subscription = %id, "stream attached");
      Ok(ChangeStream::new(id, rx, Arc::clone(self)))
   }
}
