//! Log tailer: turns database-side capture into in-process notifications.
//!
//! Triggers write straight into the log table, so nothing inside the
//! process observes a local commit directly. The tailer polls the log for
//! entries past its cursor and fans them out through the subscription
//! hub. Remote changes applied under suppression never appear here; they
//! are published by the apply path with their remote origin.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use rowsync_hub::SubscriptionHub;
use rowsync_store::SyncStore;

pub async fn run(
   store: Arc<dyn SyncStore>,
   hub: Arc<SubscriptionHub>,
   from_version: i64,
   batch_limit: i64,
   interval: Duration,
   cancel: CancellationToken,
) {
   // Only entries committed after startup are fanned out; subscribers
   // needing history pull it through the changes endpoint.
   let mut cursor = from_version;
   debug!(cursor, "log tailer started");

   loop {
      tokio::select! {
         _ = cancel.cancelled() => break,
         _ = tokio::time::sleep(interval) => {}
      }

      loop {
         let batch = match store.fetch_changes(cursor, batch_limit, None).await {
            Ok(batch) => batch,
            Err(e) => {
               warn!(error = %e, "tailer fetch failed");
               break;
            }
         };
         if batch.entries.is_empty() {
            break;
         }
         cursor = batch.to_version;
         hub.publish(&batch.entries);
         if !batch.has_more {
            break;
         }
      }
   }
   debug!("log tailer stopped");
}
