//! rowsync: an offline-first, database-agnostic row synchronization
//! daemon.
//!
//! Each node captures local row changes through database triggers into a
//! monotonic change log, exchanges those changes with peers over a small
//! HTTP/event protocol, resolves conflicts deterministically, and applies
//! remote changes under capture suppression so they are never re-logged.
//! A declarative mapping layer rewrites rows between heterogeneous
//! schemas on the way in and out.
//!
//! The workspace splits along the same seams as the data flow:
//! `rowsync-store` (capture, log, dialect adapters), `rowsync-engine`
//! (mapping, apply, conflicts), `rowsync-hub` (subscription fan-out), and
//! this crate (coordinator, HTTP surface, process wiring).

pub mod config;
pub mod coordinator;
pub mod error;
pub mod http;
pub mod state;
pub mod tailer;
pub mod wire;

use std::net::SocketAddr;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;

use rowsync_engine::ApplyEngine;
use rowsync_hub::{HubConfig, SubscriptionHub};
use rowsync_store::SyncStore;

pub use config::{Cli, PeerConfig, RuntimeConfig};
pub use error::{Error, Result};
pub use state::{AppState, Diagnostics};

/// A running node: store, hub, coordinators, and the HTTP surface.
pub struct Node {
   pub state: AppState,
   pub addr: SocketAddr,
   cancel: CancellationToken,
   tasks: JoinSet<()>,
}

impl Node {
   /// Installs the sync schema and triggers, then starts the tailer, one
   /// coordinator per peer, and the HTTP listener.
   pub async fn start(config: RuntimeConfig) -> Result<Node> {
      let store = rowsync_store::connect(&config.database)
         .await
         .map_err(Error::DatabaseUnavailable)?;
      store
         .install_schema()
         .await
         .map_err(Error::DatabaseUnavailable)?;
      for table in &config.tables {
         let schema = store.table_schema(table).await?;
         store.install_triggers(&schema).await?;
      }
      let origin = store.origin().await?;
      info!(origin = %origin, tables = config.tables.len(), "store ready");

      let state = AppState {
         store: store.clone(),
         engine: Arc::new(ApplyEngine::new(store.clone())),
         hub: SubscriptionHub::new(HubConfig::default()),
         mapping: Arc::new(ArcSwap::from_pointee(config.mapping)),
         diagnostics: Arc::new(Diagnostics::default()),
         origin,
         batch_limit: config.batch_limit,
      };

      let cancel = CancellationToken::new();
      let mut tasks = JoinSet::new();

      // Cursor read before any task starts, so nothing committed after
      // this point can slip past the tailer.
      let tail_from = store.latest_version().await?;
      tasks.spawn(tailer::run(
         store.clone(),
         state.hub.clone(),
         tail_from,
         config.batch_limit,
         config.tailer_interval,
         cancel.clone(),
      ));

      // Tombstone retention: prune the log only up to what every known
      // consumer has acked.
      {
         let store = store.clone();
         let shutdown = cancel.clone();
         let interval = config.prune_interval;
         tasks.spawn(async move {
            loop {
               tokio::select! {
                  _ = shutdown.cancelled() => break,
                  _ = tokio::time::sleep(interval) => {}
               }
               match store.prunable_version().await {
                  Ok(Some(bound)) => {
                     if let Err(e) = store.prune_log(bound).await {
                        tracing::warn!(error = %e, "log pruning failed");
                     }
                  }
                  Ok(None) => {}
                  Err(e) => tracing::warn!(error = %e, "prunable bound unavailable"),
               }
            }
         });
      }

      for peer in &config.peers {
         store.upsert_peer(&peer.name, None, &peer.endpoint).await?;
         let coordinator =
            coordinator::Coordinator::new(peer.clone(), state.clone(), config.poll_interval);
         tasks.spawn(coordinator.run(cancel.clone()));
      }

      let listener = tokio::net::TcpListener::bind(config.listen).await?;
      let addr = listener.local_addr()?;
      info!(addr = %addr, "sync surface listening");

      let router = http::router(state.clone());
      let shutdown = cancel.clone();
      tasks.spawn(async move {
         let serve = axum::serve(listener, router)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
         if let Err(e) = serve.await {
            tracing::error!(error = %e, "http surface failed");
         }
      });

      Ok(Node {
         state,
         addr,
         cancel,
         tasks,
      })
   }

   /// Signals every task to stop and waits for them to finish.
   pub async fn shutdown(mut self) {
      self.cancel.cancel();
      while self.tasks.join_next().await.is_some() {}
   }

   /// Cancellation token shared by all of this node's tasks.
   pub fn cancel_token(&self) -> CancellationToken {
      self.cancel.clone()
   }
}
