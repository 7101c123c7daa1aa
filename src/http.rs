//! The peer-facing HTTP surface.
//!
//! Thin by design: every handler delegates to the store, the engine, or
//! the hub. The subscription stream is a server-sent-event response with
//! periodic heartbeats; disconnecting clients get the hub's linger window
//! to resume.

use std::collections::HashSet;
use std::time::Duration;

use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::Json;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use rowsync_engine::{Direction, EntryStatus, map_batch};
use rowsync_hub::{StreamEvent, SubscriptionSpec, SubscriptionStreams as _};
use rowsync_store::{ChangeEntry, SyncStore as _};

use crate::state::AppState;
use crate::wire::{
   ChangesQuery, ChangesResponse, DeleteResponse, ErrorBody, PushRequest, PushResponse,
   StateResponse, SubscribeRequest, SubscribeResponse,
};

const HEARTBEAT: Duration = Duration::from_secs(15);

pub fn router(state: AppState) -> Router {
   Router::new()
      .route("/sync/state", get(get_state))
      .route("/sync/changes", get(get_changes).post(post_changes))
      .route("/sync/subscribe", post(subscribe))
      .route("/sync/subscribe/:id", delete(unsubscribe))
      .route("/sync/stream/:id", get(stream))
      .route("/sync/diagnostics", get(diagnostics))
      .with_state(state)
}

async fn get_state(State(state): State<AppState>) -> Json<StateResponse> {
   Json(StateResponse {
      origin_id: state.origin.clone(),
      connected_clients: state.hub.active_count(),
   })
}

async fn get_changes(
   State(state): State<AppState>,
   Query(query): Query<ChangesQuery>,
) -> Response {
   let limit = query.limit.unwrap_or(state.batch_limit);
   // A caller asking from `fromVersion` has consumed everything up to it;
   // that ack is what lets tombstones be pruned eventually.
   if let Some(origin) = query.origin.as_deref()
      && query.from_version > 0
      && let Err(e) = state.store.record_peer_ack(origin, query.from_version).await
   {
      return internal_error(e);
   }
   match state
      .store
      .fetch_changes(query.from_version, limit, query.origin.as_deref())
      .await
   {
      Ok(batch) => Json(ChangesResponse {
         changes: batch.entries,
         from_version: batch.from_version,
         to_version: batch.to_version,
         has_more: batch.has_more,
      })
      .into_response(),
      Err(e) => internal_error(e),
   }
}

async fn post_changes(
   State(state): State<AppState>,
   payload: Result<Json<PushRequest>, JsonRejection>,
) -> Response {
   let Json(request) = match payload {
      Ok(json) => json,
      Err(rejection) => {
         return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
               error: rejection.body_text(),
            }),
         )
            .into_response();
      }
   };

   match apply_push(&state, request).await {
      Ok(applied) => Json(PushResponse { applied }).into_response(),
      Err(e) => internal_error(e),
   }
}

/// Applies a pushed batch under direction `pull` mapping and feeds the
/// applied remote-origin entries to local subscribers.
async fn apply_push(state: &AppState, request: PushRequest) -> crate::Result<usize> {
   debug!(
      from = %request.origin_id,
      changes = request.changes.len(),
      "push received"
   );
   let config = state.mapping_config();
   let mapped = map_batch(&request.changes, &config, Direction::Pull)?;
   let server_wins = config.server_wins_tables(Direction::Pull);

   let outcome = state
      .engine
      .apply_batch(
         mapped.clone(),
         &request.origin_id,
         &server_wins,
         &CancellationToken::new(),
      )
      .await?;
   state.diagnostics.record_batch(&outcome).await;

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
      state.hub.publish(&delivered);
   }

   Ok(outcome.applied)
}

async fn subscribe(
   State(state): State<AppState>,
   payload: Result<Json<SubscribeRequest>, JsonRejection>,
) -> Response {
   let Json(request) = match payload {
      Ok(json) => json,
      Err(rejection) => {
         return (
            StatusCode::BAD_REQUEST,
            Json(ErrorBody {
               error: rejection.body_text(),
            }),
         )
            .into_response();
      }
   };

   let mut spec = SubscriptionSpec {
      kind: request.kind,
      table_name: request.table_name.clone(),
      record_keys: request.filter.map(|keys| keys.into_iter().collect()),
      origin_filter: request.origin_id,
   };
   if spec.record_keys.is_none() && spec.kind == rowsync_hub::SubscriptionKind::Record {
      return (
         StatusCode::BAD_REQUEST,
         Json(ErrorBody {
            error: "record subscriptions require a filter of record keys".into(),
         }),
      )
         .into_response();
   }
   // Table subscriptions ignore a stray record-key filter.
   if spec.kind == rowsync_hub::SubscriptionKind::Table {
      spec.record_keys = None;
   }

   let subscription = state.hub.subscribe(spec);
   Json(SubscribeResponse {
      subscription_id: subscription.id,
      kind: subscription.spec.kind,
      table_name: subscription.spec.table_name,
   })
   .into_response()
}

async fn unsubscribe(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
   if state.hub.unsubscribe(id) {
      Json(DeleteResponse { deleted: id }).into_response()
   } else {
      not_found(id)
   }
}

async fn stream(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
   match state.hub.attach(id) {
      Ok(stream) => {
         let events = stream.map(|event| match event {
            StreamEvent::Change(entry) => Event::default().event("change").json_data(&entry),
            StreamEvent::Closed(reason) => Event::default().event("closed").json_data(reason),
         });
         Sse::new(events)
            .keep_alive(KeepAlive::new().interval(HEARTBEAT).text("heartbeat"))
            .into_response()
      }
      Err(rowsync_hub::Error::UnknownSubscription(id)) => not_found(id),
      Err(rowsync_hub::Error::StreamActive(id)) => (
         StatusCode::CONFLICT,
         Json(ErrorBody {
            error: format!("subscription {id} already streaming"),
         }),
      )
         .into_response(),
   }
}

async fn diagnostics(State(state): State<AppState>) -> Response {
   Json(state.diagnostics.report().await).into_response()
}

fn not_found(id: Uuid) -> Response {
   (
      StatusCode::NOT_FOUND,
      Json(ErrorBody {
         error: format!("unknown subscription {id}"),
      }),
   )
      .into_response()
}

fn internal_error(e: impl std::fmt::Display) -> Response {
   (
      StatusCode::INTERNAL_SERVER_ERROR,
      Json(ErrorBody {
         error: e.to_string(),
      }),
   )
      .into_response()
}
