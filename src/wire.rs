//! Request and response bodies of the peer-facing HTTP contract.
//!
//! Field names here are part of the wire protocol; both the HTTP surface
//! and the coordinator's client side use these exact shapes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use rowsync_hub::SubscriptionKind;
use rowsync_store::ChangeEntry;

/// `GET /sync/state`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateResponse {
   pub origin_id: String,
   pub connected_clients: usize,
}

/// Query string of `GET /sync/changes`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesQuery {
   #[serde(default)]
   pub from_version: i64,
   pub limit: Option<i64>,
   /// Caller origin, echoed entries from which are filtered out.
   pub origin: Option<String>,
}

/// `GET /sync/changes` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangesResponse {
   pub changes: Vec<ChangeEntry>,
   pub from_version: i64,
   pub to_version: i64,
   pub has_more: bool,
}

/// `POST /sync/changes` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRequest {
   pub origin_id: String,
   pub changes: Vec<ChangeEntry>,
}

/// `POST /sync/changes` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushResponse {
   pub applied: usize,
}

/// `POST /sync/subscribe` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeRequest {
   #[serde(rename = "type")]
   pub kind: SubscriptionKind,
   pub table_name: String,
   /// Subscriber origin; its own entries are not delivered back.
   #[serde(default)]
   pub origin_id: Option<String>,
   /// Record-key set for `record` subscriptions (canonical PK JSON).
   #[serde(default)]
   pub filter: Option<Vec<String>>,
}

/// `POST /sync/subscribe` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeResponse {
   pub subscription_id: Uuid,
   #[serde(rename = "type")]
   pub kind: SubscriptionKind,
   pub table_name: String,
}

/// `DELETE /sync/subscribe/{id}` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteResponse {
   pub deleted: Uuid,
}

/// `GET /sync/changes` / `POST /sync/changes` error body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
   pub error: String,
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_changes_query_field_names() {
      let query: ChangesQuery =
         serde_json::from_str(r#"{"fromVersion": 7, "limit": 10, "origin": "abc"}"#).unwrap();
      assert_eq!(query.from_version, 7);
      assert_eq!(query.limit, Some(10));
      assert_eq!(query.origin.as_deref(), Some("abc"));
   }

   #[test]
   fn test_subscribe_request_uses_type_keyword() {
      let request: SubscribeRequest =
         serde_json::from_str(r#"{"type": "table", "tableName": "Patient"}"#).unwrap();
      assert_eq!(request.kind, SubscriptionKind::Table);
      assert_eq!(request.table_name, "Patient");
   }

   #[test]
   fn test_state_response_field_names() {
      let json = serde_json::to_value(StateResponse {
         origin_id: "o".into(),
         connected_clients: 3,
      })
      .unwrap();
      assert_eq!(json["originId"], "o");
      assert_eq!(json["connectedClients"], 3);
   }
}
