//! End-to-end tests: two live nodes syncing over the HTTP surface.
//!
//! Each test starts real `Node` instances on ephemeral ports with
//! SQLite-backed stores, writes through ordinary connections so the
//! capture triggers fire, and waits for the coordinators to converge.
//!
//! Scenarios:
//! - Round-trip insert through a schema mapping, with no re-capture on
//!   the receiving node
//! - Delete tombstone propagation and idempotent re-push
//! - Concurrent edits resolved last-writer-wins on both nodes
//! - Foreign-key ordered apply across tables
//! - Subscription delivery with origin echo filtering
//! - The HTTP contract itself (state, changes, subscribe, stream)

use std::future::Future;
use std::time::Duration;

use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use tempfile::TempDir;
use tokio::time::sleep;

use rowsync::{Node, PeerConfig, RuntimeConfig};
use rowsync_engine::MappingConfig;
use rowsync_store::{SyncStore, SyncTable};

const USER_TO_CUSTOMER: &str = r#"
{ "Version": "1.0", "UnmappedBehavior": "passThrough",
  "Mappings": [
    { "Id": "user-to-customer", "SourceTable": "User", "TargetTable": "customer",
      "Direction": "push", "Enabled": true,
      "PkMapping": { "Source": "Id", "Target": "customer_id" },
      "ColumnMappings": [
        { "Source": "FullName", "Target": "name", "Transform": "identity" },
        { "Source": "EmailAddress", "Target": "email", "Transform": "identity" },
        { "Source": null, "Target": "source", "Transform": "constant", "Value": "mobile-app" }
      ],
      "ExcludedColumns": ["PasswordHash"],
      "IsMultiTarget": false, "Targets": null }
  ]}
"#;

struct TestNode {
   node: Node,
   pool: SqlitePool,
   _dir: TempDir,
}

impl TestNode {
   fn endpoint(&self) -> String {
      format!("http://{}", self.node.addr)
   }
}

async fn start_node(
   ddl: &[&str],
   tables: Vec<SyncTable>,
   peers: Vec<PeerConfig>,
   mapping: MappingConfig,
) -> TestNode {
   let dir = tempfile::tempdir().unwrap();
   let path = dir.path().join("node.db");
   let db = path.to_str().unwrap().to_string();

   // Application-side connection; capture triggers fire on it normally.
   let pool = SqlitePool::connect_with(
      SqliteConnectOptions::new()
         .filename(&path)
         .create_if_missing(true)
         .busy_timeout(Duration::from_secs(5))
         .foreign_keys(true),
   )
   .await
   .unwrap();
   for statement in ddl {
      sqlx::query(statement).execute(&pool).await.unwrap();
   }

   let config = RuntimeConfig {
      database: db,
      listen: "127.0.0.1:0".parse().unwrap(),
      tables,
      peers,
      poll_interval: Duration::from_millis(150),
      batch_limit: 100,
      tailer_interval: Duration::from_millis(50),
      // Keep pruning out of the way; log assertions below inspect history.
      prune_interval: Duration::from_secs(3600),
      mapping,
      mapping_path: None,
   };
   let node = Node::start(config).await.unwrap();
   TestNode {
      node,
      pool,
      _dir: dir,
   }
}

async fn wait_for<F, Fut>(what: &str, mut check: F)
where
   F: FnMut() -> Fut,
   Fut: Future<Output = bool>,
{
   for _ in 0..100 {
      if check().await {
         return;
      }
      sleep(Duration::from_millis(100)).await;
   }
   panic!("timed out waiting for {what}");
}

const USER_DDL: &str = r#"
CREATE TABLE "User" (
   "Id" TEXT PRIMARY KEY,
   "FullName" TEXT,
   "EmailAddress" TEXT,
   "PasswordHash" TEXT
)"#;

const CUSTOMER_DDL: &str = r#"
CREATE TABLE customer (
   customer_id TEXT PRIMARY KEY,
   name TEXT,
   email TEXT,
   source TEXT
)"#;

// ============================================================================
// S1/S2: mapped round trip and tombstone
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_mapped_insert_round_trip_and_tombstone() {
   let b = start_node(&[CUSTOMER_DDL], vec![SyncTable::new("customer")], vec![], MappingConfig::default()).await;
   let a = start_node(
      &[USER_DDL],
      vec![SyncTable::new("User").with_excluded(["PasswordHash"])],
      vec![PeerConfig {
         name: "b".into(),
         endpoint: b.endpoint(),
      }],
      MappingConfig::from_json(USER_TO_CUSTOMER).unwrap(),
   )
   .await;

   sqlx::query(
      r#"INSERT INTO "User" ("Id", "FullName", "EmailAddress", "PasswordHash")
         VALUES ('u1', 'Alice', 'a@x.com', 'secret')"#,
   )
   .execute(&a.pool)
   .await
   .unwrap();

   // One log entry on A with the expected identity.
   let log = a.node.state.store.fetch_changes(0, 10, None).await.unwrap();
   assert_eq!(log.entries.len(), 1);
   assert_eq!(log.entries[0].version, 1);
   assert_eq!(log.entries[0].pk_value, r#"{"Id":"u1"}"#);
   assert_eq!(log.entries[0].origin, a.node.state.origin);

   // B converges to the mapped customer row.
   wait_for("customer row on B", || async {
      sqlx::query_scalar::<_, String>("SELECT name FROM customer WHERE customer_id = 'u1'")
         .fetch_optional(&b.pool)
         .await
         .unwrap()
         .is_some()
   })
   .await;

   let (name, email, source): (String, String, String) = sqlx::query_as(
      "SELECT name, email, source FROM customer WHERE customer_id = 'u1'",
   )
   .fetch_one(&b.pool)
   .await
   .unwrap();
   assert_eq!(name, "Alice");
   assert_eq!(email, "a@x.com");
   assert_eq!(source, "mobile-app");

   // The apply on B was suppressed; B's own log stays empty.
   let b_log = b.node.state.store.fetch_changes(0, 10, None).await.unwrap();
   assert!(b_log.entries.is_empty(), "apply must not re-capture on B");

   // S2: delete propagates as a tombstone.
   sqlx::query(r#"DELETE FROM "User" WHERE "Id" = 'u1'"#)
      .execute(&a.pool)
      .await
      .unwrap();

   wait_for("customer row gone on B", || async {
      sqlx::query_scalar::<_, String>("SELECT name FROM customer WHERE customer_id = 'u1'")
         .fetch_optional(&b.pool)
         .await
         .unwrap()
         .is_none()
   })
   .await;

   // A second cycle has nothing left to push.
   wait_for("push watermark settled", || async {
      a.node.state.store.watermark("b").await.unwrap().last_pushed == 2
   })
   .await;
   sleep(Duration::from_millis(400)).await;
   assert!(b.node.state.store.fetch_changes(0, 10, None).await.unwrap().entries.is_empty());
   assert_eq!(a.node.state.store.watermark("b").await.unwrap().last_pushed, 2);

   a.node.shutdown().await;
   b.node.shutdown().await;
}

// ============================================================================
// S3: concurrent edits converge last-writer-wins
// ============================================================================

const ITEM_DDL: &str = r#"
CREATE TABLE "Item" ("Id" TEXT PRIMARY KEY, "Val" TEXT)"#;

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_edits_converge_to_later_writer() {
   let b = start_node(&[ITEM_DDL], vec![SyncTable::new("Item")], vec![], MappingConfig::default()).await;
   let a = start_node(
      &[ITEM_DDL],
      vec![SyncTable::new("Item")],
      vec![PeerConfig {
         name: "b".into(),
         endpoint: b.endpoint(),
      }],
      MappingConfig::default(),
   )
   .await;

   sqlx::query(r#"INSERT INTO "Item" ("Id", "Val") VALUES ('i1', 'base')"#)
      .execute(&a.pool)
      .await
      .unwrap();
   wait_for("seed row on B", || async {
      sqlx::query_scalar::<_, String>(r#"SELECT "Val" FROM "Item" WHERE "Id" = 'i1'"#)
         .fetch_optional(&b.pool)
         .await
         .unwrap()
         .is_some()
   })
   .await;

   // Both sides edit between cycles; B's edit is strictly later.
   sqlx::query(r#"UPDATE "Item" SET "Val" = 'a-edit' WHERE "Id" = 'i1'"#)
      .execute(&a.pool)
      .await
      .unwrap();
   sleep(Duration::from_millis(50)).await;
   sqlx::query(r#"UPDATE "Item" SET "Val" = 'b-edit' WHERE "Id" = 'i1'"#)
      .execute(&b.pool)
      .await
      .unwrap();

   wait_for("both nodes converged to b-edit", || async {
      let on_a: String = sqlx::query_scalar(r#"SELECT "Val" FROM "Item" WHERE "Id" = 'i1'"#)
         .fetch_one(&a.pool)
         .await
         .unwrap();
      let on_b: String = sqlx::query_scalar(r#"SELECT "Val" FROM "Item" WHERE "Id" = 'i1'"#)
         .fetch_one(&b.pool)
         .await
         .unwrap();
      on_a == "b-edit" && on_b == "b-edit"
   })
   .await;

   // History survives on both sides: each log keeps its own edit.
   let a_log = a.node.state.store.fetch_changes(0, 100, None).await.unwrap();
   assert!(a_log.entries.iter().any(|e| e.version == 2));
   let b_log = b.node.state.store.fetch_changes(0, 100, None).await.unwrap();
   assert_eq!(b_log.entries.len(), 1, "B logged only its own edit");

   a.node.shutdown().await;
   b.node.shutdown().await;
}

// ============================================================================
// S4: foreign-key ordered apply
// ============================================================================

const PATIENT_DDL: &str = r#"CREATE TABLE "Patient" ("Id" TEXT PRIMARY KEY, "Name" TEXT)"#;
const ENCOUNTER_DDL: &str = r#"
CREATE TABLE "Encounter" (
   "Id" TEXT PRIMARY KEY,
   "PatientId" TEXT NOT NULL REFERENCES "Patient"("Id"),
   "Reason" TEXT
)"#;

#[tokio::test(flavor = "multi_thread")]
async fn test_parent_and_child_arrive_in_dependency_order() {
   let tables = || vec![SyncTable::new("Patient"), SyncTable::new("Encounter")];
   let b = start_node(&[PATIENT_DDL, ENCOUNTER_DDL], tables(), vec![], MappingConfig::default()).await;
   let a = start_node(
      &[PATIENT_DDL, ENCOUNTER_DDL],
      tables(),
      vec![PeerConfig {
         name: "b".into(),
         endpoint: b.endpoint(),
      }],
      MappingConfig::default(),
   )
   .await;

   sqlx::query(r#"INSERT INTO "Patient" ("Id", "Name") VALUES ('u2', 'Pat')"#)
      .execute(&a.pool)
      .await
      .unwrap();
   sqlx::query(
      r#"INSERT INTO "Encounter" ("Id", "PatientId", "Reason") VALUES ('e1', 'u2', 'checkup')"#,
   )
   .execute(&a.pool)
   .await
   .unwrap();

   wait_for("encounter on B", || async {
      sqlx::query_scalar::<_, String>(r#"SELECT "Reason" FROM "Encounter" WHERE "Id" = 'e1'"#)
         .fetch_optional(&b.pool)
         .await
         .unwrap()
         .is_some()
   })
   .await;

   wait_for("watermark advanced past both entries", || async {
      b.node
         .state
         .store
         .watermark(&a.node.state.origin)
         .await
         .unwrap()
         .last_pulled
         == 2
   })
   .await;

   a.node.shutdown().await;
   b.node.shutdown().await;
}

// ============================================================================
// S6: subscription delivery with origin filtering
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_subscription_sees_remote_changes_but_not_own_writes() {
   use futures::StreamExt;
   use rowsync_hub::{StreamEvent, SubscriptionSpec, SubscriptionStreams as _};

   let b = start_node(&[ITEM_DDL], vec![SyncTable::new("Item")], vec![], MappingConfig::default()).await;
   let a = start_node(
      &[ITEM_DDL],
      vec![SyncTable::new("Item")],
      vec![PeerConfig {
         name: "b".into(),
         endpoint: b.endpoint(),
      }],
      MappingConfig::default(),
   )
   .await;

   let spec = SubscriptionSpec::table("Item").with_origin_filter(a.node.state.origin.clone());
   let sub = a.node.state.hub.subscribe(spec);
   let mut stream = a.node.state.hub.attach(sub.id).unwrap();

   // A's own write: captured, tailed, but filtered by origin.
   sqlx::query(r#"INSERT INTO "Item" ("Id", "Val") VALUES ('mine', 'local')"#)
      .execute(&a.pool)
      .await
      .unwrap();

   // B's write arrives via pull and is delivered with B's origin.
   wait_for("seed synced to B", || async {
      sqlx::query_scalar::<_, String>(r#"SELECT "Val" FROM "Item" WHERE "Id" = 'mine'"#)
         .fetch_optional(&b.pool)
         .await
         .unwrap()
         .is_some()
   })
   .await;
   sqlx::query(r#"INSERT INTO "Item" ("Id", "Val") VALUES ('theirs', 'remote')"#)
      .execute(&b.pool)
      .await
      .unwrap();

   let delivered = tokio::time::timeout(Duration::from_secs(10), stream.next())
      .await
      .expect("subscription delivery timed out");
   match delivered {
      Some(StreamEvent::Change(entry)) => {
         assert_eq!(entry.table_name, "Item");
         assert_eq!(entry.pk_value, r#"{"Id":"theirs"}"#);
         assert_eq!(entry.origin, b.node.state.origin, "delivered with remote origin");
      }
      other => panic!("expected the remote change, got {other:?}"),
   }

   a.node.shutdown().await;
   b.node.shutdown().await;
}

// ============================================================================
// HTTP contract
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_http_surface_contract() {
   let node = start_node(&[ITEM_DDL], vec![SyncTable::new("Item")], vec![], MappingConfig::default()).await;
   let base = node.endpoint();
   let client = reqwest::Client::new();

   // GET /sync/state
   let state: serde_json::Value = client
      .get(format!("{base}/sync/state"))
      .send()
      .await
      .unwrap()
      .json()
      .await
      .unwrap();
   assert_eq!(state["originId"], node.node.state.origin.as_str());
   assert_eq!(state["connectedClients"], 0);

   // GET /sync/changes reflects captured writes in wire format.
   sqlx::query(r#"INSERT INTO "Item" ("Id", "Val") VALUES ('i1', 'x')"#)
      .execute(&node.pool)
      .await
      .unwrap();
   let changes: serde_json::Value = client
      .get(format!("{base}/sync/changes?fromVersion=0&limit=10"))
      .send()
      .await
      .unwrap()
      .json()
      .await
      .unwrap();
   assert_eq!(changes["toVersion"], 1);
   assert_eq!(changes["hasMore"], false);
   assert_eq!(changes["changes"][0]["Version"], 1);
   assert_eq!(changes["changes"][0]["TableName"], "Item");
   assert_eq!(changes["changes"][0]["Operation"], 0);
   assert_eq!(changes["changes"][0]["PkValue"], r#"{"Id":"i1"}"#);

   // POST /sync/changes with a malformed body is a 400.
   let response = client
      .post(format!("{base}/sync/changes"))
      .header("content-type", "application/json")
      .body("{not json")
      .send()
      .await
      .unwrap();
   assert_eq!(response.status(), 400);

   // Subscribe, stream 404 for unknown ids, then delete.
   let subscribed: serde_json::Value = client
      .post(format!("{base}/sync/subscribe"))
      .json(&serde_json::json!({"type": "table", "tableName": "Item"}))
      .send()
      .await
      .unwrap()
      .json()
      .await
      .unwrap();
   let id = subscribed["subscriptionId"].as_str().unwrap().to_string();
   assert_eq!(subscribed["type"], "table");
   assert_eq!(subscribed["tableName"], "Item");

   let state: serde_json::Value = client
      .get(format!("{base}/sync/state"))
      .send()
      .await
      .unwrap()
      .json()
      .await
      .unwrap();
   assert_eq!(state["connectedClients"], 1);

   let missing = client
      .get(format!("{base}/sync/stream/{}", uuid::Uuid::new_v4()))
      .send()
      .await
      .unwrap();
   assert_eq!(missing.status(), 404);

   let deleted: serde_json::Value = client
      .delete(format!("{base}/sync/subscribe/{id}"))
      .send()
      .await
      .unwrap()
      .json()
      .await
      .unwrap();
   assert_eq!(deleted["deleted"], id.as_str());

   let gone = client
      .delete(format!("{base}/sync/subscribe/{id}"))
      .send()
      .await
      .unwrap();
   assert_eq!(gone.status(), 404);

   // GET /sync/diagnostics is present and empty on a healthy node.
   let diagnostics: serde_json::Value = client
      .get(format!("{base}/sync/diagnostics"))
      .send()
      .await
      .unwrap()
      .json()
      .await
      .unwrap();
   assert_eq!(diagnostics["hashMismatches"], serde_json::json!([]));
   assert_eq!(diagnostics["quarantinedPeers"], serde_json::json!({}));

   node.node.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_event_stream_emits_change_frames() {
   let node = start_node(&[ITEM_DDL], vec![SyncTable::new("Item")], vec![], MappingConfig::default()).await;
   let base = node.endpoint();
   let client = reqwest::Client::new();

   let subscribed: serde_json::Value = client
      .post(format!("{base}/sync/subscribe"))
      .json(&serde_json::json!({"type": "table", "tableName": "Item"}))
      .send()
      .await
      .unwrap()
      .json()
      .await
      .unwrap();
   let id = subscribed["subscriptionId"].as_str().unwrap().to_string();

   let response = client
      .get(format!("{base}/sync/stream/{id}"))
      .send()
      .await
      .unwrap();
   assert_eq!(response.status(), 200);

   // A local write flows trigger → log → tailer → hub → SSE frame.
   sqlx::query(r#"INSERT INTO "Item" ("Id", "Val") VALUES ('i1', 'x')"#)
      .execute(&node.pool)
      .await
      .unwrap();

   use futures::StreamExt;
   let mut body = response.bytes_stream();
   let mut collected = String::new();
   let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
   while tokio::time::Instant::now() < deadline {
      match tokio::time::timeout(Duration::from_secs(5), body.next()).await {
         Ok(Some(Ok(chunk))) => {
            collected.push_str(&String::from_utf8_lossy(&chunk));
            if collected.contains("event: change") && collected.contains("\"Version\":1") {
               break;
            }
         }
         _ => break,
      }
   }
   assert!(
      collected.contains("event: change"),
      "no change frame in stream output: {collected}"
   );
   assert!(collected.contains(r#"\"Id\":\"i1\""#) || collected.contains(r#"{\"Id\":\"i1\"}"#));

   drop(body);
   node.node.shutdown().await;
}
