//! Integration tests for the embedded dialect.
//!
//! Tests verify:
//! - Capture: insert/update/delete each append one log entry with the
//!   expected version, operation, canonical PK, and origin
//! - Suppression: apply sessions write rows without producing log entries
//! - Log repository: ordering, clamping, echo filtering, watermarks
//! - Trigger generator: idempotent re-install, conflict and no-PK failures

use rowsync_store::{
   ApplySession as _, Operation, SqliteStore, SyncStore, SyncTable, WatermarkField,
};
use tempfile::TempDir;

async fn open_store() -> (SqliteStore, TempDir) {
   let dir = tempfile::tempdir().unwrap();
   let path = dir.path().join("node.db");
   let store = SqliteStore::connect(path.to_str().unwrap()).await.unwrap();
   store.install_schema().await.unwrap();
   (store, dir)
}

async fn setup_user_table(store: &SqliteStore) {
   sqlx::query(
      r#"
        CREATE TABLE "User" (
            "Id" TEXT PRIMARY KEY,
            "FullName" TEXT,
            "EmailAddress" TEXT,
            "PasswordHash" TEXT
        )
        "#,
   )
   .execute(store.pool())
   .await
   .unwrap();

   let table = SyncTable::new("User").with_excluded(["PasswordHash"]);
   let schema = store.table_schema(&table).await.unwrap();
   store.install_triggers(&schema).await.unwrap();
}

async fn insert_alice(store: &SqliteStore) {
   sqlx::query(
      r#"INSERT INTO "User" ("Id", "FullName", "EmailAddress", "PasswordHash")
         VALUES ('u1', 'Alice', 'a@x.com', 'secret')"#,
   )
   .execute(store.pool())
   .await
   .unwrap();
}

// ============================================================================
// Schema install
// ============================================================================

#[tokio::test]
async fn test_install_schema_is_idempotent_and_origin_is_stable() {
   let (store, _dir) = open_store().await;
   let origin = store.origin().await.unwrap();

   store.install_schema().await.unwrap();
   assert_eq!(store.origin().await.unwrap(), origin);
   assert_eq!(origin.len(), 36, "origin should be a uuid");
}

#[tokio::test]
async fn test_table_without_primary_key_is_rejected() {
   let (store, _dir) = open_store().await;
   sqlx::query("CREATE TABLE notes (body TEXT)")
      .execute(store.pool())
      .await
      .unwrap();

   let err = store.table_schema(&SyncTable::new("notes")).await.unwrap_err();
   assert_eq!(err.error_code(), "UNSUPPORTED_SCHEMA");
}

// ============================================================================
// Capture
// ============================================================================

#[tokio::test]
async fn test_insert_is_captured_with_canonical_pk_and_origin() {
   let (store, _dir) = open_store().await;
   setup_user_table(&store).await;
   insert_alice(&store).await;

   let batch = store.fetch_changes(0, 100, None).await.unwrap();
   assert_eq!(batch.entries.len(), 1);

   let entry = &batch.entries[0];
   assert_eq!(entry.version, 1);
   assert_eq!(entry.operation, Operation::Insert);
   assert_eq!(entry.table_name, "User");
   assert_eq!(entry.pk_value, r#"{"Id":"u1"}"#);
   assert_eq!(entry.origin, store.origin().await.unwrap());

   let payload: serde_json::Value =
      serde_json::from_str(entry.payload.as_deref().unwrap()).unwrap();
   assert_eq!(payload["FullName"], "Alice");
   assert_eq!(payload["EmailAddress"], "a@x.com");
   assert!(payload.get("PasswordHash").is_none(), "excluded column leaked");
   assert!(entry.row_hash.is_some());
}

#[tokio::test]
async fn test_update_captures_before_image_and_delete_writes_tombstone() {
   let (store, _dir) = open_store().await;
   setup_user_table(&store).await;
   insert_alice(&store).await;

   sqlx::query(r#"UPDATE "User" SET "FullName" = 'Alicia' WHERE "Id" = 'u1'"#)
      .execute(store.pool())
      .await
      .unwrap();
   sqlx::query(r#"DELETE FROM "User" WHERE "Id" = 'u1'"#)
      .execute(store.pool())
      .await
      .unwrap();

   let batch = store.fetch_changes(0, 100, None).await.unwrap();
   let versions: Vec<i64> = batch.entries.iter().map(|e| e.version).collect();
   assert_eq!(versions, vec![1, 2, 3], "versions are strictly increasing");

   let update = &batch.entries[1];
   assert_eq!(update.operation, Operation::Update);
   let before: serde_json::Value =
      serde_json::from_str(update.before_payload.as_deref().unwrap()).unwrap();
   assert_eq!(before["FullName"], "Alice");

   let tombstone = &batch.entries[2];
   assert_eq!(tombstone.operation, Operation::Delete);
   assert_eq!(tombstone.pk_value, r#"{"Id":"u1"}"#);
   assert!(tombstone.payload.is_none());
   assert!(tombstone.row_hash.is_none());
}

#[tokio::test]
async fn test_reinstalling_triggers_keeps_capture_working() {
   let (store, _dir) = open_store().await;
   setup_user_table(&store).await;

   // Second install must drop and recreate identical triggers.
   let table = SyncTable::new("User").with_excluded(["PasswordHash"]);
   let schema = store.table_schema(&table).await.unwrap();
   store.install_triggers(&schema).await.unwrap();

   insert_alice(&store).await;
   let batch = store.fetch_changes(0, 100, None).await.unwrap();
   assert_eq!(batch.entries.len(), 1);
}

#[tokio::test]
async fn test_foreign_trigger_with_our_name_is_a_conflict() {
   let (store, _dir) = open_store().await;
   sqlx::query(r#"CREATE TABLE "Thing" ("Id" TEXT PRIMARY KEY, "N" INTEGER)"#)
      .execute(store.pool())
      .await
      .unwrap();
   sqlx::query(
      r#"CREATE TRIGGER "rowsync_Thing_ai" AFTER INSERT ON "Thing"
         BEGIN UPDATE "Thing" SET "N" = 0 WHERE 0; END"#,
   )
   .execute(store.pool())
   .await
   .unwrap();

   let schema = store.table_schema(&SyncTable::new("Thing")).await.unwrap();
   let err = store.install_triggers(&schema).await.unwrap_err();
   assert_eq!(err.error_code(), "TRIGGER_CONFLICT");
}

// ============================================================================
// Suppression
// ============================================================================

#[tokio::test]
async fn test_apply_session_writes_without_capturing() {
   let (store, _dir) = open_store().await;
   setup_user_table(&store).await;

   let mut session = store.begin_apply().await.unwrap();
   session
      .upsert(
         "User",
         r#"{"Id":"u9"}"#,
         r#"{"EmailAddress":"r@x.com","FullName":"Remote","Id":"u9"}"#,
      )
      .await
      .unwrap();
   session.commit().await.unwrap();

   let batch = store.fetch_changes(0, 100, None).await.unwrap();
   assert!(batch.entries.is_empty(), "suppressed apply must not log");

   let name: String = sqlx::query_scalar(r#"SELECT "FullName" FROM "User" WHERE "Id" = 'u9'"#)
      .fetch_one(store.pool())
      .await
      .unwrap();
   assert_eq!(name, "Remote");
}

#[tokio::test]
async fn test_capture_resumes_after_apply_session_ends() {
   let (store, _dir) = open_store().await;
   setup_user_table(&store).await;

   let mut session = store.begin_apply().await.unwrap();
   session
      .upsert("User", r#"{"Id":"u9"}"#, r#"{"FullName":"Remote","Id":"u9"}"#)
      .await
      .unwrap();
   session.commit().await.unwrap();

   insert_alice(&store).await;
   let batch = store.fetch_changes(0, 100, None).await.unwrap();
   assert_eq!(batch.entries.len(), 1);
   assert_eq!(batch.entries[0].pk_value, r#"{"Id":"u1"}"#);
}

#[tokio::test]
async fn test_rolled_back_session_leaves_no_row_and_no_log() {
   let (store, _dir) = open_store().await;
   setup_user_table(&store).await;

   let mut session = store.begin_apply().await.unwrap();
   session
      .upsert("User", r#"{"Id":"u9"}"#, r#"{"FullName":"Remote","Id":"u9"}"#)
      .await
      .unwrap();
   session.rollback().await.unwrap();

   let count: i64 = sqlx::query_scalar(r#"SELECT COUNT(*) FROM "User""#)
      .fetch_one(store.pool())
      .await
      .unwrap();
   assert_eq!(count, 0);
   assert!(store.fetch_changes(0, 100, None).await.unwrap().entries.is_empty());
}

#[tokio::test]
async fn test_upsert_is_idempotent_and_delete_of_missing_row_succeeds() {
   let (store, _dir) = open_store().await;
   setup_user_table(&store).await;

   for _ in 0..2 {
      let mut session = store.begin_apply().await.unwrap();
      session
         .upsert("User", r#"{"Id":"u9"}"#, r#"{"FullName":"Remote","Id":"u9"}"#)
         .await
         .unwrap();
      session.commit().await.unwrap();
   }
   let count: i64 = sqlx::query_scalar(r#"SELECT COUNT(*) FROM "User""#)
      .fetch_one(store.pool())
      .await
      .unwrap();
   assert_eq!(count, 1);

   let mut session = store.begin_apply().await.unwrap();
   session.delete("User", r#"{"Id":"nope"}"#).await.unwrap();
   session.commit().await.unwrap();
}

// ============================================================================
// Log repository
// ============================================================================

#[tokio::test]
async fn test_fetch_changes_clamps_limit_and_reports_has_more() {
   let (store, _dir) = open_store().await;
   setup_user_table(&store).await;

   for i in 0..5 {
      sqlx::query(r#"INSERT INTO "User" ("Id") VALUES (?)"#)
         .bind(format!("u{i}"))
         .execute(store.pool())
         .await
         .unwrap();
   }

   let batch = store.fetch_changes(0, 2, None).await.unwrap();
   assert_eq!(batch.entries.len(), 2);
   assert!(batch.has_more);
   assert_eq!(batch.to_version, 2);

   let rest = store.fetch_changes(batch.to_version, 100, None).await.unwrap();
   assert_eq!(rest.entries.len(), 3);
   assert!(!rest.has_more);
}

#[tokio::test]
async fn test_echo_filter_suppresses_own_origin() {
   let (store, _dir) = open_store().await;
   setup_user_table(&store).await;
   insert_alice(&store).await;

   let origin = store.origin().await.unwrap();
   let batch = store.fetch_changes(0, 100, Some(&origin)).await.unwrap();
   assert!(batch.entries.is_empty(), "fetch must never echo the filtered origin");

   let other = store.fetch_changes(0, 100, Some("someone-else")).await.unwrap();
   assert_eq!(other.entries.len(), 1);
}

#[tokio::test]
async fn test_latest_entry_for_returns_newest_entry() {
   let (store, _dir) = open_store().await;
   setup_user_table(&store).await;
   insert_alice(&store).await;
   sqlx::query(r#"UPDATE "User" SET "FullName" = 'Alicia' WHERE "Id" = 'u1'"#)
      .execute(store.pool())
      .await
      .unwrap();

   let latest = store
      .latest_entry_for("User", r#"{"Id":"u1"}"#)
      .await
      .unwrap()
      .unwrap();
   assert_eq!(latest.version, 2);
   assert_eq!(latest.operation, Operation::Update);

   assert!(store
      .latest_entry_for("User", r#"{"Id":"missing"}"#)
      .await
      .unwrap()
      .is_none());
}

#[tokio::test]
async fn test_watermarks_are_monotonic_and_idempotent() {
   let (store, _dir) = open_store().await;

   store
      .set_watermark("clinic", WatermarkField::LastPulled, 10)
      .await
      .unwrap();
   store
      .set_watermark("clinic", WatermarkField::LastPulled, 10)
      .await
      .unwrap();

   let watermark = store.watermark("clinic").await.unwrap();
   assert_eq!(watermark.last_pulled, 10);
   assert_eq!(watermark.last_pushed, 0);

   let err = store
      .set_watermark("clinic", WatermarkField::LastPulled, 5)
      .await
      .unwrap_err();
   assert_eq!(err.error_code(), "WATERMARK_REGRESSION");
}

#[tokio::test]
async fn test_prune_log_removes_only_acked_versions() {
   let (store, _dir) = open_store().await;
   setup_user_table(&store).await;
   insert_alice(&store).await;
   sqlx::query(r#"DELETE FROM "User" WHERE "Id" = 'u1'"#)
      .execute(store.pool())
      .await
      .unwrap();

   // Tombstone at version 2 must survive a prune below it.
   let pruned = store.prune_log(1).await.unwrap();
   assert_eq!(pruned, 1);

   let batch = store.fetch_changes(0, 100, None).await.unwrap();
   assert_eq!(batch.entries.len(), 1);
   assert_eq!(batch.entries[0].operation, Operation::Delete);
}

#[tokio::test]
async fn test_peer_acks_gate_pruning() {
   let (store, _dir) = open_store().await;
   setup_user_table(&store).await;
   insert_alice(&store).await;
   sqlx::query(r#"DELETE FROM "User" WHERE "Id" = 'u1'"#)
      .execute(store.pool())
      .await
      .unwrap();

   // No acks at all: nothing may be pruned.
   assert_eq!(store.prunable_version().await.unwrap(), None);

   // A registered peer without a known origin pins the log too.
   store.upsert_peer("clinic", None, "http://clinic").await.unwrap();
   store.record_peer_ack("some-origin", 2).await.unwrap();
   assert_eq!(store.prunable_version().await.unwrap(), None);

   // Once the registered peer has acked, the bound is the minimum ack.
   store
      .upsert_peer("clinic", Some("clinic-origin"), "http://clinic")
      .await
      .unwrap();
   store.record_peer_ack("clinic-origin", 1).await.unwrap();
   assert_eq!(store.prunable_version().await.unwrap(), Some(1));

   // Acks are monotonic; a stale ack cannot widen the prunable range back.
   store.record_peer_ack("clinic-origin", 2).await.unwrap();
   store.record_peer_ack("clinic-origin", 1).await.unwrap();
   assert_eq!(store.prunable_version().await.unwrap(), Some(2));
}

// ============================================================================
// Row access helpers
// ============================================================================

#[tokio::test]
async fn test_read_row_projects_requested_columns_canonically() {
   let (store, _dir) = open_store().await;
   setup_user_table(&store).await;
   insert_alice(&store).await;

   let row = store
      .read_row(
         "User",
         r#"{"Id":"u1"}"#,
         &["FullName".to_string(), "EmailAddress".to_string()],
      )
      .await
      .unwrap()
      .unwrap();
   assert_eq!(row, r#"{"EmailAddress":"a@x.com","FullName":"Alice"}"#);

   assert!(store
      .read_row("User", r#"{"Id":"zz"}"#, &["FullName".to_string()])
      .await
      .unwrap()
      .is_none());
}

#[tokio::test]
async fn test_foreign_keys_reports_dependency_edges() {
   let (store, _dir) = open_store().await;
   sqlx::query(r#"CREATE TABLE "Patient" ("Id" TEXT PRIMARY KEY)"#)
      .execute(store.pool())
      .await
      .unwrap();
   sqlx::query(
      r#"CREATE TABLE "Encounter" (
            "Id" TEXT PRIMARY KEY,
            "PatientId" TEXT REFERENCES "Patient"("Id")
        )"#,
   )
   .execute(store.pool())
   .await
   .unwrap();

   let edges = store
      .foreign_keys(&["Patient".to_string(), "Encounter".to_string()])
      .await
      .unwrap();
   assert_eq!(edges.len(), 1);
   assert_eq!(edges[0].table, "Encounter");
   assert_eq!(edges[0].references, "Patient");
   assert_eq!(edges[0].column, "PatientId");
}

#[tokio::test]
async fn test_unicode_and_json_specials_round_trip() {
   let (store, _dir) = open_store().await;
   setup_user_table(&store).await;
   sqlx::query(r#"INSERT INTO "User" ("Id", "FullName") VALUES ('u1', ?)"#)
      .bind("Ärzt\"in 🦀\n")
      .execute(store.pool())
      .await
      .unwrap();

   let batch = store.fetch_changes(0, 100, None).await.unwrap();
   let payload: serde_json::Value =
      serde_json::from_str(batch.entries[0].payload.as_deref().unwrap()).unwrap();
   assert_eq!(payload["FullName"], "Ärzt\"in 🦀\n");
}
