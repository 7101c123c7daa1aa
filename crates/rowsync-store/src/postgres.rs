//! Centralized server dialect, backed by sqlx's PostgreSQL driver.
//!
//! Capture suppression is the transaction-local setting
//! `rowsync.suppress`: the apply session sets it with
//! `set_config(..., true)` right after `BEGIN`, so it clears itself on
//! both commit and rollback. Version allocation is a sequence read in the
//! capturing transaction.
//!
//! One generic plpgsql function handles all tables; the per-table trigger
//! passes its primary-key and excluded columns through `TG_ARGV`.

use std::collections::HashMap;

use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Postgres, Row};
use tracing::{debug, trace, warn};

use async_trait::async_trait;

use crate::entry::{
   ChangeBatch, ChangeEntry, Operation, Watermark, WatermarkField, canonical_json_str,
   canonicalize, parse_timestamp, row_hash,
};
use crate::error::{Error, Result};
use crate::schema::{ForeignKey, SyncTable, TableSchema};
use crate::store::{ApplySession, SyncStore, clamp_limit};

const CREATE_SCHEMA: &[&str] = &[
   "CREATE SEQUENCE IF NOT EXISTS rowsync_log_version_seq",
   "CREATE TABLE IF NOT EXISTS sync_log (
        version BIGINT PRIMARY KEY,
        table_name TEXT NOT NULL,
        pk_value TEXT NOT NULL,
        operation SMALLINT NOT NULL,
        payload TEXT,
        before_payload TEXT,
        origin TEXT NOT NULL,
        ts TEXT NOT NULL,
        row_hash TEXT
    )",
   "CREATE INDEX IF NOT EXISTS idx_sync_log_row ON sync_log (table_name, pk_value)",
   "CREATE TABLE IF NOT EXISTS sync_state (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    )",
   "CREATE TABLE IF NOT EXISTS sync_peer (
        peer_id TEXT PRIMARY KEY,
        origin TEXT,
        endpoint TEXT NOT NULL,
        last_pulled BIGINT NOT NULL DEFAULT 0,
        last_pushed BIGINT NOT NULL DEFAULT 0,
        backoff_state TEXT
    )",
];

/// The shared capture function. Short-circuits when the session has the
/// suppression setting active, otherwise appends one log row with a fresh
/// sequence version.
const CAPTURE_FUNCTION: &str = r#"
CREATE OR REPLACE FUNCTION rowsync_capture() RETURNS trigger AS $fn$
DECLARE
   pk_cols text[] := string_to_array(TG_ARGV[0], ',');
   excluded text[] := string_to_array(coalesce(TG_ARGV[1], ''), ',');
   img jsonb;
   before_img jsonb;
   pk jsonb := '{}'::jsonb;
   op smallint;
   col text;
BEGIN
   IF coalesce(current_setting('rowsync.suppress', true), '') = 'on' THEN
      RETURN coalesce(NEW, OLD);
   END IF;

   IF TG_OP = 'INSERT' THEN
      op := 0; img := to_jsonb(NEW); before_img := NULL;
   ELSIF TG_OP = 'UPDATE' THEN
      op := 1; img := to_jsonb(NEW); before_img := to_jsonb(OLD);
   ELSE
      op := 2; img := NULL; before_img := NULL;
   END IF;

   FOREACH col IN ARRAY excluded LOOP
      img := img - col;
      before_img := before_img - col;
   END LOOP;

   FOREACH col IN ARRAY pk_cols LOOP
      IF TG_OP = 'DELETE' THEN
         pk := pk || jsonb_build_object(col, to_jsonb(OLD) -> col);
      ELSE
         pk := pk || jsonb_build_object(col, to_jsonb(NEW) -> col);
      END IF;
   END LOOP;

   INSERT INTO sync_log (version, table_name, pk_value, operation, payload, before_payload, origin, ts, row_hash)
   VALUES (
      nextval('rowsync_log_version_seq'),
      TG_TABLE_NAME,
      pk::text,
      op,
      img::text,
      before_img::text,
      (SELECT value FROM sync_state WHERE key = 'origin_id'),
      to_char(now() AT TIME ZONE 'utc', 'YYYY-MM-DD"T"HH24:MI:SS.MS"Z"'),
      NULL
   );
   RETURN coalesce(NEW, OLD);
END;
$fn$ LANGUAGE plpgsql
"#;

/// Centralized-dialect store.
pub struct PgStore {
   pool: PgPool,
}

impl PgStore {
   pub async fn connect(url: &str) -> Result<Self> {
      let pool = PgPoolOptions::new().max_connections(10).connect(url).await?;
      Ok(Self { pool })
   }

   pub fn pool(&self) -> &PgPool {
      &self.pool
   }

   fn decode_entry(row: &PgRow) -> Result<ChangeEntry> {
      let op_code: i16 = row.try_get("operation")?;
      let operation = Operation::try_from(
         u8::try_from(op_code).map_err(|_| Error::UnknownOperation(op_code as i64))?,
      )
      .map_err(|_| Error::UnknownOperation(op_code as i64))?;

      let pk_value = canonical_json_str(row.try_get("pk_value")?, "pk_value")?;
      let payload = row
         .try_get::<Option<String>, _>("payload")?
         .map(|p| canonical_json_str(&p, "payload"))
         .transpose()?;
      let before_payload = row
         .try_get::<Option<String>, _>("before_payload")?
         .map(|p| canonical_json_str(&p, "before_payload"))
         .transpose()?;
      let table_name: String = row.try_get("table_name")?;
      let ts: String = row.try_get("ts")?;

      let stored_hash: Option<String> = row.try_get("row_hash")?;
      let row_hash = stored_hash.or_else(|| {
         payload
            .as_deref()
            .map(|p| row_hash(&table_name, &pk_value, p))
      });

      Ok(ChangeEntry {
         version: row.try_get("version")?,
         table_name,
         pk_value,
         operation,
         payload,
         before_payload,
         origin: row.try_get("origin")?,
         timestamp: parse_timestamp(&ts)?,
         row_hash,
      })
   }
}

fn trigger_name(table: &str, suffix: &str) -> String {
   format!("rowsync_{table}_{suffix}")
}

fn trigger_ddl(schema: &TableSchema, suffix: &str, event: &str) -> String {
   format!(
      "CREATE TRIGGER \"{name}\" AFTER {event} ON \"{table}\" FOR EACH ROW \
       EXECUTE FUNCTION rowsync_capture('{pks}', '{excluded}')",
      name = trigger_name(&schema.name, suffix),
      table = schema.name,
      pks = schema.pk_columns.join(","),
      excluded = schema.excluded_columns.join(","),
   )
}

async fn pk_columns_of(conn: &mut sqlx::PgConnection, table: &str) -> Result<Vec<String>> {
   let rows = sqlx::query(
      "SELECT kcu.column_name
       FROM information_schema.table_constraints tc
       JOIN information_schema.key_column_usage kcu
         ON kcu.constraint_name = tc.constraint_name
        AND kcu.table_schema = tc.table_schema
       WHERE tc.constraint_type = 'PRIMARY KEY'
         AND tc.table_schema = current_schema()
         AND tc.table_name = $1
       ORDER BY kcu.column_name",
   )
   .bind(table)
   .fetch_all(&mut *conn)
   .await?;
   Ok(rows.iter().map(|r| r.get::<String, _>("column_name")).collect())
}

#[async_trait]
impl SyncStore for PgStore {
   async fn install_schema(&self) -> Result<()> {
      for ddl in CREATE_SCHEMA {
         sqlx::query(ddl).execute(&self.pool).await?;
      }
      sqlx::query(CAPTURE_FUNCTION).execute(&self.pool).await?;
      let origin = uuid::Uuid::new_v4().to_string();
      sqlx::query(
         "INSERT INTO sync_state (key, value) VALUES ('origin_id', $1) ON CONFLICT (key) DO NOTHING",
      )
      .bind(&origin)
      .execute(&self.pool)
      .await?;
      debug!("sync schema installed");
      Ok(())
   }

   async fn table_schema(&self, table: &SyncTable) -> Result<TableSchema> {
      let rows = sqlx::query(
         "SELECT column_name FROM information_schema.columns
          WHERE table_schema = current_schema() AND table_name = $1
          ORDER BY column_name",
      )
      .bind(&table.name)
      .fetch_all(&self.pool)
      .await?;
      if rows.is_empty() {
         return Err(Error::UnsupportedSchema(table.name.clone()));
      }
      let columns: Vec<String> = rows.iter().map(|r| r.get::<String, _>("column_name")).collect();

      let mut conn = self.pool.acquire().await?;
      let pk_columns = pk_columns_of(&mut conn, &table.name).await?;
      if pk_columns.is_empty() {
         return Err(Error::UnsupportedSchema(table.name.clone()));
      }

      Ok(TableSchema {
         name: table.name.clone(),
         pk_columns,
         columns,
         excluded_columns: table.excluded_columns.clone(),
      })
   }

   async fn install_triggers(&self, schema: &TableSchema) -> Result<()> {
      for (suffix, event) in [("ai", "INSERT"), ("au", "UPDATE"), ("ad", "DELETE")] {
         let name = trigger_name(&schema.name, suffix);

         let existing: Option<String> = sqlx::query_scalar(
            "SELECT pg_get_triggerdef(t.oid)
             FROM pg_trigger t
             JOIN pg_class c ON c.oid = t.tgrelid
             WHERE NOT t.tgisinternal AND c.relname = $1 AND t.tgname = $2",
         )
         .bind(&schema.name)
         .bind(&name)
         .fetch_optional(&self.pool)
         .await?;
         if let Some(def) = existing
            && !def.contains("rowsync_capture")
         {
            return Err(Error::TriggerConflict {
               table: schema.name.clone(),
               name,
            });
         }

         sqlx::query(&format!(
            "DROP TRIGGER IF EXISTS \"{name}\" ON \"{}\"",
            schema.name
         ))
         .execute(&self.pool)
         .await?;
         sqlx::query(&trigger_ddl(schema, suffix, event))
            .execute(&self.pool)
            .await?;
         trace!(table = %schema.name, trigger = %name, "capture trigger installed");
      }
      Ok(())
   }

   async fn origin(&self) -> Result<String> {
      let origin: String =
         sqlx::query_scalar("SELECT value FROM sync_state WHERE key = 'origin_id'")
            .fetch_one(&self.pool)
            .await?;
      Ok(origin)
   }

   async fn fetch_changes(
      &self,
      from_version: i64,
      limit: i64,
      echo_filter: Option<&str>,
   ) -> Result<ChangeBatch> {
      let limit = clamp_limit(limit);
      let rows = sqlx::query(
         "SELECT version, table_name, pk_value, operation, payload, before_payload, origin, ts, row_hash
          FROM sync_log
          WHERE version > $1 AND ($2::text IS NULL OR origin <> $2)
          ORDER BY version ASC
          LIMIT $3",
      )
      .bind(from_version)
      .bind(echo_filter)
      .bind(limit + 1)
      .fetch_all(&self.pool)
      .await?;

      let has_more = rows.len() as i64 > limit;
      let mut entries = Vec::with_capacity(rows.len().min(limit as usize));
      for row in rows.iter().take(limit as usize) {
         entries.push(Self::decode_entry(row)?);
      }
      let to_version = entries.last().map(|e| e.version).unwrap_or(from_version);

      Ok(ChangeBatch {
         entries,
         from_version,
         to_version,
         has_more,
      })
   }

   async fn latest_version(&self) -> Result<i64> {
      let version: Option<i64> = sqlx::query_scalar("SELECT MAX(version) FROM sync_log")
         .fetch_one(&self.pool)
         .await?;
      Ok(version.unwrap_or(0))
   }

   async fn latest_entry_for(&self, table: &str, pk_value: &str) -> Result<Option<ChangeEntry>> {
      let row = sqlx::query(
         "SELECT version, table_name, pk_value, operation, payload, before_payload, origin, ts, row_hash
          FROM sync_log
          WHERE table_name = $1 AND pk_value::jsonb = $2::jsonb
          ORDER BY version DESC
          LIMIT 1",
      )
      .bind(table)
      .bind(pk_value)
      .fetch_optional(&self.pool)
      .await?;
      row.as_ref().map(Self::decode_entry).transpose()
   }

   async fn watermark(&self, peer: &str) -> Result<Watermark> {
      let mut watermark = Watermark::default();
      for field in [WatermarkField::LastPulled, WatermarkField::LastPushed] {
         let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM sync_state WHERE key = $1")
               .bind(field.state_key(peer))
               .fetch_optional(&self.pool)
               .await?;
         let parsed = value.and_then(|v| v.parse::<i64>().ok()).unwrap_or(0);
         match field {
            WatermarkField::LastPulled => watermark.last_pulled = parsed,
            WatermarkField::LastPushed => watermark.last_pushed = parsed,
         }
      }
      Ok(watermark)
   }

   async fn set_watermark(&self, peer: &str, field: WatermarkField, value: i64) -> Result<()> {
      let current = match field {
         WatermarkField::LastPulled => self.watermark(peer).await?.last_pulled,
         WatermarkField::LastPushed => self.watermark(peer).await?.last_pushed,
      };
      if value < current {
         return Err(Error::WatermarkRegression {
            peer: peer.to_string(),
            current,
            proposed: value,
         });
      }
      sqlx::query(
         "INSERT INTO sync_state (key, value) VALUES ($1, $2)
          ON CONFLICT (key) DO UPDATE SET value = excluded.value",
      )
      .bind(field.state_key(peer))
      .bind(value.to_string())
      .execute(&self.pool)
      .await?;
      Ok(())
   }

   async fn upsert_peer(&self, peer_id: &str, origin: Option<&str>, endpoint: &str) -> Result<()> {
      sqlx::query(
         "INSERT INTO sync_peer (peer_id, origin, endpoint) VALUES ($1, $2, $3)
          ON CONFLICT (peer_id) DO UPDATE SET origin = excluded.origin, endpoint = excluded.endpoint",
      )
      .bind(peer_id)
      .bind(origin)
      .bind(endpoint)
      .execute(&self.pool)
      .await?;
      Ok(())
   }

   async fn record_peer_ack(&self, origin: &str, version: i64) -> Result<()> {
      sqlx::query(
         "INSERT INTO sync_state (key, value) VALUES ($1, $2)
          ON CONFLICT (key) DO UPDATE SET value = excluded.value
          WHERE excluded.value::bigint > sync_state.value::bigint",
      )
      .bind(format!("peer_ack:{origin}"))
      .bind(version.to_string())
      .execute(&self.pool)
      .await?;
      Ok(())
   }

   async fn prunable_version(&self) -> Result<Option<i64>> {
      let registered: Vec<Option<String>> = sqlx::query_scalar("SELECT origin FROM sync_peer")
         .fetch_all(&self.pool)
         .await?;
      let rows = sqlx::query("SELECT key, value FROM sync_state WHERE key LIKE 'peer_ack:%'")
         .fetch_all(&self.pool)
         .await?;
      let acks: std::collections::HashMap<String, i64> = rows
         .iter()
         .filter_map(|row| {
            let key: String = row.get("key");
            let value: String = row.get("value");
            Some((key.strip_prefix("peer_ack:")?.to_string(), value.parse().ok()?))
         })
         .collect();
      Ok(crate::store::compute_prunable(&registered, &acks))
   }

   async fn prune_log(&self, min_watermark: i64) -> Result<u64> {
      let result = sqlx::query("DELETE FROM sync_log WHERE version <= $1")
         .bind(min_watermark)
         .execute(&self.pool)
         .await?;
      if result.rows_affected() > 0 {
         debug!(pruned = result.rows_affected(), below = min_watermark, "log pruned");
      }
      Ok(result.rows_affected())
   }

   async fn foreign_keys(&self, tables: &[String]) -> Result<Vec<ForeignKey>> {
      let rows = sqlx::query(
         "SELECT tc.table_name, kcu.column_name, ccu.table_name AS ref_table, ccu.column_name AS ref_column
          FROM information_schema.table_constraints tc
          JOIN information_schema.key_column_usage kcu
            ON kcu.constraint_name = tc.constraint_name
           AND kcu.table_schema = tc.table_schema
          JOIN information_schema.constraint_column_usage ccu
            ON ccu.constraint_name = tc.constraint_name
           AND ccu.table_schema = tc.table_schema
          WHERE tc.constraint_type = 'FOREIGN KEY'
            AND tc.table_schema = current_schema()
            AND tc.table_name = ANY($1)",
      )
      .bind(tables)
      .fetch_all(&self.pool)
      .await?;

      Ok(rows
         .iter()
         .map(|row| ForeignKey {
            table: row.get("table_name"),
            column: row.get("column_name"),
            references: row.get("ref_table"),
            referenced_column: row.get("ref_column"),
         })
         .collect())
   }

   async fn read_row(
      &self,
      table: &str,
      pk_value: &str,
      columns: &[String],
   ) -> Result<Option<String>> {
      let raw: Option<String> = sqlx::query_scalar(&format!(
         "SELECT to_jsonb(\"{table}\".*)::text FROM \"{table}\" WHERE to_jsonb(\"{table}\".*) @> $1::jsonb",
      ))
      .bind(pk_value)
      .fetch_optional(&self.pool)
      .await?;

      let Some(raw) = raw else {
         return Ok(None);
      };
      let full: serde_json::Value = serde_json::from_str(&raw)
         .map_err(|source| Error::MalformedJson { context: "row", source })?;
      let mut projected = serde_json::Map::new();
      if let serde_json::Value::Object(map) = full {
         for column in columns {
            projected.insert(
               column.clone(),
               map.get(column).cloned().unwrap_or(serde_json::Value::Null),
            );
         }
      }
      Ok(Some(canonicalize(&serde_json::Value::Object(projected)).to_string()))
   }

   async fn begin_apply(&self) -> Result<Box<dyn ApplySession>> {
      let mut conn = self.pool.acquire().await?;
      sqlx::query("BEGIN").execute(&mut *conn).await?;
      // Transaction-local: clears itself on commit and rollback.
      sqlx::query("SELECT set_config('rowsync.suppress', 'on', true)")
         .execute(&mut *conn)
         .await?;
      trace!("apply session opened with suppression set");
      Ok(Box::new(PgApplySession {
         conn: Some(conn),
         pk_cache: HashMap::new(),
         finalized: false,
      }))
   }
}

/// Suppressed write transaction on one pooled PostgreSQL connection.
pub struct PgApplySession {
   conn: Option<PoolConnection<Postgres>>,
   pk_cache: HashMap<String, Vec<String>>,
   finalized: bool,
}

impl PgApplySession {
   fn conn_mut(&mut self) -> Result<&mut PoolConnection<Postgres>> {
      self.conn.as_mut().ok_or(Error::SessionFinalized)
   }

   async fn pk_columns(&mut self, table: &str) -> Result<Vec<String>> {
      if let Some(pks) = self.pk_cache.get(table) {
         return Ok(pks.clone());
      }
      let conn = self.conn_mut()?;
      let pks = pk_columns_of(conn, table).await?;
      self.pk_cache.insert(table.to_string(), pks.clone());
      Ok(pks)
   }
}

#[async_trait]
impl ApplySession for PgApplySession {
   async fn upsert(&mut self, table: &str, pk_value: &str, payload: &str) -> Result<()> {
      let pk_cols = self.pk_columns(table).await?;

      let mut merged: serde_json::Value = serde_json::from_str(payload)
         .map_err(|source| Error::MalformedJson { context: "payload", source })?;
      let pk: serde_json::Value = serde_json::from_str(pk_value)
         .map_err(|source| Error::MalformedJson { context: "pk_value", source })?;
      if let (serde_json::Value::Object(row), serde_json::Value::Object(pk_map)) =
         (&mut merged, &pk)
      {
         for (key, value) in pk_map {
            row.entry(key.clone()).or_insert_with(|| value.clone());
         }
      }

      let updates: Vec<String> = merged
         .as_object()
         .map(|row| {
            row.keys()
               .filter(|c| !pk_cols.contains(c))
               .map(|c| format!("\"{c}\" = excluded.\"{c}\""))
               .collect()
         })
         .unwrap_or_default();
      let conflict_cols: Vec<String> = pk_cols.iter().map(|c| format!("\"{c}\"")).collect();
      let action = if updates.is_empty() {
         "DO NOTHING".to_string()
      } else {
         format!("DO UPDATE SET {}", updates.join(", "))
      };

      let sql = format!(
         "INSERT INTO \"{table}\" SELECT * FROM jsonb_populate_record(NULL::\"{table}\", $1::jsonb)
          ON CONFLICT ({}) {action}",
         conflict_cols.join(", "),
      );
      let conn = self.conn_mut()?;
      sqlx::query(&sql)
         .bind(merged.to_string())
         .execute(&mut **conn)
         .await?;
      Ok(())
   }

   async fn delete(&mut self, table: &str, pk_value: &str) -> Result<()> {
      let conn = self.conn_mut()?;
      let result = sqlx::query(&format!(
         "DELETE FROM \"{table}\" WHERE to_jsonb(\"{table}\".*) @> $1::jsonb",
      ))
      .bind(pk_value)
      .execute(&mut **conn)
      .await?;
      if result.rows_affected() == 0 {
         trace!(table = %table, pk = %pk_value, "delete of missing row treated as success");
      }
      Ok(())
   }

   async fn commit(mut self: Box<Self>) -> Result<()> {
      let conn = self.conn.as_mut().ok_or(Error::SessionFinalized)?;
      sqlx::query("COMMIT").execute(&mut **conn).await?;
      self.finalized = true;
      Ok(())
   }

   async fn rollback(mut self: Box<Self>) -> Result<()> {
      let conn = self.conn.as_mut().ok_or(Error::SessionFinalized)?;
      sqlx::query("ROLLBACK").execute(&mut **conn).await?;
      self.finalized = true;
      Ok(())
   }
}

impl Drop for PgApplySession {
   fn drop(&mut self) {
      if !self.finalized
         && let Some(conn) = self.conn.take()
      {
         warn!("apply session dropped without finalizing; discarding its connection");
         drop(conn.detach());
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn sample_schema() -> TableSchema {
      TableSchema {
         name: "patients".into(),
         pk_columns: vec!["id".into()],
         columns: vec!["id".into(), "name".into(), "secret".into()],
         excluded_columns: vec!["secret".into()],
      }
   }

   #[test]
   fn test_trigger_ddl_passes_pk_and_excludes_through_tg_argv() {
      let ddl = trigger_ddl(&sample_schema(), "ai", "INSERT");
      assert!(ddl.contains("EXECUTE FUNCTION rowsync_capture('id', 'secret')"));
      assert!(ddl.contains("AFTER INSERT ON \"patients\""));
   }

   #[test]
   fn test_capture_function_checks_suppression_setting() {
      assert!(CAPTURE_FUNCTION.contains("current_setting('rowsync.suppress', true)"));
      assert!(CAPTURE_FUNCTION.contains("nextval('rowsync_log_version_seq')"));
   }
}
