//! Embedded file dialect, backed by sqlx's SQLite driver.
//!
//! Capture suppression is a per-connection temp table. Every pooled
//! connection creates `_rowsync_suppress` in its temp database on connect;
//! the trigger bodies reference the table unqualified, so the temp table
//! shadows the always-empty fallback table of the same name in the main
//! database. A connection opened outside this pool therefore still captures
//! normally instead of failing.
//!
//! Version allocation is `MAX(version)+1` inside the trigger body, which is
//! atomic under SQLite's serialized writer.

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool};
use tracing::{debug, trace, warn};

use async_trait::async_trait;

use crate::entry::{
   ChangeBatch, ChangeEntry, Operation, Watermark, WatermarkField, canonical_json_str,
   parse_timestamp, row_hash,
};
use crate::error::{Error, Result};
use crate::schema::{ForeignKey, SyncTable, TableSchema};
use crate::store::{ApplySession, SyncStore, clamp_limit};

/// Serialized-writer lock wait before giving up with SQLITE_BUSY.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const CREATE_SCHEMA: &[&str] = &[
   "CREATE TABLE IF NOT EXISTS sync_log (
        version INTEGER PRIMARY KEY,
        table_name TEXT NOT NULL,
        pk_value TEXT NOT NULL,
        operation INTEGER NOT NULL,
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
        last_pulled INTEGER NOT NULL DEFAULT 0,
        last_pushed INTEGER NOT NULL DEFAULT 0,
        backoff_state TEXT
    )",
   // Fallback for the per-connection suppression temp table; stays empty.
   "CREATE TABLE IF NOT EXISTS _rowsync_suppress (active INTEGER)",
];

/// Embedded-dialect store.
pub struct SqliteStore {
   pool: SqlitePool,
}

impl SqliteStore {
   /// Opens (creating if missing) a SQLite database at `url`, which may be
   /// a plain path or a `sqlite:` URL.
   pub async fn connect(url: &str) -> Result<Self> {
      let options = if url.starts_with("sqlite:") {
         SqliteConnectOptions::from_str(url)?
      } else {
         SqliteConnectOptions::new().filename(url)
      };
      let options = options
         .create_if_missing(true)
         .busy_timeout(BUSY_TIMEOUT)
         .journal_mode(SqliteJournalMode::Wal)
         .foreign_keys(true);

      let pool = SqlitePoolOptions::new()
         .max_connections(5)
         .after_connect(|conn, _meta| {
            Box::pin(async move {
               // Per-connection suppression flag; shadows the main-database
               // fallback table of the same name.
               sqlx::query("CREATE TEMP TABLE IF NOT EXISTS _rowsync_suppress (active INTEGER)")
                  .execute(&mut *conn)
                  .await?;
               Ok(())
            })
         })
         .connect_with(options)
         .await?;

      Ok(Self { pool })
   }

   /// The underlying pool. All application reads and writes must go
   /// through it so the suppression temp table exists on every connection.
   pub fn pool(&self) -> &SqlitePool {
      &self.pool
   }

   fn decode_entry(row: &SqliteRow) -> Result<ChangeEntry> {
      let op_code: i64 = row.try_get("operation")?;
      let operation = Operation::try_from(
         u8::try_from(op_code).map_err(|_| Error::UnknownOperation(op_code))?,
      )
      .map_err(|_| Error::UnknownOperation(op_code))?;

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

/// Builds a `json_object(...)` expression over `columns` of the `NEW` or
/// `OLD` trigger row. Column order is the caller's, which is always sorted,
/// so the emitted JSON is canonical.
fn json_object_expr(prefix: &str, columns: &[&str]) -> String {
   let pairs: Vec<String> = columns
      .iter()
      .map(|c| format!("'{c}', {prefix}.\"{c}\""))
      .collect();
   format!("json_object({})", pairs.join(", "))
}

fn trigger_name(table: &str, suffix: &str) -> String {
   format!("rowsync_{table}_{suffix}")
}

/// Renders one capture trigger. The output is a pure function of the table
/// schema, so re-installation produces byte-identical bodies.
fn trigger_ddl(schema: &TableSchema, op: Operation) -> String {
   let table = &schema.name;
   let pk_cols: Vec<&str> = schema.pk_columns.iter().map(String::as_str).collect();
   let payload_cols = schema.payload_columns();

   let (suffix, event, row, payload, before) = match op {
      Operation::Insert => (
         "ai",
         "INSERT",
         "NEW",
         json_object_expr("NEW", &payload_cols),
         "NULL".to_string(),
      ),
      Operation::Update => (
         "au",
         "UPDATE",
         "NEW",
         json_object_expr("NEW", &payload_cols),
         json_object_expr("OLD", &payload_cols),
      ),
      Operation::Delete => ("ad", "DELETE", "OLD", "NULL".to_string(), "NULL".to_string()),
   };
   let pk_expr = json_object_expr(row, &pk_cols);

   format!(
      "CREATE TRIGGER \"{name}\" AFTER {event} ON \"{table}\"\n\
       WHEN NOT EXISTS (SELECT 1 FROM _rowsync_suppress)\n\
       BEGIN\n\
       \x20  INSERT INTO sync_log (version, table_name, pk_value, operation, payload, before_payload, origin, ts, row_hash)\n\
       \x20  VALUES (\n\
       \x20     (SELECT COALESCE(MAX(version), 0) + 1 FROM sync_log),\n\
       \x20     '{table}',\n\
       \x20     {pk_expr},\n\
       \x20     {code},\n\
       \x20     {payload},\n\
       \x20     {before},\n\
       \x20     (SELECT value FROM sync_state WHERE key = 'origin_id'),\n\
       \x20     strftime('%Y-%m-%dT%H:%M:%fZ', 'now'),\n\
       \x20     NULL\n\
       \x20  );\n\
       END",
      name = trigger_name(table, suffix),
      code = op.code(),
   )
}

/// Binds one JSON value as its natural SQLite type.
fn bind_value<'q>(
   query: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
   value: &serde_json::Value,
) -> sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
   match value {
      serde_json::Value::Null => query.bind(None::<String>),
      serde_json::Value::Bool(b) => query.bind(*b),
      serde_json::Value::Number(n) => {
         if let Some(i) = n.as_i64() {
            query.bind(i)
         } else {
            query.bind(n.as_f64().unwrap_or(f64::NAN))
         }
      }
      serde_json::Value::String(s) => query.bind(s.clone()),
      // Nested structures are stored as JSON text.
      other => query.bind(other.to_string()),
   }
}

fn parse_object(raw: &str, context: &'static str) -> Result<serde_json::Map<String, serde_json::Value>> {
   use serde::de::Error as _;

   let value: serde_json::Value =
      serde_json::from_str(raw).map_err(|source| Error::MalformedJson { context, source })?;
   match value {
      serde_json::Value::Object(map) => Ok(map),
      _ => Err(Error::MalformedJson {
         context,
         source: serde_json::Error::custom("expected a JSON object"),
      }),
   }
}

async fn pk_columns_of(
   conn: &mut sqlx::SqliteConnection,
   table: &str,
) -> Result<Vec<String>> {
   let rows = sqlx::query(&format!("PRAGMA table_info(\"{table}\")"))
      .fetch_all(&mut *conn)
      .await?;
   let mut pks: Vec<String> = rows
      .iter()
      .filter(|r| r.get::<i64, _>("pk") > 0)
      .map(|r| r.get::<String, _>("name"))
      .collect();
   pks.sort();
   Ok(pks)
}

#[async_trait]
impl SyncStore for SqliteStore {
   async fn install_schema(&self) -> Result<()> {
      for ddl in CREATE_SCHEMA {
         sqlx::query(ddl).execute(&self.pool).await?;
      }
      let origin = uuid::Uuid::new_v4().to_string();
      sqlx::query("INSERT INTO sync_state (key, value) VALUES ('origin_id', ?) ON CONFLICT (key) DO NOTHING")
         .bind(&origin)
         .execute(&self.pool)
         .await?;
      debug!("sync schema installed");
      Ok(())
   }

   async fn table_schema(&self, table: &SyncTable) -> Result<TableSchema> {
      let rows = sqlx::query(&format!("PRAGMA table_info(\"{}\")", table.name))
         .fetch_all(&self.pool)
         .await?;
      if rows.is_empty() {
         return Err(Error::UnsupportedSchema(table.name.clone()));
      }

      let mut columns: Vec<String> = rows.iter().map(|r| r.get::<String, _>("name")).collect();
      let mut pk_columns: Vec<String> = rows
         .iter()
         .filter(|r| r.get::<i64, _>("pk") > 0)
         .map(|r| r.get::<String, _>("name"))
         .collect();
      columns.sort();
      pk_columns.sort();

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
      for op in [Operation::Insert, Operation::Update, Operation::Delete] {
         let suffix = match op {
            Operation::Insert => "ai",
            Operation::Update => "au",
            Operation::Delete => "ad",
         };
         let name = trigger_name(&schema.name, suffix);

         let existing: Option<String> = sqlx::query_scalar(
            "SELECT sql FROM sqlite_master WHERE type = 'trigger' AND name = ?",
         )
         .bind(&name)
         .fetch_optional(&self.pool)
         .await?;
         if let Some(sql) = existing {
            if !sql.contains("INSERT INTO sync_log") {
               return Err(Error::TriggerConflict {
                  table: schema.name.clone(),
                  name,
               });
            }
            sqlx::query(&format!("DROP TRIGGER \"{name}\""))
               .execute(&self.pool)
               .await?;
         }

         sqlx::query(&trigger_ddl(schema, op)).execute(&self.pool).await?;
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
          WHERE version > ? AND (? IS NULL OR origin <> ?)
          ORDER BY version ASC
          LIMIT ?",
      )
      .bind(from_version)
      .bind(echo_filter)
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
          WHERE table_name = ? AND pk_value = ?
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
         let value: Option<String> = sqlx::query_scalar("SELECT value FROM sync_state WHERE key = ?")
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
         "INSERT INTO sync_state (key, value) VALUES (?, ?)
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
         "INSERT INTO sync_peer (peer_id, origin, endpoint) VALUES (?, ?, ?)
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
         "INSERT INTO sync_state (key, value) VALUES (?, ?)
          ON CONFLICT (key) DO UPDATE SET value = excluded.value
          WHERE CAST(excluded.value AS INTEGER) > CAST(sync_state.value AS INTEGER)",
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
      let rows = sqlx::query(
         "SELECT key, value FROM sync_state WHERE key LIKE 'peer_ack:%'",
      )
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
      let result = sqlx::query("DELETE FROM sync_log WHERE version <= ?")
         .bind(min_watermark)
         .execute(&self.pool)
         .await?;
      if result.rows_affected() > 0 {
         debug!(pruned = result.rows_affected(), below = min_watermark, "log pruned");
      }
      Ok(result.rows_affected())
   }

   async fn foreign_keys(&self, tables: &[String]) -> Result<Vec<ForeignKey>> {
      let mut edges = Vec::new();
      for table in tables {
         let rows = sqlx::query(&format!("PRAGMA foreign_key_list(\"{table}\")"))
            .fetch_all(&self.pool)
            .await?;
         for row in rows {
            edges.push(ForeignKey {
               table: table.clone(),
               column: row.get::<String, _>("from"),
               references: row.get::<String, _>("table"),
               referenced_column: row
                  .try_get::<Option<String>, _>("to")?
                  .unwrap_or_default(),
            });
         }
      }
      Ok(edges)
   }

   async fn read_row(
      &self,
      table: &str,
      pk_value: &str,
      columns: &[String],
   ) -> Result<Option<String>> {
      let pk = parse_object(pk_value, "pk_value")?;
      let cols: Vec<&str> = columns.iter().map(String::as_str).collect();
      let select = json_object_expr(&format!("\"{table}\""), &cols);
      let conditions: Vec<String> = pk.keys().map(|k| format!("\"{k}\" = ?")).collect();
      let sql = format!(
         "SELECT {select} AS row FROM \"{table}\" WHERE {}",
         conditions.join(" AND ")
      );

      let mut query = sqlx::query(&sql);
      for value in pk.values() {
         query = bind_value(query, value);
      }
      let row = query.fetch_optional(&self.pool).await?;
      row
         .map(|r| canonical_json_str(&r.get::<String, _>("row"), "row"))
         .transpose()
   }

   async fn begin_apply(&self) -> Result<Box<dyn ApplySession>> {
      let mut conn = self.pool.acquire().await?;
      sqlx::query("BEGIN IMMEDIATE").execute(&mut *conn).await?;
      // The suppression row participates in the transaction: a rollback
      // removes it together with the writes it was guarding.
      sqlx::query("INSERT INTO _rowsync_suppress (active) VALUES (1)")
         .execute(&mut *conn)
         .await?;
      trace!("apply session opened with suppression set");
      Ok(Box::new(SqliteApplySession {
         conn: Some(conn),
         pk_cache: HashMap::new(),
         finalized: false,
      }))
   }
}

/// Suppressed write transaction on one pooled SQLite connection.
pub struct SqliteApplySession {
   conn: Option<PoolConnection<Sqlite>>,
   pk_cache: HashMap<String, Vec<String>>,
   finalized: bool,
}

impl SqliteApplySession {
   fn conn_mut(&mut self) -> Result<&mut PoolConnection<Sqlite>> {
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
impl ApplySession for SqliteApplySession {
   async fn upsert(&mut self, table: &str, pk_value: &str, payload: &str) -> Result<()> {
      let pk_cols = self.pk_columns(table).await?;
      let row = parse_object(payload, "payload")?;
      let pk = parse_object(pk_value, "pk_value")?;

      // PK columns may be absent from a mapped payload (renamed away);
      // merge them in from the transformed pk object.
      let mut merged = row;
      for (key, value) in &pk {
         merged.entry(key.clone()).or_insert_with(|| value.clone());
      }

      let columns: Vec<&String> = merged.keys().collect();
      let placeholders = vec!["?"; columns.len()].join(", ");
      let column_list: Vec<String> = columns.iter().map(|c| format!("\"{c}\"")).collect();
      let updates: Vec<String> = columns
         .iter()
         .filter(|c| !pk_cols.contains(c))
         .map(|c| format!("\"{c}\" = excluded.\"{c}\""))
         .collect();
      let conflict_cols: Vec<String> = pk_cols.iter().map(|c| format!("\"{c}\"")).collect();

      let action = if updates.is_empty() {
         "DO NOTHING".to_string()
      } else {
         format!("DO UPDATE SET {}", updates.join(", "))
      };
      let sql = format!(
         "INSERT INTO \"{table}\" ({}) VALUES ({placeholders}) ON CONFLICT ({}) {action}",
         column_list.join(", "),
         conflict_cols.join(", "),
      );

      let mut query = sqlx::query(&sql);
      for column in &columns {
         query = bind_value(query, &merged[column.as_str()]);
      }
      let conn = self.conn_mut()?;
      query.execute(&mut **conn).await?;
      Ok(())
   }

   async fn delete(&mut self, table: &str, pk_value: &str) -> Result<()> {
      let pk = parse_object(pk_value, "pk_value")?;
      let conditions: Vec<String> = pk.keys().map(|k| format!("\"{k}\" = ?")).collect();
      let sql = format!("DELETE FROM \"{table}\" WHERE {}", conditions.join(" AND "));

      let mut query = sqlx::query(&sql);
      for value in pk.values() {
         query = bind_value(query, value);
      }
      let conn = self.conn_mut()?;
      let result = query.execute(&mut **conn).await?;
      if result.rows_affected() == 0 {
         trace!(table = %table, pk = %pk_value, "delete of missing row treated as success");
      }
      Ok(())
   }

   async fn commit(mut self: Box<Self>) -> Result<()> {
      let conn = self.conn.as_mut().ok_or(Error::SessionFinalized)?;
      sqlx::query("COMMIT").execute(&mut **conn).await?;
      // The committed suppression row would outlive the session; clear it
      // before the connection returns to the pool.
      sqlx::query("DELETE FROM _rowsync_suppress")
         .execute(&mut **conn)
         .await?;
      self.finalized = true;
      Ok(())
   }

   async fn rollback(mut self: Box<Self>) -> Result<()> {
      let conn = self.conn.as_mut().ok_or(Error::SessionFinalized)?;
      sqlx::query("ROLLBACK").execute(&mut **conn).await?;
      sqlx::query("DELETE FROM _rowsync_suppress")
         .execute(&mut **conn)
         .await?;
      self.finalized = true;
      Ok(())
   }
}

impl Drop for SqliteApplySession {
   fn drop(&mut self) {
      if !self.finalized
         && let Some(conn) = self.conn.take()
      {
         // Detach the connection so the open transaction and the temp
         // suppression row die with it instead of leaking into the pool.
         warn!("apply session dropped without finalizing; discarding its connection");
         drop(conn.detach());
      }
   }
}
