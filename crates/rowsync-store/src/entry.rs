//! The change log entry and its canonical JSON identity.
//!
//! A row's identity on the wire is its canonical primary-key JSON: object
//! keys in lexicographic order, compact separators, no trailing metadata.
//! Both dialects emit JSON with their own spacing and key order, so every
//! entry is normalized once when it is read out of the log; from then on
//! `pk_value` and `payload` round-trip byte-identically.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::error::{Error, Result};

/// Logical operation captured in the change log.
///
/// The wire format carries these as fixed integer codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Operation {
   Insert,
   Update,
   Delete,
}

impl Operation {
   pub fn as_str(self) -> &'static str {
      match self {
         Operation::Insert => "insert",
         Operation::Update => "update",
         Operation::Delete => "delete",
      }
   }

   pub fn code(self) -> u8 {
      self.into()
   }
}

impl From<Operation> for u8 {
   fn from(op: Operation) -> u8 {
      match op {
         Operation::Insert => 0,
         Operation::Update => 1,
         Operation::Delete => 2,
      }
   }
}

impl TryFrom<u8> for Operation {
   type Error = String;

   fn try_from(code: u8) -> std::result::Result<Self, String> {
      match code {
         0 => Ok(Operation::Insert),
         1 => Ok(Operation::Update),
         2 => Ok(Operation::Delete),
         other => Err(format!("unknown operation code {other}")),
      }
   }
}

/// A single committed change, as captured by the database triggers.
///
/// `pk_value` and `payload` are strings carrying nested JSON rather than
/// inline objects so the wire representation round-trips byte-identically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChangeEntry {
   /// Monotonically increasing version, unique within the producing node.
   pub version: i64,
   /// User table the change targets.
   pub table_name: String,
   /// Canonical JSON object over all primary-key columns.
   pub pk_value: String,
   pub operation: Operation,
   /// Post-image over every non-excluded column; absent for deletes.
   pub payload: Option<String>,
   /// Pre-image for updates, kept for conflict diagnostics. Not part of
   /// the peer wire contract.
   #[serde(default, skip_serializing_if = "Option::is_none")]
   pub before_payload: Option<String>,
   /// Origin id of the node that produced the change.
   pub origin: String,
   #[serde(with = "time::serde::rfc3339")]
   pub timestamp: OffsetDateTime,
   /// SHA-256 over canonical `(table_name, pk_value, payload)`; absent
   /// for deletes.
   pub row_hash: Option<String>,
}

impl ChangeEntry {
   /// Recomputes the row hash from this entry's own fields.
   pub fn computed_hash(&self) -> Option<String> {
      self
         .payload
         .as_deref()
         .map(|payload| row_hash(&self.table_name, &self.pk_value, payload))
   }

   /// RFC 3339 rendering of the capture timestamp.
   ///
   /// Conflict resolution compares these strings lexicographically, which
   /// for RFC 3339 UTC timestamps matches chronological order.
   pub fn timestamp_str(&self) -> String {
      self
         .timestamp
         .format(&Rfc3339)
         .unwrap_or_else(|_| String::new())
   }
}

/// An ordered slice of the change log, as returned by `fetch_changes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeBatch {
   pub entries: Vec<ChangeEntry>,
   /// The exclusive lower bound the caller asked for.
   pub from_version: i64,
   /// Highest version contained in `entries`, or `from_version` when empty.
   pub to_version: i64,
   /// True when the batch was clamped and more entries remain.
   pub has_more: bool,
}

/// Per-peer sync cursors.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Watermark {
   pub last_pulled: i64,
   pub last_pushed: i64,
}

/// Which watermark cursor a `set_watermark` call advances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatermarkField {
   LastPulled,
   LastPushed,
}

impl WatermarkField {
   pub fn state_key(self, peer: &str) -> String {
      match self {
         WatermarkField::LastPulled => format!("last_pulled_version:{peer}"),
         WatermarkField::LastPushed => format!("last_pushed_version:{peer}"),
      }
   }
}

/// Rebuilds a JSON value with all object keys in lexicographic order.
///
/// Arrays keep their element order; only object key order is normalized.
pub fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
   match value {
      serde_json::Value::Object(map) => {
         let mut keys: Vec<&String> = map.keys().collect();
         keys.sort();
         let mut out = serde_json::Map::with_capacity(map.len());
         for key in keys {
            out.insert(key.clone(), canonicalize(&map[key]));
         }
         serde_json::Value::Object(out)
      }
      serde_json::Value::Array(items) => {
         serde_json::Value::Array(items.iter().map(canonicalize).collect())
      }
      other => other.clone(),
   }
}

/// Parses a JSON string and re-serializes it in canonical form.
pub fn canonical_json_str(raw: &str, context: &'static str) -> Result<String> {
   let value: serde_json::Value =
      serde_json::from_str(raw).map_err(|source| Error::MalformedJson { context, source })?;
   Ok(canonicalize(&value).to_string())
}

/// SHA-256 hex digest over the canonical JSON array
/// `[table_name, pk_value, payload]`.
pub fn row_hash(table_name: &str, pk_value: &str, payload: &str) -> String {
   let pk: serde_json::Value = serde_json::from_str(pk_value)
      .unwrap_or_else(|_| serde_json::Value::String(pk_value.to_string()));
   let row: serde_json::Value = serde_json::from_str(payload)
      .unwrap_or_else(|_| serde_json::Value::String(payload.to_string()));
   let canonical = canonicalize(&serde_json::json!([table_name, pk, row])).to_string();

   let digest = Sha256::digest(canonical.as_bytes());
   digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Parses a trigger-written timestamp (RFC 3339, UTC) from the log.
pub fn parse_timestamp(raw: &str) -> Result<OffsetDateTime> {
   OffsetDateTime::parse(raw, &Rfc3339).map_err(|_| Error::MalformedTimestamp(raw.to_string()))
}
