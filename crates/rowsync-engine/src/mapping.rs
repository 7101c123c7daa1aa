//! Rewrites log entries between heterogeneous schemas.
//!
//! `apply_mapping` is a pure function of the entry, the config, and the
//! direction. It produces zero or more entries addressed at target tables:
//! zero when a filter or drop policy discards the entry, several when a
//! multi-target mapping fans one source row out.

use serde_json::{Map, Value};
use tracing::trace;

use rowsync_store::{ChangeEntry, Operation, canonicalize, row_hash};

use crate::config::{
   ColumnMapping, Direction, MappingConfig, PkMapping, TableMapping, Transform, UnmappedBehavior,
};
use crate::error::{Error, Result};
use crate::expr::{self, EvalContext};

/// Transforms one log entry for the given direction.
pub fn apply_mapping(
   entry: &ChangeEntry,
   config: &MappingConfig,
   direction: Direction,
) -> Result<Vec<ChangeEntry>> {
   let Some(mapping) = config.find_mapping(&entry.table_name, direction) else {
      return match config.unmapped_behavior {
         UnmappedBehavior::PassThrough => Ok(vec![entry.clone()]),
         UnmappedBehavior::Drop => Ok(Vec::new()),
         UnmappedBehavior::Strict => Err(Error::UnmappedTable(entry.table_name.clone())),
      };
   };

   // Filters apply to the post-image; tombstones carry none and always
   // propagate.
   if let Some(filter) = &mapping.filter
      && let Some(payload) = entry.payload.as_deref()
   {
      let row = parse_object(payload)?;
      let terms = expr::parse_filter(filter)?;
      if !expr::eval_filter(&terms, &row) {
         trace!(table = %entry.table_name, version = entry.version, "entry dropped by filter");
         return Ok(Vec::new());
      }
   }

   if mapping.is_multi_target {
      let targets = mapping.targets.as_deref().unwrap_or_default();
      targets
         .iter()
         .map(|target| {
            map_to_target(
               entry,
               &target.target_table,
               target.pk_mapping.as_ref(),
               &target.column_mappings,
               &target.excluded_columns,
            )
         })
         .collect()
   } else {
      let target_table = mapping
         .target_table
         .as_deref()
         .unwrap_or(&mapping.source_table);
      Ok(vec![map_to_target(
         entry,
         target_table,
         mapping.pk_mapping.as_ref(),
         &mapping.column_mappings,
         &mapping.excluded_columns,
      )?])
   }
}

/// Convenience wrapper: maps a whole batch, flattening fan-outs.
pub fn map_batch(
   entries: &[ChangeEntry],
   config: &MappingConfig,
   direction: Direction,
) -> Result<Vec<ChangeEntry>> {
   let mut mapped = Vec::with_capacity(entries.len());
   for entry in entries {
      mapped.extend(apply_mapping(entry, config, direction)?);
   }
   Ok(mapped)
}

fn map_to_target(
   entry: &ChangeEntry,
   target_table: &str,
   pk_mapping: Option<&PkMapping>,
   column_mappings: &[ColumnMapping],
   excluded_columns: &[String],
) -> Result<ChangeEntry> {
   let pk_value = transform_pk(&entry.pk_value, pk_mapping)?;

   let payload = match (&entry.operation, entry.payload.as_deref()) {
      // Mapped tombstones never carry a payload.
      (Operation::Delete, _) | (_, None) => None,
      (_, Some(raw)) => {
         let row = parse_object(raw)?;
         let mapped = transform_row(&row, entry, column_mappings, excluded_columns)?;
         Some(canonicalize(&Value::Object(mapped)).to_string())
      }
   };

   let row_hash = payload
      .as_deref()
      .map(|p| row_hash(target_table, &pk_value, p));

   Ok(ChangeEntry {
      version: entry.version,
      table_name: target_table.to_string(),
      pk_value,
      operation: entry.operation,
      payload,
      before_payload: None,
      origin: entry.origin.clone(),
      timestamp: entry.timestamp,
      row_hash,
   })
}

fn transform_pk(pk_value: &str, pk_mapping: Option<&PkMapping>) -> Result<String> {
   let pk = parse_object(pk_value)?;
   let Some(mapping) = pk_mapping else {
      return Ok(canonicalize(&Value::Object(pk)).to_string());
   };

   let mut mapped = Map::with_capacity(pk.len());
   for (key, value) in &pk {
      if *key == mapping.source {
         mapped.insert(mapping.target.clone(), value.clone());
      } else {
         mapped.insert(key.clone(), value.clone());
      }
   }
   Ok(canonicalize(&Value::Object(mapped)).to_string())
}

/// Builds the target payload.
///
/// With no column mappings every non-excluded source column is copied
/// verbatim. With mappings, the mapped columns alone make up the target
/// row, walked in declaration order so later mappings win over earlier
/// ones targeting the same column.
fn transform_row(
   row: &Map<String, Value>,
   entry: &ChangeEntry,
   column_mappings: &[ColumnMapping],
   excluded_columns: &[String],
) -> Result<Map<String, Value>> {
   let mut out = Map::new();

   if column_mappings.is_empty() {
      for (key, value) in row {
         if !excluded_columns.contains(key) {
            out.insert(key.clone(), value.clone());
         }
      }
      return Ok(out);
   }

   let ctx = EvalContext {
      row,
      timestamp: entry.timestamp,
   };
   for mapping in column_mappings {
      if excluded_columns.contains(&mapping.target) {
         continue;
      }
      let value = match mapping.transform {
         Transform::Identity => {
            let source = mapping.source.as_deref().unwrap_or(&mapping.target);
            if excluded_columns.iter().any(|c| c.as_str() == source) {
               continue;
            }
            row.get(source).cloned().unwrap_or(Value::Null)
         }
         Transform::Constant => mapping.value.clone().unwrap_or(Value::Null),
         Transform::Expression => {
            let text = mapping.value.as_ref().and_then(|v| v.as_str()).unwrap_or("");
            expr::eval(&expr::parse(text)?, &ctx)?
         }
      };
      out.insert(mapping.target.clone(), value);
   }
   Ok(out)
}

fn parse_object(raw: &str) -> Result<Map<String, Value>> {
   let value: Value = serde_json::from_str(raw).map_err(Error::Json)?;
   match value {
      Value::Object(map) => Ok(map),
      other => Err(Error::Config(format!("expected a JSON object, got {other}"))),
   }
}
