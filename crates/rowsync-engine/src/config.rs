//! The declarative mapping configuration.
//!
//! Loaded from a JSON document (field names are part of the wire contract)
//! and validated once; after load the config is immutable and shared by
//! reference. A reload builds a fresh config and swaps the shared pointer.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::expr;

/// Which sync direction a mapping (or a transform lookup) applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
   Push,
   Pull,
   Both,
}

impl Direction {
   /// True when a mapping declared for `self` covers traffic flowing in
   /// `wanted`.
   pub fn covers(self, wanted: Direction) -> bool {
      self == Direction::Both || self == wanted
   }
}

/// Policy for entries whose table has no mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UnmappedBehavior {
   /// Forward the entry unchanged.
   #[default]
   PassThrough,
   /// Fail the batch.
   Strict,
   /// Silently discard the entry.
   Drop,
}

/// How one target column gets its value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Transform {
   Identity,
   Constant,
   Expression,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PkMapping {
   pub source: String,
   pub target: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ColumnMapping {
   /// Source column; absent for `constant` and optional for `expression`.
   #[serde(default)]
   pub source: Option<String>,
   pub target: String,
   pub transform: Transform,
   /// The constant value, or the expression text.
   #[serde(default)]
   pub value: Option<serde_json::Value>,
}

/// One fan-out target of a multi-target mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TargetConfig {
   pub target_table: String,
   #[serde(default)]
   pub pk_mapping: Option<PkMapping>,
   #[serde(default)]
   pub column_mappings: Vec<ColumnMapping>,
   #[serde(default)]
   pub excluded_columns: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct TableMapping {
   pub id: String,
   pub source_table: String,
   #[serde(default)]
   pub target_table: Option<String>,
   pub direction: Direction,
   #[serde(default = "default_enabled")]
   pub enabled: bool,
   #[serde(default)]
   pub pk_mapping: Option<PkMapping>,
   #[serde(default)]
   pub column_mappings: Vec<ColumnMapping>,
   #[serde(default)]
   pub excluded_columns: Vec<String>,
   #[serde(default)]
   pub filter: Option<String>,
   #[serde(default)]
   pub is_multi_target: bool,
   #[serde(default)]
   pub targets: Option<Vec<TargetConfig>>,
   /// Forces the incoming side to win every conflict on this table.
   #[serde(default)]
   pub server_wins: bool,
}

fn default_enabled() -> bool {
   true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct MappingConfig {
   #[serde(default = "default_version")]
   pub version: String,
   #[serde(default)]
   pub unmapped_behavior: UnmappedBehavior,
   #[serde(default)]
   pub mappings: Vec<TableMapping>,
}

fn default_version() -> String {
   "1.0".to_string()
}

impl Default for MappingConfig {
   fn default() -> Self {
      Self {
         version: default_version(),
         unmapped_behavior: UnmappedBehavior::default(),
         mappings: Vec::new(),
      }
   }
}

impl MappingConfig {
   pub fn from_json(json: &str) -> Result<Self> {
      let config: MappingConfig = serde_json::from_str(json)?;
      config.validate()?;
      Ok(config)
   }

   pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
      Self::from_json(&std::fs::read_to_string(path)?)
   }

   /// First enabled mapping whose source table and direction match.
   pub fn find_mapping(&self, table: &str, direction: Direction) -> Option<&TableMapping> {
      self
         .mappings
         .iter()
         .find(|m| m.enabled && m.source_table == table && m.direction.covers(direction))
   }

   /// Target tables whose mapping forces the incoming side to win.
   pub fn server_wins_tables(&self, direction: Direction) -> HashSet<String> {
      let mut tables = HashSet::new();
      for mapping in &self.mappings {
         if !(mapping.enabled && mapping.server_wins && mapping.direction.covers(direction)) {
            continue;
         }
         if let Some(targets) = &mapping.targets {
            tables.extend(targets.iter().map(|t| t.target_table.clone()));
         }
         tables.insert(
            mapping
               .target_table
               .clone()
               .unwrap_or_else(|| mapping.source_table.clone()),
         );
      }
      tables
   }

   fn validate(&self) -> Result<()> {
      let mut seen = HashSet::new();
      for mapping in &self.mappings {
         if !seen.insert(&mapping.id) {
            return Err(Error::Config(format!("duplicate mapping id '{}'", mapping.id)));
         }
         if mapping.is_multi_target {
            match &mapping.targets {
               Some(targets) if !targets.is_empty() => {}
               _ => {
                  return Err(Error::Config(format!(
                     "mapping '{}' is multi-target but declares no targets",
                     mapping.id
                  )));
               }
            }
         }
         for column in mapping
            .column_mappings
            .iter()
            .chain(mapping.targets.iter().flatten().flat_map(|t| &t.column_mappings))
         {
            match column.transform {
               Transform::Identity => {
                  if column.source.is_none() {
                     return Err(Error::Config(format!(
                        "mapping '{}': identity column '{}' needs a source",
                        mapping.id, column.target
                     )));
                  }
               }
               Transform::Constant => {
                  if column.value.is_none() {
                     return Err(Error::Config(format!(
                        "mapping '{}': constant column '{}' needs a value",
                        mapping.id, column.target
                     )));
                  }
               }
               Transform::Expression => {
                  let text = column
                     .value
                     .as_ref()
                     .and_then(|v| v.as_str())
                     .ok_or_else(|| {
                        Error::Config(format!(
                           "mapping '{}': expression column '{}' needs expression text",
                           mapping.id, column.target
                        ))
                     })?;
                  expr::parse(text)?;
               }
            }
         }
         if let Some(filter) = &mapping.filter {
            expr::parse_filter(filter)?;
         }
      }
      Ok(())
   }
}
