//! Table shape information used by the trigger generator and apply path.

use serde::{Deserialize, Serialize};

/// Shape of one captured user table.
///
/// `pk_columns` and `data_columns` are kept in lexicographic order so the
/// generated trigger bodies (and therefore the canonical JSON they emit)
/// are deterministic across installs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
   pub name: String,
   /// Primary key columns, sorted.
   pub pk_columns: Vec<String>,
   /// All columns, sorted. Includes the primary key columns.
   pub columns: Vec<String>,
   /// Columns that must never enter the log (passwords, ephemeral stamps).
   pub excluded_columns: Vec<String>,
}

impl TableSchema {
   /// Columns that appear in captured payloads, sorted.
   pub fn payload_columns(&self) -> Vec<&str> {
      self
         .columns
         .iter()
         .filter(|c| !self.excluded_columns.contains(c))
         .map(String::as_str)
         .collect()
   }
}

/// A table name plus its per-table capture settings, as configured by the
/// embedding application.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTable {
   pub name: String,
   #[serde(default)]
   pub excluded_columns: Vec<String>,
}

impl SyncTable {
   pub fn new(name: impl Into<String>) -> Self {
      Self {
         name: name.into(),
         excluded_columns: Vec::new(),
      }
   }

   pub fn with_excluded<I, S>(mut self, columns: I) -> Self
   where
      I: IntoIterator<Item = S>,
      S: Into<String>,
   {
      self.excluded_columns = columns.into_iter().map(Into::into).collect();
      self
   }
}

/// A foreign-key edge between two captured tables.
///
/// `table` depends on `references`: rows of `table` cannot be inserted
/// before their parent row in `references` exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ForeignKey {
   pub table: String,
   pub column: String,
   pub references: String,
   pub referenced_column: String,
}
