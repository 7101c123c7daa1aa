/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from the mapping and apply layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from the store layer.
   #[error(transparent)]
   Store(#[from] rowsync_store::Error),

   /// No enabled mapping covers this table while `UnmappedBehavior` is
   /// strict.
   #[error("no mapping for table '{0}' and unmapped behavior is strict")]
   UnmappedTable(String),

   /// Mapping configuration failed to load or validate.
   #[error("mapping config error: {0}")]
   Config(String),

   /// I/O error reading a mapping config file.
   #[error("io error: {0}")]
   Io(#[from] std::io::Error),

   /// Mapping config JSON failed to parse.
   #[error("mapping config parse error: {0}")]
   Json(#[from] serde_json::Error),

   /// A transform expression failed to parse or evaluate.
   #[error("expression '{expression}': {message}")]
   Expression { expression: String, message: String },

   /// A row filter failed to parse.
   #[error("filter '{filter}': {message}")]
   Filter { filter: String, message: String },

   /// The batch was cancelled between entries; the transaction was rolled
   /// back and no watermark advanced.
   #[error("apply cancelled")]
   Cancelled,
}

impl Error {
   /// Machine-readable error code for diagnostics and logs.
   pub fn error_code(&self) -> &'static str {
      match self {
         Error::Store(e) => e.error_code(),
         Error::UnmappedTable(_) => "UNMAPPED_TABLE",
         Error::Config(_) => "CONFIG_ERROR",
         Error::Io(_) => "IO_ERROR",
         Error::Json(_) => "CONFIG_PARSE_ERROR",
         Error::Expression { .. } => "EXPRESSION_ERROR",
         Error::Filter { .. } => "FILTER_ERROR",
         Error::Cancelled => "CANCELLED",
      }
   }
}
