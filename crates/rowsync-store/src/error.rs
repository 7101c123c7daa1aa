/// Result type alias for store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the change-capture and log layer.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Error from SQLx operations.
   #[error(transparent)]
   Sqlx(#[from] sqlx::Error),

   /// A table cannot be captured because it declares no primary key.
   #[error("table '{0}' has no primary key; sync requires row identity")]
   UnsupportedSchema(String),

   /// A trigger name is taken by a trigger this engine did not install.
   #[error("trigger '{name}' on table '{table}' exists and was not installed by rowsync")]
   TriggerConflict { table: String, name: String },

   /// The database URL matches no supported dialect.
   #[error("unsupported database url: {0}")]
   UnsupportedUrl(String),

   /// A log row or wire entry carried JSON that does not parse.
   #[error("malformed json in {context}: {source}")]
   MalformedJson {
      context: &'static str,
      #[source]
      source: serde_json::Error,
   },

   /// A log row carried an operation code outside 0..=2.
   #[error("unknown operation code {0} in change log")]
   UnknownOperation(i64),

   /// A log row carried a timestamp that does not parse as RFC 3339.
   #[error("malformed timestamp in change log: {0}")]
   MalformedTimestamp(String),

   /// Watermark updates must not move backwards.
   #[error("watermark for peer '{peer}' would regress from {current} to {proposed}")]
   WatermarkRegression {
      peer: String,
      current: i64,
      proposed: i64,
   },

   /// The apply session was already committed or rolled back.
   #[error("apply session has already been finalized")]
   SessionFinalized,
}

impl Error {
   /// Machine-readable error code for diagnostics and logs.
   pub fn error_code(&self) -> &'static str {
      match self {
         Error::Sqlx(_) => "DATABASE_ERROR",
         Error::UnsupportedSchema(_) => "UNSUPPORTED_SCHEMA",
         Error::TriggerConflict { .. } => "TRIGGER_CONFLICT",
         Error::UnsupportedUrl(_) => "UNSUPPORTED_URL",
         Error::MalformedJson { .. } => "MALFORMED_JSON",
         Error::UnknownOperation(_) => "UNKNOWN_OPERATION",
         Error::MalformedTimestamp(_) => "MALFORMED_TIMESTAMP",
         Error::WatermarkRegression { .. } => "WATERMARK_REGRESSION",
         Error::SessionFinalized => "SESSION_FINALIZED",
      }
   }

   /// True when the underlying database rejected a write because a
   /// referenced parent row is missing.
   pub fn is_foreign_key_violation(&self) -> bool {
      match self {
         Error::Sqlx(sqlx::Error::Database(db)) => {
            db.kind() == sqlx::error::ErrorKind::ForeignKeyViolation
         }
         _ => false,
      }
   }
}
