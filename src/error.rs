/// Result type alias for daemon operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Process exit codes for the CLI front-end.
pub mod exit {
   pub const OK: u8 = 0;
   pub const CONFIG: u8 = 2;
   pub const DATABASE: u8 = 3;
   pub const UNRESOLVED: u8 = 4;
}

/// Top-level daemon errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
   /// Invalid CLI arguments, environment, or mapping config.
   #[error("config error: {0}")]
   Config(String),

   /// The local database could not be reached or prepared.
   #[error("database unavailable: {0}")]
   DatabaseUnavailable(rowsync_store::Error),

   #[error(transparent)]
   Store(#[from] rowsync_store::Error),

   #[error(transparent)]
   Engine(#[from] rowsync_engine::Error),

   /// Transport-level failure talking to a peer; retried with backoff.
   #[error("peer '{peer}' unreachable: {message}")]
   TransientNetwork { peer: String, message: String },

   /// The peer rejected us permanently; cycling stops until an operator
   /// intervenes.
   #[error("peer '{peer}' quarantined after status {status}")]
   PeerQuarantined { peer: String, status: u16 },

   #[error("io error: {0}")]
   Io(#[from] std::io::Error),
}

impl Error {
   pub fn exit_code(&self) -> u8 {
      match self {
         Error::Config(_) => exit::CONFIG,
         Error::DatabaseUnavailable(_) => exit::DATABASE,
         _ => 1,
      }
   }

   /// True when the coordinator should retry with backoff rather than
   /// quarantine the peer.
   pub fn is_transient(&self) -> bool {
      matches!(self, Error::TransientNetwork { .. })
   }
}
