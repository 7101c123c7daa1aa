/// Result type alias for hub operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from the subscription hub.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
   /// No subscription with this id exists (never created, or closed).
   #[error("unknown subscription: {0}")]
   UnknownSubscription(uuid::Uuid),

   /// The subscription's stream is already attached elsewhere.
   #[error("subscription {0} already has an active stream")]
   StreamActive(uuid::Uuid),
}
