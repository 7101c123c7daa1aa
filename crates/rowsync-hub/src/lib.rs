//! Subscription fan-out for committed change log entries.
//!
//! Subscribers register by table or by record-key set and receive entries
//! over a bounded, strictly version-ordered stream. Fan-out favours
//! message passing over shared state: the hub is the only producer of a
//! subscription's channel, the stream writer its only consumer.

pub mod error;
pub mod hub;
pub mod stream;
pub mod subscription;

pub use error::Error;
pub use hub::{
   DEFAULT_LINGER, DEFAULT_QUEUE_CAPACITY, HubConfig, SubscriptionHub, SubscriptionStreams,
};
pub use stream::{ChangeStream, StreamEvent};
pub use subscription::{CloseReason, Subscription, SubscriptionKind, SubscriptionSpec};

pub type Result<T> = std::result::Result<T, Error>;
