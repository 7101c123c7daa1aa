//! Subscription descriptors.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Scope of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubscriptionKind {
   /// Every committed change on one table.
   Table,
   /// Changes on one table whose primary key is in a fixed set.
   Record,
}

/// What a subscriber asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionSpec {
   pub kind: SubscriptionKind,
   pub table_name: String,
   /// Canonical PK JSON strings; required for `Record` subscriptions.
   pub record_keys: Option<HashSet<String>>,
   /// Origin whose entries are never delivered, so a subscriber can
   /// suppress echoes of its own writes.
   pub origin_filter: Option<String>,
}

impl SubscriptionSpec {
   pub fn table(table_name: impl Into<String>) -> Self {
      Self {
         kind: SubscriptionKind::Table,
         table_name: table_name.into(),
         record_keys: None,
         origin_filter: None,
      }
   }

   pub fn records<I, S>(table_name: impl Into<String>, keys: I) -> Self
   where
      I: IntoIterator<Item = S>,
      S: Into<String>,
   {
      Self {
         kind: SubscriptionKind::Record,
         table_name: table_name.into(),
         record_keys: Some(keys.into_iter().map(Into::into).collect()),
         origin_filter: None,
      }
   }

   pub fn with_origin_filter(mut self, origin: impl Into<String>) -> Self {
      self.origin_filter = Some(origin.into());
      self
   }
}

/// A registered subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
   pub id: Uuid,
   pub spec: SubscriptionSpec,
}

/// Why a subscription was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CloseReason {
   /// The subscriber's sink stayed full; delivery could not keep up.
   Overflow,
   /// Explicit unsubscribe.
   Unsubscribed,
   /// Nobody re-attached within the linger window after a disconnect.
   LingerExpired,
}
