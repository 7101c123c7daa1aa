//! The consumer side of a subscription.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio_stream::Stream;
use uuid::Uuid;

use rowsync_store::ChangeEntry;

use crate::hub::SubscriptionHub;
use crate::subscription::CloseReason;

/// One delivery on a subscription stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
   Change(ChangeEntry),
   /// Terminal marker: the hub closed the subscription. Emitted once,
   /// right before the stream ends.
   Closed(CloseReason),
}

/// A leased stream over one subscription's sink.
///
/// Entries arrive in strict ascending version order. Dropping the stream
/// parks the receiver back in the hub, so a reconnect within the linger
/// window resumes with the next undelivered entry.
pub struct ChangeStream {
   id: Uuid,
   rx: Option<mpsc::Receiver<ChangeEntry>>,
   hub: Arc<SubscriptionHub>,
   close_emitted: bool,
}

impl ChangeStream {
   pub(crate) fn new(id: Uuid, rx: mpsc::Receiver<ChangeEntry>, hub: Arc<SubscriptionHub>) -> Self {
      Self {
         id,
         rx: Some(rx),
         hub,
         close_emitted: false,
      }
   }

   pub fn id(&self) -> Uuid {
      self.id
   }
}

impl Stream for ChangeStream {
   type Item = StreamEvent;

   fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
      let Some(rx) = self.rx.as_mut() else {
         return Poll::Ready(None);
      };
      match rx.poll_recv(cx) {
         Poll::Ready(Some(entry)) => Poll::Ready(Some(StreamEvent::Change(entry))),
         Poll::Ready(None) => {
            // Sender gone: the hub closed this subscription. The receiver
            // must not be re-parked on drop.
            self.rx = None;
            if !self.close_emitted
               && let Some(reason) = self.hub.close_reason(self.id)
            {
               self.close_emitted = true;
               return Poll::Ready(Some(StreamEvent::Closed(reason)));
            }
            Poll::Ready(None)
         }
         Poll::Pending => Poll::Pending,
      }
   }
}

impl Drop for ChangeStream {
   fn drop(&mut self) {
      if let Some(rx) = self.rx.take() {
         SubscriptionHub::release(&self.hub, self.id, rx);
      }
   }
}
