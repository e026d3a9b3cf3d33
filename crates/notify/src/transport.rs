//! Push delivery seam.
//!
//! [`Transport::send`] may fail; the bus logs the loss and moves on.
//! `reconcile` is the guarantee, push is the optimization.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::NotifyError;
use crate::events::Event;

/// Delivers one event to one subscriber.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, subscriber_id: &str, event: &Event) -> Result<(), NotifyError>;
}

/// In-process delivery over per-subscriber channels.
///
/// Used when the surrounding application consumes events in the same
/// process (e.g. fanning out to its own WebSocket layer), and in tests.
pub struct ChannelTransport {
    channels: RwLock<HashMap<String, mpsc::UnboundedSender<Event>>>,
}

impl ChannelTransport {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Open a channel for a subscriber, replacing any previous one.
    pub fn register(&self, subscriber_id: &str) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channels.write().unwrap().insert(subscriber_id.to_string(), tx);
        rx
    }

    pub fn deregister(&self, subscriber_id: &str) -> bool {
        self.channels.write().unwrap().remove(subscriber_id).is_some()
    }
}

impl Default for ChannelTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, subscriber_id: &str, event: &Event) -> Result<(), NotifyError> {
        let channels = self.channels.read().unwrap();
        let tx = channels
            .get(subscriber_id)
            .ok_or_else(|| NotifyError::UnknownSubscriber(subscriber_id.to_string()))?;
        tx.send(event.clone())
            .map_err(|_| NotifyError::ChannelClosed(subscriber_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use segmentd_queue::item::CancelScope;

    fn sample_event() -> Event {
        Event::CancellationApplied {
            scope: CancelScope::All,
            target: None,
            cancelled_count: 1,
        }
    }

    #[tokio::test]
    async fn delivers_to_registered_subscriber() {
        let transport = ChannelTransport::new();
        let mut rx = transport.register("sub-1");
        transport.send("sub-1", &sample_event()).await.unwrap();
        assert!(matches!(rx.recv().await, Some(Event::CancellationApplied { .. })));
    }

    #[tokio::test]
    async fn unknown_subscriber_is_an_error() {
        let transport = ChannelTransport::new();
        let err = transport.send("nobody", &sample_event()).await.unwrap_err();
        assert!(matches!(err, NotifyError::UnknownSubscriber(_)));
    }

    #[tokio::test]
    async fn dropped_receiver_reports_closed_channel() {
        let transport = ChannelTransport::new();
        let rx = transport.register("sub-1");
        drop(rx);
        let err = transport.send("sub-1", &sample_event()).await.unwrap_err();
        assert!(matches!(err, NotifyError::ChannelClosed(_)));
    }
}
