//! Transports that deliver committed row changes to the bus

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::ChangeEvent;
use crate::utils::{EngineError, Result};

/// Channel capacity for locally published changes.
const CHANNEL_CAPACITY: usize = 1024;

/// Something the bus can (re)connect to
#[async_trait]
pub trait ChangeSource: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn ChangeStream>>;
}

/// One live connection. `None` means the connection closed.
#[async_trait]
pub trait ChangeStream: Send {
    async fn next_event(&mut self) -> Option<Result<ChangeEvent>>;
}

/// Publishing side for stores that live in this process
#[derive(Clone)]
pub struct FeedPublisher {
    sender: broadcast::Sender<ChangeEvent>,
}

impl FeedPublisher {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: ChangeEvent) {
        // No receivers just means nobody is listening yet
        if self.sender.send(event).is_err() {
            debug!("Change published with no feed connected");
        }
    }

    /// A source the bus can connect to for these changes
    pub fn source(&self) -> ChannelSource {
        ChannelSource {
            sender: self.sender.clone(),
        }
    }
}

impl Default for FeedPublisher {
    fn default() -> Self {
        Self::new()
    }
}

/// In-process source backed by a broadcast channel
pub struct ChannelSource {
    sender: broadcast::Sender<ChangeEvent>,
}

#[async_trait]
impl ChangeSource for ChannelSource {
    async fn connect(&self) -> Result<Box<dyn ChangeStream>> {
        Ok(Box::new(ChannelStream {
            receiver: self.sender.subscribe(),
        }))
    }
}

struct ChannelStream {
    receiver: broadcast::Receiver<ChangeEvent>,
}

#[async_trait]
impl ChangeStream for ChannelStream {
    async fn next_event(&mut self) -> Option<Result<ChangeEvent>> {
        match self.receiver.recv().await {
            Ok(event) => Some(Ok(event)),
            Err(broadcast::error::RecvError::Closed) => None,
            // Dropped events are a gap like any other; the bus reconnects and resyncs
            Err(broadcast::error::RecvError::Lagged(count)) => Some(Err(
                EngineError::TransportUnavailable(format!("feed lagged by {} events", count)),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ChangeKind, Table};
    use serde_json::json;

    #[tokio::test]
    async fn test_channel_source_delivers_published_events() {
        let publisher = FeedPublisher::new();
        let source = publisher.source();
        let mut stream = source.connect().await.expect("connect");

        publisher.publish(ChangeEvent::new(
            Table::Notifications,
            ChangeKind::Update,
            json!({ "id": 1, "user_id": 5 }),
        ));

        let event = stream.next_event().await.expect("event").expect("ok");
        assert_eq!(event.table, Table::Notifications);
        assert_eq!(event.kind, ChangeKind::Update);
    }

    #[tokio::test]
    async fn test_publish_without_listeners_is_not_an_error() {
        let publisher = FeedPublisher::new();
        publisher.publish(ChangeEvent::new(Table::Users, ChangeKind::Insert, json!({})));
    }
}
