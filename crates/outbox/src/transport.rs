//! Transport seam between the dispatcher and the message broker.

use std::collections::HashSet;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use async_trait::async_trait;
use store::OutboxRecord;
use thiserror::Error;
use tokio::sync::mpsc;

/// A message as handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Stable identifier carried as a header; consumers dedup on it.
    pub message_id: String,
    pub routing_key: String,
    pub event_type: String,
    pub payload: Vec<u8>,
}

impl From<&OutboxRecord> for OutboundMessage {
    fn from(record: &OutboxRecord) -> Self {
        Self {
            message_id: record.message_id(),
            routing_key: record.routing_key(),
            event_type: record.event_type.clone(),
            payload: record.payload.clone(),
        }
    }
}

/// Errors reported by a transport.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The broker could not be reached.
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    /// The broker refused or negatively acknowledged the message.
    #[error("Message rejected: {0}")]
    Rejected(String),
}

/// Publishes messages to an external broker.
///
/// `Ok(())` means the broker confirmed the message. Anything else, including
/// never returning, leaves the outbox row unsent.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError>;
}

#[derive(Debug, Default)]
struct InMemoryTransportState {
    published: Vec<OutboundMessage>,
    fail_on_publish: bool,
    failing_routing_keys: HashSet<String>,
    confirm_delay: Option<Duration>,
}

/// In-memory transport for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryTransport {
    state: Arc<RwLock<InMemoryTransportState>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, InMemoryTransportState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, InMemoryTransportState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Configures the transport to reject every publish.
    pub fn set_fail_on_publish(&self, fail: bool) {
        self.write().fail_on_publish = fail;
    }

    /// Configures the transport to reject publishes for one routing key.
    pub fn fail_routing_key(&self, routing_key: impl Into<String>) {
        self.write().failing_routing_keys.insert(routing_key.into());
    }

    /// Delays every confirmation, to simulate a slow broker.
    pub fn set_confirm_delay(&self, delay: Option<Duration>) {
        self.write().confirm_delay = delay;
    }

    /// Returns every confirmed message in publish order.
    pub fn published(&self) -> Vec<OutboundMessage> {
        self.read().published.clone()
    }

    /// Returns the number of confirmed messages.
    pub fn published_count(&self) -> usize {
        self.read().published.len()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        let delay = self.read().confirm_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.write();
        if state.fail_on_publish {
            return Err(TransportError::Unavailable("broker unreachable".to_string()));
        }
        if state.failing_routing_keys.contains(&message.routing_key) {
            return Err(TransportError::Rejected(format!(
                "nack for {}",
                message.routing_key
            )));
        }
        state.published.push(message);
        Ok(())
    }
}

/// Transport that hands messages to an in-process consumer over a channel.
///
/// A message counts as confirmed once the channel accepts it.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    sender: mpsc::Sender<OutboundMessage>,
}

impl ChannelTransport {
    /// Creates a transport and the receiving end for its consumer.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<OutboundMessage>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn publish(&self, message: OutboundMessage) -> Result<(), TransportError> {
        self.sender
            .send(message)
            .await
            .map_err(|_| TransportError::Unavailable("consumer channel closed".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(key: &str) -> OutboundMessage {
        OutboundMessage {
            message_id: "1".to_string(),
            routing_key: key.to_string(),
            event_type: "ORDER_CONFIRMED".to_string(),
            payload: Vec::new(),
        }
    }

    #[tokio::test]
    async fn in_memory_transport_records_confirmed_messages() {
        let transport = InMemoryTransport::new();
        transport.publish(message("Order.1")).await.unwrap();
        assert_eq!(transport.published_count(), 1);

        transport.set_fail_on_publish(true);
        assert!(transport.publish(message("Order.1")).await.is_err());
        assert_eq!(transport.published_count(), 1);
    }

    #[tokio::test]
    async fn failing_routing_key_only_affects_that_key() {
        let transport = InMemoryTransport::new();
        transport.fail_routing_key("Order.1");
        assert!(matches!(
            transport.publish(message("Order.1")).await,
            Err(TransportError::Rejected(_))
        ));
        transport.publish(message("Order.2")).await.unwrap();
        assert_eq!(transport.published()[0].routing_key, "Order.2");
    }

    #[tokio::test]
    async fn channel_transport_fails_once_consumer_is_gone() {
        let (transport, mut receiver) = ChannelTransport::new(4);
        transport.publish(message("Order.1")).await.unwrap();
        assert_eq!(receiver.recv().await.unwrap().routing_key, "Order.1");

        drop(receiver);
        assert!(transport.publish(message("Order.1")).await.is_err());
    }
}
