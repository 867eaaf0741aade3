//! Reliable event delivery for saga steps.
//!
//! Producers record events with an [`OutboxRecorder`] inside the same
//! [`store::UnitOfWork`] as the business change they describe. An
//! [`OutboxDispatcher`] later relays unsent rows to a [`Transport`] and marks
//! them sent only once the transport confirms, giving at-least-once delivery.
//! Consumers guard their effects with an [`InboxDeduplicator`] so that
//! redelivered messages are applied at most once.

pub mod dispatcher;
pub mod error;
pub mod inbox;
pub mod recorder;
pub mod transport;

pub use dispatcher::{DispatchReport, DispatcherConfig, OutboxDispatcher};
pub use error::{OutboxError, Result};
pub use inbox::InboxDeduplicator;
pub use recorder::OutboxRecorder;
pub use transport::{
    ChannelTransport, InMemoryTransport, OutboundMessage, Transport, TransportError,
};
