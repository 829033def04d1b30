//! Minimal publish/consume contract for external brokers.

use uuid::Uuid;

use crate::error::PublishError;
use crate::event::{EventId, SerializedEvent};

/// A serialized event on its way to or from a broker.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Broker message id, stable across redeliveries.
    pub id: String,
    /// Event type name, used to pick handlers on the consume side.
    pub event_type: String,
    /// Encoded payload.
    pub payload: Vec<u8>,
    /// Optional headers (correlation ids and the like).
    pub headers: Vec<(String, String)>,
}

impl BrokerMessage {
    pub fn new(id: impl Into<String>, event_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            event_type: event_type.into(),
            payload,
            headers: Vec::new(),
        }
    }

    pub fn from_event(id: EventId, event: &SerializedEvent) -> Self {
        Self::new(id.to_string(), event.event_type.clone(), event.payload.clone())
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The event id behind this message.
    ///
    /// Ids published from an outbox event parse back to that event. Any other
    /// broker id maps to a name-based UUID, so redeliveries keep one identity.
    pub fn event_id(&self) -> EventId {
        EventId::parse(&self.id).unwrap_or_else(|_| {
            EventId::from_uuid(Uuid::new_v5(&Uuid::NAMESPACE_OID, self.id.as_bytes()))
        })
    }

    pub fn to_serialized_event(&self) -> SerializedEvent {
        SerializedEvent::new(self.event_type.clone(), self.payload.clone())
    }
}

/// Sends messages to a broker.
pub trait Publisher: Send + Sync {
    fn publish(&self, message: BrokerMessage) -> Result<(), PublishError>;

    /// Default implementation publishes messages one by one.
    fn publish_batch(&self, messages: Vec<BrokerMessage>) -> Result<(), PublishError> {
        for message in messages {
            self.publish(message)?;
        }
        Ok(())
    }
}

/// Pull-based consumer of a broker.
pub trait Subscriber: Send + Sync {
    /// Wait up to `timeout_ms` for the next message.
    fn poll(&self, timeout_ms: u64) -> Result<Option<BrokerMessage>, PublishError>;

    /// Confirm a message was processed.
    fn ack(&self, message_id: &str) -> Result<(), PublishError>;

    /// Reject a message so the broker can redeliver or dead-letter it.
    fn nack(&self, message_id: &str, reason: &str) -> Result<(), PublishError>;
}
