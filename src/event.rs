use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SerializationError;
use crate::serializer::EventSerializer;

/// Globally unique identity of a published event, assigned at insert time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    pub fn new() -> Self {
        EventId(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        EventId(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(EventId)
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A typed domain event that can be published through the outbox.
///
/// `EVENT_TYPE` is the stable name used for routing and for picking the
/// handlers registered for the event; it is stored next to the payload so
/// the concrete type can be recovered from a row.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct OrderPlaced { order_id: String }
///
/// impl DomainEvent for OrderPlaced {
///     const EVENT_TYPE: &'static str = "OrderPlaced";
/// }
/// ```
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + 'static {
    const EVENT_TYPE: &'static str;

    /// Aggregate-scoped events are expected to reach a handler; delivering
    /// one to nobody is reported as a failure rather than success.
    const AGGREGATE_SCOPED: bool = false;
}

/// An event in storable form: its type name plus the encoded payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedEvent {
    pub event_type: String,
    #[serde(with = "payload_serde")]
    pub payload: Vec<u8>,
}

mod payload_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(payload: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(payload).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

impl SerializedEvent {
    pub fn new(event_type: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }

    /// Encode a typed event with the given serializer.
    pub fn from_event<E, Z>(serializer: &Z, event: &E) -> Result<Self, SerializationError>
    where
        E: DomainEvent,
        Z: EventSerializer + ?Sized,
    {
        Ok(Self::new(E::EVENT_TYPE, serializer.encode(event)?))
    }

    /// Decode the payload back into `E`, checking the recorded type name.
    pub fn decode<E, Z>(&self, serializer: &Z) -> Result<E, SerializationError>
    where
        E: DomainEvent,
        Z: EventSerializer + ?Sized,
    {
        if self.event_type != E::EVENT_TYPE {
            return Err(SerializationError::TypeMismatch {
                expected: E::EVENT_TYPE.to_string(),
                actual: self.event_type.clone(),
            });
        }
        serializer.decode(&self.payload)
    }

    /// The `domain_event` column form: a JSON envelope with a base64 payload.
    pub fn to_column(&self) -> Result<String, SerializationError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_column(column: &str) -> Result<Self, SerializationError> {
        Ok(serde_json::from_str(column)?)
    }

    /// Get the payload as a string (if valid UTF-8).
    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}
