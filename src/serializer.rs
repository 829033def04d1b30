//! Event payload encoding.
//!
//! The outbox stores payloads as bytes; an `EventSerializer` decides what
//! those bytes look like. `JsonSerializer` keeps rows human readable,
//! `BitcodeSerializer` keeps them small.

use crate::error::SerializationError;
use crate::event::DomainEvent;

/// Converts typed events to and from payload bytes.
pub trait EventSerializer: Send + Sync + 'static {
    fn encode<E: DomainEvent>(&self, event: &E) -> Result<Vec<u8>, SerializationError>;

    fn decode<E: DomainEvent>(&self, payload: &[u8]) -> Result<E, SerializationError>;
}

/// JSON payloads via serde_json.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonSerializer;

impl EventSerializer for JsonSerializer {
    fn encode<E: DomainEvent>(&self, event: &E) -> Result<Vec<u8>, SerializationError> {
        Ok(serde_json::to_vec(event)?)
    }

    fn decode<E: DomainEvent>(&self, payload: &[u8]) -> Result<E, SerializationError> {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// Compact binary payloads via bitcode.
#[derive(Clone, Copy, Debug, Default)]
pub struct BitcodeSerializer;

impl EventSerializer for BitcodeSerializer {
    fn encode<E: DomainEvent>(&self, event: &E) -> Result<Vec<u8>, SerializationError> {
        Ok(bitcode::serialize(event)?)
    }

    fn decode<E: DomainEvent>(&self, payload: &[u8]) -> Result<E, SerializationError> {
        Ok(bitcode::deserialize(payload)?)
    }
}
