//! Error types shared across the outbox.

use std::any::Any;
use std::error::Error as StdError;

use thiserror::Error;

use crate::event::EventId;

/// Errors raised by an outbox or idempotency store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// An insert required a caller transaction but none was active.
    #[error("no transaction active")]
    NoTransactionActive,

    /// The store could not acquire its lock in time. Transient: retry on the next tick.
    #[error("lock timeout while {0}")]
    LockTimeout(&'static str),

    /// An in-process lock was poisoned by a panicking thread.
    #[error("store lock poisoned during {0}")]
    LockPoisoned(&'static str),

    /// A concurrent delivery already recorded this (event, handler) marker.
    #[error("idempotency marker already recorded for event {event_id} and handler {handler_id}")]
    MarkerConflict { event_id: EventId, handler_id: String },

    /// No outbox entry exists for the id.
    #[error("outbox entry not found: {0}")]
    NotFound(EventId),

    /// An operator action was refused for the entry's current state.
    #[error("invalid state for {event_id}: {reason}")]
    InvalidState { event_id: EventId, reason: String },

    /// Envelope or payload encoding failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// SQLite error.
    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(rusqlite::Error),

    /// Connection pool error.
    #[error("connection error: {0}")]
    Pool(String),

    /// A stored row could not be interpreted.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl StoreError {
    /// Whether the failure is contention that a later attempt may not hit.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::LockTimeout(_))
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err.sqlite_error_code() {
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked) => {
                StoreError::LockTimeout("waiting for the sqlite write lock")
            }
            _ => StoreError::Sqlite(err),
        }
    }
}

/// Result type alias using StoreError.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised while encoding or decoding events.
#[derive(Error, Debug)]
pub enum SerializationError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bitcode error: {0}")]
    Bitcode(#[from] bitcode::Error),

    #[error("base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The payload was recorded for a different event type.
    #[error("event type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },
}

/// Error returned by an event handler.
///
/// The dispatcher captures these per handler; they never reach the poller.
#[derive(Error, Debug)]
pub enum HandlerError {
    /// Business logic rejected the event.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The payload could not be decoded into the handler's event type.
    #[error("decode failed: {0}")]
    Decode(#[from] SerializationError),

    /// The handler's own store access failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("handler error: {0}")]
    Other(Box<dyn StdError + Send + Sync>),
}

/// Errors raised while resolving a channel for an event.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    /// No explicit route matched and no default channel is configured.
    #[error("no route for event type {0} and no default channel")]
    NoRouteAndNoDefault(String),

    /// A route or default names a channel that was never registered.
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    /// Two channels were registered under the same name.
    #[error("channel registered twice: {0}")]
    DuplicateChannel(String),
}

/// Errors raised while building a handler registry.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// The handler id is already bound to the event type.
    #[error("handler {handler_id} already registered for {event_type}")]
    DuplicateHandler {
        event_type: String,
        handler_id: String,
    },
}

/// Errors raised by an external broker.
#[derive(Error, Debug)]
pub enum PublishError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("message rejected: {0}")]
    Rejected(String),

    #[error("publish timeout")]
    Timeout,

    #[error("publish error: {0}")]
    Other(Box<dyn StdError + Send + Sync>),
}

/// Configuration validation error.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The outbox runtime could not start.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Publish-time error surfaced synchronously to the caller.
#[derive(Error, Debug)]
pub enum OutboxError {
    #[error(transparent)]
    Route(#[from] RouteError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Serialization(#[from] SerializationError),

    #[error("broker error: {0}")]
    Broker(#[from] PublishError),
}

/// Result type alias using OutboxError.
pub type OutboxResult<T> = Result<T, OutboxError>;

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
