//! Transactional outbox for domain events.
//!
//! Events are published inside the caller's transaction and stored in an
//! outbox table. A poller claims committed entries in batches, runs the
//! registered handlers and records one result per event. Rolled-back events
//! never exist; committed ones are delivered at least once.
//!
//! ```ignore
//! let store = Arc::new(SqliteOutboxStore::from_config(&path, &config)?);
//!
//! let mut registry = HandlerRegistry::new();
//! registry.on::<OrderPlaced, _>("billing", |event, tx| bill(tx.connection(), event))?;
//! let dispatcher = Dispatcher::new(Arc::clone(&store), registry).with_idempotency();
//!
//! let router = ChannelRouter::builder()
//!     .channel(Channel::outbox("outbox", OutboxChannel::new(Arc::clone(&store))))
//!     .default_channel("outbox")
//!     .build()?;
//! let publisher = EventPublisher::new(Arc::new(router));
//! let runtime = OutboxRuntime::start(&config, dispatcher, publisher.router())?;
//!
//! let mut tx = store.begin()?;
//! publisher.publish(&mut tx, &OrderPlaced { order_id: "o-1".into() })?;
//! tx.commit()?;
//! ```

pub mod bus;
pub mod channel;
pub mod clock;
pub mod config;
pub mod dispatch;
mod error;
mod event;
pub mod outbox;
mod publisher;
mod runtime;
pub mod serializer;
mod transaction;
pub mod worker;

pub use channel::{BrokerChannel, Channel, ChannelPublisher, ChannelRouter, OutboxChannel};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::OutboxConfig;
pub use dispatch::{Dispatcher, HandlerRegistry, HandlerOutcome};
pub use error::{
    ConfigError, HandlerError, OutboxError, OutboxResult, PublishError, RegistrationError,
    RouteError, RuntimeError, SerializationError, StoreError, StoreResult,
};
pub use event::{DomainEvent, EventId, SerializedEvent};
pub use outbox::{
    Batch, BatchId, IdempotencyStore, InMemoryOutboxStore, MemoryTransaction, OutboxEntry,
    OutboxStore, ProcessingResult,
};
#[cfg(feature = "sqlite")]
pub use outbox::sqlite::{SqliteOptions, SqliteOutboxStore, SqliteTransaction};
pub use publisher::EventPublisher;
pub use runtime::{OutboxRuntime, RuntimeStats};
pub use serializer::{BitcodeSerializer, EventSerializer, JsonSerializer};
pub use transaction::{TransactionContext, TransactionHook, TransactionProvider};
