//! Outbox storage: entries, the store contract and its backends.

mod entry;
mod in_memory;
mod store;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use entry::{Batch, BatchId, DeliveryState, OutboxEntry, ProcessingResult};
pub use in_memory::{InMemoryOutboxStore, MemoryTransaction};
pub use store::{IdempotencyStore, OutboxStore};
