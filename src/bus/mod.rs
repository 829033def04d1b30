//! External broker contract.
//!
//! Channels that do not go through the outbox publish to a broker and
//! consume from it through these traits.
//!
//! ```text
//! BrokerChannel ──publish──▶ Publisher ═══ broker ═══ Subscriber ──poll──▶ BrokerConsumer
//!                                                          ▲                    │
//!                                                          └──── ack / nack ────┘
//! ```

mod in_memory_queue;
mod publisher;

pub use in_memory_queue::InMemoryQueue;
pub use publisher::{BrokerMessage, Publisher, Subscriber};

pub use crate::error::PublishError;
