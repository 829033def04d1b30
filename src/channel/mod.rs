//! Named delivery channels and the routing table that picks one per event type.

mod broker_channel;
mod outbox_channel;
mod router;

use std::fmt;
use std::sync::Arc;

use crate::bus::Subscriber;
use crate::error::OutboxResult;
use crate::event::{EventId, SerializedEvent};
use crate::transaction::TransactionContext;

pub use broker_channel::BrokerChannel;
pub use outbox_channel::OutboxChannel;
pub use router::{ChannelRouter, ChannelRouterBuilder};

/// Publish side of a channel.
pub trait ChannelPublisher<Tx>: Send + Sync {
    /// Publish as part of `tx`: the event leaves only if `tx` commits.
    fn publish(&self, tx: &mut Tx, event: &SerializedEvent) -> OutboxResult<EventId>;

    /// Publish with no caller transaction.
    fn publish_detached(&self, event: &SerializedEvent) -> OutboxResult<EventId>;
}

/// A named destination: how events are published and, optionally, how they
/// are consumed back.
pub struct Channel<Tx> {
    name: String,
    publisher: Arc<dyn ChannelPublisher<Tx>>,
    consumer: Option<Arc<dyn Subscriber>>,
}

impl<Tx: TransactionContext + 'static> Channel<Tx> {
    pub fn new<P>(name: impl Into<String>, publisher: P) -> Self
    where
        P: ChannelPublisher<Tx> + 'static,
    {
        Self {
            name: name.into(),
            publisher: Arc::new(publisher),
            consumer: None,
        }
    }

    /// A channel whose events go through the outbox.
    pub fn outbox<S>(name: impl Into<String>, channel: OutboxChannel<S>) -> Self
    where
        S: crate::outbox::OutboxStore<Tx = Tx> + 'static,
    {
        Self::new(name, channel)
    }

    /// A channel publishing straight to a broker, consumed back by `BrokerConsumer`
    /// when the broker channel has a subscriber.
    pub fn broker<P>(name: impl Into<String>, channel: BrokerChannel<P>) -> Self
    where
        P: crate::bus::Publisher + 'static,
    {
        let consumer = channel.subscriber();
        Self {
            name: name.into(),
            publisher: Arc::new(channel),
            consumer,
        }
    }
}

impl<Tx> Channel<Tx> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn publisher(&self) -> &dyn ChannelPublisher<Tx> {
        self.publisher.as_ref()
    }

    /// Consume side, if the channel has one.
    pub fn consumer(&self) -> Option<Arc<dyn Subscriber>> {
        self.consumer.clone()
    }
}

impl<Tx> fmt::Debug for Channel<Tx> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("name", &self.name)
            .field("consumes", &self.consumer.is_some())
            .finish()
    }
}
