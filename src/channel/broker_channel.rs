use std::sync::Arc;

use tracing::error;

use crate::bus::{BrokerMessage, Publisher, Subscriber};
use crate::error::OutboxResult;
use crate::event::{EventId, SerializedEvent};
use crate::transaction::TransactionContext;

use super::ChannelPublisher;

/// Publishes straight to an external broker, bypassing the outbox.
///
/// Inside a transaction the message is sent from a commit hook, so a rolled
/// back event never reaches the broker. A send that fails after commit is
/// logged; there is no stored copy to retry from.
pub struct BrokerChannel<P> {
    publisher: Arc<P>,
    subscriber: Option<Arc<dyn Subscriber>>,
}

impl<P: Publisher> BrokerChannel<P> {
    pub fn new(publisher: P) -> Self {
        Self {
            publisher: Arc::new(publisher),
            subscriber: None,
        }
    }

    /// Give the channel a consume side read by `BrokerConsumer`.
    pub fn consuming<S>(mut self, subscriber: S) -> Self
    where
        S: Subscriber + 'static,
    {
        self.subscriber = Some(Arc::new(subscriber));
        self
    }

    pub fn subscriber(&self) -> Option<Arc<dyn Subscriber>> {
        self.subscriber.clone()
    }
}

impl<Tx, P> ChannelPublisher<Tx> for BrokerChannel<P>
where
    Tx: TransactionContext,
    P: Publisher + 'static,
{
    fn publish(&self, tx: &mut Tx, event: &SerializedEvent) -> OutboxResult<EventId> {
        let id = EventId::new();
        let message = BrokerMessage::from_event(id, event);
        let publisher = Arc::clone(&self.publisher);

        tx.on_commit(Box::new(move || {
            let event_type = message.event_type.clone();
            if let Err(err) = publisher.publish(message) {
                error!(
                    event_id = %id,
                    event_type = %event_type,
                    error = %err,
                    "Broker publish after commit failed"
                );
            }
        }));
        Ok(id)
    }

    fn publish_detached(&self, event: &SerializedEvent) -> OutboxResult<EventId> {
        let id = EventId::new();
        self.publisher.publish(BrokerMessage::from_event(id, event))?;
        Ok(id)
    }
}
