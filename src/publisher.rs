//! Application-facing entry point for publishing domain events.

use std::sync::Arc;

use tracing::debug;

use crate::channel::ChannelRouter;
use crate::error::OutboxResult;
use crate::event::{DomainEvent, EventId, SerializedEvent};
use crate::serializer::{EventSerializer, JsonSerializer};

/// Publishes typed events through the channel their type routes to.
///
/// Built once at startup and handed to the code that emits events.
///
/// ```ignore
/// let publisher = EventPublisher::new(Arc::new(router));
///
/// let mut tx = store.begin()?;
/// save_order(tx.connection(), &order)?;
/// publisher.publish(&mut tx, &OrderPlaced { order_id: order.id.clone() })?;
/// tx.commit()?;
/// ```
pub struct EventPublisher<Tx, Z = JsonSerializer> {
    router: Arc<ChannelRouter<Tx>>,
    serializer: Z,
}

impl<Tx> EventPublisher<Tx, JsonSerializer> {
    pub fn new(router: Arc<ChannelRouter<Tx>>) -> Self {
        Self::with_serializer(router, JsonSerializer)
    }
}

impl<Tx, Z> Clone for EventPublisher<Tx, Z>
where
    Z: Clone,
{
    fn clone(&self) -> Self {
        Self {
            router: Arc::clone(&self.router),
            serializer: self.serializer.clone(),
        }
    }
}

impl<Tx, Z> EventPublisher<Tx, Z>
where
    Z: EventSerializer,
{
    pub fn with_serializer(router: Arc<ChannelRouter<Tx>>, serializer: Z) -> Self {
        Self { router, serializer }
    }

    pub fn router(&self) -> &ChannelRouter<Tx> {
        &self.router
    }

    /// Publish `event` as part of `tx`.
    ///
    /// Fails synchronously when no channel accepts the event type.
    pub fn publish<E: DomainEvent>(&self, tx: &mut Tx, event: &E) -> OutboxResult<EventId> {
        let serialized = SerializedEvent::from_event(&self.serializer, event)?;
        self.publish_serialized(tx, &serialized)
    }

    /// Publish without a caller transaction. Outbox channels refuse this
    /// unless they were built with `require_transaction(false)`.
    pub fn publish_detached<E: DomainEvent>(&self, event: &E) -> OutboxResult<EventId> {
        let serialized = SerializedEvent::from_event(&self.serializer, event)?;
        let channel = self.router.route(&serialized.event_type)?;
        let id = channel.publisher().publish_detached(&serialized)?;
        debug!(
            event_id = %id,
            event_type = %serialized.event_type,
            channel = channel.name(),
            "Published detached event"
        );
        Ok(id)
    }

    /// Publish an already serialized event as part of `tx`.
    pub fn publish_serialized(
        &self,
        tx: &mut Tx,
        event: &SerializedEvent,
    ) -> OutboxResult<EventId> {
        let channel = self.router.route(&event.event_type)?;
        let id = channel.publisher().publish(tx, event)?;
        debug!(
            event_id = %id,
            event_type = %event.event_type,
            channel = channel.name(),
            "Published event"
        );
        Ok(id)
    }
}
