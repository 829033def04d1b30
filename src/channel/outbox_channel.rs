use std::sync::Arc;

use crate::config::OutboxConfig;
use crate::error::{OutboxResult, StoreError};
use crate::event::{EventId, SerializedEvent};
use crate::outbox::OutboxStore;

use super::ChannelPublisher;

/// Publishes by inserting into the outbox.
///
/// With `require_transaction` set, publishing without a caller transaction
/// fails with `NoTransactionActive`. Otherwise the insert commits on its own.
pub struct OutboxChannel<S> {
    store: Arc<S>,
    require_transaction: bool,
}

impl<S> OutboxChannel<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            require_transaction: true,
        }
    }

    pub fn from_config(store: Arc<S>, config: &OutboxConfig) -> Self {
        Self::new(store).require_transaction(config.require_transaction)
    }

    pub fn require_transaction(mut self, required: bool) -> Self {
        self.require_transaction = required;
        self
    }
}

impl<S> ChannelPublisher<S::Tx> for OutboxChannel<S>
where
    S: OutboxStore,
{
    fn publish(&self, tx: &mut S::Tx, event: &SerializedEvent) -> OutboxResult<EventId> {
        Ok(self.store.insert(tx, event)?)
    }

    fn publish_detached(&self, event: &SerializedEvent) -> OutboxResult<EventId> {
        if self.require_transaction {
            return Err(StoreError::NoTransactionActive.into());
        }
        Ok(self
            .store
            .in_new_transaction(|tx| self.store.insert(tx, event))?)
    }
}
