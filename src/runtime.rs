//! Starts and stops every background part of the outbox together.

use std::sync::Arc;

use tracing::info;

use crate::channel::ChannelRouter;
use crate::config::OutboxConfig;
use crate::dispatch::Dispatcher;
use crate::error::RuntimeError;
use crate::outbox::OutboxStore;
use crate::worker::{
    BrokerConsumer, CleanupSweep, ConsumerStats, DeliveryTimeoutMonitor, Poller, PollerStats,
    TaskStats,
};

/// Counters collected at shutdown.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RuntimeStats {
    pub poller: PollerStats,
    pub delivery_check: TaskStats,
    pub cleanup: TaskStats,
    /// (channel name, stats) per broker consumer.
    pub consumers: Vec<(String, ConsumerStats)>,
}

/// The running outbox: poller, delivery-timeout monitor, cleanup sweep and
/// one consumer per broker channel that has a consume side.
///
/// ```ignore
/// let runtime = OutboxRuntime::start(&config, dispatcher, &router)?;
/// // serve traffic...
/// let stats = runtime.shutdown();
/// ```
pub struct OutboxRuntime {
    poller: Poller,
    delivery_check: DeliveryTimeoutMonitor,
    cleanup: CleanupSweep,
    consumers: Vec<BrokerConsumer>,
}

impl OutboxRuntime {
    /// Validate `config` and start every worker. Nothing is spawned for an
    /// invalid configuration.
    pub fn start<S>(
        config: &OutboxConfig,
        dispatcher: Dispatcher<S>,
        router: &ChannelRouter<S::Tx>,
    ) -> Result<Self, RuntimeError>
    where
        S: OutboxStore + 'static,
    {
        config.validate()?;
        let store: Arc<S> = Arc::clone(dispatcher.store());

        let mut consumers = Vec::new();
        for channel in router.channels() {
            if let Some(subscriber) = channel.consumer() {
                consumers.push(BrokerConsumer::spawn(
                    channel.name(),
                    subscriber,
                    dispatcher.clone(),
                    config.polling_period(),
                )?);
            }
        }

        let delivery_check = DeliveryTimeoutMonitor::start(Arc::clone(&store), config)?;
        let cleanup = CleanupSweep::start(store, config)?;
        let poller = Poller::start(dispatcher, config)?;

        info!(
            consumers = consumers.len(),
            polling_period_ms = config.polling_period_ms,
            max_batch_size = config.max_batch_size,
            "Outbox runtime started"
        );

        Ok(Self {
            poller,
            delivery_check,
            cleanup,
            consumers,
        })
    }

    /// Stop everything. The poller goes first so no new batch is claimed
    /// while the rest wind down; work already in progress finishes.
    pub fn shutdown(self) -> RuntimeStats {
        let poller = self.poller.stop();
        let consumers = self
            .consumers
            .into_iter()
            .map(|consumer| {
                let name = consumer.channel().to_string();
                (name, consumer.stop())
            })
            .collect();
        let stats = RuntimeStats {
            poller,
            delivery_check: self.delivery_check.stop(),
            cleanup: self.cleanup.stop(),
            consumers,
        };

        info!(
            batches = stats.poller.batches,
            events = stats.poller.events,
            "Outbox runtime stopped"
        );
        stats
    }
}
