//! Background threads: the poller, the maintenance sweeps and broker consumers.

mod broker_consumer;
mod poller;
mod scheduler;
mod sweeps;

pub use broker_consumer::{BrokerConsumer, ConsumerStats};
pub use poller::{poll_once, Poller, PollerStats};
pub use scheduler::{ScheduledTask, TaskStats};
pub use sweeps::{check_deliveries, clean_up, CleanupSweep, DeliveryTimeoutMonitor};
