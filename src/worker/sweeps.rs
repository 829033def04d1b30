//! Periodic maintenance of the outbox table.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::OutboxConfig;
use crate::error::StoreResult;
use crate::outbox::OutboxStore;

use super::scheduler::{ScheduledTask, TaskStats};

/// Marks entries stuck in flight past the delivery timeout as `DELIVERY_TIMED_OUT`.
pub struct DeliveryTimeoutMonitor {
    task: ScheduledTask,
}

impl DeliveryTimeoutMonitor {
    pub fn start<S>(store: Arc<S>, config: &OutboxConfig) -> std::io::Result<Self>
    where
        S: OutboxStore + 'static,
    {
        Self::spawn(
            store,
            config.delivery_check_period(),
            config.batch_delivery_timeout(),
        )
    }

    /// First check after one `period`, then every `period`.
    pub fn spawn<S>(store: Arc<S>, period: Duration, timeout: Duration) -> std::io::Result<Self>
    where
        S: OutboxStore + 'static,
    {
        let task = ScheduledTask::spawn("outbox-delivery-check", period, period, move || {
            check_deliveries(store.as_ref(), timeout).map(|_| ())
        })?;
        Ok(Self { task })
    }

    pub fn stop(self) -> TaskStats {
        self.task.stop()
    }
}

/// One delivery-timeout pass. Returns how many entries timed out.
pub fn check_deliveries<S: OutboxStore>(store: &S, timeout: Duration) -> StoreResult<usize> {
    let timed_out = store.delivery_check(timeout)?;
    if timed_out > 0 {
        warn!(
            count = timed_out,
            timeout_secs = timeout.as_secs(),
            "Outbox entries timed out in flight"
        );
    } else {
        debug!("No timed-out outbox entries");
    }
    Ok(timed_out)
}

/// Deletes delivered entries older than the retention age.
pub struct CleanupSweep {
    task: ScheduledTask,
}

impl CleanupSweep {
    pub fn start<S>(store: Arc<S>, config: &OutboxConfig) -> std::io::Result<Self>
    where
        S: OutboxStore + 'static,
    {
        Self::spawn(store, config.cleanup_period(), config.cleanup_age())
    }

    /// First sweep after one `period`, then every `period`.
    pub fn spawn<S>(store: Arc<S>, period: Duration, age: Duration) -> std::io::Result<Self>
    where
        S: OutboxStore + 'static,
    {
        let task = ScheduledTask::spawn("outbox-cleanup", period, period, move || {
            clean_up(store.as_ref(), age).map(|_| ())
        })?;
        Ok(Self { task })
    }

    pub fn stop(self) -> TaskStats {
        self.task.stop()
    }
}

/// One cleanup pass. Returns how many entries were deleted.
pub fn clean_up<S: OutboxStore>(store: &S, age: Duration) -> StoreResult<usize> {
    let deleted = store.cleanup(age)?;
    if deleted > 0 {
        info!(count = deleted, "Deleted delivered outbox entries");
    }
    Ok(deleted)
}
