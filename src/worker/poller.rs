use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::config::OutboxConfig;
use crate::dispatch::{BatchReport, Dispatcher};
use crate::error::{StoreError, StoreResult};
use crate::outbox::OutboxStore;

use super::scheduler::{ScheduledTask, TaskStats};

/// Counters from a stopped poller.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PollerStats {
    pub task: TaskStats,
    /// Non-empty batches handed to the dispatcher.
    pub batches: usize,
    /// Events dispatched, whatever their result.
    pub events: usize,
}

/// Fetch one batch and dispatch it.
///
/// Returns `None` when nothing was pending or the fetch lost the race for the
/// store lock; the next tick tries again.
pub fn poll_once<S>(
    dispatcher: &Dispatcher<S>,
    max_batch_size: usize,
) -> StoreResult<Option<BatchReport>>
where
    S: OutboxStore + 'static,
{
    let batch = match dispatcher.store().fetch_batch_for_sending(max_batch_size) {
        Ok(batch) => batch,
        Err(err) if err.is_transient() => {
            debug!(error = %err, "Batch fetch contended, retrying next tick");
            return Ok(None);
        }
        Err(err) => return Err(err),
    };

    if batch.is_empty() {
        debug!("No pending outbox entries");
        return Ok(None);
    }
    Ok(Some(dispatcher.dispatch_batch(&batch)))
}

/// Periodically claims batches from the outbox and dispatches them.
pub struct Poller {
    task: ScheduledTask,
    batches: Arc<AtomicUsize>,
    events: Arc<AtomicUsize>,
}

impl Poller {
    /// Start polling with the delay, period and batch size from `config`.
    pub fn start<S>(dispatcher: Dispatcher<S>, config: &OutboxConfig) -> std::io::Result<Self>
    where
        S: OutboxStore + 'static,
    {
        Self::spawn(
            dispatcher,
            config.polling_delay(),
            config.polling_period(),
            config.max_batch_size,
        )
    }

    pub fn spawn<S>(
        dispatcher: Dispatcher<S>,
        delay: Duration,
        period: Duration,
        max_batch_size: usize,
    ) -> std::io::Result<Self>
    where
        S: OutboxStore + 'static,
    {
        let batches = Arc::new(AtomicUsize::new(0));
        let events = Arc::new(AtomicUsize::new(0));

        let batch_count = Arc::clone(&batches);
        let event_count = Arc::clone(&events);
        let task = ScheduledTask::spawn("outbox-poller", delay, period, move || {
            if let Some(report) = poll_once(&dispatcher, max_batch_size)? {
                batch_count.fetch_add(1, Ordering::Relaxed);
                event_count.fetch_add(report.events.len(), Ordering::Relaxed);
            }
            Ok::<(), StoreError>(())
        })?;

        Ok(Self {
            task,
            batches,
            events,
        })
    }

    /// Stop polling. A batch being dispatched is finished first.
    pub fn stop(self) -> PollerStats {
        let task = self.task.stop();
        PollerStats {
            task,
            batches: self.batches.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
        }
    }
}
