//! Recurring background task on a dedicated thread.

use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::error::panic_message;

/// Counters from a scheduled task.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TaskStats {
    /// Runs that started, whatever their outcome.
    pub runs: usize,
    /// Runs that returned an error.
    pub failures: usize,
    /// Runs that panicked.
    pub panics: usize,
}

/// A task run after `delay` and then every `period` until stopped.
///
/// Errors and panics of a run are logged and counted; the next run still
/// happens. Stopping never interrupts a run in progress, and no run starts
/// once `stop()` has returned.
///
/// ```ignore
/// let task = ScheduledTask::spawn("heartbeat", Duration::ZERO, Duration::from_secs(1), || {
///     ping()
/// })?;
/// // ...
/// let stats = task.stop();
/// ```
pub struct ScheduledTask {
    name: String,
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<TaskStats>>,
}

impl ScheduledTask {
    pub fn spawn<F, E>(
        name: &str,
        delay: Duration,
        period: Duration,
        mut task: F,
    ) -> std::io::Result<Self>
    where
        F: FnMut() -> Result<(), E> + Send + 'static,
        E: Display,
    {
        let (stop_tx, stop_rx) = channel();
        let task_name = name.to_string();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut stats = TaskStats::default();
                let mut wait = delay;

                loop {
                    match stop_rx.recv_timeout(wait) {
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {}
                    }

                    let started = Instant::now();
                    stats.runs += 1;
                    match panic::catch_unwind(AssertUnwindSafe(&mut task)) {
                        Ok(Ok(())) => {}
                        Ok(Err(err)) => {
                            stats.failures += 1;
                            warn!(task = %task_name, error = %err, "Scheduled run failed");
                        }
                        Err(payload) => {
                            stats.panics += 1;
                            error!(
                                task = %task_name,
                                panic = %panic_message(payload.as_ref()),
                                "Scheduled run panicked"
                            );
                        }
                    }

                    // Fixed rate: a slow run shortens the next wait.
                    wait = period.saturating_sub(started.elapsed());
                }

                debug!(task = %task_name, runs = stats.runs, "Scheduled task stopped");
                stats
            })?;

        info!(
            task = name,
            delay_ms = delay.as_millis() as u64,
            period_ms = period.as_millis() as u64,
            "Scheduled task started"
        );

        Ok(Self {
            name: name.to_string(),
            stop_tx,
            handle: Some(handle),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop the task, waiting for a run in progress to finish.
    pub fn stop(mut self) -> TaskStats {
        self.join()
    }

    /// Signal the task to stop without waiting.
    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(());
    }

    fn join(&mut self) -> TaskStats {
        let _ = self.stop_tx.send(());
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_default(),
            None => TaskStats::default(),
        }
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
        // Don't join on drop - the thread exits after its current run.
    }
}
