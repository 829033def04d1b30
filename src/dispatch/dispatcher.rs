use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::config::{OutboxConfig, DEFAULT_BOOKKEEPING_RETRIES};
use crate::error::StoreResult;
use crate::event::{EventId, SerializedEvent};
use crate::outbox::{Batch, BatchId, IdempotencyStore, OutboxStore, ProcessingResult};

use super::idempotency::IdempotencyGuard;
use super::invoker::{HandlerInvoker, HandlerOutcome, TransactionalInvoker};
use super::registry::{Delivery, ExecutionContextDetector};

/// Result of delivering one event to its handlers.
#[derive(Debug)]
pub struct EventReport {
    pub event_id: EventId,
    pub event_type: String,
    pub result: ProcessingResult,
    /// (handler id, outcome) in invocation order.
    pub outcomes: Vec<(String, HandlerOutcome)>,
}

impl EventReport {
    /// Ids of the handlers that failed.
    pub fn failed_handlers(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| !outcome.is_success())
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

/// Result of delivering a batch.
#[derive(Debug)]
pub struct BatchReport {
    pub batch_id: BatchId,
    pub events: Vec<EventReport>,
    /// Entries whose result could not be written back; they stay in flight.
    pub unrecorded: Vec<EventId>,
}

impl BatchReport {
    pub fn result_of(&self, event_id: EventId) -> Option<ProcessingResult> {
        self.events
            .iter()
            .find(|report| report.event_id == event_id)
            .map(|report| report.result)
    }

    pub fn delivered(&self) -> usize {
        self.events.iter().filter(|r| r.result.is_ok()).count()
    }

    pub fn failed(&self) -> usize {
        self.events.len() - self.delivered()
    }

    pub fn is_fully_delivered(&self) -> bool {
        self.failed() == 0
    }
}

/// Combine handler outcomes into the stored result.
///
/// No handlers at all is `OK` unless the event is aggregate-scoped.
pub fn aggregate_result(
    outcomes: &[(String, HandlerOutcome)],
    aggregate_scoped: bool,
) -> ProcessingResult {
    if outcomes.is_empty() {
        return if aggregate_scoped {
            ProcessingResult::Failed
        } else {
            ProcessingResult::Ok
        };
    }

    let succeeded = outcomes.iter().filter(|(_, o)| o.is_success()).count();
    if succeeded == outcomes.len() {
        ProcessingResult::Ok
    } else if succeeded == 0 {
        ProcessingResult::Failed
    } else {
        ProcessingResult::FailedPartially
    }
}

/// Delivers events to their handlers and records the outcome in the store.
///
/// Handlers of one batch run one after another on the calling thread.
pub struct Dispatcher<S: OutboxStore> {
    store: Arc<S>,
    detector: Arc<dyn ExecutionContextDetector<S::Tx>>,
    invoker: Arc<dyn HandlerInvoker<S::Tx>>,
    bookkeeping_retries: u32,
}

impl<S: OutboxStore> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            detector: Arc::clone(&self.detector),
            invoker: Arc::clone(&self.invoker),
            bookkeeping_retries: self.bookkeeping_retries,
        }
    }
}

impl<S> Dispatcher<S>
where
    S: OutboxStore + 'static,
{
    /// A dispatcher running each handler in its own transaction.
    pub fn new<D>(store: Arc<S>, detector: D) -> Self
    where
        D: ExecutionContextDetector<S::Tx> + 'static,
    {
        Self {
            invoker: Arc::new(TransactionalInvoker::new(Arc::clone(&store))),
            store,
            detector: Arc::new(detector),
            bookkeeping_retries: DEFAULT_BOOKKEEPING_RETRIES,
        }
    }

    /// Guard handlers with idempotency markers kept in the same store.
    pub fn with_idempotency(mut self) -> Self
    where
        S: IdempotencyStore,
    {
        self.invoker = Arc::new(IdempotencyGuard::new(Arc::clone(&self.store)));
        self
    }

    pub fn with_invoker<I>(mut self, invoker: I) -> Self
    where
        I: HandlerInvoker<S::Tx> + 'static,
    {
        self.invoker = Arc::new(invoker);
        self
    }

    pub fn with_bookkeeping_retries(mut self, retries: u32) -> Self {
        self.bookkeeping_retries = retries;
        self
    }

    /// Apply the dispatcher settings from `config`.
    pub fn configured(self, config: &OutboxConfig) -> Self {
        self.with_bookkeeping_retries(config.bookkeeping_retries)
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Run every handler registered for the event and aggregate the outcome.
    ///
    /// Nothing is written to the outbox.
    pub fn dispatch_event(&self, event_id: EventId, event: &SerializedEvent) -> EventReport {
        let context = self.detector.detect(&event.event_type);
        let delivery = Delivery::new(event_id, event);

        let outcomes: Vec<(String, HandlerOutcome)> = context
            .handlers
            .iter()
            .map(|binding| {
                let outcome = self.invoker.invoke(&delivery, binding);
                if let HandlerOutcome::Failed(err) = &outcome {
                    warn!(
                        event_id = %event_id,
                        event_type = %event.event_type,
                        handler_id = %binding.handler_id,
                        error = %err,
                        "Handler failed"
                    );
                }
                (binding.handler_id.clone(), outcome)
            })
            .collect();

        let result = aggregate_result(&outcomes, context.aggregate_scoped);
        if outcomes.is_empty() {
            debug!(
                event_id = %event_id,
                event_type = %event.event_type,
                result = %result,
                "No handlers for event"
            );
        }

        EventReport {
            event_id,
            event_type: event.event_type.clone(),
            result,
            outcomes,
        }
    }

    /// Deliver every entry of a claimed batch and write the results back.
    ///
    /// When every event succeeded the batch is recorded with one
    /// `sent_successfully`; otherwise delivered entries are recorded together
    /// and each failed entry on its own. Results only land on entries the
    /// batch still holds, so a batch that lost its claim cannot overwrite a
    /// newer delivery.
    pub fn dispatch_batch(&self, batch: &Batch) -> BatchReport {
        let events: Vec<EventReport> = batch
            .entries
            .iter()
            .map(|entry| self.dispatch_event(entry.id, &entry.domain_event))
            .collect();

        let mut unrecorded = Vec::new();
        let all_ok = events.iter().all(|r| r.result.is_ok());

        let delivered = if all_ok {
            batch.clone()
        } else {
            batch.subset(|entry| {
                events
                    .iter()
                    .any(|r| r.event_id == entry.id && r.result.is_ok())
            })
        };
        if !delivered.is_empty()
            && !self.record("sent successfully", || self.store.sent_successfully(&delivered))
        {
            unrecorded.extend(delivered.event_ids());
        }

        for report in events.iter().filter(|r| !r.result.is_ok()) {
            let recorded = self.record("mark failed", || {
                self.store
                    .mark_failed_in_batch(batch.id, report.event_id, report.result)
            });
            if !recorded {
                unrecorded.push(report.event_id);
            }
        }

        let report = BatchReport {
            batch_id: batch.id,
            events,
            unrecorded,
        };

        if report.is_fully_delivered() {
            info!(batch_id = %batch.id, count = batch.len(), "Batch delivered");
        } else {
            warn!(
                batch_id = %batch.id,
                delivered = report.delivered(),
                failed = report.failed(),
                "Batch delivered with failures"
            );
        }
        report
    }

    /// Run a bookkeeping write, retrying up to the configured count.
    fn record<F>(&self, operation: &'static str, mut write: F) -> bool
    where
        F: FnMut() -> StoreResult<()>,
    {
        let attempts = self.bookkeeping_retries.max(1);
        for attempt in 1..=attempts {
            match write() {
                Ok(()) => return true,
                Err(err) if attempt < attempts => {
                    warn!(operation, attempt, error = %err, "Bookkeeping write failed, retrying");
                }
                Err(err) => {
                    error!(
                        operation,
                        attempts,
                        error = %err,
                        "Bookkeeping write failed, entries stay in flight until they time out"
                    );
                }
            }
        }
        false
    }
}
