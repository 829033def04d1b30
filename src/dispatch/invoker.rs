use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{panic_message, HandlerError, StoreError};
use crate::transaction::{TransactionContext, TransactionProvider};

use super::registry::{Delivery, HandlerBinding};

/// What happened when one handler was given one event.
#[derive(Debug)]
pub enum HandlerOutcome {
    /// The handler ran and its transaction committed.
    Succeeded,
    /// The handler had already processed this event; it was not run again.
    Skipped,
    /// The handler failed; its transaction was rolled back.
    Failed(HandlerError),
}

impl HandlerOutcome {
    /// Skipped counts as success: the effect already exists.
    pub fn is_success(&self) -> bool {
        !matches!(self, HandlerOutcome::Failed(_))
    }

    pub fn error(&self) -> Option<&HandlerError> {
        match self {
            HandlerOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }
}

/// Runs one handler binding for one event.
///
/// Implementations never propagate a handler failure; it comes back as
/// `HandlerOutcome::Failed` so sibling handlers still run.
pub trait HandlerInvoker<Tx>: Send + Sync {
    fn invoke(&self, delivery: &Delivery<'_>, binding: &HandlerBinding<Tx>) -> HandlerOutcome;
}

/// Runs every handler in a transaction of its own.
///
/// A failing or panicking handler rolls back only its own writes.
pub struct TransactionalInvoker<S> {
    store: Arc<S>,
}

impl<S> TransactionalInvoker<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S> HandlerInvoker<S::Tx> for TransactionalInvoker<S>
where
    S: TransactionProvider,
{
    fn invoke(&self, delivery: &Delivery<'_>, binding: &HandlerBinding<S::Tx>) -> HandlerOutcome {
        let mut tx = match self.store.begin() {
            Ok(tx) => tx,
            Err(err) => return HandlerOutcome::Failed(err.into()),
        };

        match run_guarded(delivery, binding, &mut tx) {
            Ok(()) => commit(tx),
            Err(err) => {
                rollback(tx);
                HandlerOutcome::Failed(err)
            }
        }
    }
}

/// Call the handler, turning a panic into `HandlerError::Panicked`.
pub(crate) fn run_guarded<Tx>(
    delivery: &Delivery<'_>,
    binding: &HandlerBinding<Tx>,
    tx: &mut Tx,
) -> Result<(), HandlerError> {
    panic::catch_unwind(AssertUnwindSafe(|| binding.call(delivery, tx)))
        .unwrap_or_else(|payload| Err(HandlerError::Panicked(panic_message(payload.as_ref()))))
}

pub(crate) fn commit<Tx: TransactionContext>(tx: Tx) -> HandlerOutcome {
    match tx.commit() {
        Ok(()) => HandlerOutcome::Succeeded,
        Err(err) => HandlerOutcome::Failed(err.into()),
    }
}

pub(crate) fn rollback<Tx: TransactionContext>(tx: Tx) {
    if let Err(err) = tx.rollback() {
        warn!(error = %err, "Handler transaction rollback failed");
    }
}

/// Outcome for a marker written concurrently by another delivery.
pub(crate) fn already_processed(delivery: &Delivery<'_>, handler_id: &str) -> HandlerOutcome {
    debug!(
        event_id = %delivery.event_id,
        handler_id,
        "Handler already processed event, skipping"
    );
    HandlerOutcome::Skipped
}

pub(crate) fn is_marker_conflict(err: &StoreError) -> bool {
    matches!(err, StoreError::MarkerConflict { .. })
}
