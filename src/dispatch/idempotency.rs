use std::sync::Arc;

use crate::error::HandlerError;
use crate::outbox::IdempotencyStore;

use super::invoker::{
    already_processed, commit, is_marker_conflict, rollback, run_guarded, HandlerInvoker,
    HandlerOutcome,
};
use super::registry::{Delivery, HandlerBinding};

/// Runs each handler at most once per event.
///
/// Inside the handler's own transaction: look up the (event, handler)
/// marker, skip if present, otherwise run the handler and record the marker.
/// The marker and the handler's writes commit together. If a concurrent
/// delivery records the same marker first, this delivery rolls back and
/// reports `Skipped`.
pub struct IdempotencyGuard<S> {
    store: Arc<S>,
}

impl<S> IdempotencyGuard<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

impl<S> HandlerInvoker<S::Tx> for IdempotencyGuard<S>
where
    S: IdempotencyStore,
{
    fn invoke(&self, delivery: &Delivery<'_>, binding: &HandlerBinding<S::Tx>) -> HandlerOutcome {
        let handler_id = binding.handler_id.as_str();
        let mut tx = match self.store.begin() {
            Ok(tx) => tx,
            Err(err) => return HandlerOutcome::Failed(err.into()),
        };

        match self.store.is_processed(&mut tx, delivery.event_id, handler_id) {
            Ok(true) => {
                rollback(tx);
                return already_processed(delivery, handler_id);
            }
            Ok(false) => {}
            Err(err) => {
                rollback(tx);
                return HandlerOutcome::Failed(err.into());
            }
        }

        if let Err(err) = run_guarded(delivery, binding, &mut tx) {
            rollback(tx);
            return HandlerOutcome::Failed(err);
        }

        if let Err(err) = self
            .store
            .record_processed(&mut tx, delivery.event_id, handler_id)
        {
            rollback(tx);
            if is_marker_conflict(&err) {
                return already_processed(delivery, handler_id);
            }
            return HandlerOutcome::Failed(err.into());
        }

        match commit(tx) {
            HandlerOutcome::Failed(HandlerError::Store(err)) if is_marker_conflict(&err) => {
                already_processed(delivery, handler_id)
            }
            outcome => outcome,
        }
    }
}
