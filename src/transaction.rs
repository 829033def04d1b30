//! Explicit transaction boundaries.
//!
//! A transaction is an owned value handed to whoever must write inside it:
//! the outbox insert, a handler's own writes, an idempotency marker. Nothing
//! is bound to the current thread.
//!
//! ```ignore
//! let mut tx = store.begin()?;
//! orders.save(&mut tx, &order)?;
//! publisher.publish(&mut tx, &OrderPlaced { .. })?;
//! tx.commit()?; // the event exists only from here on
//! ```

use std::mem;

use tracing::warn;

use crate::error::StoreResult;

/// A callback run after a transaction finishes.
pub type TransactionHook = Box<dyn FnOnce() + Send + 'static>;

/// A unit of work that either commits or rolls back as a whole.
///
/// Dropping a context that was neither committed nor rolled back rolls it back.
pub trait TransactionContext: Send {
    /// Whether the transaction can still accept writes.
    fn is_active(&self) -> bool;

    /// Run `hook` after a successful commit.
    fn on_commit(&mut self, hook: TransactionHook);

    /// Run `hook` after a rollback, explicit or on drop.
    fn on_rollback(&mut self, hook: TransactionHook);

    fn commit(self) -> StoreResult<()>
    where
        Self: Sized;

    fn rollback(self) -> StoreResult<()>
    where
        Self: Sized;
}

/// Opens new transactions.
pub trait TransactionProvider: Send + Sync {
    type Tx: TransactionContext + 'static;

    fn begin(&self) -> StoreResult<Self::Tx>;

    /// Run `work` inside a new transaction: commit on `Ok`, roll back on `Err`.
    fn in_new_transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut Self::Tx) -> Result<T, E>,
        E: From<crate::error::StoreError>,
    {
        let mut tx = self.begin()?;
        match work(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    warn!(error = %rollback_err, "Rollback failed after unit of work error");
                }
                Err(err)
            }
        }
    }
}

/// Commit/rollback callbacks collected by a transaction.
#[derive(Default)]
pub(crate) struct Hooks {
    on_commit: Vec<TransactionHook>,
    on_rollback: Vec<TransactionHook>,
}

impl Hooks {
    pub(crate) fn push_commit(&mut self, hook: TransactionHook) {
        self.on_commit.push(hook);
    }

    pub(crate) fn push_rollback(&mut self, hook: TransactionHook) {
        self.on_rollback.push(hook);
    }

    pub(crate) fn run_commit(&mut self) {
        self.on_rollback.clear();
        for hook in mem::take(&mut self.on_commit) {
            hook();
        }
    }

    pub(crate) fn run_rollback(&mut self) {
        self.on_commit.clear();
        for hook in mem::take(&mut self.on_rollback) {
            hook();
        }
    }
}
