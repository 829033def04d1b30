use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::StoreResult;
use crate::event::{EventId, SerializedEvent};
use crate::transaction::TransactionProvider;

use super::entry::{Batch, BatchId, OutboxEntry, ProcessingResult};

/// Durable outbox storage.
///
/// Inserts join the caller's transaction; every other operation runs in a
/// transaction of its own. Mutual exclusion between concurrent fetchers is
/// the store's job, so callers hold no locks of their own.
pub trait OutboxStore: TransactionProvider {
    /// Insert a new, unclaimed entry inside `tx`. The id is assigned here.
    fn insert(&self, tx: &mut Self::Tx, event: &SerializedEvent) -> StoreResult<EventId>;

    /// Claim up to `max_size` unclaimed entries and return them as one batch.
    ///
    /// Claimed entries get a batch id and a delivery start time. Concurrent
    /// calls never return the same entry; contention surfaces as
    /// `StoreError::LockTimeout` rather than blocking. Returns an empty batch
    /// when nothing is pending.
    fn fetch_batch_for_sending(&self, max_size: usize) -> StoreResult<Batch>;

    /// Record `result` for one entry, claimed or not.
    fn mark_failed(&self, id: EventId, result: ProcessingResult) -> StoreResult<()>;

    /// Record `result` for an entry claimed by `batch_id`.
    ///
    /// Does nothing once the entry no longer belongs to that batch, as when
    /// a republish handed it to a newer fetch. Unknown ids are `NotFound`.
    fn mark_failed_in_batch(
        &self,
        batch_id: BatchId,
        id: EventId,
        result: ProcessingResult,
    ) -> StoreResult<()>;

    /// Record `OK` for every entry still claimed by the batch.
    fn sent_successfully(&self, batch: &Batch) -> StoreResult<()>;

    /// Mark entries in flight for longer than `timeout` as `DELIVERY_TIMED_OUT`.
    /// Returns how many entries changed.
    fn delivery_check(&self, timeout: Duration) -> StoreResult<usize>;

    /// Delete `OK` entries inserted more than `age` ago. Returns how many were deleted.
    fn cleanup(&self, age: Duration) -> StoreResult<usize>;

    fn get(&self, id: EventId) -> StoreResult<Option<OutboxEntry>>;

    /// Entries with the given result (`None` = not yet attempted), oldest first.
    fn entries_with_result(
        &self,
        result: Option<ProcessingResult>,
    ) -> StoreResult<Vec<OutboxEntry>>;

    /// Put a failed or timed-out entry back into the pending state.
    fn republish(&self, id: EventId) -> StoreResult<()>;
}

/// Persistent record of which handler already processed which event.
///
/// Markers are written in the handler's own transaction so the marker and
/// the handler's effects commit or roll back together.
pub trait IdempotencyStore: TransactionProvider {
    fn is_processed(
        &self,
        tx: &mut Self::Tx,
        event_id: EventId,
        handler_id: &str,
    ) -> StoreResult<bool>;

    /// Record the marker. A marker committed concurrently by another delivery
    /// surfaces as `StoreError::MarkerConflict`, here or at commit.
    fn record_processed(
        &self,
        tx: &mut Self::Tx,
        event_id: EventId,
        handler_id: &str,
    ) -> StoreResult<()>;
}

/// The instant `age` before `now`, clamped to the earliest representable time.
pub(crate) fn cutoff(now: DateTime<Utc>, age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
