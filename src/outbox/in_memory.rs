//! In-memory outbox store for tests and single-process deployments.

use std::collections::HashSet;
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::{StoreError, StoreResult};
use crate::event::{EventId, SerializedEvent};
use crate::transaction::{Hooks, TransactionContext, TransactionHook, TransactionProvider};

use super::entry::{Batch, BatchId, OutboxEntry, ProcessingResult};
use super::store::{cutoff, IdempotencyStore, OutboxStore};

#[derive(Default)]
struct MemoryState {
    /// Entries in commit order.
    entries: Vec<OutboxEntry>,
    markers: HashSet<(EventId, String)>,
}

impl MemoryState {
    fn entry_mut(&mut self, id: EventId) -> StoreResult<&mut OutboxEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(StoreError::NotFound(id))
    }
}

/// Outbox and idempotency markers held in process memory.
///
/// Cloning creates another handle to the same storage. All operations
/// serialize on one mutex held only for the in-memory update, so a fetch
/// never waits on a caller's open transaction: transactions stage their
/// writes and apply them in one step at commit.
///
/// Fetches always follow insertion time, which satisfies both strict and
/// relaxed batch order.
#[derive(Clone)]
pub struct InMemoryOutboxStore {
    state: Arc<Mutex<MemoryState>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
            clock,
        }
    }

    /// Number of stored entries, in any state.
    pub fn len(&self) -> StoreResult<usize> {
        Ok(self.lock("len")?.entries.len())
    }

    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Number of recorded idempotency markers.
    pub fn marker_count(&self) -> StoreResult<usize> {
        Ok(self.lock("marker count")?.markers.len())
    }

    fn lock(&self, operation: &'static str) -> StoreResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| StoreError::LockPoisoned(operation))
    }
}

impl TransactionProvider for InMemoryOutboxStore {
    type Tx = MemoryTransaction;

    fn begin(&self) -> StoreResult<MemoryTransaction> {
        Ok(MemoryTransaction {
            state: Arc::clone(&self.state),
            staged_entries: Vec::new(),
            staged_markers: Vec::new(),
            hooks: Hooks::default(),
            finished: false,
        })
    }
}

impl OutboxStore for InMemoryOutboxStore {
    fn insert(&self, tx: &mut MemoryTransaction, event: &SerializedEvent) -> StoreResult<EventId> {
        if !tx.is_active() {
            return Err(StoreError::NoTransactionActive);
        }
        let entry = OutboxEntry::new(event.clone(), self.clock.now());
        let id = entry.id;
        tx.staged_entries.push(entry);
        Ok(id)
    }

    fn fetch_batch_for_sending(&self, max_size: usize) -> StoreResult<Batch> {
        let now = self.clock.now();
        let mut state = self.lock("fetch batch")?;

        let mut candidates: Vec<usize> = state
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_pending())
            .map(|(index, _)| index)
            .collect();
        // Stable sort: equal timestamps keep commit order.
        candidates.sort_by_key(|&index| state.entries[index].inserted);
        candidates.truncate(max_size);

        if candidates.is_empty() {
            return Ok(Batch::empty());
        }

        let batch_id = BatchId::new();
        let mut claimed = Vec::with_capacity(candidates.len());
        for index in candidates {
            let entry = &mut state.entries[index];
            entry.claim(batch_id, now);
            claimed.push(entry.clone());
        }

        debug!(batch_id = %batch_id, count = claimed.len(), "Claimed batch");
        Ok(Batch::new(batch_id, claimed))
    }

    fn mark_failed(&self, id: EventId, result: ProcessingResult) -> StoreResult<()> {
        let mut state = self.lock("mark failed")?;
        let entry = state.entry_mut(id)?;
        if entry.accepts_result() {
            entry.processing_result = Some(result);
        }
        Ok(())
    }

    fn mark_failed_in_batch(
        &self,
        batch_id: BatchId,
        id: EventId,
        result: ProcessingResult,
    ) -> StoreResult<()> {
        let mut state = self.lock("mark failed")?;
        let entry = state.entry_mut(id)?;
        if entry.batch_id == Some(batch_id) && entry.accepts_result() {
            entry.processing_result = Some(result);
        }
        Ok(())
    }

    fn sent_successfully(&self, batch: &Batch) -> StoreResult<()> {
        let mut state = self.lock("sent successfully")?;
        for id in batch.event_ids() {
            if let Some(entry) = state.entries.iter_mut().find(|e| e.id == id) {
                if entry.batch_id == Some(batch.id) && entry.accepts_result() {
                    entry.processing_result = Some(ProcessingResult::Ok);
                }
            }
        }
        Ok(())
    }

    fn delivery_check(&self, timeout: Duration) -> StoreResult<usize> {
        let deadline = cutoff(self.clock.now(), timeout);
        let mut state = self.lock("delivery check")?;

        let mut timed_out = 0;
        for entry in state.entries.iter_mut() {
            let started_before_deadline = entry
                .delivery_started
                .map(|started| started < deadline)
                .unwrap_or(false);
            if entry.processing_result.is_none() && started_before_deadline {
                entry.processing_result = Some(ProcessingResult::DeliveryTimedOut);
                timed_out += 1;
            }
        }
        Ok(timed_out)
    }

    fn cleanup(&self, age: Duration) -> StoreResult<usize> {
        let deadline = cutoff(self.clock.now(), age);
        let mut state = self.lock("cleanup")?;

        let (expired, kept): (Vec<_>, Vec<_>) = mem::take(&mut state.entries)
            .into_iter()
            .partition(|e| {
                e.processing_result == Some(ProcessingResult::Ok) && e.inserted < deadline
            });
        state.entries = kept;

        let expired_ids: HashSet<EventId> = expired.iter().map(|e| e.id).collect();
        state
            .markers
            .retain(|(event_id, _)| !expired_ids.contains(event_id));

        Ok(expired.len())
    }

    fn get(&self, id: EventId) -> StoreResult<Option<OutboxEntry>> {
        let state = self.lock("get")?;
        Ok(state.entries.iter().find(|e| e.id == id).cloned())
    }

    fn entries_with_result(
        &self,
        result: Option<ProcessingResult>,
    ) -> StoreResult<Vec<OutboxEntry>> {
        let state = self.lock("entries with result")?;
        let mut entries: Vec<OutboxEntry> = state
            .entries
            .iter()
            .filter(|e| e.processing_result == result)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.inserted);
        Ok(entries)
    }

    fn republish(&self, id: EventId) -> StoreResult<()> {
        let mut state = self.lock("republish")?;
        let entry = state.entry_mut(id)?;
        if !entry.can_republish() {
            return Err(StoreError::InvalidState {
                event_id: id,
                reason: format!(
                    "only failed or timed-out entries can be republished, entry is {:?}",
                    entry.state()
                ),
            });
        }
        entry.reset_to_pending();
        Ok(())
    }
}

impl IdempotencyStore for InMemoryOutboxStore {
    fn is_processed(
        &self,
        tx: &mut MemoryTransaction,
        event_id: EventId,
        handler_id: &str,
    ) -> StoreResult<bool> {
        if tx.has_staged_marker(event_id, handler_id) {
            return Ok(true);
        }
        let state = self.lock("is processed")?;
        Ok(state.markers.contains(&(event_id, handler_id.to_string())))
    }

    fn record_processed(
        &self,
        tx: &mut MemoryTransaction,
        event_id: EventId,
        handler_id: &str,
    ) -> StoreResult<()> {
        if !tx.is_active() {
            return Err(StoreError::NoTransactionActive);
        }
        tx.staged_markers.push((event_id, handler_id.to_string()));
        Ok(())
    }
}

/// Transaction over an `InMemoryOutboxStore`.
///
/// Writes are staged and become visible together at commit. Marker writes
/// are checked again at commit so two deliveries racing on the same
/// (event, handler) pair cannot both succeed.
pub struct MemoryTransaction {
    state: Arc<Mutex<MemoryState>>,
    staged_entries: Vec<OutboxEntry>,
    staged_markers: Vec<(EventId, String)>,
    hooks: Hooks,
    finished: bool,
}

impl MemoryTransaction {
    fn has_staged_marker(&self, event_id: EventId, handler_id: &str) -> bool {
        self.staged_markers
            .iter()
            .any(|(id, handler)| *id == event_id && handler == handler_id)
    }

    fn apply(&mut self) -> StoreResult<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| StoreError::LockPoisoned("commit"))?;

        if let Some((event_id, handler_id)) = self
            .staged_markers
            .iter()
            .find(|marker| state.markers.contains(*marker))
        {
            return Err(StoreError::MarkerConflict {
                event_id: *event_id,
                handler_id: handler_id.clone(),
            });
        }

        state.entries.append(&mut self.staged_entries);
        state.markers.extend(self.staged_markers.drain(..));
        Ok(())
    }

    fn discard(&mut self) {
        self.staged_entries.clear();
        self.staged_markers.clear();
        self.finished = true;
        self.hooks.run_rollback();
    }
}

impl TransactionContext for MemoryTransaction {
    fn is_active(&self) -> bool {
        !self.finished
    }

    fn on_commit(&mut self, hook: TransactionHook) {
        self.hooks.push_commit(hook);
    }

    fn on_rollback(&mut self, hook: TransactionHook) {
        self.hooks.push_rollback(hook);
    }

    fn commit(mut self) -> StoreResult<()> {
        if let Err(err) = self.apply() {
            self.discard();
            return Err(err);
        }
        self.finished = true;
        self.hooks.run_commit();
        Ok(())
    }

    fn rollback(mut self) -> StoreResult<()> {
        self.discard();
        Ok(())
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.discard();
        }
    }
}
