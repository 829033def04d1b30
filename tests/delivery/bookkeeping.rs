use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sourced_outbox::worker::poll_once;
use sourced_outbox::{
    Batch, BatchId, Dispatcher, EventId, InMemoryOutboxStore, MemoryTransaction, OutboxEntry,
    OutboxStore, ProcessingResult, SerializedEvent, StoreError, StoreResult, TransactionProvider,
};

use crate::support::{ADomainEvent, App};

/// Wraps the in-memory store and fails the first result write-backs.
struct FlakyStore {
    inner: InMemoryOutboxStore,
    failures_left: AtomicU32,
}

impl FlakyStore {
    fn new(failures: u32) -> Self {
        Self {
            inner: InMemoryOutboxStore::new(),
            failures_left: AtomicU32::new(failures),
        }
    }

    fn trip(&self) -> StoreResult<()> {
        let tripped = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            Err(StoreError::LockTimeout("recording results"))
        } else {
            Ok(())
        }
    }
}

impl TransactionProvider for FlakyStore {
    type Tx = MemoryTransaction;

    fn begin(&self) -> StoreResult<MemoryTransaction> {
        self.inner.begin()
    }
}

impl OutboxStore for FlakyStore {
    fn insert(&self, tx: &mut MemoryTransaction, event: &SerializedEvent) -> StoreResult<EventId> {
        self.inner.insert(tx, event)
    }

    fn fetch_batch_for_sending(&self, max_size: usize) -> StoreResult<Batch> {
        self.inner.fetch_batch_for_sending(max_size)
    }

    fn mark_failed(&self, id: EventId, result: ProcessingResult) -> StoreResult<()> {
        self.trip()?;
        self.inner.mark_failed(id, result)
    }

    fn mark_failed_in_batch(
        &self,
        batch_id: BatchId,
        id: EventId,
        result: ProcessingResult,
    ) -> StoreResult<()> {
        self.trip()?;
        self.inner.mark_failed_in_batch(batch_id, id, result)
    }

    fn sent_successfully(&self, batch: &Batch) -> StoreResult<()> {
        self.trip()?;
        self.inner.sent_successfully(batch)
    }

    fn delivery_check(&self, timeout: Duration) -> StoreResult<usize> {
        self.inner.delivery_check(timeout)
    }

    fn cleanup(&self, age: Duration) -> StoreResult<usize> {
        self.inner.cleanup(age)
    }

    fn get(&self, id: EventId) -> StoreResult<Option<OutboxEntry>> {
        self.inner.get(id)
    }

    fn entries_with_result(
        &self,
        result: Option<ProcessingResult>,
    ) -> StoreResult<Vec<OutboxEntry>> {
        self.inner.entries_with_result(result)
    }

    fn republish(&self, id: EventId) -> StoreResult<()> {
        self.inner.republish(id)
    }
}

fn publish_one(store: &FlakyStore, name: &str) -> EventId {
    let event = SerializedEvent::from_event(
        &sourced_outbox::JsonSerializer,
        &ADomainEvent::new(name),
    )
    .unwrap();
    store.in_new_transaction(|tx| store.insert(tx, &event)).unwrap()
}

#[test]
fn write_back_is_retried() {
    let app = App::new();
    let store = Arc::new(FlakyStore::new(2));
    let dispatcher =
        Dispatcher::new(Arc::clone(&store), app.registry()).with_bookkeeping_retries(3);

    let id = publish_one(&store, "Retried");
    let report = poll_once(&dispatcher, 10).unwrap().unwrap();

    assert!(report.unrecorded.is_empty());
    assert_eq!(
        store.get(id).unwrap().unwrap().processing_result,
        Some(ProcessingResult::Ok)
    );
}

#[test]
fn exhausted_retries_leave_the_entry_in_flight() {
    let app = App::new();
    let store = Arc::new(FlakyStore::new(u32::MAX));
    let dispatcher =
        Dispatcher::new(Arc::clone(&store), app.registry()).with_bookkeeping_retries(2);

    let id = publish_one(&store, "Lost");
    let report = poll_once(&dispatcher, 10).unwrap().unwrap();

    // Handlers ran; only the write-back is missing.
    assert_eq!(report.result_of(id), Some(ProcessingResult::Ok));
    assert_eq!(report.unrecorded, vec![id]);
    assert_eq!(app.receipts.handlers_for("Lost").len(), 5);

    let entry = store.get(id).unwrap().unwrap();
    assert!(entry.is_in_flight());
    assert_eq!(entry.processing_result, None);

    // The timeout sweep is what eventually resolves it.
    assert_eq!(store.delivery_check(Duration::ZERO).unwrap(), 1);
    assert_eq!(
        store.get(id).unwrap().unwrap().processing_result,
        Some(ProcessingResult::DeliveryTimedOut)
    );
}
