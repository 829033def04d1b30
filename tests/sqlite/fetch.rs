use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use sourced_outbox::{
    OutboxStore, SqliteOptions, StoreError, TransactionContext, TransactionProvider,
};

use crate::support::TestDb;

// =============================================================================
// Claim exclusivity
// =============================================================================

#[test]
fn concurrent_fetches_never_share_an_entry() {
    let db = TestDb::with_lock_timeout(Duration::from_secs(2));
    let id = db.publish("order-1");

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = (0..2)
        .map(|_| {
            let store = Arc::clone(&db.store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                store.fetch_batch_for_sending(1).unwrap()
            })
        })
        .collect();

    let mut batches: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    batches.sort_by_key(|batch| batch.len());

    assert_eq!(batches[0].len(), 0);
    assert_eq!(batches[1].len(), 1);
    assert_eq!(batches[1].entries[0].id, id);

    let entry = db.store.get(id).unwrap().unwrap();
    assert_eq!(entry.batch_id, Some(batches[1].id));
    assert!(entry.is_in_flight());
}

#[test]
fn many_fetchers_claim_each_entry_exactly_once() {
    let db = TestDb::with_lock_timeout(Duration::from_secs(5));
    let mut published: Vec<_> = (0..20).map(|i| db.publish(&format!("order-{i}"))).collect();

    let barrier = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&db.store);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                let mut claimed = Vec::new();
                loop {
                    let batch = store.fetch_batch_for_sending(3).unwrap();
                    if batch.is_empty() {
                        break claimed;
                    }
                    claimed.extend(batch.event_ids());
                }
            })
        })
        .collect();

    let mut claimed: Vec<_> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();

    claimed.sort();
    published.sort();
    assert_eq!(claimed, published);
}

#[test]
fn fetch_gives_up_while_another_writer_holds_the_lock() {
    let db = TestDb::with_lock_timeout(Duration::from_millis(50));
    db.publish("order-1");

    let holder = db.store.begin().unwrap();
    let err = db.store.fetch_batch_for_sending(10).unwrap_err();
    assert!(matches!(err, StoreError::LockTimeout(_)));
    assert!(err.is_transient());
    holder.rollback().unwrap();

    // The entry was not touched and is claimable once the lock is free.
    assert_eq!(db.store.fetch_batch_for_sending(10).unwrap().len(), 1);
}

// =============================================================================
// Ordering
// =============================================================================

#[test]
fn strict_order_claims_oldest_first() {
    let db = TestDb::new();
    // Same clock reading for both; insertion order still decides.
    let first = db.publish("E1");
    let second = db.publish("E2");

    let batch = db.store.fetch_batch_for_sending(1).unwrap();
    assert_eq!(batch.event_ids(), vec![first]);
    let batch = db.store.fetch_batch_for_sending(1).unwrap();
    assert_eq!(batch.event_ids(), vec![second]);
    assert!(db.store.fetch_batch_for_sending(1).unwrap().is_empty());
}

#[test]
fn batch_entries_come_back_in_insertion_order() {
    let db = TestDb::with_options(SqliteOptions {
        strict_order: false,
        ..SqliteOptions::default()
    });
    let ids: Vec<_> = (0..5)
        .map(|i| {
            db.clock.advance(chrono::Duration::milliseconds(1));
            db.publish(&format!("order-{i}"))
        })
        .collect();

    let batch = db.store.fetch_batch_for_sending(10).unwrap();
    assert_eq!(batch.event_ids(), ids);
}

// =============================================================================
// Transactions
// =============================================================================

#[test]
fn application_write_and_event_share_the_transaction() {
    let db = TestDb::new();
    let payload = br#"{"order_id":"o-1"}"#.to_vec();
    let event = sourced_outbox::SerializedEvent::new("OrderPlaced", payload);

    let mut tx = db.store.begin().unwrap();
    tx.connection()
        .execute("INSERT INTO orders (id) VALUES ('o-1')", [])
        .unwrap();
    let rolled_back = db.store.insert(&mut tx, &event).unwrap();
    tx.rollback().unwrap();

    assert_eq!(db.count("SELECT COUNT(*) FROM orders"), 0);
    assert!(db.store.get(rolled_back).unwrap().is_none());

    let mut tx = db.store.begin().unwrap();
    tx.connection()
        .execute("INSERT INTO orders (id) VALUES ('o-1')", [])
        .unwrap();
    let committed = db.store.insert(&mut tx, &event).unwrap();
    tx.commit().unwrap();

    assert_eq!(db.count("SELECT COUNT(*) FROM orders"), 1);
    assert!(db.store.get(committed).unwrap().unwrap().is_pending());
}

#[test]
fn insert_after_commit_is_refused() {
    let db = TestDb::new();
    let mut tx = db.store.begin().unwrap();
    tx.connection().execute_batch("COMMIT").unwrap();

    let event = sourced_outbox::SerializedEvent::new("OrderPlaced", b"{}".to_vec());
    let err = db.store.insert(&mut tx, &event).unwrap_err();
    assert!(matches!(err, StoreError::NoTransactionActive));
}
