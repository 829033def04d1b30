use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sourced_outbox::dispatch::HandlerOutcome;
use sourced_outbox::worker::poll_once;
use sourced_outbox::{
    Dispatcher, HandlerError, HandlerRegistry, IdempotencyStore, OutboxStore, ProcessingResult,
    SqliteTransaction, StoreError, TransactionContext, TransactionProvider,
};

use crate::support::{record_effect, OrderPlaced, TestDb};

fn registry(fail_shipping: bool) -> HandlerRegistry<SqliteTransaction> {
    let mut registry = HandlerRegistry::new();
    registry
        .on::<OrderPlaced, _>("billing", |event, tx: &mut SqliteTransaction| {
            record_effect(tx.connection(), "billing", &event.order_id)?;
            Ok(())
        })
        .unwrap()
        .on::<OrderPlaced, _>("shipping", move |event, tx: &mut SqliteTransaction| {
            record_effect(tx.connection(), "shipping", &event.order_id)?;
            if fail_shipping {
                return Err(HandlerError::Rejected("no carrier available".into()));
            }
            Ok(())
        })
        .unwrap();
    registry
}

#[test]
fn handler_writes_commit_with_their_transaction() {
    let db = TestDb::new();
    let dispatcher = Dispatcher::new(Arc::clone(&db.store), registry(false));

    let id = db.publish("o-1");
    let report = poll_once(&dispatcher, 10).unwrap().unwrap();

    assert_eq!(report.result_of(id), Some(ProcessingResult::Ok));
    assert_eq!(db.effects_of("billing"), 1);
    assert_eq!(db.effects_of("shipping"), 1);
    assert_eq!(
        db.store.get(id).unwrap().unwrap().processing_result,
        Some(ProcessingResult::Ok)
    );
}

#[test]
fn contended_poll_skips_the_tick_and_delivers_on_the_next() {
    let db = TestDb::with_lock_timeout(Duration::from_millis(50));
    let dispatcher = Dispatcher::new(Arc::clone(&db.store), registry(false));
    let id = db.publish("o-1");

    let holder = db.store.begin().unwrap();
    assert!(poll_once(&dispatcher, 10).unwrap().is_none());
    holder.rollback().unwrap();

    let entry = db.store.get(id).unwrap().unwrap();
    assert!(entry.is_pending());
    assert_eq!(db.effects_of("billing"), 0);

    let report = poll_once(&dispatcher, 10).unwrap().unwrap();
    assert_eq!(report.result_of(id), Some(ProcessingResult::Ok));
    assert_eq!(db.effects_of("billing"), 1);
}

#[test]
fn failed_handler_writes_are_rolled_back() {
    let db = TestDb::new();
    let dispatcher = Dispatcher::new(Arc::clone(&db.store), registry(true));

    let id = db.publish("o-1");
    let report = poll_once(&dispatcher, 10).unwrap().unwrap();

    assert_eq!(report.result_of(id), Some(ProcessingResult::FailedPartially));
    assert_eq!(db.effects_of("billing"), 1);
    assert_eq!(db.effects_of("shipping"), 0);
}

#[test]
fn idempotent_redelivery_against_sqlite() {
    let db = TestDb::new();
    let id = db.publish("o-1");

    let failing = Dispatcher::new(Arc::clone(&db.store), registry(true)).with_idempotency();
    poll_once(&failing, 10).unwrap().unwrap();
    assert_eq!(db.count("SELECT COUNT(*) FROM idempotency_markers"), 1);

    db.store.republish(id).unwrap();
    let healed = Dispatcher::new(Arc::clone(&db.store), registry(false)).with_idempotency();
    let report = poll_once(&healed, 10).unwrap().unwrap();

    assert_eq!(report.result_of(id), Some(ProcessingResult::Ok));
    assert!(matches!(report.events[0].outcomes[0].1, HandlerOutcome::Skipped));
    assert!(matches!(report.events[0].outcomes[1].1, HandlerOutcome::Succeeded));
    assert_eq!(db.effects_of("billing"), 1);
    assert_eq!(db.effects_of("shipping"), 1);
}

#[test]
fn recorded_marker_conflicts_with_a_second_record() {
    let db = TestDb::new();
    let id = db.publish("o-1");

    let mut tx = db.store.begin().unwrap();
    assert!(!db.store.is_processed(&mut tx, id, "billing").unwrap());
    db.store.record_processed(&mut tx, id, "billing").unwrap();
    tx.commit().unwrap();

    let mut tx = db.store.begin().unwrap();
    assert!(db.store.is_processed(&mut tx, id, "billing").unwrap());
    let err = db.store.record_processed(&mut tx, id, "billing").unwrap_err();
    assert!(matches!(err, StoreError::MarkerConflict { .. }));

    // Markers are per handler.
    db.store.record_processed(&mut tx, id, "shipping").unwrap();
    tx.commit().unwrap();
    assert_eq!(db.count("SELECT COUNT(*) FROM idempotency_markers"), 2);
}

#[test]
fn dropped_transaction_runs_rollback_hooks() {
    let db = TestDb::new();
    let rolled_back = Arc::new(AtomicBool::new(false));

    let mut tx = db.store.begin().unwrap();
    let flag = Arc::clone(&rolled_back);
    tx.on_rollback(Box::new(move || flag.store(true, Ordering::SeqCst)));
    drop(tx);

    assert!(rolled_back.load(Ordering::SeqCst));
}
