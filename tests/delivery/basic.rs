use std::sync::Arc;

use sourced_outbox::worker::poll_once;
use sourced_outbox::{
    Dispatcher, OutboxStore, ProcessingResult, TransactionContext, TransactionProvider,
};

use crate::support::{ADomainEvent, AggregateClosed, App, UnreceivedDomainEvent, LAYERS};

// =============================================================================
// Commit makes the event visible, rollback makes it disappear
// =============================================================================

#[test]
fn committed_event_reaches_every_handler_once() {
    let app = App::new();
    let publisher = app.publisher();
    let dispatcher = Dispatcher::new(Arc::clone(&app.store), app.registry());

    let mut tx = app.store.begin().unwrap();
    let id = publisher
        .publish(&mut tx, &ADomainEvent::new("TestCommit"))
        .unwrap();
    tx.commit().unwrap();

    let report = poll_once(&dispatcher, 10).unwrap().expect("one batch");
    assert_eq!(report.events.len(), 1);
    assert_eq!(report.result_of(id), Some(ProcessingResult::Ok));

    let entry = app.store.get(id).unwrap().unwrap();
    assert_eq!(entry.processing_result, Some(ProcessingResult::Ok));
    assert!(entry.batch_id.is_some());
    assert!(entry.delivery_started.is_some());

    for layer in LAYERS {
        assert_eq!(app.receipts.count(layer, "TestCommit"), 1, "{layer}");
    }

    // Nothing left to deliver.
    assert!(poll_once(&dispatcher, 10).unwrap().is_none());
}

#[test]
fn rolled_back_event_is_never_delivered() {
    let app = App::new();
    let publisher = app.publisher();
    let dispatcher = Dispatcher::new(Arc::clone(&app.store), app.registry());

    let mut tx = app.store.begin().unwrap();
    let id = publisher
        .publish(&mut tx, &ADomainEvent::new("TestRollback"))
        .unwrap();
    tx.rollback().unwrap();

    assert!(app.store.get(id).unwrap().is_none());
    assert!(app.store.is_empty().unwrap());
    assert!(poll_once(&dispatcher, 10).unwrap().is_none());
    assert!(app.receipts.handlers_for("TestRollback").is_empty());
}

#[test]
fn dropped_transaction_behaves_like_rollback() {
    let app = App::new();
    let publisher = app.publisher();

    {
        let mut tx = app.store.begin().unwrap();
        publisher
            .publish(&mut tx, &ADomainEvent::new("TestDropped"))
            .unwrap();
    }

    assert!(app.store.is_empty().unwrap());
}

#[test]
fn events_of_one_transaction_are_claimed_in_order() {
    let app = App::new();
    let publisher = app.publisher();

    let mut tx = app.store.begin().unwrap();
    let first = publisher.publish(&mut tx, &ADomainEvent::new("E1")).unwrap();
    let second = publisher.publish(&mut tx, &ADomainEvent::new("E2")).unwrap();
    tx.commit().unwrap();

    let batch = app.store.fetch_batch_for_sending(10).unwrap();
    assert_eq!(batch.event_ids(), vec![first, second]);
}

// =============================================================================
// Events nobody handles
// =============================================================================

#[test]
fn unreceived_event_is_delivered_ok() {
    let app = App::new();
    let publisher = app.publisher();
    let dispatcher = Dispatcher::new(Arc::clone(&app.store), app.registry());

    let id = app
        .store
        .in_new_transaction(|tx| {
            publisher.publish(
                tx,
                &UnreceivedDomainEvent {
                    name: "nobody listens".into(),
                },
            )
        })
        .unwrap();

    let report = poll_once(&dispatcher, 10).unwrap().unwrap();
    assert_eq!(report.result_of(id), Some(ProcessingResult::Ok));
    assert!(report.events[0].outcomes.is_empty());
    assert!(app.receipts.is_empty());
}

#[test]
fn aggregate_event_without_handler_fails() {
    let app = App::new();
    let publisher = app.publisher();
    let dispatcher = Dispatcher::new(Arc::clone(&app.store), app.registry());

    let id = app
        .store
        .in_new_transaction(|tx| {
            publisher.publish(
                tx,
                &AggregateClosed {
                    aggregate_id: "order-1".into(),
                },
            )
        })
        .unwrap();

    let report = poll_once(&dispatcher, 10).unwrap().unwrap();
    assert_eq!(report.result_of(id), Some(ProcessingResult::Failed));
    assert_eq!(
        app.store.get(id).unwrap().unwrap().processing_result,
        Some(ProcessingResult::Failed)
    );
}
