use std::time::Duration;

use sourced_outbox::worker::{check_deliveries, clean_up};
use sourced_outbox::{OutboxStore, ProcessingResult};

use crate::support::TestDb;

const DAY: Duration = Duration::from_secs(24 * 60 * 60);

#[test]
fn stuck_batch_times_out() {
    let db = TestDb::new();
    let id = db.publish("order-1");
    let batch = db.store.fetch_batch_for_sending(10).unwrap();
    assert_eq!(batch.len(), 1);

    db.clock.advance(chrono::Duration::seconds(29));
    assert_eq!(check_deliveries(db.store.as_ref(), Duration::from_secs(30)).unwrap(), 0);

    db.clock.advance(chrono::Duration::seconds(2));
    assert_eq!(check_deliveries(db.store.as_ref(), Duration::from_secs(30)).unwrap(), 1);

    let entry = db.store.get(id).unwrap().unwrap();
    assert_eq!(entry.processing_result, Some(ProcessingResult::DeliveryTimedOut));
    assert_eq!(
        db.store
            .entries_with_result(Some(ProcessingResult::DeliveryTimedOut))
            .unwrap()
            .len(),
        1
    );
}

#[test]
fn late_result_overrides_timeout() {
    let db = TestDb::new();
    let id = db.publish("order-1");
    let batch = db.store.fetch_batch_for_sending(10).unwrap();

    db.clock.advance(chrono::Duration::minutes(10));
    db.store.delivery_check(Duration::from_secs(60)).unwrap();
    db.store.sent_successfully(&batch).unwrap();

    assert_eq!(
        db.store.get(id).unwrap().unwrap().processing_result,
        Some(ProcessingResult::Ok)
    );
}

#[test]
fn late_failure_from_a_republished_batch_is_ignored() {
    let db = TestDb::new();
    let id = db.publish("order-1");
    let stale = db.store.fetch_batch_for_sending(10).unwrap();

    db.clock.advance(chrono::Duration::minutes(10));
    db.store.delivery_check(Duration::from_secs(60)).unwrap();
    db.store.republish(id).unwrap();
    let current = db.store.fetch_batch_for_sending(10).unwrap();
    assert_eq!(current.event_ids(), vec![id]);

    db.store
        .mark_failed_in_batch(stale.id, id, ProcessingResult::Failed)
        .unwrap();
    assert_eq!(db.store.get(id).unwrap().unwrap().processing_result, None);

    db.store.sent_successfully(&stale).unwrap();
    assert_eq!(db.store.get(id).unwrap().unwrap().processing_result, None);

    db.store.sent_successfully(&current).unwrap();
    assert_eq!(
        db.store.get(id).unwrap().unwrap().processing_result,
        Some(ProcessingResult::Ok)
    );
}

#[test]
fn pending_entries_never_time_out() {
    let db = TestDb::new();
    db.publish("order-1");
    db.clock.advance(chrono::Duration::days(1));
    assert_eq!(db.store.delivery_check(Duration::from_secs(1)).unwrap(), 0);
}

#[test]
fn timed_out_entry_can_be_republished() {
    let db = TestDb::new();
    let id = db.publish("order-1");
    db.store.fetch_batch_for_sending(10).unwrap();
    db.clock.advance(chrono::Duration::minutes(10));
    db.store.delivery_check(Duration::from_secs(60)).unwrap();

    db.store.republish(id).unwrap();
    let entry = db.store.get(id).unwrap().unwrap();
    assert!(entry.is_pending());
    assert_eq!(entry.batch_id, None);
    assert_eq!(entry.delivery_started, None);

    assert_eq!(db.store.fetch_batch_for_sending(10).unwrap().event_ids(), vec![id]);
}

#[test]
fn cleanup_deletes_only_old_delivered_entries() {
    let db = TestDb::new();

    let old_ok = db.publish("old-ok");
    let old_failed = db.publish("old-failed");
    let batch = db.store.fetch_batch_for_sending(10).unwrap();
    db.store
        .sent_successfully(&batch.subset(|entry| entry.id == old_ok))
        .unwrap();
    db.store
        .mark_failed(old_failed, ProcessingResult::Failed)
        .unwrap();

    db.clock.advance(chrono::Duration::days(8));
    let recent_ok = db.publish("recent-ok");
    let batch = db.store.fetch_batch_for_sending(10).unwrap();
    db.store.sent_successfully(&batch).unwrap();

    assert_eq!(clean_up(db.store.as_ref(), 7 * DAY).unwrap(), 1);

    assert!(db.store.get(old_ok).unwrap().is_none());
    assert!(db.store.get(old_failed).unwrap().is_some());
    assert!(db.store.get(recent_ok).unwrap().is_some());
}
