#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sourced_outbox::{
    DomainEvent, EventId, ManualClock, OutboxStore, SerializedEvent, SqliteOptions,
    SqliteOutboxStore, StoreError, StoreResult, TransactionProvider,
};
use tempfile::TempDir;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderPlaced {
    pub order_id: String,
}

impl DomainEvent for OrderPlaced {
    const EVENT_TYPE: &'static str = "OrderPlaced";
}

/// A store in a fresh temp directory, on a manual clock.
pub struct TestDb {
    pub dir: TempDir,
    pub clock: ManualClock,
    pub store: Arc<SqliteOutboxStore>,
}

impl TestDb {
    pub fn new() -> Self {
        Self::with_options(SqliteOptions::default())
    }

    pub fn with_options(options: SqliteOptions) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let clock = ManualClock::default();
        let store = SqliteOutboxStore::open_with_clock(
            &dir.path().join("outbox.db"),
            options,
            Arc::new(clock.clone()),
        )
        .unwrap();
        store
            .connection()
            .unwrap()
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS orders (id TEXT PRIMARY KEY);
                 CREATE TABLE IF NOT EXISTS order_effects (
                     handler_id TEXT NOT NULL,
                     order_id TEXT NOT NULL
                 );",
            )
            .unwrap();

        Self {
            dir,
            clock,
            store: Arc::new(store),
        }
    }

    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self::with_options(SqliteOptions {
            lock_timeout,
            ..SqliteOptions::default()
        })
    }

    /// Insert `OrderPlaced` in its own committed transaction.
    pub fn publish(&self, order_id: &str) -> EventId {
        let event = SerializedEvent::from_event(
            &sourced_outbox::JsonSerializer,
            &OrderPlaced {
                order_id: order_id.to_string(),
            },
        )
        .unwrap();
        self.store
            .in_new_transaction(|tx| self.store.insert(tx, &event))
            .unwrap()
    }

    pub fn count(&self, sql: &str) -> i64 {
        self.store
            .connection()
            .unwrap()
            .query_row(sql, [], |row| row.get(0))
            .unwrap()
    }

    pub fn effects_of(&self, handler_id: &str) -> i64 {
        self.store
            .connection()
            .unwrap()
            .query_row(
                "SELECT COUNT(*) FROM order_effects WHERE handler_id = ?1",
                [handler_id],
                |row| row.get(0),
            )
            .unwrap()
    }
}

/// Application write made through the transaction's connection.
pub fn record_effect(
    conn: &rusqlite::Connection,
    handler_id: &str,
    order_id: &str,
) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO order_effects (handler_id, order_id) VALUES (?1, ?2)",
        [handler_id, order_id],
    )
    .map_err(StoreError::from)?;
    Ok(())
}
