//! Schema for the SQLite outbox.
//!
//! Migrations run in order and are tracked in the `migrations` table.

use rusqlite::Connection;
use tracing::{debug, info};

use crate::error::StoreResult;

/// Current schema version.
pub const CURRENT_VERSION: i32 = 2;

/// Run all pending migrations.
pub fn run_migrations(conn: &Connection) -> StoreResult<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        [],
    )?;

    let current_version: i32 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM migrations",
        [],
        |row| row.get(0),
    )?;

    if current_version >= CURRENT_VERSION {
        debug!(current_version, "Outbox schema up to date");
        return Ok(());
    }

    info!(current_version, target_version = CURRENT_VERSION, "Running outbox migrations");

    if current_version < 1 {
        migrate_v1_outbox_entries(conn)?;
    }
    if current_version < 2 {
        migrate_v2_idempotency_markers(conn)?;
    }

    info!("Outbox migrations complete");
    Ok(())
}

fn record_migration(conn: &Connection, version: i32, name: &str) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO migrations (version, name) VALUES (?1, ?2)",
        rusqlite::params![version, name],
    )?;
    debug!(version, name, "Migration applied");
    Ok(())
}

/// V1: the outbox table.
///
/// Timestamps are fixed-width RFC 3339 UTC strings, so text order is time order.
fn migrate_v1_outbox_entries(conn: &Connection) -> StoreResult<()> {
    info!("Applying migration v1: outbox entries");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS outbox_entries (
            id TEXT PRIMARY KEY,
            event_type TEXT NOT NULL,
            domain_event TEXT NOT NULL,
            inserted TEXT NOT NULL,
            batch_id TEXT,
            processing_result TEXT,
            delivery_started TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_outbox_entries_unclaimed
            ON outbox_entries(batch_id, inserted);
        CREATE INDEX IF NOT EXISTS idx_outbox_entries_result
            ON outbox_entries(processing_result, inserted);
        CREATE INDEX IF NOT EXISTS idx_outbox_entries_in_flight
            ON outbox_entries(processing_result, delivery_started);
        ",
    )?;

    record_migration(conn, 1, "outbox_entries")
}

/// V2: idempotency markers, one row per (event, handler) pair.
fn migrate_v2_idempotency_markers(conn: &Connection) -> StoreResult<()> {
    info!("Applying migration v2: idempotency markers");

    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS idempotency_markers (
            event_id TEXT NOT NULL,
            handler_id TEXT NOT NULL,
            processed_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (event_id, handler_id)
        );
        ",
    )?;

    record_migration(conn, 2, "idempotency_markers")
}
