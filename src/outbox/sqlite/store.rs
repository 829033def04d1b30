use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, Connection, ErrorCode, Row};
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::OutboxConfig;
use crate::error::{StoreError, StoreResult};
use crate::event::{EventId, SerializedEvent};
use crate::outbox::entry::{Batch, BatchId, OutboxEntry, ProcessingResult};
use crate::outbox::store::{cutoff, IdempotencyStore, OutboxStore};
use crate::transaction::{TransactionContext, TransactionProvider};

use super::migrations;
use super::transaction::SqliteTransaction;

const ENTRY_COLUMNS: &str =
    "id, domain_event, inserted, batch_id, processing_result, delivery_started";

/// Options for opening a SQLite outbox.
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    /// Maximum connections in the pool.
    pub pool_size: u32,
    /// Claim the oldest unclaimed entries first.
    pub strict_order: bool,
    /// How long a batch fetch waits for the write lock.
    pub lock_timeout: Duration,
    /// How long every other write waits for the write lock.
    pub busy_timeout: Duration,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            pool_size: 8,
            strict_order: true,
            lock_timeout: Duration::from_millis(crate::config::DEFAULT_LOCK_TIMEOUT_MS),
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl SqliteOptions {
    pub fn from_config(config: &OutboxConfig) -> Self {
        Self {
            strict_order: config.strict_batch_order,
            lock_timeout: config.lock_timeout(),
            ..Self::default()
        }
    }
}

/// Outbox and idempotency markers in a SQLite database file.
///
/// Uses WAL mode so readers never block the writer. SQLite allows one writer
/// at a time; a batch fetch waits at most `lock_timeout` for it and otherwise
/// reports `StoreError::LockTimeout`.
#[derive(Clone)]
pub struct SqliteOutboxStore {
    pool: Pool<SqliteConnectionManager>,
    clock: Arc<dyn Clock>,
    options: SqliteOptions,
    path: String,
}

impl SqliteOutboxStore {
    /// Open (or create) the database at `path` and run pending migrations.
    pub fn open(path: &Path, options: SqliteOptions) -> StoreResult<Self> {
        Self::open_with_clock(path, options, Arc::new(SystemClock))
    }

    pub fn from_config(path: &Path, config: &OutboxConfig) -> StoreResult<Self> {
        Self::open(path, SqliteOptions::from_config(config))
    }

    pub fn open_with_clock(
        path: &Path,
        options: SqliteOptions,
        clock: Arc<dyn Clock>,
    ) -> StoreResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Pool(format!("cannot create {}: {}", parent.display(), e))
            })?;
        }

        let path_str = path.to_string_lossy().to_string();
        let busy_timeout = options.busy_timeout;

        let manager = SqliteConnectionManager::file(path).with_init(move |conn| {
            conn.execute_batch(
                "
                PRAGMA journal_mode = WAL;
                PRAGMA synchronous = NORMAL;
                PRAGMA foreign_keys = ON;
                PRAGMA temp_store = MEMORY;
            ",
            )?;
            conn.busy_timeout(busy_timeout)?;
            Ok(())
        });

        let pool = Pool::builder()
            .max_size(options.pool_size)
            .build(manager)
            .map_err(|e| StoreError::Pool(e.to_string()))?;

        info!(
            path = %path_str,
            pool_size = options.pool_size,
            strict_order = options.strict_order,
            "Outbox database opened"
        );

        {
            let conn = pool.get().map_err(|e| StoreError::Pool(e.to_string()))?;
            migrations::run_migrations(&conn)?;
        }

        Ok(Self {
            pool,
            clock,
            options,
            path: path_str,
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// A pooled connection outside any transaction, for application schema setup.
    pub fn connection(&self) -> StoreResult<PooledConnection<SqliteConnectionManager>> {
        self.pool.get().map_err(|e| StoreError::Pool(e.to_string()))
    }

    /// Run `work` in a store-owned transaction.
    fn write<T, F>(&self, work: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T>,
    {
        self.in_new_transaction(|tx| work(tx.connection()))
    }

    fn claim(&self, conn: &Connection, max_size: usize) -> StoreResult<Batch> {
        let batch_id = BatchId::new();
        let now = format_timestamp(self.clock.now());
        let limit = i64::try_from(max_size).unwrap_or(i64::MAX);

        let order = if self.options.strict_order {
            "ORDER BY inserted, rowid"
        } else {
            ""
        };
        let claim_sql = format!(
            "UPDATE outbox_entries SET batch_id = ?1, delivery_started = ?2
             WHERE id IN (
                 SELECT id FROM outbox_entries
                 WHERE batch_id IS NULL AND processing_result IS NULL
                 {order}
                 LIMIT ?3
             )"
        );

        conn.execute_batch("BEGIN IMMEDIATE")?;
        let claimed = conn
            .execute(&claim_sql, params![batch_id.to_string(), now, limit])
            .map_err(StoreError::from)
            .and_then(|claimed| {
                if claimed == 0 {
                    return Ok(Vec::new());
                }
                select_entries(
                    conn,
                    &format!(
                        "SELECT {ENTRY_COLUMNS} FROM outbox_entries
                         WHERE batch_id = ?1 ORDER BY inserted, rowid"
                    ),
                    params![batch_id.to_string()],
                )
            });

        let committed = claimed.and_then(|entries| {
            conn.execute_batch("COMMIT")?;
            Ok(entries)
        });
        match committed {
            Ok(entries) => Ok(Batch::new(batch_id, entries)),
            Err(err) => {
                if !conn.is_autocommit() {
                    if let Err(rollback_err) = conn.execute_batch("ROLLBACK") {
                        warn!(error = %rollback_err, "Rollback of batch claim failed");
                    }
                }
                Err(err)
            }
        }
    }

    fn entry_exists(conn: &Connection, id: EventId) -> StoreResult<bool> {
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM outbox_entries WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }
}

impl TransactionProvider for SqliteOutboxStore {
    type Tx = SqliteTransaction;

    fn begin(&self) -> StoreResult<SqliteTransaction> {
        SqliteTransaction::begin(self.connection()?)
    }
}

impl OutboxStore for SqliteOutboxStore {
    fn insert(&self, tx: &mut SqliteTransaction, event: &SerializedEvent) -> StoreResult<EventId> {
        if !tx.is_active() {
            return Err(StoreError::NoTransactionActive);
        }
        let id = EventId::new();
        tx.connection().execute(
            "INSERT INTO outbox_entries (id, event_type, domain_event, inserted)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                id.to_string(),
                event.event_type,
                event.to_column()?,
                format_timestamp(self.clock.now()),
            ],
        )?;
        Ok(id)
    }

    fn fetch_batch_for_sending(&self, max_size: usize) -> StoreResult<Batch> {
        let conn = self.connection()?;
        conn.busy_timeout(self.options.lock_timeout)?;
        let result = self.claim(&conn, max_size);
        conn.busy_timeout(self.options.busy_timeout)?;

        let batch = result?;
        if !batch.is_empty() {
            debug!(batch_id = %batch.id, count = batch.len(), "Claimed batch");
        }
        Ok(batch)
    }

    fn mark_failed(&self, id: EventId, result: ProcessingResult) -> StoreResult<()> {
        self.write(|conn| {
            let updated = conn.execute(
                "UPDATE outbox_entries SET processing_result = ?2
                 WHERE id = ?1
                   AND (processing_result IS NULL OR processing_result = 'DELIVERY_TIMED_OUT')",
                params![id.to_string(), result.as_str()],
            )?;
            if updated == 0 && !Self::entry_exists(conn, id)? {
                return Err(StoreError::NotFound(id));
            }
            Ok(())
        })
    }

    fn mark_failed_in_batch(
        &self,
        batch_id: BatchId,
        id: EventId,
        result: ProcessingResult,
    ) -> StoreResult<()> {
        self.write(|conn| {
            let updated = conn.execute(
                "UPDATE outbox_entries SET processing_result = ?3
                 WHERE id = ?1 AND batch_id = ?2
                   AND (processing_result IS NULL OR processing_result = 'DELIVERY_TIMED_OUT')",
                params![id.to_string(), batch_id.to_string(), result.as_str()],
            )?;
            if updated == 0 && !Self::entry_exists(conn, id)? {
                return Err(StoreError::NotFound(id));
            }
            Ok(())
        })
    }

    fn sent_successfully(&self, batch: &Batch) -> StoreResult<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let batch_id = batch.id.to_string();
        self.write(|conn| {
            let mut stmt = conn.prepare_cached(
                "UPDATE outbox_entries SET processing_result = 'OK'
                 WHERE id = ?1 AND batch_id = ?2
                   AND (processing_result IS NULL OR processing_result = 'DELIVERY_TIMED_OUT')",
            )?;
            for id in batch.event_ids() {
                stmt.execute(params![id.to_string(), batch_id])?;
            }
            Ok(())
        })
    }

    fn delivery_check(&self, timeout: Duration) -> StoreResult<usize> {
        let deadline = format_timestamp(cutoff(self.clock.now(), timeout));
        self.write(|conn| {
            Ok(conn.execute(
                "UPDATE outbox_entries SET processing_result = 'DELIVERY_TIMED_OUT'
                 WHERE processing_result IS NULL
                   AND delivery_started IS NOT NULL
                   AND delivery_started < ?1",
                params![deadline],
            )?)
        })
    }

    fn cleanup(&self, age: Duration) -> StoreResult<usize> {
        let deadline = format_timestamp(cutoff(self.clock.now(), age));
        self.write(|conn| {
            conn.execute(
                "DELETE FROM idempotency_markers WHERE event_id IN (
                     SELECT id FROM outbox_entries
                     WHERE processing_result = 'OK' AND inserted < ?1
                 )",
                params![deadline],
            )?;
            Ok(conn.execute(
                "DELETE FROM outbox_entries WHERE processing_result = 'OK' AND inserted < ?1",
                params![deadline],
            )?)
        })
    }

    fn get(&self, id: EventId) -> StoreResult<Option<OutboxEntry>> {
        let conn = self.connection()?;
        let mut entries = select_entries(
            &conn,
            &format!("SELECT {ENTRY_COLUMNS} FROM outbox_entries WHERE id = ?1"),
            params![id.to_string()],
        )?;
        Ok(entries.pop())
    }

    fn entries_with_result(
        &self,
        result: Option<ProcessingResult>,
    ) -> StoreResult<Vec<OutboxEntry>> {
        let conn = self.connection()?;
        match result {
            Some(result) => select_entries(
                &conn,
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM outbox_entries
                     WHERE processing_result = ?1 ORDER BY inserted, rowid"
                ),
                params![result.as_str()],
            ),
            None => select_entries(
                &conn,
                &format!(
                    "SELECT {ENTRY_COLUMNS} FROM outbox_entries
                     WHERE processing_result IS NULL ORDER BY inserted, rowid"
                ),
                [],
            ),
        }
    }

    fn republish(&self, id: EventId) -> StoreResult<()> {
        self.write(|conn| {
            let mut entries = select_entries(
                conn,
                &format!("SELECT {ENTRY_COLUMNS} FROM outbox_entries WHERE id = ?1"),
                params![id.to_string()],
            )?;
            let entry = entries.pop().ok_or(StoreError::NotFound(id))?;
            if !entry.can_republish() {
                return Err(StoreError::InvalidState {
                    event_id: id,
                    reason: format!(
                        "only failed or timed-out entries can be republished, entry is {:?}",
                        entry.state()
                    ),
                });
            }
            conn.execute(
                "UPDATE outbox_entries
                 SET batch_id = NULL, delivery_started = NULL, processing_result = NULL
                 WHERE id = ?1",
                params![id.to_string()],
            )?;
            Ok(())
        })
    }
}

impl IdempotencyStore for SqliteOutboxStore {
    fn is_processed(
        &self,
        tx: &mut SqliteTransaction,
        event_id: EventId,
        handler_id: &str,
    ) -> StoreResult<bool> {
        let count: i64 = tx.connection().query_row(
            "SELECT COUNT(*) FROM idempotency_markers WHERE event_id = ?1 AND handler_id = ?2",
            params![event_id.to_string(), handler_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn record_processed(
        &self,
        tx: &mut SqliteTransaction,
        event_id: EventId,
        handler_id: &str,
    ) -> StoreResult<()> {
        if !tx.is_active() {
            return Err(StoreError::NoTransactionActive);
        }
        let inserted = tx.connection().execute(
            "INSERT INTO idempotency_markers (event_id, handler_id, processed_at)
             VALUES (?1, ?2, ?3)",
            params![
                event_id.to_string(),
                handler_id,
                format_timestamp(self.clock.now()),
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(StoreError::MarkerConflict {
                    event_id,
                    handler_id: handler_id.to_string(),
                })
            }
            Err(err) => Err(err.into()),
        }
    }
}

fn format_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidData(format!("bad timestamp {:?}: {}", raw, e)))
}

/// Column values as stored, before parsing.
struct RawEntry {
    id: String,
    domain_event: String,
    inserted: String,
    batch_id: Option<String>,
    processing_result: Option<String>,
    delivery_started: Option<String>,
}

impl RawEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            domain_event: row.get(1)?,
            inserted: row.get(2)?,
            batch_id: row.get(3)?,
            processing_result: row.get(4)?,
            delivery_started: row.get(5)?,
        })
    }

    fn into_entry(self) -> StoreResult<OutboxEntry> {
        let invalid =
            |what: &str, raw: &str| StoreError::InvalidData(format!("bad {} {:?}", what, raw));

        Ok(OutboxEntry {
            id: EventId::parse(&self.id).map_err(|_| invalid("event id", &self.id))?,
            domain_event: SerializedEvent::from_column(&self.domain_event)?,
            inserted: parse_timestamp(&self.inserted)?,
            batch_id: self
                .batch_id
                .as_deref()
                .map(|raw| BatchId::parse(raw).map_err(|_| invalid("batch id", raw)))
                .transpose()?,
            processing_result: self
                .processing_result
                .as_deref()
                .map(|raw| raw.parse().map_err(StoreError::InvalidData))
                .transpose()?,
            delivery_started: self
                .delivery_started
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
        })
    }
}

fn select_entries<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> StoreResult<Vec<OutboxEntry>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let raw = stmt
        .query_map(params, RawEntry::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    raw.into_iter().map(RawEntry::into_entry).collect()
}
