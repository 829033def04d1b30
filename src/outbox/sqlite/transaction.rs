use r2d2::PooledConnection;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;
use tracing::warn;

use crate::error::StoreResult;
use crate::transaction::{Hooks, TransactionContext, TransactionHook};

/// A write transaction on one pooled connection.
///
/// Opened with `BEGIN IMMEDIATE`, so the write lock is taken up front and a
/// conflicting writer waits for the busy timeout instead of failing late at
/// commit. The connection goes back to the pool when the value is dropped.
pub struct SqliteTransaction {
    conn: PooledConnection<SqliteConnectionManager>,
    hooks: Hooks,
    finished: bool,
}

impl SqliteTransaction {
    pub(crate) fn begin(conn: PooledConnection<SqliteConnectionManager>) -> StoreResult<Self> {
        conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(Self {
            conn,
            hooks: Hooks::default(),
            finished: false,
        })
    }

    /// The connection the transaction runs on. Application writes made
    /// through it commit or roll back together with the outbox insert.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn abort(&mut self) {
        if !self.conn.is_autocommit() {
            if let Err(err) = self.conn.execute_batch("ROLLBACK") {
                warn!(error = %err, "SQLite rollback failed");
            }
        }
        self.finished = true;
        self.hooks.run_rollback();
    }
}

impl TransactionContext for SqliteTransaction {
    fn is_active(&self) -> bool {
        !self.finished && !self.conn.is_autocommit()
    }

    fn on_commit(&mut self, hook: TransactionHook) {
        self.hooks.push_commit(hook);
    }

    fn on_rollback(&mut self, hook: TransactionHook) {
        self.hooks.push_rollback(hook);
    }

    fn commit(mut self) -> StoreResult<()> {
        if let Err(err) = self.conn.execute_batch("COMMIT") {
            self.abort();
            return Err(err.into());
        }
        self.finished = true;
        self.hooks.run_commit();
        Ok(())
    }

    fn rollback(mut self) -> StoreResult<()> {
        self.abort();
        Ok(())
    }
}

impl Drop for SqliteTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.abort();
        }
    }
}
