//! SQLite-backed outbox store.

mod migrations;
mod store;
mod transaction;

pub use migrations::CURRENT_VERSION as SCHEMA_VERSION;
pub use store::{SqliteOptions, SqliteOutboxStore};
pub use transaction::SqliteTransaction;
