//! Unified store for the Watchkeeper control plane.
//!
//! This crate is the single source of truth: latest-truth state, the
//! append-only event log, intent/action/feedback records, capabilities, the
//! STT bias lexicon, and the Twitch ingest tables all live in one SQLite
//! file. Every component goes through [`WatchkeeperDb`]; nothing else opens
//! the database.

mod capability;
mod error;
mod events;
mod intents;
mod schema;
mod state;
mod twitch;
mod types;

pub use error::{DbError, Result};
pub use events::EventFilter;
pub use state::{BatchResult, EventContext, StateWrite, StateWriteResult};
pub use types::*;

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::path::Path;
use tokio::sync::broadcast;
use tracing::info;
use watchkeeper_protocol::EventRecord;

const EVENT_FEED_CAPACITY: usize = 256;

/// Handle to the Watchkeeper store. Cheap to clone; the pool is shared.
#[derive(Clone)]
pub struct WatchkeeperDb {
    pool: SqlitePool,
    event_feed: broadcast::Sender<EventRecord>,
}

impl WatchkeeperDb {
    /// Open or create the store at the given path and ensure the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let (event_feed, _) = broadcast::channel(EVENT_FEED_CAPACITY);
        let db = Self { pool, event_feed };
        db.ensure_schema().await?;

        info!(path = %path.display(), "store opened");
        Ok(db)
    }

    /// In-memory store for tests and dev ingest.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let (event_feed, _) = broadcast::channel(EVENT_FEED_CAPACITY);
        let db = Self { pool, event_feed };
        db.ensure_schema().await?;
        Ok(db)
    }

    /// Subscribe to events appended after this call. Slow consumers may see
    /// `Lagged`; the log itself is always complete.
    pub fn subscribe_events(&self) -> broadcast::Receiver<EventRecord> {
        self.event_feed.subscribe()
    }

    pub(crate) fn publish(&self, record: &EventRecord) {
        // Nobody listening is fine.
        let _ = self.event_feed.send(record.clone());
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }

    /// Current time as epoch milliseconds.
    pub fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn open_creates_database_file() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("test.sqlite3");
        let db = WatchkeeperDb::open(&db_path).await.unwrap();
        assert!(db_path.exists());
        db.close().await;
    }

    #[tokio::test]
    async fn open_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("test.sqlite3");
        let first = WatchkeeperDb::open(&db_path).await.unwrap();
        first.close().await;
        // Second open re-runs schema creation against existing tables.
        let second = WatchkeeperDb::open(&db_path).await.unwrap();
        second.close().await;
    }
}
