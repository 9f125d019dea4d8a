//! SQLite persistence for postings and weekly snapshots, plus HTTP fetch utilities.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};
use thiserror::Error;
use tracing::{debug, info};

pub mod http;
pub mod postings;
pub mod snapshots;

pub use http::{
    classify_reqwest_error, classify_status, BackoffPolicy, FetchError, FetchedPage,
    HttpClientConfig, HttpFetcher, RateLimit, RetryDisposition, Url,
};
pub use postings::{
    insert_posting, load_active_postings, mark_inactive, touch_posting, update_posting_content,
    NewPosting, PostingFilter, PostingPage, PostingStatistics, TimeRange,
};
pub use snapshots::{ActiveRollup, NewSnapshot, SnapshotInsert};

pub const CRATE_NAME: &str = "jobtrack-storage";

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// How long a writer waits for the database lock before failing with `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("preparing database path: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt value in column `{column}`: {message}")]
    Corrupt {
        column: &'static str,
        message: String,
    },
}

impl StoreError {
    pub(crate) fn corrupt(column: &'static str, err: impl fmt::Display) -> Self {
        Self::Corrupt {
            column,
            message: err.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Handle to the posting/snapshot database.
///
/// Cloning is cheap; all clones share one connection pool.
#[derive(Debug, Clone)]
pub struct PostingStore {
    pool: SqlitePool,
}

impl PostingStore {
    /// Open (creating if needed) the database at `database_url`. Does not migrate.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);

        let filename = options.get_filename();
        if let Some(parent) = filename.parent() {
            if !parent.as_os_str().is_empty() && filename.as_os_str() != ":memory:" {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        debug!(database_url, "connected posting store");
        Ok(Self { pool })
    }

    /// Ephemeral migrated database on a single pinned connection.
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        MIGRATOR.run(&self.pool).await?;
        info!("database migrations applied");
        Ok(())
    }

    /// Write transaction that takes the database write lock up front.
    ///
    /// A deferred transaction that reads before writing cannot wait for the
    /// lock on upgrade, so concurrent writers would fail with `SQLITE_BUSY`.
    /// Dropping the returned transaction without committing rolls it back.
    pub async fn begin(&self) -> StoreResult<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }
}
