use std::future::Future;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use parking_lot::Mutex;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use tokio::sync::RwLock;

use crate::config::RetryConfig;
use crate::error::StoreError;

/// Substrings of driver messages that indicate a lost or unusable connection
const CONNECTION_MARKERS: &[&str] = &[
    "connection closed",
    "closed connection",
    "connection reset",
    "broken pipe",
    "eof",
    "readonly database",
    "read-only",
    "disk i/o error",
];

/// Process-wide view of the database connection, only written by [`ResilientPool`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionState {
    pub connected: bool,
    /// Reconnect attempts made since the connection was last known good
    pub attempt: u32,
}

/// Tells connection-class failures apart from domain errors such as `RowNotFound`
pub fn is_connection_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::PoolClosed
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::Io(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::WorkerCrashed => true,
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_ascii_lowercase();
            CONNECTION_MARKERS.iter().any(|m| message.contains(m))
        }
        _ => false,
    }
}

/// A sqlite pool guarded by connect-state tracking and bounded reconnect.
///
/// Every durable read or write goes through [`ResilientPool::with_retry`].
pub struct ResilientPool {
    db_path: PathBuf,
    pool: RwLock<SqlitePool>,
    state: Mutex<ConnectionState>,
    reconnect_gate: tokio::sync::Mutex<()>,
    retry: RetryConfig,
}

impl ResilientPool {
    pub async fn connect(db_path: impl AsRef<Path>, retry: RetryConfig) -> sqlx::Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();
        let pool = open_pool(&db_path).await?;

        Ok(Self {
            db_path,
            pool: RwLock::new(pool),
            state: Mutex::new(ConnectionState {
                connected: true,
                attempt: 0,
            }),
            reconnect_gate: tokio::sync::Mutex::new(()),
            retry,
        })
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Current pool handle; cheap to clone
    pub async fn pool(&self) -> SqlitePool {
        self.pool.read().await.clone()
    }

    /// Runs `op`, reconnecting and retrying it once on a connection-class error.
    ///
    /// Any other error is returned untouched as [`StoreError::Query`].
    pub async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T, StoreError>
    where
        F: Fn(SqlitePool) -> Fut,
        Fut: Future<Output = sqlx::Result<T>>,
    {
        if !self.state.lock().connected {
            self.reconnect().await?;
        }

        match op(self.pool().await).await {
            Ok(value) => Ok(value),
            Err(e) if is_connection_error(&e) => {
                log::warn!("Database connection error, reconnecting: {e}");
                self.state.lock().connected = false;
                self.reconnect().await?;

                op(self.pool().await).await.map_err(|e| {
                    if is_connection_error(&e) {
                        self.state.lock().connected = false;
                        StoreError::Unavailable {
                            attempts: 1,
                            source: e,
                        }
                    } else {
                        StoreError::Query(e)
                    }
                })
            }
            Err(e) => Err(StoreError::Query(e)),
        }
    }

    async fn reconnect(&self) -> Result<(), StoreError> {
        let _gate = self.reconnect_gate.lock().await;

        // Another task may have restored the connection while we waited
        if self.state.lock().connected {
            return Ok(());
        }

        let mut last_error = None;
        for attempt in 0..self.retry.max_attempts {
            self.state.lock().attempt = attempt + 1;
            tokio::time::sleep(self.retry.backoff(attempt)).await;

            match open_pool(&self.db_path).await {
                Ok(pool) => {
                    let old = std::mem::replace(&mut *self.pool.write().await, pool);
                    old.close().await;
                    *self.state.lock() = ConnectionState {
                        connected: true,
                        attempt: 0,
                    };
                    log::info!("Reconnected to database after {} attempt(s)", attempt + 1);
                    return Ok(());
                }
                Err(e) => {
                    log::warn!("Reconnect attempt {} failed: {e}", attempt + 1);
                    last_error = Some(e);
                }
            }
        }

        log::error!(
            "Giving up on database after {} reconnect attempts",
            self.retry.max_attempts
        );
        Err(StoreError::Unavailable {
            attempts: self.retry.max_attempts,
            source: last_error.unwrap_or(sqlx::Error::PoolClosed),
        })
    }
}

async fn open_pool(db_path: &Path) -> sqlx::Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", db_path.display()))?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(2)) // lock contention
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal);

    SqlitePoolOptions::new()
        .max_connections(4)
        .min_connections(0)
        .acquire_timeout(Duration::from_secs(5))
        .connect_with(options)
        .await
}
