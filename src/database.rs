mod resilient;

pub use resilient::{ConnectionState, ResilientPool, is_connection_error};

use std::path::Path;

use sqlx::Row;

use crate::config::RetryConfig;
use crate::create_timestamp;
use crate::error::StoreError;
use crate::models::{RunKind, RunRecord, SourceFile, TestSpec};

/// The durable source of truth for lesson tests, solutions and student code.
///
/// Every call is bracketed by [`ResilientPool::with_retry`]; "not found" is
/// reported as `None`, never as an error.
pub struct RecordStore {
    db: ResilientPool,
}

impl RecordStore {
    pub async fn open(db_path: impl AsRef<Path>, retry: RetryConfig) -> Result<Self, StoreError> {
        let db = ResilientPool::connect(&db_path, retry).await?;
        let store = Self { db };
        store.init_schema().await?;

        log::info!("Initialized database at {}", db_path.as_ref().display());
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        self.db
            .with_retry(|pool| async move {
                let mut tx = pool.begin().await?;
                for sql in &[
                    r"
                    CREATE TABLE IF NOT EXISTS lesson_tests (
                        lesson_id     INTEGER PRIMARY KEY,
                        source        TEXT    NOT NULL
                    );",
                    r"
                    CREATE TABLE IF NOT EXISTS lesson_solutions (
                        lesson_id     INTEGER PRIMARY KEY,
                        source        TEXT    NOT NULL
                    );",
                    r"
                    CREATE TABLE IF NOT EXISTS student_code (
                        user_id       TEXT    NOT NULL,
                        lesson_id     INTEGER NOT NULL,
                        files_json    TEXT    NOT NULL,
                        updated_time  TEXT    NOT NULL,
                        PRIMARY KEY (user_id, lesson_id)
                    );",
                    r"
                    CREATE TABLE IF NOT EXISTS run_history (
                        id            INTEGER PRIMARY KEY AUTOINCREMENT,
                        owner_id      TEXT    NOT NULL,
                        lesson_id     INTEGER NOT NULL,
                        kind          TEXT    NOT NULL,
                        succeeded     INTEGER NOT NULL,
                        summary       TEXT    NOT NULL,
                        created_time  TEXT    NOT NULL
                    );",
                    "CREATE INDEX IF NOT EXISTS idx_run_history_owner ON run_history(owner_id, lesson_id);",
                ] {
                    sqlx::query(sql).execute(&mut *tx).await?;
                }
                tx.commit().await
            })
            .await
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.db.state()
    }

    pub fn pool(&self) -> &ResilientPool {
        &self.db
    }

    pub async fn get_lesson_test(&self, lesson_id: i64) -> Result<Option<TestSpec>, StoreError> {
        log::debug!("Fetching evaluator test for lesson {lesson_id}");
        let row = self
            .db
            .with_retry(move |pool| async move {
                sqlx::query("SELECT source FROM lesson_tests WHERE lesson_id = ?")
                    .bind(lesson_id)
                    .fetch_optional(&pool)
                    .await
            })
            .await?;

        Ok(row.map(|r| TestSpec {
            lesson_id,
            source: r.get("source"),
        }))
    }

    pub async fn put_lesson_test(&self, lesson_id: i64, source: &str) -> Result<(), StoreError> {
        self.db
            .with_retry(move |pool| async move {
                sqlx::query(
                    "INSERT INTO lesson_tests (lesson_id, source) VALUES (?, ?)
                     ON CONFLICT(lesson_id) DO UPDATE SET source = excluded.source",
                )
                .bind(lesson_id)
                .bind(source)
                .execute(&pool)
                .await
            })
            .await?;
        Ok(())
    }

    pub async fn get_lesson_solution(&self, lesson_id: i64) -> Result<Option<String>, StoreError> {
        let row = self
            .db
            .with_retry(move |pool| async move {
                sqlx::query("SELECT source FROM lesson_solutions WHERE lesson_id = ?")
                    .bind(lesson_id)
                    .fetch_optional(&pool)
                    .await
            })
            .await?;

        Ok(row.map(|r| r.get("source")))
    }

    pub async fn put_lesson_solution(&self, lesson_id: i64, source: &str) -> Result<(), StoreError> {
        self.db
            .with_retry(move |pool| async move {
                sqlx::query(
                    "INSERT INTO lesson_solutions (lesson_id, source) VALUES (?, ?)
                     ON CONFLICT(lesson_id) DO UPDATE SET source = excluded.source",
                )
                .bind(lesson_id)
                .bind(source)
                .execute(&pool)
                .await
            })
            .await?;
        Ok(())
    }

    /// Replaces the stored submission of `user_id` for `lesson_id`
    pub async fn save_student_code(
        &self,
        user_id: &str,
        lesson_id: i64,
        files: &[SourceFile],
    ) -> Result<(), StoreError> {
        let files_json = serde_json::to_string(files)?;
        let files_json = files_json.as_str();
        let now = create_timestamp();
        let now = now.as_str();

        self.db
            .with_retry(move |pool| async move {
                sqlx::query(
                    "INSERT INTO student_code (user_id, lesson_id, files_json, updated_time)
                     VALUES (?, ?, ?, ?)
                     ON CONFLICT(user_id, lesson_id)
                     DO UPDATE SET files_json = excluded.files_json, updated_time = excluded.updated_time",
                )
                .bind(user_id)
                .bind(lesson_id)
                .bind(files_json)
                .bind(now)
                .execute(&pool)
                .await
            })
            .await?;

        log::debug!("Saved {} file(s) for user {user_id} lesson {lesson_id}", files.len());
        Ok(())
    }

    pub async fn get_student_code(
        &self,
        user_id: &str,
        lesson_id: i64,
    ) -> Result<Option<Vec<SourceFile>>, StoreError> {
        let row = self
            .db
            .with_retry(move |pool| async move {
                sqlx::query("SELECT files_json FROM student_code WHERE user_id = ? AND lesson_id = ?")
                    .bind(user_id)
                    .bind(lesson_id)
                    .fetch_optional(&pool)
                    .await
            })
            .await?;

        match row {
            Some(r) => {
                let json: String = r.get("files_json");
                Ok(Some(serde_json::from_str(&json)?))
            }
            None => Ok(None),
        }
    }

    pub async fn record_run(
        &self,
        owner_id: &str,
        lesson_id: i64,
        kind: RunKind,
        succeeded: bool,
        summary: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let summary = summary.to_string();
        let summary = summary.as_str();
        let now = create_timestamp();
        let now = now.as_str();

        self.db
            .with_retry(move |pool| async move {
                sqlx::query(
                    "INSERT INTO run_history (owner_id, lesson_id, kind, succeeded, summary, created_time)
                     VALUES (?, ?, ?, ?, ?, ?)",
                )
                .bind(owner_id)
                .bind(lesson_id)
                .bind(kind)
                .bind(succeeded)
                .bind(summary)
                .bind(now)
                .execute(&pool)
                .await
            })
            .await?;
        Ok(())
    }

    /// Most recent runs first
    pub async fn recent_runs(
        &self,
        owner_id: &str,
        lesson_id: i64,
        limit: u32,
    ) -> Result<Vec<RunRecord>, StoreError> {
        self.db
            .with_retry(move |pool| async move {
                sqlx::query_as::<_, RunRecord>(
                    "SELECT owner_id, lesson_id, kind, succeeded, summary, created_time
                     FROM run_history
                     WHERE owner_id = ? AND lesson_id = ?
                     ORDER BY id DESC
                     LIMIT ?",
                )
                .bind(owner_id)
                .bind(lesson_id)
                .bind(limit)
                .fetch_all(&pool)
                .await
            })
            .await
    }
}

pub fn remove_db(db_path: impl AsRef<Path>) {
    let db_path = db_path.as_ref();
    if let Err(e) = std::fs::remove_file(db_path) {
        log::warn!("Unable to remove database at {}: {e}", db_path.display());
    } else {
        log::info!("Removed database at {}", db_path.display());
    }

    // WAL and SHM files may be left behind
    for suffix in ["-wal", "-shm"] {
        let mut side = db_path.as_os_str().to_owned();
        side.push(suffix);
        let _ = std::fs::remove_file(side);
    }
}
