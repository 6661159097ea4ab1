// SPDX-License-Identifier: AGPL-3.0-only

//! SQLite-backed job store. The stage column holds the serialized
//! `LifecycleStage`, so a `Failed { at, reason }` survives a restart intact.

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::app::errors::{AppError, AppResult};
use crate::app::ports::JobStorePort;
use crate::app::types::{JobRecord, LifecycleStage, NewJob};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("stored value could not be decoded: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("timestamp formatting: {0}")]
    Time(#[from] time::error::Format),
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        AppError::internal(format!("job store: {e}"))
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    job_id TEXT NOT NULL UNIQUE,
    username TEXT NOT NULL,
    stage TEXT NOT NULL,
    scheduler_id INTEGER,
    scheduler_state TEXT,
    input_files TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
"#;

pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))
            .unwrap_or_else(|_| SqliteConnectOptions::new().filename(path))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    fn now() -> Result<String, StoreError> {
        Ok(OffsetDateTime::now_utc().format(&Rfc3339)?)
    }

    fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> Result<JobRecord, StoreError> {
        let stage_json: String = row.get("stage");
        let input_files_json: String = row.get("input_files");
        Ok(JobRecord {
            id: row.get("id"),
            job_id: row.get("job_id"),
            username: row.get("username"),
            stage: serde_json::from_str(&stage_json)?,
            scheduler_id: row.get("scheduler_id"),
            scheduler_state: row.get("scheduler_state"),
            input_files: serde_json::from_str(&input_files_json)?,
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

#[async_trait]
impl JobStorePort for SqliteJobStore {
    async fn insert(&self, job: &NewJob, stage: &LifecycleStage) -> AppResult<JobRecord> {
        let now = Self::now()?;
        let stage_json =
            serde_json::to_string(stage).map_err(StoreError::from)?;
        let input_files_json =
            serde_json::to_string(&job.input_files).map_err(StoreError::from)?;
        sqlx::query(
            "INSERT INTO jobs (job_id, username, stage, input_files, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
        )
        .bind(&job.job_id)
        .bind(&job.username)
        .bind(&stage_json)
        .bind(&input_files_json)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        self.get(&job.job_id)
            .await?
            .ok_or_else(|| AppError::internal("inserted job vanished"))
    }

    async fn get(&self, job_id: &str) -> AppResult<Option<JobRecord>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE job_id = ?1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::from)?;
        match row {
            Some(row) => Ok(Some(Self::row_to_record(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_stage(&self, job_id: &str, stage: &LifecycleStage) -> AppResult<()> {
        let now = Self::now()?;
        let stage_json =
            serde_json::to_string(stage).map_err(StoreError::from)?;
        let result = sqlx::query("UPDATE jobs SET stage = ?1, updated_at = ?2 WHERE job_id = ?3")
            .bind(&stage_json)
            .bind(&now)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        if result.rows_affected() == 0 {
            return Err(AppError::validation(format!("unknown job: {job_id}")));
        }
        Ok(())
    }

    async fn set_scheduler_id(&self, job_id: &str, scheduler_id: i64) -> AppResult<()> {
        let now = Self::now()?;
        sqlx::query("UPDATE jobs SET scheduler_id = ?1, updated_at = ?2 WHERE job_id = ?3")
            .bind(scheduler_id)
            .bind(&now)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn update_scheduler_state(&self, job_id: &str, state: &str) -> AppResult<()> {
        let now = Self::now()?;
        sqlx::query("UPDATE jobs SET scheduler_state = ?1, updated_at = ?2 WHERE job_id = ?3")
            .bind(state)
            .bind(&now)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }

    async fn list_unfinished_jobs(&self) -> AppResult<Vec<JobRecord>> {
        let rows = sqlx::query("SELECT * FROM jobs ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from)?;
        let mut out = Vec::new();
        for row in &rows {
            let record = Self::row_to_record(row)?;
            if !record.stage.is_terminal() {
                out.push(record);
            }
        }
        Ok(out)
    }

    async fn delete(&self, job_id: &str) -> AppResult<()> {
        sqlx::query("DELETE FROM jobs WHERE job_id = ?1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::from)?;
        Ok(())
    }
}
