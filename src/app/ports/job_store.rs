// SPDX-License-Identifier: AGPL-3.0-only

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::{JobRecord, LifecycleStage, NewJob};

/// Durable job records. Stage writes must be flushed before returning so a
/// restart can resume from the last recorded stage.
#[async_trait]
pub trait JobStorePort: Send + Sync {
    async fn insert(&self, job: &NewJob, stage: &LifecycleStage) -> AppResult<JobRecord>;

    async fn get(&self, job_id: &str) -> AppResult<Option<JobRecord>>;

    async fn update_stage(&self, job_id: &str, stage: &LifecycleStage) -> AppResult<()>;

    async fn set_scheduler_id(&self, job_id: &str, scheduler_id: i64) -> AppResult<()>;

    async fn update_scheduler_state(&self, job_id: &str, state: &str) -> AppResult<()>;

    /// Jobs whose stage is not terminal, for the startup resume pass and the
    /// periodic poll loop.
    async fn list_unfinished_jobs(&self) -> AppResult<Vec<JobRecord>>;

    async fn delete(&self, job_id: &str) -> AppResult<()>;
}
