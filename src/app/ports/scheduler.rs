// SPDX-License-Identifier: AGPL-3.0-only

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::SchedulerState;

/// Batch scheduler boundary. The production adapter talks SLURM through the
/// remote execution port.
#[async_trait]
pub trait SchedulerPort: Send + Sync {
    /// Submit a script with the given working directory, returning the
    /// scheduler-assigned job id.
    async fn submit(&self, script_path: &str, workdir: &str) -> AppResult<i64>;

    async fn query_status(&self, scheduler_id: i64) -> AppResult<SchedulerState>;

    /// Cancel a job. Cancelling an unknown or already-finished id succeeds.
    async fn cancel(&self, scheduler_id: i64) -> AppResult<()>;
}
