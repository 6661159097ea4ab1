// SPDX-License-Identifier: AGPL-3.0-only

//! SchedulerPort over the remote execution boundary: builds SLURM commands,
//! runs them on the login node, parses what comes back.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::app::errors::{AppError, AppResult};
use crate::app::ports::{RemoteExecPort, SchedulerPort};
use crate::app::services::slurm;
use crate::app::types::SchedulerState;

const SCHEDULER_TIMEOUT: Duration = Duration::from_secs(60);

pub struct SlurmScheduler {
    exec: Arc<dyn RemoteExecPort>,
}

impl SlurmScheduler {
    pub fn new(exec: Arc<dyn RemoteExecPort>) -> Self {
        Self { exec }
    }
}

#[async_trait]
impl SchedulerPort for SlurmScheduler {
    async fn submit(&self, script_path: &str, workdir: &str) -> AppResult<i64> {
        let cmd = slurm::sbatch_command(script_path, workdir);
        let capture = self.exec.execute_command(&cmd, SCHEDULER_TIMEOUT).await?;
        if capture.exit_code != 0 {
            return Err(AppError::scheduler(format!(
                "sbatch exited {}: {}",
                capture.exit_code,
                capture.stderr_text().trim()
            ))
            .with_suggestion("inspect the job script and the scheduler error above"));
        }
        slurm::parse_submission(&capture.stdout_text()).ok_or_else(|| {
            AppError::scheduler(format!(
                "unrecognized sbatch confirmation: {:?}",
                capture.stdout_text().trim()
            ))
        })
    }

    async fn query_status(&self, scheduler_id: i64) -> AppResult<SchedulerState> {
        let cmd = slurm::squeue_command(scheduler_id);
        let capture = self.exec.execute_command(&cmd, SCHEDULER_TIMEOUT).await?;
        let text = capture.stdout_text();
        let token = text.trim();
        if capture.exit_code == 0 && !token.is_empty() {
            return Ok(slurm::map_state(token));
        }

        // Finished jobs leave the queue; ask accounting.
        let cmd = slurm::sacct_command(scheduler_id);
        let capture = self.exec.execute_command(&cmd, SCHEDULER_TIMEOUT).await?;
        if capture.exit_code != 0 {
            return Err(AppError::scheduler(format!(
                "sacct exited {}: {}",
                capture.exit_code,
                capture.stderr_text().trim()
            )));
        }
        let text = capture.stdout_text();
        let token = text.trim();
        if token.is_empty() {
            return Ok(SchedulerState::Unknown);
        }
        Ok(slurm::map_state(token))
    }

    async fn cancel(&self, scheduler_id: i64) -> AppResult<()> {
        let cmd = slurm::scancel_command(scheduler_id);
        let capture = self.exec.execute_command(&cmd, SCHEDULER_TIMEOUT).await?;
        // A job that already finished is fine to "cancel".
        if capture.exit_code != 0 {
            let stderr = capture.stderr_text();
            if !stderr.contains("Invalid job id") {
                return Err(AppError::scheduler(format!(
                    "scancel exited {}: {}",
                    capture.exit_code,
                    stderr.trim()
                )));
            }
        }
        Ok(())
    }
}
