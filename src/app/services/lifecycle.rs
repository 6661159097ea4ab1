// SPDX-License-Identifier: AGPL-3.0-only

//! Two-tier remote directory lifecycle. The project tier is the durable home
//! of a job; the scratch tier is the fast working copy the scheduler runs in.
//! Scratch is always synced back to project before anything removes it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::app::errors::{AppError, AppResult};
use crate::app::ports::{ClockPort, RemoteExecPort};
use crate::app::services::shell::sh_escape;
use crate::app::services::{paths, retry};
use crate::app::types::{CleanupResult, DirectorySetupResult, JobPaths, RetryPolicy};

const COPY_TIMEOUT: Duration = Duration::from_secs(300);

pub struct DirectoryLifecycleManager {
    exec: Arc<dyn RemoteExecPort>,
    clock: Arc<dyn ClockPort>,
    policy: RetryPolicy,
    cancel: watch::Receiver<bool>,
}

impl DirectoryLifecycleManager {
    pub fn new(
        exec: Arc<dyn RemoteExecPort>,
        clock: Arc<dyn ClockPort>,
        policy: RetryPolicy,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            exec,
            clock,
            policy,
            cancel,
        }
    }

    /// Create both tier roots for a user. Partial success: one tier failing
    /// does not abort the other.
    pub async fn setup_user_workspace(&self, username: &str) -> AppResult<DirectorySetupResult> {
        let mut result = DirectorySetupResult::default();
        for root in [paths::project_root(username), paths::scratch_root(username)] {
            match self.ensure_directory_exists(&root).await {
                Ok(true) => result.created.push(root),
                Ok(false) => result.existed.push(root),
                Err(err) => result.errors.push(format!("{root}: {err}")),
            }
        }
        Ok(result)
    }

    /// Idempotent mkdir. The existence probe runs inside the retry closure so
    /// a create that succeeded remotely but lost its reply is not repeated as
    /// a failure.
    pub async fn ensure_directory_exists(&self, path: &str) -> AppResult<bool> {
        paths::validate_path(path)?;
        let exec = &self.exec;
        retry::execute(&self.policy, &self.cancel, |_| async move {
            if exec.exists(path).await? {
                return Ok(false);
            }
            exec.create_directory(path).await?;
            Ok(true)
        })
        .await
    }

    /// Create the full per-job directory layout on both tiers.
    pub async fn prepare_job_directories(
        &self,
        username: &str,
        job_id: &str,
    ) -> AppResult<(JobPaths, DirectorySetupResult)> {
        let job = paths::job_paths(username, job_id)?;
        let mut result = DirectorySetupResult::default();
        for dir in [
            &job.job_dir,
            &job.inputs_dir,
            &job.outputs_dir,
            &job.logs_dir,
            &job.scratch_dir,
        ] {
            match self.ensure_directory_exists(dir).await {
                Ok(true) => result.created.push(dir.clone()),
                Ok(false) => result.existed.push(dir.clone()),
                Err(err) => return Err(err),
            }
        }
        Ok((job, result))
    }

    /// Mirror the project job directory into scratch, server-side.
    pub async fn mirror_to_scratch(&self, job: &JobPaths) -> AppResult<()> {
        self.ensure_directory_exists(&job.scratch_dir).await?;
        let cmd = format!(
            "cp -r {}/. {}",
            sh_escape(&job.job_dir),
            sh_escape(&job.scratch_dir)
        );
        self.run_copy(&cmd).await
    }

    /// Copy everything the job produced in scratch back under the project
    /// tier. Must complete before the scratch directory is removed.
    pub async fn sync_outputs_to_project(&self, job: &JobPaths) -> AppResult<()> {
        let cmd = format!(
            "cp -r {}/. {}",
            sh_escape(&job.scratch_dir),
            sh_escape(&job.job_dir)
        );
        self.run_copy(&cmd).await
    }

    async fn run_copy(&self, cmd: &str) -> AppResult<()> {
        let exec = &self.exec;
        retry::execute(&self.policy, &self.cancel, |_| async move {
            let capture = exec.execute_command(cmd, COPY_TIMEOUT).await?;
            if capture.exit_code != 0 {
                return Err(AppError::file_operation(format!(
                    "copy failed (exit {}): {}",
                    capture.exit_code,
                    capture.stderr_text().trim()
                )));
            }
            Ok(())
        })
        .await
    }

    /// Sweep the scratch tier, removing job directories whose last
    /// modification is older than `max_age`. Entries without a usable mtime
    /// are left in place. Each entry fails independently; the sweep always
    /// reports what it managed to do.
    pub async fn cleanup_old_jobs(
        &self,
        username: &str,
        max_age: Duration,
    ) -> AppResult<CleanupResult> {
        let root = paths::scratch_root(username);
        let entries = self.exec.list_files(&root).await?;
        let now = self.clock.now_utc();

        let mut result = CleanupResult::default();
        for entry in entries.iter().filter(|e| e.is_dir) {
            result.scanned += 1;
            let Some(modified) = entry.modified else {
                tracing::debug!(path = %entry.path, "no mtime, leaving in place");
                continue;
            };
            if now - modified < max_age {
                continue;
            }
            match self.delete_job_directory(&entry.path, username).await {
                Ok(()) => result.cleaned += 1,
                Err(err) => {
                    result.failed += 1;
                    result.errors.push(format!("{}: {err}", entry.path));
                    tracing::warn!(path = %entry.path, error = %err, "cleanup entry failed");
                }
            }
        }
        Ok(result)
    }

    /// Recursive delete with the containment check recomputed here, at the
    /// last moment before the remote call. A path outside the user's job
    /// tiers is refused outright and nothing is sent to the remote host.
    pub async fn delete_job_directory(&self, path: &str, username: &str) -> AppResult<()> {
        if !paths::is_path_allowed(path, username) {
            return Err(AppError::validation(format!(
                "refusing to delete path outside the job workspace: {path}"
            ))
            .with_suggestion("only paths under the user's namdrunner_jobs tiers may be removed"));
        }
        let exec = &self.exec;
        retry::execute(&self.policy, &self.cancel, |_| async move {
            exec.delete_recursive(path).await
        })
        .await
    }
}
