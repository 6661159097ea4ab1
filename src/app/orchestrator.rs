// SPDX-License-Identifier: AGPL-3.0-only

//! Drives a job through its stages: Created, Uploading, Submitting, Syncing,
//! Monitoring, Completing, CleanedUp. Every stage change is written to the
//! store before the operation returns, so a daemon restart resumes from the
//! last durable stage instead of repeating remote side effects blindly.

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{watch, Mutex};

use crate::app::errors::{AppError, AppResult};
use crate::app::ports::{ClockPort, JobStorePort, RemoteExecPort, SchedulerPort};
use crate::app::services::lifecycle::DirectoryLifecycleManager;
use crate::app::services::{paths, retry};
use crate::app::types::{JobPaths, JobRecord, LifecycleStage, NewJob, RetryPolicy, SchedulerState};

/// Metadata written to the project tier as `job.json` when a job is created.
#[derive(Debug, Serialize)]
struct JobMetadata<'a> {
    job_id: &'a str,
    username: &'a str,
    input_files: &'a [String],
    created_at: String,
}

pub struct JobAutomationOrchestrator {
    exec: Arc<dyn RemoteExecPort>,
    scheduler: Arc<dyn SchedulerPort>,
    store: Arc<dyn JobStorePort>,
    lifecycle: DirectoryLifecycleManager,
    retry_policy: RetryPolicy,
    cancel: watch::Receiver<bool>,
    /// At most one remote operation runs at a time.
    op_lock: Mutex<()>,
}

impl JobAutomationOrchestrator {
    pub fn new(
        exec: Arc<dyn RemoteExecPort>,
        scheduler: Arc<dyn SchedulerPort>,
        store: Arc<dyn JobStorePort>,
        clock: Arc<dyn ClockPort>,
        retry_policy: RetryPolicy,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let lifecycle =
            DirectoryLifecycleManager::new(exec.clone(), clock, retry_policy, cancel.clone());
        Self {
            exec,
            scheduler,
            store,
            lifecycle,
            retry_policy,
            cancel,
            op_lock: Mutex::new(()),
        }
    }

    pub fn lifecycle(&self) -> &DirectoryLifecycleManager {
        &self.lifecycle
    }

    /// Create the job record, lay out both directory tiers, and write the
    /// `job.json` metadata file to the project tier.
    pub async fn create_job(&self, new: NewJob) -> AppResult<JobRecord> {
        let _guard = self.op_lock.lock().await;
        self.check_cancelled()?;

        let job_paths = paths::job_paths(&new.username, &new.job_id)?;
        let record = self.store.insert(&new, &LifecycleStage::Created).await?;
        tracing::info!(job_id = %record.job_id, "job created");

        let result = async {
            self.lifecycle
                .prepare_job_directories(&new.username, &new.job_id)
                .await?;
            self.write_metadata(&record, &job_paths).await
        }
        .await;

        match result {
            Ok(()) => Ok(record),
            Err(err) => {
                self.fail_job(&record, err, "Created").await
            }
        }
    }

    async fn write_metadata(&self, record: &JobRecord, job_paths: &JobPaths) -> AppResult<()> {
        let metadata = JobMetadata {
            job_id: &record.job_id,
            username: &record.username,
            input_files: &record.input_files,
            created_at: record.created_at.clone(),
        };
        let json = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| AppError::internal(format!("job metadata serialization: {e}")))?;

        let mut tmp = tempfile::NamedTempFile::new()
            .map_err(|e| AppError::file_operation(format!("temp file: {e}")))?;
        tmp.write_all(&json)
            .map_err(|e| AppError::file_operation(format!("temp file write: {e}")))?;
        tmp.flush()
            .map_err(|e| AppError::file_operation(format!("temp file flush: {e}")))?;

        let exec = &self.exec;
        let local = tmp.path();
        let remote = job_paths.config_file.as_str();
        retry::execute(&self.retry_policy, &self.cancel, |_| async move {
            exec.upload_file(local, remote).await
        })
        .await
    }

    /// Upload the declared input files into the project tier.
    pub async fn upload_inputs(&self, job_id: &str, local_files: &[&Path]) -> AppResult<()> {
        let _guard = self.op_lock.lock().await;
        self.check_cancelled()?;

        let record = self.load(job_id).await?;
        let job_paths = paths::job_paths(&record.username, &record.job_id)?;
        self.persist_stage(&record, LifecycleStage::Uploading).await?;

        for local in local_files {
            let name = local
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    AppError::validation(format!("input file has no usable name: {}", local.display()))
                })?;
            let remote = format!("{}/{}", job_paths.inputs_dir, name);
            paths::validate_path(&remote)?;
            let exec = &self.exec;
            let remote = remote.as_str();
            let uploaded = retry::execute(&self.retry_policy, &self.cancel, |_| async move {
                exec.upload_file(local, remote).await
            })
            .await;
            if let Err(err) = uploaded {
                return self.fail_job(&record, err, "Uploading").await;
            }
            tracing::debug!(job_id, file = name, "input uploaded");
        }
        Ok(())
    }

    /// Submit the job: record intent, mirror project into scratch, run sbatch
    /// with the scratch directory as the working directory, and move to
    /// Monitoring once a scheduler id is known.
    ///
    /// Submission is not idempotent, so the sbatch call itself is never
    /// auto-retried. Re-invoking after a failure re-checks remote state: a
    /// job that already has a scheduler id is not submitted again.
    pub async fn submit_job(&self, job_id: &str) -> AppResult<i64> {
        let _guard = self.op_lock.lock().await;
        self.check_cancelled()?;

        let record = self.load(job_id).await?;
        if let Some(scheduler_id) = record.scheduler_id {
            tracing::info!(job_id, scheduler_id, "already submitted, skipping");
            self.persist_stage(&record, LifecycleStage::Monitoring).await?;
            return Ok(scheduler_id);
        }

        let job_paths = paths::job_paths(&record.username, &record.job_id)?;
        self.persist_stage(&record, LifecycleStage::Submitting).await?;

        let record = self.load(job_id).await?;
        self.persist_stage(&record, LifecycleStage::Syncing).await?;
        if let Err(err) = self.lifecycle.mirror_to_scratch(&job_paths).await {
            return self.fail_job(&record, err, "Syncing").await;
        }

        let scheduler_id = match self
            .scheduler
            .submit(&job_paths.slurm_script, &job_paths.scratch_dir)
            .await
        {
            Ok(id) => id,
            Err(err) => return self.fail_job(&record, err, "Syncing").await,
        };

        self.store.set_scheduler_id(job_id, scheduler_id).await?;
        self.persist_stage(&record, LifecycleStage::Monitoring).await?;
        tracing::info!(job_id, scheduler_id, "job submitted");
        Ok(scheduler_id)
    }

    /// Ask the scheduler where the job stands and record the answer. A job
    /// that has reached a terminal scheduler state is completed: outputs are
    /// synced back and scratch is removed.
    pub async fn poll_job(&self, job_id: &str) -> AppResult<SchedulerState> {
        let record = self.load(job_id).await?;
        let scheduler_id = record.scheduler_id.ok_or_else(|| {
            AppError::validation(format!("job {job_id} has not been submitted"))
        })?;

        let scheduler = &self.scheduler;
        let state = retry::execute(&self.retry_policy, &self.cancel, |_| async move {
            scheduler.query_status(scheduler_id).await
        })
        .await?;
        self.store
            .update_scheduler_state(job_id, state.as_str())
            .await?;
        tracing::debug!(job_id, scheduler_id, state = state.as_str(), "polled");

        if state.is_terminal() && !record.stage.is_terminal() {
            self.complete_job(job_id).await?;
        }
        Ok(state)
    }

    /// Finish a job whose scheduler run is over: sync scratch back to the
    /// project tier, then remove scratch. The sync must complete before the
    /// scratch delete is issued; outputs are never lost to a cleanup.
    ///
    /// Re-entrant: a restart after the scratch delete but before the stage
    /// write lands here again, finds scratch gone, and just records the
    /// stage instead of failing on a copy from a missing directory.
    pub async fn complete_job(&self, job_id: &str) -> AppResult<()> {
        let _guard = self.op_lock.lock().await;
        let record = self.load(job_id).await?;
        let job_paths = paths::job_paths(&record.username, &record.job_id)?;

        let exec = &self.exec;
        let scratch = job_paths.scratch_dir.as_str();
        let scratch_present =
            match retry::execute(&self.retry_policy, &self.cancel, |_| async move {
                exec.exists(scratch).await
            })
            .await
            {
                Ok(present) => present,
                Err(err) => return self.fail_job(&record, err, "Completing").await,
            };

        if scratch_present {
            if let Err(err) = self.lifecycle.sync_outputs_to_project(&job_paths).await {
                return self.fail_job(&record, err, "Completing").await;
            }
            if let Err(err) = self
                .lifecycle
                .delete_job_directory(&job_paths.scratch_dir, &record.username)
                .await
            {
                return self.fail_job(&record, err, "Completing").await;
            }
        } else {
            tracing::info!(job_id, "scratch already removed, skipping output sync");
        }

        self.persist_stage(&record, LifecycleStage::Completing).await?;
        tracing::info!(job_id, "job completed, outputs in project tier");
        Ok(())
    }

    /// User-requested deletion: cancel the scheduler job if it may still be
    /// running, remove both directory tiers, then drop the record.
    pub async fn delete_job(&self, job_id: &str) -> AppResult<()> {
        let _guard = self.op_lock.lock().await;
        let record = self.load(job_id).await?;
        let job_paths = paths::job_paths(&record.username, &record.job_id)?;

        if let Some(scheduler_id) = record.scheduler_id {
            let still_active = !record
                .scheduler_state
                .as_deref()
                .map(|s| crate::app::services::slurm::map_state(s).is_terminal())
                .unwrap_or(false);
            if still_active {
                let scheduler = &self.scheduler;
                retry::execute(&self.retry_policy, &self.cancel, |_| async move {
                    scheduler.cancel(scheduler_id).await
                })
                .await?;
                tracing::info!(job_id, scheduler_id, "scheduler job cancelled");
            }
        }

        self.lifecycle
            .delete_job_directory(&job_paths.scratch_dir, &record.username)
            .await?;
        self.lifecycle
            .delete_job_directory(&job_paths.job_dir, &record.username)
            .await?;

        self.persist_stage(&record, LifecycleStage::CleanedUp).await?;
        self.store.delete(job_id).await?;
        tracing::info!(job_id, "job deleted");
        Ok(())
    }

    /// Startup pass: reconcile stored stages with remote reality instead of
    /// repeating side effects. Jobs with a scheduler id go back to
    /// Monitoring; jobs interrupted mid-submit wait for an explicit
    /// re-invocation, which re-checks state itself.
    pub async fn resume_jobs(&self) -> AppResult<Vec<String>> {
        let jobs = self.store.list_unfinished_jobs().await?;
        let mut resumed = Vec::new();

        for record in jobs {
            if !record.stage.is_resumable() {
                continue;
            }
            match record.stage {
                LifecycleStage::Submitting | LifecycleStage::Syncing
                    if record.scheduler_id.is_some() =>
                {
                    self.persist_stage(&record, LifecycleStage::Monitoring).await?;
                    resumed.push(record.job_id);
                }
                LifecycleStage::Monitoring => {
                    if let Err(err) = self.poll_job(&record.job_id).await {
                        tracing::warn!(job_id = %record.job_id, error = %err, "resume poll failed");
                    } else {
                        resumed.push(record.job_id);
                    }
                }
                _ => {
                    tracing::info!(
                        job_id = %record.job_id,
                        stage = record.stage.label(),
                        "job waits for its next explicit operation"
                    );
                }
            }
        }
        Ok(resumed)
    }

    /// One sweep of the periodic poll loop.
    pub async fn poll_active_jobs(&self) {
        let jobs = match self.store.list_unfinished_jobs().await {
            Ok(jobs) => jobs,
            Err(err) => {
                tracing::warn!(error = %err, "listing unfinished jobs failed");
                return;
            }
        };
        for record in jobs {
            if record.stage != LifecycleStage::Monitoring {
                continue;
            }
            if let Err(err) = self.poll_job(&record.job_id).await {
                tracing::warn!(job_id = %record.job_id, error = %err, "poll failed");
            }
        }
    }

    async fn load(&self, job_id: &str) -> AppResult<JobRecord> {
        self.store
            .get(job_id)
            .await?
            .ok_or_else(|| AppError::validation(format!("unknown job: {job_id}")))
    }

    /// Durable stage write, gated by the forward-only progression rules.
    async fn persist_stage(&self, record: &JobRecord, next: LifecycleStage) -> AppResult<()> {
        if !record.stage.can_advance_to(&next) {
            return Err(AppError::validation(format!(
                "job {} cannot move from {} to {}",
                record.job_id,
                record.stage.label(),
                next.label()
            )));
        }
        self.store.update_stage(&record.job_id, &next).await
    }

    /// Record the failure durably, then surface the error annotated with the
    /// stage it happened in. The error keeps its original kind; only the
    /// stage annotation is added, and only if nothing set one earlier.
    async fn fail_job<T>(&self, record: &JobRecord, err: AppError, stage: &str) -> AppResult<T> {
        let failed = LifecycleStage::Failed {
            at: stage.to_string(),
            reason: err.message().to_string(),
        };
        if let Err(store_err) = self.store.update_stage(&record.job_id, &failed).await {
            tracing::error!(job_id = %record.job_id, error = %store_err, "failed to record failure");
        }
        Err(err.at_stage(stage))
    }

    fn check_cancelled(&self) -> AppResult<()> {
        if *self.cancel.borrow() {
            return Err(AppError::cancelled());
        }
        Ok(())
    }
}
