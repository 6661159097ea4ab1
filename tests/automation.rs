// SPDX-License-Identifier: AGPL-3.0-only

//! Full job flow against fake ports: create, upload, submit, poll to
//! completion, delete. The fakes record every remote call so ordering
//! guarantees can be asserted, not just end states.

use std::collections::{HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use namdrunnerd::adapters::slurm::SlurmScheduler;
use namdrunnerd::adapters::time::SystemClock;
use namdrunnerd::app::errors::{AppError, AppErrorKind, AppResult};
use namdrunnerd::app::orchestrator::JobAutomationOrchestrator;
use namdrunnerd::app::ports::{JobStorePort, RemoteExecPort};
use namdrunnerd::app::types::{
    ExecCapture, FileInfo, JobRecord, LifecycleStage, NewJob, RetryPolicy, SchedulerState,
};

/// Remote host stand-in. Commands are answered by prefix; every interaction
/// is appended to the shared call log.
#[derive(Default)]
struct FakeCluster {
    calls: Mutex<Vec<String>>,
    existing: Mutex<HashSet<String>>,
    squeue_state: Mutex<Option<String>>,
    sacct_state: Mutex<Option<String>>,
    sbatch_reply: Mutex<String>,
    /// Next N uploads fail with a network error, then recover.
    upload_failures: Mutex<u32>,
    /// Next N shell commands fail with a network error, then recover.
    exec_failures: Mutex<u32>,
}

impl FakeCluster {
    fn new() -> Arc<Self> {
        let fake = Self::default();
        *fake.sbatch_reply.lock().unwrap() = "Submitted batch job 4821\n".to_string();
        Arc::new(fake)
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn set_queue_state(&self, state: Option<&str>) {
        *self.squeue_state.lock().unwrap() = state.map(str::to_string);
    }

    fn set_accounting_state(&self, state: Option<&str>) {
        *self.sacct_state.lock().unwrap() = state.map(str::to_string);
    }

    fn call_index(&self, needle: &str) -> Option<usize> {
        self.calls().iter().position(|c| c.contains(needle))
    }
}

fn ok(stdout: &str) -> ExecCapture {
    ExecCapture {
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
        exit_code: 0,
    }
}

#[async_trait]
impl RemoteExecPort for FakeCluster {
    async fn execute_command(&self, command: &str, _: Duration) -> AppResult<ExecCapture> {
        self.record(format!("exec {command}"));
        {
            let mut failures = self.exec_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(AppError::network("connection reset by peer"));
            }
        }
        if command.starts_with("sbatch") {
            return Ok(ok(&self.sbatch_reply.lock().unwrap().clone()));
        }
        if command.starts_with("squeue") {
            let state = self.squeue_state.lock().unwrap().clone();
            return Ok(ok(&state.map(|s| format!("{s}\n")).unwrap_or_default()));
        }
        if command.starts_with("sacct") {
            let state = self.sacct_state.lock().unwrap().clone();
            return Ok(ok(&state.map(|s| format!("{s}\n")).unwrap_or_default()));
        }
        // Copies behave like a real cp: a missing source directory is an error.
        if let Some(rest) = command.strip_prefix("cp -r '") {
            if let Some(src) = rest.split('\'').next() {
                if !self.existing.lock().unwrap().contains(src) {
                    return Ok(ExecCapture {
                        stdout: Vec::new(),
                        stderr: format!(
                            "cp: cannot stat '{src}/.': No such file or directory"
                        )
                        .into_bytes(),
                        exit_code: 1,
                    });
                }
            }
            return Ok(ok(""));
        }
        // scancel, anything else: succeed silently.
        Ok(ok(""))
    }

    async fn upload_file(&self, _: &Path, remote: &str) -> AppResult<()> {
        self.record(format!("upload {remote}"));
        {
            let mut failures = self.upload_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(AppError::network("connection reset during upload"));
            }
        }
        self.existing.lock().unwrap().insert(remote.to_string());
        Ok(())
    }

    async fn download_file(&self, remote: &str, _: &Path) -> AppResult<()> {
        self.record(format!("download {remote}"));
        Ok(())
    }

    async fn list_files(&self, remote_dir: &str) -> AppResult<Vec<FileInfo>> {
        self.record(format!("list {remote_dir}"));
        Ok(Vec::new())
    }

    async fn exists(&self, remote: &str) -> AppResult<bool> {
        Ok(self.existing.lock().unwrap().contains(remote))
    }

    async fn create_directory(&self, remote: &str) -> AppResult<()> {
        self.record(format!("mkdir {remote}"));
        self.existing.lock().unwrap().insert(remote.to_string());
        Ok(())
    }

    async fn delete_recursive(&self, remote: &str) -> AppResult<()> {
        self.record(format!("delete {remote}"));
        self.existing.lock().unwrap().remove(remote);
        Ok(())
    }
}

/// In-memory job store with the same stage semantics as the SQLite adapter.
#[derive(Default)]
struct MemoryStore {
    jobs: Mutex<HashMap<String, JobRecord>>,
    next_id: Mutex<i64>,
}

#[async_trait]
impl JobStorePort for MemoryStore {
    async fn insert(&self, job: &NewJob, stage: &LifecycleStage) -> AppResult<JobRecord> {
        let mut next_id = self.next_id.lock().unwrap();
        *next_id += 1;
        let record = JobRecord {
            id: *next_id,
            job_id: job.job_id.clone(),
            username: job.username.clone(),
            stage: stage.clone(),
            scheduler_id: None,
            scheduler_state: None,
            input_files: job.input_files.clone(),
            created_at: "2026-08-29T00:00:00Z".to_string(),
            updated_at: "2026-08-29T00:00:00Z".to_string(),
        };
        self.jobs
            .lock()
            .unwrap()
            .insert(job.job_id.clone(), record.clone());
        Ok(record)
    }

    async fn get(&self, job_id: &str) -> AppResult<Option<JobRecord>> {
        Ok(self.jobs.lock().unwrap().get(job_id).cloned())
    }

    async fn update_stage(&self, job_id: &str, stage: &LifecycleStage) -> AppResult<()> {
        let mut jobs = self.jobs.lock().unwrap();
        let record = jobs
            .get_mut(job_id)
            .ok_or_else(|| AppError::validation(format!("unknown job: {job_id}")))?;
        record.stage = stage.clone();
        Ok(())
    }

    async fn set_scheduler_id(&self, job_id: &str, scheduler_id: i64) -> AppResult<()> {
        if let Some(record) = self.jobs.lock().unwrap().get_mut(job_id) {
            record.scheduler_id = Some(scheduler_id);
        }
        Ok(())
    }

    async fn update_scheduler_state(&self, job_id: &str, state: &str) -> AppResult<()> {
        if let Some(record) = self.jobs.lock().unwrap().get_mut(job_id) {
            record.scheduler_state = Some(state.to_string());
        }
        Ok(())
    }

    async fn list_unfinished_jobs(&self) -> AppResult<Vec<JobRecord>> {
        let mut out: Vec<_> = self
            .jobs
            .lock()
            .unwrap()
            .values()
            .filter(|r| !r.stage.is_terminal())
            .cloned()
            .collect();
        out.sort_by_key(|r| r.id);
        Ok(out)
    }

    async fn delete(&self, job_id: &str) -> AppResult<()> {
        self.jobs.lock().unwrap().remove(job_id);
        Ok(())
    }
}

struct Harness {
    cluster: Arc<FakeCluster>,
    store: Arc<MemoryStore>,
    orchestrator: JobAutomationOrchestrator,
    _cancel_tx: watch::Sender<bool>,
}

fn harness_with(policy: RetryPolicy) -> Harness {
    let cluster = FakeCluster::new();
    let store = Arc::new(MemoryStore::default());
    let scheduler = Arc::new(SlurmScheduler::new(cluster.clone()));
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let orchestrator = JobAutomationOrchestrator::new(
        cluster.clone(),
        scheduler,
        store.clone(),
        Arc::new(SystemClock),
        policy,
        cancel_rx,
    );
    Harness {
        cluster,
        store,
        orchestrator,
        _cancel_tx: cancel_tx,
    }
}

fn harness() -> Harness {
    harness_with(RetryPolicy::single_attempt())
}

fn fast_retries() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter_ratio: 0.0,
    }
}

fn sim1() -> NewJob {
    NewJob {
        job_id: "sim1".to_string(),
        username: "alice".to_string(),
        input_files: vec!["protein.psf".to_string()],
    }
}

async fn stage_of(store: &MemoryStore, job_id: &str) -> LifecycleStage {
    store.get(job_id).await.unwrap().unwrap().stage
}

#[tokio::test]
async fn create_lays_out_both_tiers_and_writes_metadata() {
    let h = harness();
    let record = h.orchestrator.create_job(sim1()).await.unwrap();
    assert_eq!(record.stage, LifecycleStage::Created);

    let calls = h.cluster.calls();
    assert!(calls.contains(&"mkdir /projects/alice/namdrunner_jobs/sim1".to_string()));
    assert!(calls.contains(&"mkdir /projects/alice/namdrunner_jobs/sim1/input_files".to_string()));
    assert!(calls.contains(&"mkdir /projects/alice/namdrunner_jobs/sim1/outputs".to_string()));
    assert!(calls.contains(&"mkdir /projects/alice/namdrunner_jobs/sim1/logs".to_string()));
    assert!(calls.contains(&"mkdir /scratch/alpine/alice/namdrunner_jobs/sim1".to_string()));
    assert!(calls.contains(&"upload /projects/alice/namdrunner_jobs/sim1/job.json".to_string()));
}

#[tokio::test]
async fn upload_places_inputs_under_input_files() {
    let h = harness();
    h.orchestrator.create_job(sim1()).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("protein.psf");
    let mut f = std::fs::File::create(&local).unwrap();
    f.write_all(b"psf").unwrap();

    h.orchestrator
        .upload_inputs("sim1", &[local.as_path()])
        .await
        .unwrap();
    assert!(h
        .cluster
        .calls()
        .contains(&"upload /projects/alice/namdrunner_jobs/sim1/input_files/protein.psf".to_string()));
    assert_eq!(stage_of(&h.store, "sim1").await, LifecycleStage::Uploading);
}

#[tokio::test]
async fn submit_mirrors_then_parses_the_scheduler_id() {
    let h = harness();
    h.orchestrator.create_job(sim1()).await.unwrap();
    let id = h.orchestrator.submit_job("sim1").await.unwrap();
    assert_eq!(id, 4821);
    assert_eq!(stage_of(&h.store, "sim1").await, LifecycleStage::Monitoring);

    // The project tree was mirrored into scratch before sbatch ran.
    let mirror = h.cluster.call_index("cp -r '/projects/alice").unwrap();
    let sbatch = h.cluster.call_index("sbatch").unwrap();
    assert!(mirror < sbatch);

    let sbatch_call = h.cluster.calls().remove(sbatch);
    assert!(sbatch_call.contains("--chdir='/scratch/alpine/alice/namdrunner_jobs/sim1'"));
}

#[tokio::test]
async fn resubmission_reuses_the_existing_scheduler_id() {
    let h = harness();
    h.orchestrator.create_job(sim1()).await.unwrap();
    h.orchestrator.submit_job("sim1").await.unwrap();
    let id = h.orchestrator.submit_job("sim1").await.unwrap();
    assert_eq!(id, 4821);
    let sbatch_count = h
        .cluster
        .calls()
        .iter()
        .filter(|c| c.contains("sbatch"))
        .count();
    assert_eq!(sbatch_count, 1);
}

#[tokio::test]
async fn garbled_sbatch_output_fails_the_job() {
    let h = harness();
    *h.cluster.sbatch_reply.lock().unwrap() = "batch job maybe submitted?\n".to_string();
    h.orchestrator.create_job(sim1()).await.unwrap();

    let err = h.orchestrator.submit_job("sim1").await.unwrap_err();
    assert_eq!(err.kind(), AppErrorKind::Scheduler);
    assert!(matches!(
        stage_of(&h.store, "sim1").await,
        LifecycleStage::Failed { .. }
    ));
}

#[tokio::test]
async fn completion_syncs_outputs_before_removing_scratch() {
    let h = harness();
    h.orchestrator.create_job(sim1()).await.unwrap();
    h.orchestrator.submit_job("sim1").await.unwrap();

    h.cluster.set_queue_state(Some("RUNNING"));
    let state = h.orchestrator.poll_job("sim1").await.unwrap();
    assert_eq!(state, SchedulerState::Running);
    assert_eq!(stage_of(&h.store, "sim1").await, LifecycleStage::Monitoring);

    h.cluster.set_queue_state(None);
    h.cluster.set_accounting_state(Some("COMPLETED"));
    let state = h.orchestrator.poll_job("sim1").await.unwrap();
    assert_eq!(state, SchedulerState::Completed);
    assert_eq!(stage_of(&h.store, "sim1").await, LifecycleStage::Completing);

    let sync = h
        .cluster
        .call_index("cp -r '/scratch/alpine/alice/namdrunner_jobs/sim1'/.")
        .unwrap();
    let cleanup = h
        .cluster
        .call_index("delete /scratch/alpine/alice/namdrunner_jobs/sim1")
        .unwrap();
    assert!(
        sync < cleanup,
        "outputs must be synced back before scratch is removed"
    );
}

#[tokio::test]
async fn delete_cancels_an_active_job_and_removes_both_tiers() {
    let h = harness();
    h.orchestrator.create_job(sim1()).await.unwrap();
    h.orchestrator.submit_job("sim1").await.unwrap();
    h.cluster.set_queue_state(Some("RUNNING"));
    h.orchestrator.poll_job("sim1").await.unwrap();

    h.orchestrator.delete_job("sim1").await.unwrap();

    let calls = h.cluster.calls();
    assert!(calls.contains(&"exec scancel 4821".to_string()));
    assert!(calls.contains(&"delete /scratch/alpine/alice/namdrunner_jobs/sim1".to_string()));
    assert!(calls.contains(&"delete /projects/alice/namdrunner_jobs/sim1".to_string()));
    assert!(h.store.get("sim1").await.unwrap().is_none());
}

#[tokio::test]
async fn delete_of_a_finished_job_skips_cancellation() {
    let h = harness();
    h.orchestrator.create_job(sim1()).await.unwrap();
    h.orchestrator.submit_job("sim1").await.unwrap();
    h.cluster.set_queue_state(None);
    h.cluster.set_accounting_state(Some("COMPLETED"));
    h.orchestrator.poll_job("sim1").await.unwrap();

    h.orchestrator.delete_job("sim1").await.unwrap();
    assert!(h.cluster.call_index("scancel").is_none());
}

#[tokio::test]
async fn resume_returns_interrupted_submissions_to_monitoring() {
    let h = harness();
    h.orchestrator.create_job(sim1()).await.unwrap();
    // Simulate a crash after sbatch succeeded but before the stage advanced.
    h.store.set_scheduler_id("sim1", 4821).await.unwrap();
    h.store
        .update_stage("sim1", &LifecycleStage::Syncing)
        .await
        .unwrap();

    let resumed = h.orchestrator.resume_jobs().await.unwrap();
    assert_eq!(resumed, vec!["sim1".to_string()]);
    assert_eq!(stage_of(&h.store, "sim1").await, LifecycleStage::Monitoring);
}

#[tokio::test]
async fn poll_sweep_only_touches_monitoring_jobs() {
    let h = harness();
    h.orchestrator.create_job(sim1()).await.unwrap();
    h.orchestrator
        .create_job(NewJob {
            job_id: "sim2".to_string(),
            username: "alice".to_string(),
            input_files: vec![],
        })
        .await
        .unwrap();
    h.orchestrator.submit_job("sim2").await.unwrap();
    h.cluster.set_queue_state(Some("PENDING"));

    h.orchestrator.poll_active_jobs().await;

    assert_eq!(stage_of(&h.store, "sim1").await, LifecycleStage::Created);
    let sim2 = h.store.get("sim2").await.unwrap().unwrap();
    assert_eq!(sim2.scheduler_state.as_deref(), Some("PENDING"));
}

#[tokio::test]
async fn completion_tolerates_a_rerun_after_scratch_is_gone() {
    let h = harness();
    h.orchestrator.create_job(sim1()).await.unwrap();
    h.orchestrator.submit_job("sim1").await.unwrap();
    h.cluster.set_queue_state(None);
    h.cluster.set_accounting_state(Some("COMPLETED"));
    h.orchestrator.poll_job("sim1").await.unwrap();
    assert_eq!(stage_of(&h.store, "sim1").await, LifecycleStage::Completing);

    // Scratch was already removed. Rewind the stage as if the daemon died
    // before the Completing write landed, then poll again.
    h.store
        .update_stage("sim1", &LifecycleStage::Monitoring)
        .await
        .unwrap();

    let state = h.orchestrator.poll_job("sim1").await.unwrap();
    assert_eq!(state, SchedulerState::Completed);
    assert_eq!(stage_of(&h.store, "sim1").await, LifecycleStage::Completing);

    // Only the first completion ran the output sync; the rerun skipped it.
    let syncs = h
        .cluster
        .calls()
        .iter()
        .filter(|c| c.contains("cp -r '/scratch"))
        .count();
    assert_eq!(syncs, 1);
}

#[tokio::test]
async fn create_survives_a_transient_metadata_upload_failure() {
    let h = harness_with(fast_retries());
    *h.cluster.upload_failures.lock().unwrap() = 1;

    let record = h.orchestrator.create_job(sim1()).await.unwrap();
    assert_eq!(record.stage, LifecycleStage::Created);
    assert_eq!(stage_of(&h.store, "sim1").await, LifecycleStage::Created);

    let uploads = h
        .cluster
        .calls()
        .iter()
        .filter(|c| c.contains("job.json"))
        .count();
    assert_eq!(uploads, 2);
}

#[tokio::test]
async fn input_upload_survives_a_transient_failure() {
    let h = harness_with(fast_retries());
    h.orchestrator.create_job(sim1()).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let local = dir.path().join("protein.psf");
    std::fs::write(&local, b"psf").unwrap();

    *h.cluster.upload_failures.lock().unwrap() = 1;
    h.orchestrator
        .upload_inputs("sim1", &[local.as_path()])
        .await
        .unwrap();
    assert_eq!(stage_of(&h.store, "sim1").await, LifecycleStage::Uploading);

    let uploads = h
        .cluster
        .calls()
        .iter()
        .filter(|c| c.contains("protein.psf"))
        .count();
    assert_eq!(uploads, 2);
}

#[tokio::test]
async fn poll_survives_a_transient_scheduler_query_failure() {
    let h = harness_with(fast_retries());
    h.orchestrator.create_job(sim1()).await.unwrap();
    h.orchestrator.submit_job("sim1").await.unwrap();
    h.cluster.set_queue_state(Some("RUNNING"));

    *h.cluster.exec_failures.lock().unwrap() = 1;
    let state = h.orchestrator.poll_job("sim1").await.unwrap();
    assert_eq!(state, SchedulerState::Running);

    let squeues = h
        .cluster
        .calls()
        .iter()
        .filter(|c| c.contains("squeue"))
        .count();
    assert_eq!(squeues, 2);
}

#[tokio::test]
async fn delete_survives_a_transient_cancel_failure() {
    let h = harness_with(fast_retries());
    h.orchestrator.create_job(sim1()).await.unwrap();
    h.orchestrator.submit_job("sim1").await.unwrap();
    h.cluster.set_queue_state(Some("RUNNING"));
    h.orchestrator.poll_job("sim1").await.unwrap();

    *h.cluster.exec_failures.lock().unwrap() = 1;
    h.orchestrator.delete_job("sim1").await.unwrap();

    let scancels = h
        .cluster
        .calls()
        .iter()
        .filter(|c| c.contains("scancel"))
        .count();
    assert_eq!(scancels, 2);
    assert!(h.store.get("sim1").await.unwrap().is_none());
}
