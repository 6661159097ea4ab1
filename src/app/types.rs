// SPDX-License-Identifier: AGPL-3.0-only

use std::time::Duration;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Lifecycle of the single logical SSH session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Expired,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Expired => "Expired",
        };
        write!(f, "{name}")
    }
}

/// One recorded transition attempt, successful or rejected.
#[derive(Debug, Clone)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
    pub at: OffsetDateTime,
    pub reason: String,
    pub success: bool,
}

/// Connection metadata only. Credential material is never stored here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    pub host: String,
    pub username: String,
    pub connected_at: OffsetDateTime,
}

/// Backoff knobs, immutable per call site.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Fraction of the computed delay used as uniform ± noise, to avoid a
    /// thundering herd against the cluster.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter_ratio: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, no backoff. For operations that are not idempotent and
    /// must not be silently re-run.
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

/// All remote paths for one job, derived deterministically from
/// {username, job_id}. Never hand-built anywhere else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobPaths {
    pub job_dir: String,
    pub inputs_dir: String,
    pub outputs_dir: String,
    pub logs_dir: String,
    pub scratch_dir: String,
    pub config_file: String,
    pub slurm_script: String,
}

/// Partial-success record for a batch of directory creations.
#[derive(Debug, Clone, Default)]
pub struct DirectorySetupResult {
    pub created: Vec<String>,
    pub existed: Vec<String>,
    pub errors: Vec<String>,
}

/// Partial-success record for an old-job cleanup sweep.
#[derive(Debug, Clone, Default)]
pub struct CleanupResult {
    pub scanned: usize,
    pub cleaned: usize,
    pub failed: usize,
    pub errors: Vec<String>,
}

/// Durable per-job automation stage. Advances forward or into `Failed`,
/// never silently backwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "detail")]
pub enum LifecycleStage {
    Created,
    Uploading,
    Submitting,
    Syncing,
    Monitoring,
    Completing,
    CleanedUp,
    Failed { at: String, reason: String },
}

impl LifecycleStage {
    pub fn label(&self) -> &'static str {
        match self {
            LifecycleStage::Created => "Created",
            LifecycleStage::Uploading => "Uploading",
            LifecycleStage::Submitting => "Submitting",
            LifecycleStage::Syncing => "Syncing",
            LifecycleStage::Monitoring => "Monitoring",
            LifecycleStage::Completing => "Completing",
            LifecycleStage::CleanedUp => "CleanedUp",
            LifecycleStage::Failed { .. } => "Failed",
        }
    }

    pub fn failed(at: &LifecycleStage, reason: impl Into<String>) -> Self {
        LifecycleStage::Failed {
            at: at.label().to_string(),
            reason: reason.into(),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            LifecycleStage::Created => 0,
            LifecycleStage::Uploading => 1,
            LifecycleStage::Submitting => 2,
            LifecycleStage::Syncing => 3,
            LifecycleStage::Monitoring => 4,
            LifecycleStage::Completing => 5,
            LifecycleStage::CleanedUp => 6,
            LifecycleStage::Failed { .. } => u8::MAX,
        }
    }

    /// Forward-only progression. Re-recording the current stage is permitted
    /// (re-entry after a restart), as is any move into `Failed`. A `Failed`
    /// job only moves on an explicit caller action: a retry of the failed
    /// stage or a deletion. `CleanedUp` is final.
    pub fn can_advance_to(&self, next: &LifecycleStage) -> bool {
        match (self, next) {
            (LifecycleStage::CleanedUp, _) => false,
            (_, LifecycleStage::Failed { .. }) => true,
            (LifecycleStage::Failed { .. }, _) => true,
            _ => next.rank() >= self.rank(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            LifecycleStage::CleanedUp | LifecycleStage::Failed { .. }
        )
    }

    /// Stages the startup resume pass should pick back up.
    pub fn is_resumable(&self) -> bool {
        !self.is_terminal() && !matches!(self, LifecycleStage::Completing)
    }
}

/// Payload for creating a job record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub job_id: String,
    pub username: String,
    /// Declared local input files, uploaded into `input_files/`.
    pub input_files: Vec<String>,
}

/// Full stored job record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub id: i64,
    pub job_id: String,
    pub username: String,
    pub stage: LifecycleStage,
    /// Scheduler-assigned id, known after submission.
    pub scheduler_id: Option<i64>,
    pub scheduler_state: Option<String>,
    pub input_files: Vec<String>,
    pub created_at: String, // RFC3339
    pub updated_at: String, // RFC3339
}

/// External scheduler state, normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Timeout,
    Unknown,
}

impl SchedulerState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SchedulerState::Completed
                | SchedulerState::Failed
                | SchedulerState::Cancelled
                | SchedulerState::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SchedulerState::Pending => "PENDING",
            SchedulerState::Running => "RUNNING",
            SchedulerState::Completed => "COMPLETED",
            SchedulerState::Failed => "FAILED",
            SchedulerState::Cancelled => "CANCELLED",
            SchedulerState::Timeout => "TIMEOUT",
            SchedulerState::Unknown => "UNKNOWN",
        }
    }
}

/// One remote directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub is_dir: bool,
    pub modified: Option<OffsetDateTime>,
}

/// Captured output of a remote command.
#[derive(Debug, Clone)]
pub struct ExecCapture {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

impl ExecCapture {
    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}
