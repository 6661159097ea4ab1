// SPDX-License-Identifier: AGPL-3.0-only

//! SLURM command building and output parsing. Pure functions; the scheduler
//! adapter runs the commands and feeds the output back through here.

use crate::app::services::shell::sh_escape;
use crate::app::types::SchedulerState;

/// Parse the sbatch confirmation line, e.g. `Submitted batch job 4821`.
///
/// Strict: anything that does not match the expected shape (extra tokens,
/// non-numeric id, missing prefix) is rejected so a garbled submission is
/// never mistaken for a successful one.
pub fn parse_submission(output: &str) -> Option<i64> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty())?;
    let rest = line.strip_prefix("Submitted batch job ")?;
    if rest.is_empty() || !rest.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    rest.parse::<i64>().ok()
}

/// Normalize a raw SLURM state token. squeue/sacct decorate states with
/// suffixes like `PENDING+`, `CANCELLED by 1234`, `FAILED:127`; the base
/// token is what we classify on.
pub fn normalize_state(raw: &str) -> String {
    let token = raw.split_whitespace().next().unwrap_or("");
    let end = token
        .find(|c| c == '+' || c == ':' || c == '(')
        .unwrap_or(token.len());
    token[..end].to_ascii_uppercase()
}

pub fn map_state(raw: &str) -> SchedulerState {
    match normalize_state(raw).as_str() {
        "PENDING" | "CONFIGURING" | "REQUEUED" | "RESIZING" | "SUSPENDED" => {
            SchedulerState::Pending
        }
        "RUNNING" | "COMPLETING" => SchedulerState::Running,
        "COMPLETED" => SchedulerState::Completed,
        "FAILED" | "BOOT_FAIL" | "NODE_FAIL" | "OUT_OF_MEMORY" | "PREEMPTED" => {
            SchedulerState::Failed
        }
        "CANCELLED" | "DEADLINE" | "REVOKED" => SchedulerState::Cancelled,
        "TIMEOUT" => SchedulerState::Timeout,
        _ => SchedulerState::Unknown,
    }
}

pub fn sbatch_command(script_path: &str, workdir: &str) -> String {
    format!(
        "sbatch --chdir={} {}",
        sh_escape(workdir),
        sh_escape(script_path)
    )
}

pub fn squeue_command(scheduler_id: i64) -> String {
    format!("squeue -h -j {scheduler_id} -o %T")
}

/// Fallback for jobs that have already left the queue.
pub fn sacct_command(scheduler_id: i64) -> String {
    format!("sacct -n -X -j {scheduler_id} -o State")
}

pub fn scancel_command(scheduler_id: i64) -> String {
    format!("scancel {scheduler_id}")
}
