// SPDX-License-Identifier: AGPL-3.0-only

//! Remote path construction and containment checks. Every path that crosses
//! the remote boundary is built or validated here; nothing else in the crate
//! concatenates path strings by hand.

use std::collections::HashMap;

use rand::Rng;

use crate::app::errors::{AppError, AppResult};
use crate::app::types::JobPaths;

pub const PROJECT_ROOT_TEMPLATE: &str = "/projects/{username}/namdrunner_jobs";
pub const SCRATCH_ROOT_TEMPLATE: &str = "/scratch/alpine/{username}/namdrunner_jobs";

pub const CONFIG_FILE_NAME: &str = "job.json";
pub const SLURM_SCRIPT_NAME: &str = "job.slurm";

const MAX_PATH_LEN: usize = 1000;

/// Replace `{key}` placeholders with values from `vars`. Unknown placeholders
/// are left as-is so a typo surfaces in validation instead of vanishing.
pub fn expand_path(template: &str, vars: &HashMap<&str, &str>) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

/// Reduce an arbitrary identifier to the `[A-Za-z0-9_-]` allow-list.
///
/// Disallowed characters become `_`, runs of `_` collapse (literal ones
/// included), and leading or trailing `_`/`-` are trimmed. If nothing
/// survives, a random identifier is generated so the result is always usable
/// as a path segment.
pub fn sanitize_identifier(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_underscore = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() || c == '-' {
            out.push(c);
            last_underscore = false;
        } else if !last_underscore {
            out.push('_');
            last_underscore = true;
        }
    }
    let trimmed = out.trim_matches(|c| c == '_' || c == '-');
    if trimmed.is_empty() {
        return generated_identifier();
    }
    trimmed.to_string()
}

fn generated_identifier() -> String {
    const CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    let mut rng = rand::rng();
    let suffix: String = (0..8)
        .map(|_| CHARS[rng.random_range(0..CHARS.len())] as char)
        .collect();
    format!("job_{suffix}")
}

/// Reject any path we would not hand to a remote shell or SFTP call. Each
/// rule is named in the error so failures are diagnosable from the log line.
pub fn validate_path(path: &str) -> AppResult<()> {
    if !path.starts_with('/') {
        return Err(AppError::validation(format!("path is not absolute: {path}")));
    }
    if path.len() >= MAX_PATH_LEN {
        return Err(AppError::validation(format!(
            "path exceeds {MAX_PATH_LEN} characters"
        )));
    }
    if path.contains("//") {
        return Err(AppError::validation(format!(
            "path contains empty segment: {path}"
        )));
    }
    if path.chars().any(|c| c.is_control()) {
        return Err(AppError::validation(
            "path contains control characters".to_string(),
        ));
    }
    for segment in path.split('/') {
        if segment == "." || segment == ".." {
            return Err(AppError::validation(format!(
                "path contains traversal segment: {path}"
            )));
        }
    }
    if path.len() > 1 && path.ends_with('/') {
        return Err(AppError::validation(format!(
            "path has trailing slash: {path}"
        )));
    }
    Ok(())
}

fn roots_for(username: &str) -> (String, String) {
    let vars = HashMap::from([("username", username)]);
    (
        expand_path(PROJECT_ROOT_TEMPLATE, &vars),
        expand_path(SCRATCH_ROOT_TEMPLATE, &vars),
    )
}

pub fn project_root(username: &str) -> String {
    roots_for(username).0
}

pub fn scratch_root(username: &str) -> String {
    roots_for(username).1
}

/// Derive every remote path for one job. Inputs are sanitized first, so the
/// output is always validation-clean.
pub fn job_paths(username: &str, job_id: &str) -> AppResult<JobPaths> {
    let username = sanitize_identifier(username);
    let job_id = sanitize_identifier(job_id);

    let (project, scratch) = roots_for(&username);
    let job_dir = format!("{project}/{job_id}");
    let paths = JobPaths {
        inputs_dir: format!("{job_dir}/input_files"),
        outputs_dir: format!("{job_dir}/outputs"),
        logs_dir: format!("{job_dir}/logs"),
        scratch_dir: format!("{scratch}/{job_id}"),
        config_file: format!("{job_dir}/{CONFIG_FILE_NAME}"),
        slurm_script: format!("{job_dir}/{SLURM_SCRIPT_NAME}"),
        job_dir,
    };

    validate_path(&paths.job_dir)?;
    validate_path(&paths.scratch_dir)?;
    Ok(paths)
}

/// Containment check performed immediately before any destructive remote
/// operation. The allowed prefixes are recomputed here from the username
/// rather than trusted from any earlier derivation, so a corrupted stored
/// path can never widen the blast radius.
pub fn is_path_allowed(path: &str, username: &str) -> bool {
    if validate_path(path).is_err() {
        return false;
    }
    let username = sanitize_identifier(username);
    let (project, scratch) = roots_for(&username);
    // Strictly below the root, never the root itself.
    [project, scratch]
        .iter()
        .any(|root| path.starts_with(&format!("{root}/")) && path.len() > root.len() + 1)
}
