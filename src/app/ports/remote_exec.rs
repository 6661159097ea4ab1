// SPDX-License-Identifier: AGPL-3.0-only

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;

use crate::app::errors::AppResult;
use crate::app::types::{ExecCapture, FileInfo};

/// Everything the core needs from the remote host. The SSH adapter is the
/// production implementation; tests substitute fakes.
#[async_trait]
pub trait RemoteExecPort: Send + Sync {
    /// Run a command on the remote host and capture stdout/stderr/exit code.
    /// A non-zero exit code is not an error at this boundary.
    async fn execute_command(&self, command: &str, timeout: Duration) -> AppResult<ExecCapture>;

    async fn upload_file(&self, local: &Path, remote: &str) -> AppResult<()>;

    async fn download_file(&self, remote: &str, local: &Path) -> AppResult<()>;

    async fn list_files(&self, remote_dir: &str) -> AppResult<Vec<FileInfo>>;

    /// True if the path exists on the remote host, file or directory.
    async fn exists(&self, remote: &str) -> AppResult<bool>;

    /// Create a directory, including missing parents. Succeeds if it already
    /// exists.
    async fn create_directory(&self, remote: &str) -> AppResult<()>;

    /// Recursive delete. Callers are responsible for path containment checks
    /// before reaching this boundary.
    async fn delete_recursive(&self, remote: &str) -> AppResult<()>;
}
