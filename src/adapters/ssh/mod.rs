// SPDX-License-Identifier: AGPL-3.0-only

//! russh-backed implementation of the remote execution boundary. Transport
//! errors are translated into the application taxonomy here, exactly once;
//! layers above never see a raw russh or sftp error.

mod session;
mod sftp;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error as ThisError;

use crate::app::errors::{AppError, AppResult};
use crate::app::ports::RemoteExecPort;
use crate::app::services::shell::sh_escape;
use crate::app::types::{ExecCapture, FileInfo};

pub use session::{SessionManager, SshParams};

#[derive(Debug, ThisError)]
#[error("authentication_failure")]
pub struct AuthenticationFailure;

fn network_error(context: &str, e: anyhow::Error) -> AppError {
    if e.downcast_ref::<AuthenticationFailure>().is_some() {
        return AppError::authentication("the cluster rejected the credentials")
            .with_suggestion("check the username and password and try again");
    }
    AppError::network(format!("{context}: {e:#}"))
        .with_suggestion("check the connection to the cluster and retry")
}

fn file_error(context: &str, e: anyhow::Error) -> AppError {
    if e.downcast_ref::<AuthenticationFailure>().is_some() {
        return AppError::authentication("the cluster rejected the credentials");
    }
    AppError::file_operation(format!("{context}: {e:#}"))
}

pub struct SshRemoteExec {
    session: Arc<SessionManager>,
}

impl SshRemoteExec {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }
}

#[async_trait]
impl RemoteExecPort for SshRemoteExec {
    async fn execute_command(&self, command: &str, timeout: Duration) -> AppResult<ExecCapture> {
        let capture = tokio::time::timeout(timeout, self.session.exec_capture(command))
            .await
            .map_err(|_| {
                AppError::network(format!(
                    "remote command timed out after {}s",
                    timeout.as_secs()
                ))
            })?
            .map_err(|e| network_error("remote command", e))?;
        let (stdout, stderr, exit_code) = capture;
        Ok(ExecCapture {
            stdout,
            stderr,
            exit_code,
        })
    }

    async fn upload_file(&self, local: &Path, remote: &str) -> AppResult<()> {
        self.session
            .upload_file(local, remote)
            .await
            .map_err(|e| file_error("upload", e))
    }

    async fn download_file(&self, remote: &str, local: &Path) -> AppResult<()> {
        self.session
            .download_file(remote, local)
            .await
            .map_err(|e| file_error("download", e))
    }

    async fn list_files(&self, remote_dir: &str) -> AppResult<Vec<FileInfo>> {
        self.session
            .list_dir(remote_dir)
            .await
            .map_err(|e| file_error("list directory", e))
    }

    async fn exists(&self, remote: &str) -> AppResult<bool> {
        self.session
            .path_exists(remote)
            .await
            .map_err(|e| network_error("existence probe", e))
    }

    async fn create_directory(&self, remote: &str) -> AppResult<()> {
        self.session
            .ensure_remote_dir(remote)
            .await
            .map_err(|e| file_error("create directory", e))
    }

    async fn delete_recursive(&self, remote: &str) -> AppResult<()> {
        let cmd = format!("rm -rf -- {}", sh_escape(remote));
        let (_, stderr, code) = self
            .session
            .exec_capture(&cmd)
            .await
            .map_err(|e| network_error("recursive delete", e))?;
        if code != 0 {
            return Err(AppError::file_operation(format!(
                "rm -rf exited {code}: {}",
                String::from_utf8_lossy(&stderr).trim()
            )));
        }
        Ok(())
    }
}
