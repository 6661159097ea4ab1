// SPDX-License-Identifier: AGPL-3.0-only

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use russh::client::{AuthResult, Config};
use russh::ChannelMsg;
use tokio::sync::Mutex;

use crate::adapters::ssh::AuthenticationFailure;

/// Minimal russh client handler. We rely on default implementations.
/// TODO: add actual server key verification
#[derive(Clone, Debug, Default)]
pub(crate) struct ClientHandler;

impl russh::client::Handler for ClientHandler {
    type Error = anyhow::Error;
    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Parameters for establishing the SSH connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SshParams {
    pub addr: SocketAddr,
    pub username: String,
    /// Send keepalives to keep long connections healthy.
    pub keepalive_secs: u64,
}

pub(crate) fn handle_capture_message(
    msg: &ChannelMsg,
    out: &mut Vec<u8>,
    err: &mut Vec<u8>,
    code: &mut i32,
) -> bool {
    match msg {
        ChannelMsg::Data { data } => {
            out.extend_from_slice(data);
            false
        }
        ChannelMsg::ExtendedData { data, ext: 1 } => {
            err.extend_from_slice(data);
            false
        }
        ChannelMsg::ExitStatus { exit_status } => {
            *code = *exit_status as i32;
            false
        }
        ChannelMsg::Close => true,
        _ => false,
    }
}

fn ls_exit_code_to_exists(code: i32) -> bool {
    code == 0
}

/// Manager that owns a single long-lived SSH connection.
pub struct SessionManager {
    params: SshParams,
    config: Arc<Config>,
    // The active handle, protected by a mutex because we serialize command use
    pub(crate) handle: Arc<Mutex<Option<russh::client::Handle<ClientHandler>>>>,
    // Background keepalive task
    keepalive_task_handle: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl SessionManager {
    pub fn new(params: SshParams) -> Self {
        let cfg = Config {
            inactivity_timeout: Some(Duration::from_secs(30)),
            keepalive_interval: Some(Duration::from_secs(params.keepalive_secs)),
            channel_buffer_size: 64,
            window_size: 1024 * 1024,
            ..Default::default()
        };
        Self {
            params,
            config: Arc::new(cfg),
            handle: Arc::new(Mutex::new(None)),
            keepalive_task_handle: Arc::new(Mutex::new(None)),
        }
    }

    /// Connect and authenticate with a password. The password is consumed
    /// here and never stored; reconnecting requires the caller to supply it
    /// again.
    pub async fn connect(&self, password: &str) -> Result<()> {
        let mut handle_field = self.handle.lock().await;
        if let Some(h) = handle_field.as_ref() {
            if !h.is_closed() {
                return Ok(());
            }
        }

        let mut handle =
            russh::client::connect(self.config.clone(), self.params.addr, ClientHandler)
                .await
                .context("tcp/ssh connect")?;

        let auth = handle
            .authenticate_password(&self.params.username, password)
            .await
            .context("password auth request")?;
        if !matches!(auth, AuthResult::Success) {
            return Err(AuthenticationFailure.into());
        }

        *handle_field = Some(handle);
        drop(handle_field);
        self.spawn_keepalive().await;
        tracing::info!(host = %self.params.addr, user = %self.params.username, "ssh session established");
        Ok(())
    }

    async fn spawn_keepalive(&self) {
        let mut task_field = self.keepalive_task_handle.lock().await;
        if let Some(task) = task_field.take() {
            task.abort();
        }
        let handle = self.handle.clone();
        let interval = Duration::from_secs(self.params.keepalive_secs.max(1));
        *task_field = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let guard = handle.lock().await;
                match guard.as_ref() {
                    Some(h) if !h.is_closed() => {}
                    _ => {
                        tracing::warn!("ssh session closed, keepalive task exiting");
                        break;
                    }
                }
            }
        }));
    }

    pub async fn needs_connect(&self) -> bool {
        let handle_field = self.handle.lock().await;
        match handle_field.as_ref() {
            None => true,
            Some(h) if h.is_closed() => true,
            Some(_) => false,
        }
    }

    pub async fn shutdown(&self) {
        if let Some(task) = self.keepalive_task_handle.lock().await.take() {
            task.abort();
        }
        let mut handle_field = self.handle.lock().await;
        let _ = handle_field.take();
    }

    // Execute command over SSH, retrieving stdout, stderr and exit code as output
    pub async fn exec_capture(&self, cmd: &str) -> Result<(Vec<u8>, Vec<u8>, i32)> {
        let guard = self.handle.lock().await;
        let handle = guard.as_ref().ok_or_else(|| anyhow!("SSH handle lost"))?;
        let mut chan = handle.channel_open_session().await?;
        tracing::debug!(cmd, "executing");
        chan.exec(true, cmd).await.context("exec request")?;

        let mut out = Vec::new();
        let mut err = Vec::new();
        let mut code: i32 = 0;
        loop {
            let Some(msg) = chan.wait().await else {
                break;
            };
            if handle_capture_message(&msg, &mut out, &mut err, &mut code) {
                break;
            }
        }

        let _ = chan.close().await;
        Ok((out, err, code))
    }

    /// Existence probe that works uniformly for files and directories.
    pub async fn path_exists(&self, path: &str) -> Result<bool> {
        let command = format!(
            "ls {} 1>&2 2>/dev/null",
            crate::app::services::shell::sh_escape(path)
        );
        let (_, _, code) = self.exec_capture(&command).await?;
        Ok(ls_exit_code_to_exists(code))
    }
}
