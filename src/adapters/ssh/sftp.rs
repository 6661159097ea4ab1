// SPDX-License-Identifier: AGPL-3.0-only

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use russh_sftp::client::SftpSession;
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use tokio::fs as tokiofs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::app::types::FileInfo;

use super::session::SessionManager;

const UPLOAD_BLOCK_SIZE: usize = 64 * 1024;

/// All parent paths of `remote_dir`, shallowest first, ending with the
/// directory itself.
pub(crate) fn dir_chain(remote_dir: &str) -> Vec<String> {
    let mut chain = Vec::new();
    let mut cur = String::new();
    for segment in remote_dir.split('/').filter(|s| !s.is_empty()) {
        cur.push('/');
        cur.push_str(segment);
        chain.push(cur.clone());
    }
    chain
}

impl SessionManager {
    async fn sftp(&self) -> Result<SftpSession> {
        let guard = self.handle.lock().await;
        let handle = guard
            .as_ref()
            .ok_or_else(|| anyhow!("SSH handle lost before opening SFTP"))?;
        let channel = handle.channel_open_session().await?;
        channel.request_subsystem(true, "sftp").await?;
        let sftp = SftpSession::new(channel.into_stream()).await?;
        Ok(sftp)
    }

    /// Create a directory and any missing parents.
    pub async fn ensure_remote_dir(&self, remote_dir: &str) -> Result<()> {
        let sftp = self.sftp().await?;
        for cur in dir_chain(remote_dir) {
            match sftp.metadata(&cur).await {
                Ok(meta) => {
                    if !meta.is_dir() {
                        return Err(anyhow!("remote path exists but is not a directory: {cur}"));
                    }
                }
                Err(_) => {
                    sftp.create_dir(&cur)
                        .await
                        .context(format!("creating path {}", &cur))?;
                    let attrs = FileAttributes {
                        permissions: Some(0o700),
                        ..Default::default()
                    };
                    if let Err(e) = sftp.set_metadata(&cur, attrs).await {
                        tracing::debug!(path = %cur, error = %e, "could not set directory mode");
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        let sftp = self.sftp().await?;
        tracing::debug!(local = %local_path.display(), remote = remote_path, "uploading over sftp");
        let mut lf = tokiofs::File::open(local_path)
            .await
            .with_context(|| format!("open local file {}", local_path.display()))?;
        let flags = OpenFlags::READ
            .union(OpenFlags::WRITE)
            .union(OpenFlags::CREATE)
            .union(OpenFlags::TRUNCATE);
        let mut rfile = sftp.open_with_flags(remote_path, flags).await?;
        let mut offset = 0u64;
        let mut buf = vec![0u8; UPLOAD_BLOCK_SIZE];
        loop {
            let n = lf.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            rfile.seek(std::io::SeekFrom::Start(offset)).await?;
            rfile.write_all(&buf[..n]).await?;
            offset += n as u64;
        }
        rfile.flush().await?;
        rfile.shutdown().await?;
        Ok(())
    }

    pub async fn download_file(&self, remote_path: &str, local_path: &Path) -> Result<()> {
        let sftp = self.sftp().await?;
        if let Some(parent) = local_path.parent() {
            tokiofs::create_dir_all(parent).await?;
        }
        let mut rfile = sftp.open(remote_path).await?;
        let mut lfile = tokiofs::File::create(local_path).await?;
        tokio::io::copy(&mut rfile, &mut lfile).await?;
        lfile.flush().await?;
        Ok(())
    }

    pub async fn list_dir(&self, remote_dir: &str) -> Result<Vec<FileInfo>> {
        let sftp = self.sftp().await?;
        let base = remote_dir.trim_end_matches('/');
        let entries = sftp.read_dir(base).await?;
        let mut out = Vec::new();
        for entry in entries {
            let name = entry.file_name();
            if name == "." || name == ".." {
                continue;
            }
            let meta = entry.metadata();
            out.push(FileInfo {
                path: format!("{base}/{name}"),
                size: meta.size.unwrap_or(0),
                is_dir: meta.is_dir(),
                modified: meta.mtime.and_then(|t| {
                    time::OffsetDateTime::from_unix_timestamp(i64::from(t)).ok()
                }),
                name,
            });
        }
        Ok(out)
    }
}
