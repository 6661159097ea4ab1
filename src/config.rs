// SPDX-License-Identifier: AGPL-3.0-only

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

const APP_DIR_NAME: &str = "namdrunnerd";
const CONFIG_FILE_NAME: &str = "namdrunnerd.toml";
const DATABASE_FILE_NAME: &str = "namdrunnerd.sqlite";
const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;
const DEFAULT_KEEPALIVE_SECS: u64 = 15;
const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_CLEANUP_AGE_DAYS: u64 = 30;

#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    database_path: Option<String>,
    poll_interval_secs: Option<u64>,
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    keepalive_secs: Option<u64>,
    cleanup_age_days: Option<u64>,
}

#[derive(Debug)]
pub struct Config {
    pub database_path: PathBuf,
    pub poll_interval_secs: u64,
    pub host: Option<String>,
    pub port: u16,
    pub username: Option<String>,
    pub keepalive_secs: u64,
    /// Scratch job directories older than this are swept at startup.
    pub cleanup_age_days: u64,
    pub config_path: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct Overrides {
    pub database_path: Option<PathBuf>,
    pub poll_interval_secs: Option<u64>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub keepalive_secs: Option<u64>,
    pub cleanup_age_days: Option<u64>,
}

pub fn load(config_path_override: Option<PathBuf>, overrides: Overrides) -> Result<Config> {
    let required = config_path_override.is_some();
    let config_path = match config_path_override {
        Some(path) => Some(expand_path(path)),
        None => default_config_path().ok(),
    };

    let file_config = match config_path.as_deref() {
        Some(path) => read_config_file(path, required)?,
        None => FileConfig::default(),
    };

    let database_path = match overrides.database_path {
        Some(path) => expand_path(path),
        None => match file_config.database_path {
            Some(raw) => resolve_path(
                &raw,
                config_path.as_deref().and_then(|path| path.parent()),
            ),
            None => default_database_path().with_context(|| {
                "failed to resolve default database path; specify --database-path or set database_path in the config file"
            })?,
        },
    };

    Ok(Config {
        database_path,
        poll_interval_secs: overrides
            .poll_interval_secs
            .or(file_config.poll_interval_secs)
            .unwrap_or(DEFAULT_POLL_INTERVAL_SECS),
        host: overrides.host.or(file_config.host),
        port: overrides.port.or(file_config.port).unwrap_or(DEFAULT_SSH_PORT),
        username: overrides.username.or(file_config.username),
        keepalive_secs: overrides
            .keepalive_secs
            .or(file_config.keepalive_secs)
            .unwrap_or(DEFAULT_KEEPALIVE_SECS),
        cleanup_age_days: overrides
            .cleanup_age_days
            .or(file_config.cleanup_age_days)
            .unwrap_or(DEFAULT_CLEANUP_AGE_DAYS),
        config_path,
    })
}

pub fn ensure_database_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create database directory {}", parent.display()))?;
    }
    Ok(())
}

fn read_config_file(path: &Path, required: bool) -> Result<FileConfig> {
    if !path.exists() {
        if required {
            anyhow::bail!("config file not found at {}", path.display());
        }
        return Ok(FileConfig::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn resolve_path(raw: &str, base_dir: Option<&Path>) -> PathBuf {
    let expanded = shellexpand::tilde(raw);
    let path = PathBuf::from(expanded.as_ref());
    if path.is_absolute() {
        return path;
    }
    match base_dir {
        Some(dir) => dir.join(path),
        None => path,
    }
}

fn expand_path(path: PathBuf) -> PathBuf {
    let path_string = path.to_string_lossy().to_string();
    let expanded = shellexpand::tilde(&path_string);
    PathBuf::from(expanded.as_ref())
}

fn default_config_path() -> Result<PathBuf> {
    Ok(default_config_dir()?.join(CONFIG_FILE_NAME))
}

fn default_database_path() -> Result<PathBuf> {
    Ok(default_data_dir()?.join(DATABASE_FILE_NAME))
}

fn default_config_dir() -> Result<PathBuf> {
    let base = dirs::config_dir().context("failed to resolve config directory")?;
    Ok(base.join(APP_DIR_NAME))
}

fn default_data_dir() -> Result<PathBuf> {
    let base = dirs::data_dir().context("failed to resolve data directory")?;
    Ok(base.join(APP_DIR_NAME))
}
