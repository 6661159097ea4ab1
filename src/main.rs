// SPDX-License-Identifier: AGPL-3.0-only

use std::io::Write;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::time::Duration;

use namdrunnerd::adapters::db::SqliteJobStore;
use namdrunnerd::adapters::slurm::SlurmScheduler;
use namdrunnerd::adapters::ssh::{SessionManager, SshParams, SshRemoteExec};
use namdrunnerd::adapters::time::SystemClock;
use namdrunnerd::app::orchestrator::JobAutomationOrchestrator;
use namdrunnerd::app::services::connection::ConnectionStateMachine;
use namdrunnerd::app::types::{ConnectionState, RetryPolicy, SessionInfo};
use namdrunnerd::{config, logging};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Opts {
    /// Path to the TOML config file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    database_path: Option<PathBuf>,

    /// Seconds between scheduler polls for active jobs.
    #[arg(long)]
    poll_interval_secs: Option<u64>,

    /// Cluster login node, e.g. login.cluster.edu
    #[arg(short = 'H', long)]
    host: Option<String>,

    #[arg(short, long)]
    port: Option<u16>,

    #[arg(short, long)]
    username: Option<String>,

    #[arg(long)]
    keepalive_secs: Option<u64>,

    /// Scratch job directories older than this many days are swept at startup.
    #[arg(long)]
    cleanup_age_days: Option<u64>,

    #[arg(short, long)]
    verbose: bool,
}

/// Read the password from stdin. It lives on the stack of this call chain
/// and in the SSH handshake only; nothing stores it.
async fn prompt_password(username: &str, host: &str) -> anyhow::Result<String> {
    let prompt = format!("{username}@{host} password: ");
    tokio::task::spawn_blocking(move || -> anyhow::Result<String> {
        print!("{prompt}");
        std::io::stdout().flush()?;
        let mut s = String::new();
        std::io::stdin().read_line(&mut s)?;
        while s.ends_with('\n') || s.ends_with('\r') {
            s.pop();
        }
        Ok(s)
    })
    .await?
}

async fn resolve_addr(host: &str, port: u16) -> anyhow::Result<SocketAddr> {
    tokio::net::lookup_host((host, port))
        .await
        .with_context(|| format!("failed to resolve {host}:{port}"))?
        .next()
        .with_context(|| format!("no addresses for {host}:{port}"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    logging::init(opts.verbose);

    let config = config::load(
        opts.config,
        config::Overrides {
            database_path: opts.database_path,
            poll_interval_secs: opts.poll_interval_secs,
            host: opts.host,
            port: opts.port,
            username: opts.username,
            keepalive_secs: opts.keepalive_secs,
            cleanup_age_days: opts.cleanup_age_days,
        },
    )?;

    let Some(host) = config.host.clone() else {
        bail!("no cluster host configured; pass --host or set host in the config file");
    };
    let Some(username) = config.username.clone() else {
        bail!("no username configured; pass --username or set username in the config file");
    };

    config::ensure_database_dir(&config.database_path)?;
    let store = Arc::new(SqliteJobStore::open(&config.database_path).await?);

    let clock = Arc::new(SystemClock);
    let machine = Arc::new(ConnectionStateMachine::new(clock.clone()));
    let addr = resolve_addr(&host, config.port).await?;
    let session = Arc::new(SessionManager::new(SshParams {
        addr,
        username: username.clone(),
        keepalive_secs: config.keepalive_secs,
    }));

    machine.transition_to(ConnectionState::Connecting, "daemon startup")?;
    let password = prompt_password(&username, &host).await?;
    if let Err(err) = session.connect(&password).await {
        machine.record_connect_failure(&err.to_string());
        machine.transition_to(ConnectionState::Disconnected, "connect failed")?;
        return Err(err.context("could not establish the cluster session"));
    }
    drop(password);
    machine.transition_to(ConnectionState::Connected, "authenticated")?;
    machine.set_session(SessionInfo {
        host: host.clone(),
        username: username.clone(),
        connected_at: time::OffsetDateTime::now_utc(),
    });

    let exec = Arc::new(SshRemoteExec::new(session.clone()));
    let scheduler = Arc::new(SlurmScheduler::new(exec.clone()));
    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);

    let orchestrator = Arc::new(JobAutomationOrchestrator::new(
        exec,
        scheduler,
        store,
        clock.clone(),
        RetryPolicy::default(),
        cancel_rx,
    ));

    let resumed = orchestrator.resume_jobs().await?;
    if !resumed.is_empty() {
        tracing::info!(count = resumed.len(), "resumed jobs from last run");
    }

    let max_age = Duration::from_secs(config.cleanup_age_days * 86_400);
    match orchestrator.lifecycle().cleanup_old_jobs(&username, max_age).await {
        Ok(report) => tracing::info!(
            scanned = report.scanned,
            cleaned = report.cleaned,
            failed = report.failed,
            "scratch cleanup sweep done"
        ),
        Err(err) => tracing::warn!(error = %err, "scratch cleanup sweep failed"),
    }

    let poller = orchestrator.clone();
    let poll_machine = machine.clone();
    let poll_session = session.clone();
    let interval = Duration::from_secs(config.poll_interval_secs);
    let max_idle = Duration::from_secs(config.keepalive_secs * 4);
    let poll_task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if poll_session.needs_connect().await
                && poll_machine.state() == ConnectionState::Connected
            {
                let _ = poll_machine.transition_to(ConnectionState::Expired, "ssh handle closed");
                continue;
            }
            if poll_machine.is_idle_too_long(max_idle) {
                let _ = poll_machine.transition_to(ConnectionState::Expired, "session idle");
                continue;
            }
            poller.poll_active_jobs().await;
            poll_machine.touch_activity();
        }
    });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    let _ = cancel_tx.send(true);
    poll_task.abort();
    session.shutdown().await;
    machine.transition_to(ConnectionState::Disconnected, "daemon shutdown")?;
    Ok(())
}
