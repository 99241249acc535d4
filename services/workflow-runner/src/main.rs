//! Workflow Runner
//!
//! Single-binary batch runner that:
//! 1. Loads a list of item identifiers
//! 2. Runs a configured command for each, at most `max_concurrency` at once
//! 3. Leases one pooled credential per attempt and retries upstream failures
//! 4. Checkpoints unstarted items as interrupted on SIGINT/SIGTERM

mod command;
mod config;
mod metrics;

use anyhow::{Context, Result};
use credential_pool::Pool;
use runner::{Coordinator, RunReport, WorkContext};
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::command::CommandRunner;
use crate::config::{Config, LogFormat};

/// Exit status when the run was cut short by a signal (128 + SIGINT).
const EXIT_INTERRUPTED: u8 = 130;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // CLI: simple --config / --dry-run flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    let loaded = Config::load(&config_path);

    // Logging format comes from the config, so tracing starts once it is read
    init_tracing(
        loaded
            .as_ref()
            .map(|c| c.runner.log_format)
            .unwrap_or_default(),
    );
    info!(path = %config_path.display(), "starting workflow-runner");

    let config = loaded
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    let items = config.load_items().context("failed to load items")?;
    let dry_run = dry_run_enabled(&args, config.runner.dry_run);

    info!(
        items = items.len(),
        max_concurrency = config.runner.max_concurrency,
        credentials = config.runner.credentials.len(),
        program = %config.command.program,
        dry_run,
        "configuration loaded"
    );

    if let Some(addr) = config.metrics.listen_addr {
        metrics::install_exporter(addr)
            .with_context(|| format!("failed to start metrics exporter on {addr}"))?;
        info!(addr = %addr, "serving Prometheus metrics");
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    let mut coordinator = Coordinator::new(config.runner_options())
        .context("invalid runner configuration")?
        .with_shutdown(shutdown.clone());

    let tracking = CancellationToken::new();
    if !config.runner.credentials.is_empty() {
        let pool = Arc::new(Pool::new(
            config.runner.credentials.iter().map(|c| c.expose().clone()),
        ));
        for credential in &config.runner.credentials {
            tracing::debug!(fingerprint = %credential.fingerprint(), "credential loaded");
        }
        tokio::spawn(metrics::track_pool(Arc::clone(&pool), tracking.clone()));
        coordinator = coordinator.with_pool(pool);
    }

    let command = Arc::new(CommandRunner::new(config.command.clone()));
    let report = coordinator
        .execute(
            items,
            move |item: Arc<String>, ctx: WorkContext| {
                let command = Arc::clone(&command);
                async move { command.run(item, ctx).await }
            },
            |id: &String| id.clone(),
            dry_run,
        )
        .await;
    tracking.cancel();

    if let Some(pool) = coordinator.pool() {
        info!(health = %pool.health(), "credential pool at exit");
    }

    if let Some(ref path) = config.runner.report_path {
        write_report(path, &report)?;
        info!(path = %path.display(), "run report written");
    }

    Ok(exit_code(&report))
}

/// Initialize tracing with LOG_LEVEL / RUST_LOG support, writing to stderr.
fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_env("LOG_LEVEL")
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Json => registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init(),
        LogFormat::Pretty => registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init(),
    }
}

/// `--dry-run` on the command line turns dry-run on over the config file.
fn dry_run_enabled(args: &[String], from_config: bool) -> bool {
    from_config || args.iter().any(|a| a == "--dry-run")
}

fn write_report(path: &Path, report: &RunReport) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(report).context("failed to serialize run report")?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))
}

fn exit_code(report: &RunReport) -> ExitCode {
    if report.was_interrupted() {
        ExitCode::from(EXIT_INTERRUPTED)
    } else if report.all_succeeded() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Cancel `shutdown` on the first SIGINT/SIGTERM. Later signals are logged
/// and otherwise ignored; running items always finish.
async fn watch_signals(shutdown: CancellationToken) {
    let mut terminate = Terminate::install();
    loop {
        let signal = tokio::select! {
            result = tokio::signal::ctrl_c() => match result {
                Ok(()) => "SIGINT",
                Err(e) => {
                    error!(error = %e, "failed to listen for Ctrl+C");
                    return;
                }
            },
            () = terminate.recv() => "SIGTERM",
        };

        if shutdown.is_cancelled() {
            warn!(signal, "shutdown already in progress, waiting for running items");
        } else {
            info!(signal, "received signal, finishing running items and skipping the rest");
            shutdown.cancel();
        }
    }
}

#[cfg(unix)]
struct Terminate(Option<tokio::signal::unix::Signal>);

#[cfg(unix)]
impl Terminate {
    fn install() -> Self {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(stream) => Self(Some(stream)),
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                Self(None)
            }
        }
    }

    async fn recv(&mut self) {
        if let Some(stream) = self.0.as_mut()
            && stream.recv().await.is_some()
        {
            return;
        }
        std::future::pending::<()>().await
    }
}

#[cfg(not(unix))]
struct Terminate;

#[cfg(not(unix))]
impl Terminate {
    fn install() -> Self {
        Self
    }

    async fn recv(&mut self) {
        std::future::pending::<()>().await
    }
}
