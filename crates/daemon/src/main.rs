//! fsentry daemon
//!
//! Watches a dynamic set of directories for filesystem changes, records
//! qualifying changes into the history store, and answers queries from an
//! external client over a single-slot shared-memory command channel.

mod cli;
mod config;
mod dispatcher;
mod processor;
mod registry;
mod signals;
mod store;
mod watcher;

use clap::Parser;
use cli::{Cli, Command};
use color_eyre::eyre::Result;
use config::Config;
use dispatcher::CommandDispatcher;
use fsentry_protocol::IpcChannel;
use processor::{AuditLog, ChangeProcessor};
use registry::{WatchRegistry, WatcherContext};
use signals::ServiceSignals;
use std::path::PathBuf;
use std::sync::Arc;
use store::{MemoryStore, SharedStore, shared};
use tokio::sync::broadcast;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let config = Config::load(cli.config.as_ref())?.with_log_level(cli.log_level.clone());

    init_logging(&config.daemon.log_level)?;

    match cli.command {
        Command::Start { segment, audit_log } => cmd_start(config, segment, audit_log).await,
    }
}

fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .init();

    Ok(())
}

async fn cmd_start(
    config: Config,
    segment_override: Option<PathBuf>,
    audit_override: Option<PathBuf>,
) -> Result<()> {
    let config = config
        .with_segment(segment_override)
        .with_audit_log(audit_override);
    let segment = config.daemon.segment.clone();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        segment = %segment.display(),
        "Starting fsentryd"
    );

    // Channel first: failing to create the segment or its lock aborts
    // startup entirely.
    let channel = Arc::new(IpcChannel::create(&segment)?);

    let store: SharedStore = shared(MemoryStore::new());
    let signals = Arc::new(ServiceSignals::new());
    let audit = config
        .audit
        .path
        .as_deref()
        .map(AuditLog::open)
        .transpose()?;
    let processor = Arc::new(ChangeProcessor::new(store.clone(), audit));
    let ctx = Arc::new(WatcherContext {
        signals: Arc::clone(&signals),
        processor,
        intervals: config.intervals.watch_intervals(),
    });
    let registry = Arc::new(WatchRegistry::new(tokio::runtime::Handle::current()));

    // Restore watches for the store's persisted directory list.
    for dir in store.lock().all_dirs() {
        registry.add(dir, Arc::clone(&ctx));
    }

    // Create shutdown channel
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel::<()>(1);
    spawn_signal_task(shutdown_tx, Arc::clone(&signals));

    let dispatcher = CommandDispatcher::new(
        Arc::clone(&channel),
        store,
        Arc::clone(&registry),
        Arc::clone(&ctx),
        config.intervals.dispatch_cycle(),
    );
    let mut dispatch_handle = tokio::task::spawn_blocking(move || dispatcher.run());

    let mut dispatch_done = false;
    tokio::select! {
        _ = shutdown_rx.recv() => {}
        result = &mut dispatch_handle => {
            dispatch_done = true;
            report_dispatch_exit(result);
            // The IPC side is down; watchers keep running until a
            // termination signal arrives.
            let _ = shutdown_rx.recv().await;
        }
    }

    tracing::info!("Shutting down");
    signals.shutdown();
    if !dispatch_done {
        report_dispatch_exit(dispatch_handle.await);
    }
    registry.shutdown().await;

    tracing::info!("Daemon stopped");
    Ok(())
}

fn report_dispatch_exit(
    result: Result<Result<(), dispatcher::DispatchError>, tokio::task::JoinError>,
) {
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "dispatch loop failed"),
        Err(e) => tracing::error!(error = %e, "dispatch task panicked"),
    }
}

fn spawn_signal_task(shutdown_tx: broadcast::Sender<()>, signals: Arc<ServiceSignals>) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};

            let mut sigterm = signal(SignalKind::terminate()).expect("Failed to set up SIGTERM");
            let mut sigint = signal(SignalKind::interrupt()).expect("Failed to set up SIGINT");
            let mut pause = signal(SignalKind::user_defined1()).expect("Failed to set up SIGUSR1");
            let mut resume =
                signal(SignalKind::user_defined2()).expect("Failed to set up SIGUSR2");

            loop {
                tokio::select! {
                    _ = sigterm.recv() => {
                        tracing::info!("Received SIGTERM");
                        break;
                    }
                    _ = sigint.recv() => {
                        tracing::info!("Received SIGINT");
                        break;
                    }
                    _ = pause.recv() => {
                        tracing::info!("Received SIGUSR1, pausing");
                        signals.pause();
                    }
                    _ = resume.recv() => {
                        tracing::info!("Received SIGUSR2, resuming");
                        signals.resume();
                    }
                }
            }

            let _ = shutdown_tx.send(());
        }

        #[cfg(not(unix))]
        {
            let _ = &signals;
            tokio::signal::ctrl_c().await.expect("Failed to set up Ctrl+C");
            tracing::info!("Received Ctrl+C");
            let _ = shutdown_tx.send(());
        }
    });
}
