//! envcheck - environment leak detection sidecar for CI jobs.
//!
//! This is the main entry point that:
//! - Initializes structured logging
//! - Loads configuration and creates the Kubernetes client
//! - Starts the health server (ready once the before-snapshot is captured)
//! - Captures the before-snapshot, waits for SIGTERM/SIGINT, then captures
//!   the after-snapshot and prints the delta report as JSON on stdout
//!
//! Exit status: 0 when nothing leaked, 1 when the report has entries, 2 when
//! no report could be produced (snapshot unavailable, bad configuration).

use std::process::ExitCode;
use std::sync::Arc;

use kube::Client;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use cluster_envcheck::health::{HealthState, Metrics, run_health_server};
use cluster_envcheck::{
    DeltaReport, EnvCheckConfig, EnvironmentCheck, Error, KubeResourceLister, Result,
};

const EXIT_CLEAN: u8 = 0;
const EXIT_LEAKED: u8 = 1;
const EXIT_NO_REPORT: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = init_tracing() {
        eprintln!("failed to initialise logging: {e}");
        return ExitCode::from(EXIT_NO_REPORT);
    }

    info!("Starting envcheck");

    match run().await {
        Ok(report) => match serde_json::to_string_pretty(&report) {
            Ok(json) => {
                println!("{json}");
                if report.is_empty() {
                    info!("No leaked resources");
                    ExitCode::from(EXIT_CLEAN)
                } else {
                    warn!(entries = report.entry_count(), summary = %report.summary(), "Environment changed");
                    ExitCode::from(EXIT_LEAKED)
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to serialize report");
                ExitCode::from(EXIT_NO_REPORT)
            }
        },
        Err(e) => {
            error!(error = %e, "Environment check failed");
            ExitCode::from(EXIT_NO_REPORT)
        }
    }
}

fn init_tracing() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cluster_envcheck=info".parse()?)
                .add_directive("envcheck=info".parse()?)
                .add_directive("kube=info".parse()?),
        )
        .json()
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

async fn run() -> Result<DeltaReport> {
    let config = EnvCheckConfig::load()?;
    let policy = config.exclusion_policy()?;

    let client = Client::try_default().await.map_err(Error::from_kube)?;
    info!(
        namespace = config.namespace.as_deref().unwrap_or("cluster-wide"),
        kinds = config.kinds.len(),
        "Connected to Kubernetes cluster"
    );

    let metrics = Arc::new(Metrics::new());
    let health_state = Arc::new(HealthState::with_metrics(metrics.clone()));
    {
        let health_state = health_state.clone();
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, port).await {
                error!("Health server error: {}", e);
            }
        });
    }

    let cancel = CancellationToken::new();
    let check = EnvironmentCheck::from_config(
        Arc::new(KubeResourceLister::new(client)),
        &config,
    )?
    .with_metrics(metrics)
    .with_cancellation(cancel.clone());

    let begin = check.begin();
    tokio::pin!(begin);
    let mut handle = tokio::select! {
        result = &mut begin => result?,
        _ = shutdown_signal() => {
            warn!("Shutdown requested before the before-snapshot was captured");
            cancel.cancel();
            begin.await?
        }
    };

    health_state.set_ready(true).await;
    info!(check_id = %handle.id(), "Before-snapshot captured, waiting for shutdown signal");

    shutdown_signal().await;
    info!(check_id = %handle.id(), "Received shutdown signal, capturing after-snapshot");
    health_state.set_ready(false).await;

    check.end(&mut handle, &policy).await
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
///
/// If a handler cannot be installed, that signal source never fires and the
/// other one is still honoured.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
