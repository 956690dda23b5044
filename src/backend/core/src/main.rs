//! Tenant Guard decision server.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use tenantguard_core::{
    api::{self, AppState},
    config::Config,
    engine::{self, AuthorizationEngine},
    telemetry,
};

#[derive(Debug, Parser)]
#[command(name = "tenantguard-server", version, about = "Tenant Guard decision service")]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "TENANTGUARD_CONFIG")]
    config: Option<PathBuf>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Load the configuration, build the engine and exit
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::load()?,
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }

    let telemetry_handle = telemetry::init_telemetry(&config.telemetry)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Tenant Guard");

    let (engine, audit_worker) = engine::bootstrap(&config).await?;
    let engine = Arc::new(engine);

    if args.check {
        tracing::info!(policy_version = engine.policy_version(), "Configuration check passed");
        drop(engine);
        audit_worker.drained().await;
        telemetry_handle.shutdown();
        return Ok(());
    }

    let reload_task = tokio::spawn(reload_on_hangup(engine.clone()));

    let state = AppState::new(engine.clone(), telemetry_handle.metrics.clone())
        .with_operator_token(config.server.operator_token.clone());
    let app = api::build_router(state, &config.server);

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(address = %addr, "Starting HTTP server");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // The audit worker drains once the last engine handle is gone.
    reload_task.abort();
    let _ = reload_task.await;
    drop(engine);

    let pending_wait = config.server.shutdown_timeout;
    if tokio::time::timeout(pending_wait, audit_worker.drained())
        .await
        .is_err()
    {
        tracing::warn!(
            timeout_ms = pending_wait.as_millis() as u64,
            "Audit queue did not drain before shutdown"
        );
    }

    telemetry_handle.shutdown();
    tracing::info!("Server shutdown complete");

    Ok(())
}

/// Re-read the policy file on SIGHUP.
#[cfg(unix)]
async fn reload_on_hangup(engine: Arc<AuthorizationEngine>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(hangup) => hangup,
        Err(e) => {
            tracing::error!(error = %e, "Failed to install SIGHUP handler");
            return;
        }
    };

    while hangup.recv().await.is_some() {
        tracing::info!("SIGHUP received; reloading policy");
        match engine.reload_from_source() {
            Ok(snapshot) => tracing::info!(version = snapshot.version(), "Policy reloaded"),
            Err(e) => e.log(),
        }
    }
}

#[cfg(not(unix))]
async fn reload_on_hangup(_engine: Arc<AuthorizationEngine>) {
    std::future::pending::<()>().await;
}

/// Wait for Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
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

    tracing::info!("Shutdown signal received");
}
