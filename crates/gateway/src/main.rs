use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use ar_crypto::CryptoService;
use ar_domain::config::{Config, ConfigSeverity};
use ar_domain::session::SessionStatus;
use ar_gateway::api;
use ar_gateway::hub::HubRegistry;
use ar_gateway::reaper::Reaper;
use ar_gateway::state::AppState;
use ar_sandbox::SandboxManager;
use ar_store::Store;

#[derive(Parser)]
#[command(name = "agentrelay", about = "Relay between chat/code clients and sandboxed agents")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay server (default).
    Serve,
    /// Print a fresh base64 master key for AR_MASTER_KEY.
    GenerateKey,
    /// Print the version.
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => {
            init_tracing();
            run_server(Arc::new(Config::from_env())).await
        }
        Some(Command::GenerateKey) => {
            println!("{}", CryptoService::generate_key());
            Ok(())
        }
        Some(Command::Version) => {
            println!("agentrelay {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Initialize structured JSON tracing (only for the `serve` command).
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,ar_gateway=debug")),
        )
        .json()
        .init();
}

async fn run_server(config: Arc<Config>) -> anyhow::Result<()> {
    tracing::info!("AgentRelay starting");

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!(
            "config validation failed with {} error(s)",
            issues
                .iter()
                .filter(|i| i.severity == ConfigSeverity::Error)
                .count()
        );
    }

    // ── Crypto service ───────────────────────────────────────────────
    let crypto = Arc::new(
        CryptoService::from_config(&config.crypto).context("initializing crypto service")?,
    );
    tracing::info!(key_version = crypto.current_version(), "crypto service ready");

    // ── Relational store ─────────────────────────────────────────────
    let db_path = config.dirs.db_path();
    let store = Arc::new(Store::open(&db_path).context("opening relational store")?);
    tracing::info!(path = %db_path.display(), "store ready");

    // ── Sandbox manager + secrets snapshot ───────────────────────────
    let manager = Arc::new(SandboxManager::new(
        config.sandbox.clone(),
        config.dirs.state_dir.clone(),
    ));
    let snapshot = store
        .secrets_as_env(&crypto)
        .context("loading secrets snapshot")?;
    manager.set_secrets(snapshot);
    tracing::info!("sandbox manager ready");

    // ── Hubs ─────────────────────────────────────────────────────────
    let hubs = Arc::new(HubRegistry::new(
        store.clone(),
        manager.clone(),
        config.clone(),
    ));

    // ── Recovery: sandboxes don't survive a relay restart attached ──
    let recovered = recover_sessions(&store)?;
    if recovered > 0 {
        tracing::info!(recovered, "demoted stale active sessions to idle");
    }

    // ── Idle reaper ──────────────────────────────────────────────────
    let shutdown = CancellationToken::new();
    let reaper = Arc::new(Reaper::new(
        store.clone(),
        manager.clone(),
        hubs.clone(),
        config.reaper.clone(),
    ));
    tokio::spawn(reaper.run(shutdown.clone()));
    tracing::info!(
        interval_ms = config.reaper.check_interval_ms,
        "idle reaper started"
    );

    // ── Concurrency limit (backpressure protection) ──────────────────
    let max_concurrent = std::env::var("AR_MAX_CONCURRENT_REQUESTS")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(256);
    tracing::info!(max_concurrent, "concurrency limit set");

    // ── Router + bind ────────────────────────────────────────────────
    let state = AppState {
        config: config.clone(),
        store,
        crypto,
        manager,
        hubs: hubs.clone(),
    };
    // Dashboard clients are cross-origin; the relay carries no cookies.
    let app = api::router()
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_concurrent))
        .with_state(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding to {addr}"))?;
    tracing::info!(addr = %addr, "AgentRelay listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown(shutdown.clone()))
        .await
        .context("axum server error")?;

    // ── Drain ────────────────────────────────────────────────────────
    tracing::info!("shutting down hubs");
    hubs.shutdown_all(Duration::from_secs(2)).await;
    tracing::info!("AgentRelay stopped");
    Ok(())
}

/// Sessions persisted as `active` have no live channel after a restart;
/// demote them so the next activate rebuilds the sandbox. Sessions still
/// `creating` lost their provisioning task and are marked `error`.
fn recover_sessions(store: &Store) -> anyhow::Result<usize> {
    let mut recovered = 0;
    for session in store.list_sessions_by_status(SessionStatus::Active)? {
        store.update_session_status(&session.id, SessionStatus::Idle)?;
        recovered += 1;
    }
    for session in store.list_sessions_by_status(SessionStatus::Creating)? {
        store.update_session_status(&session.id, SessionStatus::Error)?;
        recovered += 1;
    }
    Ok(recovered)
}

async fn wait_for_shutdown(shutdown: CancellationToken) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    shutdown.cancel();
}
