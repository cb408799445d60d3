//! # qualifyd-broker
//!
//! Interactive terminal broker for the assessment platform.
//!
//! A candidate's browser opens a WebSocket; the broker provisions (or
//! reattaches to) a short-lived terminal pod in the cluster, bridges the
//! socket to an SSH shell inside it, keeps the pod's activity annotation
//! fresh while the session lives, and reaps pods that sit idle past their
//! TTL. When the cluster is unreachable the broker degrades to a fixed
//! terminal host.
//!
//! ## API surface
//!
//! | Method | Path                                             | Auth | Description            |
//! |--------|--------------------------------------------------|------|------------------------|
//! | GET    | `/api/health`                                    | No   | Liveness probe         |
//! | GET    | `/api/terminal/{assessment_id}/pods`             | Yes  | List assessment pods   |
//! | DELETE | `/api/terminal/{assessment_id}/pods/{session_id}`| Yes  | Destroy a pod          |
//! | GET    | `/ws/terminal/{assessment_id}`                   | No*  | Terminal WebSocket     |
//!
//! *The platform authorises the principal against the assessment before
//! routing the upgrade here.
//!
//! ## Architecture
//!
//! ```text
//! main.rs        — entry point, clap, router setup, reaper task, shutdown
//! config.rs      — TOML + env-var configuration
//! hub.rs         — session registry, assessment lock table, shutdown
//! auth.rs        — Bearer token middleware for the admin surface
//! k8s/
//!   mod.rs       — cluster client façade, label/annotation schema
//!   template.rs  — pod template loading and override application
//!   workload.rs  — ensure/heartbeat/destroy/reap policy layer
//! ssh/
//!   mod.rs       — SSH channel: connect with retries, PTY, I/O task
//! ws/
//!   mod.rs       — WebSocket upgrade, session bridge state machine
//!   protocol.rs  — client/server frame sum types
//! routes/
//!   health.rs    — GET /api/health
//!   terminal.rs  — admin pod listing and destruction
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::{middleware, Extension, Router};
use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use qualifyd_broker::auth::{self, ApiKey};
use qualifyd_broker::config::Config;
use qualifyd_broker::hub::BrokerHub;
use qualifyd_broker::k8s::workload::WorkloadManager;
use qualifyd_broker::k8s::Client;
use qualifyd_broker::ssh::HostKeyPolicy;
use qualifyd_broker::state::AppState;
use qualifyd_broker::{routes, ws};

/// Terminal session broker for the assessment platform.
#[derive(Parser)]
#[command(name = "qualifyd-broker", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the broker (default when no subcommand given).
    Serve {
        /// Path to TOML config file.
        #[arg(long)]
        config: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let config_path = match cli.command {
        Some(Commands::Serve { config }) => config,
        None => None,
    };
    run_server(config_path.as_deref()).await;
}

async fn run_server(config_path: Option<&str>) {
    let config = Config::load(config_path);

    // Initialize tracing
    let log_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| config.logging.level.clone());
    tracing_subscriber::fmt().with_env_filter(log_filter).init();

    info!("qualifyd-broker v{} starting", env!("CARGO_PKG_VERSION"));
    info!("Listening on {}", config.server.listen);

    if config.auth.api_key == "change-me" {
        warn!("Using default API key — set QUALIFYD_API_KEY or update config");
    }
    match HostKeyPolicy::parse(&config.ssh.host_key) {
        Ok(HostKeyPolicy::AcceptAny) => {
            warn!("SSH host keys are accepted unconditionally — pin a fingerprint outside development clusters");
        }
        Ok(HostKeyPolicy::Pinned(_)) => {}
        Err(e) => {
            error!("Invalid [ssh] host_key: {e}");
            std::process::exit(1);
        }
    }

    let hub = Arc::new(BrokerHub::new());

    // Cluster access, with the fixed-host fallback when unavailable.
    let workload = match Client::connect(&config.cluster.namespace).await {
        Ok(client) => WorkloadManager::new(client, hub.locks(), &config.cluster),
        Err(e) => {
            if config.terminal.fallback_host.is_empty() {
                error!("Failed to initialise cluster client and no TERMINAL_HOST fallback configured: {e}");
                std::process::exit(1);
            }
            warn!(
                "Cluster client unavailable ({e}), using fixed terminal host {}",
                config.terminal.fallback_host
            );
            WorkloadManager::fallback(&config.terminal.fallback_host, hub.locks())
        }
    };

    let state = AppState {
        config: Arc::new(config),
        hub: Arc::clone(&hub),
        workload: workload.clone(),
    };

    // Build router
    let public_routes = Router::new().route("/api/health", get(routes::health::health));

    let authed_routes = Router::new()
        .route(
            "/api/terminal/{assessment_id}/pods",
            get(routes::terminal::list_pods),
        )
        .route(
            "/api/terminal/{assessment_id}/pods/{session_id}",
            axum::routing::delete(routes::terminal::destroy_pod),
        )
        .layer(middleware::from_fn(auth::require_api_key));

    let ws_route = Router::new().route("/ws/terminal/{assessment_id}", get(ws::ws_upgrade));

    let app = Router::new()
        .merge(public_routes)
        .merge(authed_routes)
        .merge(ws_route)
        .layer(Extension(ApiKey(state.config.auth.api_key.clone())))
        .layer(TraceLayer::new_for_http())
        .with_state(state.clone());

    let listener = TcpListener::bind(&state.config.server.listen)
        .await
        .expect("Failed to bind");

    info!("Broker ready");

    // Periodic reaper: delete terminal pods idle past their TTL.
    let reap_interval = Duration::from_secs(state.config.server.reap_interval_secs);
    let reap_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(reap_interval);
        loop {
            interval.tick().await;
            match workload.reap_idle().await {
                Ok(0) => {}
                Ok(reaped) => info!("Idle reaper deleted {reaped} pod(s)"),
                Err(e) => warn!("Idle reaper sweep failed: {e}"),
            }
        }
    });

    // Graceful shutdown
    let shutdown = async {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to register SIGTERM");
            tokio::select! {
                _ = ctrl_c => info!("Received SIGINT"),
                _ = sigterm.recv() => info!("Received SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            ctrl_c.await.ok();
            info!("Received SIGINT");
        }
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .expect("Server error");

    // Cleanup: sessions close, pods stay for reattach.
    info!("Shutting down...");
    reap_task.abort();
    hub.shutdown(Duration::from_secs(10)).await;
    info!("Goodbye");
}
