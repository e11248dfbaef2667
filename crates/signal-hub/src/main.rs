//! Signal Hub
//!
//! Stateful WebSocket signaling server for peer-to-peer sessions.
//!
//! # Servers
//!
//! - WebSocket server for client signaling (default: 0.0.0.0:9400)
//! - HTTP server for health endpoints and metrics (default: 0.0.0.0:9401)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Build the credential verifier from the shared secret
//! 4. Initialize the session registry actor system
//! 5. Start the health HTTP server (liveness, readiness, status, metrics)
//! 6. Start the WebSocket hub
//! 7. Start the mesh controller maintenance task
//! 8. Wait for shutdown signal, then drain gracefully

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use base64::Engine;
use metrics_exporter_prometheus::PrometheusBuilder;
use secrecy::ExposeSecret;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use signal_hub::actors::RegistryHandle;
use signal_hub::auth::HmacCredentialVerifier;
use signal_hub::config::Config;
use signal_hub::hub::{HubSettings, SignalHub};
use signal_hub::mesh::{run_mesh_controller, MaintenanceSettings};
use signal_hub::observability::{
    observability_router, HealthState, HubMetrics, ObservabilityState,
};
use signal_hub::ratelimit::RateLimiter;

/// How long the registry gets to drain sessions at shutdown.
const SHUTDOWN_DRAIN_DEADLINE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "signal_hub=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting signal hub");

    // Load configuration
    let config = Config::from_env().map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        anyhow::anyhow!(e)
    })?;

    info!(
        hub_bind_address = %config.hub_bind_address,
        health_bind_address = %config.health_bind_address,
        full_mesh_threshold = config.topology.full_mesh_threshold,
        relay_fanout = config.topology.relay_fanout,
        maintenance_interval_secs = config.maintenance_interval.as_secs(),
        empty_session_grace_secs = config.empty_session_grace.as_secs(),
        "Configuration loaded"
    );

    // Install the Prometheus recorder before any metrics are emitted
    let prometheus_handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        anyhow::anyhow!("failed to install Prometheus metrics recorder: {e}")
    })?;

    // Decode the credential secret (base64, minimum 32 bytes enforced below)
    let secret_bytes = base64::engine::general_purpose::STANDARD
        .decode(config.auth_secret.expose_secret())
        .map_err(|e| {
            error!(error = %e, "LATTICE_AUTH_SECRET is not valid base64");
            anyhow::anyhow!("invalid base64 in LATTICE_AUTH_SECRET: {e}")
        })?;
    let verifier = Arc::new(HmacCredentialVerifier::new(&secret_bytes).map_err(|e| {
        error!(error = %e, "LATTICE_AUTH_SECRET rejected");
        anyhow::anyhow!(e)
    })?);

    // Actor system and shared services
    let metrics = HubMetrics::new();
    let registry = RegistryHandle::new(config.topology, Arc::clone(&metrics));
    let limiter = Arc::new(RateLimiter::new(config.rate_limits));
    let health_state = Arc::new(HealthState::new());

    // Everything below hangs off the registry's token so one cancel tears
    // the whole service down in order.
    let shutdown_token = registry.child_token();

    // Health HTTP server: bind first to fail fast on bad addresses.
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(addr = %config.health_bind_address, "Invalid health bind address");
        anyhow::anyhow!("invalid health bind address: {e}")
    })?;

    let app = observability_router(ObservabilityState {
        health: Arc::clone(&health_state),
        metrics: Arc::clone(&metrics),
    })
    .merge(Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    ));

    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            anyhow::anyhow!("failed to bind health server to {health_addr}: {e}")
        })?;

    let health_shutdown = shutdown_token.child_token();
    tokio::spawn(async move {
        info!(addr = %health_addr, "Health server starting");
        let server = axum::serve(health_listener, app).with_graceful_shutdown(async move {
            health_shutdown.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });

    // WebSocket hub
    let hub_addr: SocketAddr = config.hub_bind_address.parse().map_err(|e| {
        error!(addr = %config.hub_bind_address, "Invalid hub bind address");
        anyhow::anyhow!("invalid hub bind address: {e}")
    })?;
    let hub_listener = tokio::net::TcpListener::bind(hub_addr).await.map_err(|e| {
        error!(error = %e, addr = %hub_addr, "Failed to bind hub listener");
        anyhow::anyhow!("failed to bind hub listener to {hub_addr}: {e}")
    })?;

    let hub = SignalHub::new(
        registry.clone(),
        Arc::clone(&limiter),
        verifier,
        Arc::clone(&metrics),
        HubSettings {
            heartbeat_timeout: config.heartbeat_timeout,
            reaper_interval: config.reaper_interval,
        },
    );

    let hub_token = shutdown_token.child_token();
    tokio::spawn(async move {
        if let Err(e) = hub.serve(hub_listener, hub_token).await {
            error!(error = %e, "Hub listener failed");
        }
    });
    info!(addr = %hub_addr, "Signal hub started");

    // Mesh controller maintenance task
    let mesh_token = shutdown_token.child_token();
    tokio::spawn(run_mesh_controller(
        registry.clone(),
        Arc::clone(&limiter),
        MaintenanceSettings {
            interval: config.maintenance_interval,
            empty_session_grace: config.empty_session_grace,
        },
        mesh_token,
    ));

    health_state.set_ready();
    info!("Signal hub running - press Ctrl+C to shutdown");

    shutdown_signal().await;

    info!("Shutdown signal received, initiating graceful shutdown...");

    // Stop advertising readiness so load balancers drain us first.
    health_state.set_not_ready();
    shutdown_token.cancel();

    // Give connection and maintenance tasks a moment to wind down.
    tokio::time::sleep(Duration::from_secs(2)).await;

    if let Err(e) = registry.shutdown(SHUTDOWN_DRAIN_DEADLINE).await {
        warn!(error = %e, "Registry shutdown error");
    }

    info!("Signal hub shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// # Panics
///
/// Panics if signal handlers cannot be installed; without them the service
/// could never shut down gracefully.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "signal handler installation is critical - panic is appropriate if it fails"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
