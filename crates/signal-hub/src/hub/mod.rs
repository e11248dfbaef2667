//! The signal relay hub: WebSocket listener, connection table, reaper.
//!
//! Each accepted connection runs as its own task pair (reader + writer) and
//! registers in the connection table. A background reaper cancels
//! connections whose keep-alive is overdue, so half-open network failures
//! cannot strand peers inside a session.

mod connection;

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::actors::RegistryHandle;
use crate::auth::CredentialVerifier;
use crate::observability::HubMetrics;
use crate::ratelimit::RateLimiter;

/// Hub behavior knobs, lifted from [`crate::config::Config`].
#[derive(Debug, Clone, Copy)]
pub struct HubSettings {
    /// Connections silent longer than this are reaped.
    pub heartbeat_timeout: Duration,
    /// How often the reaper scans the connection table.
    pub reaper_interval: Duration,
}

/// Live-connection bookkeeping for the reaper.
struct ConnectionEntry {
    /// Milliseconds since the hub epoch of the last inbound frame.
    last_seen_ms: Arc<AtomicU64>,
    cancel: CancellationToken,
}

/// The connection-facing hub.
pub struct SignalHub {
    registry: RegistryHandle,
    limiter: Arc<RateLimiter>,
    verifier: Arc<dyn CredentialVerifier>,
    metrics: Arc<HubMetrics>,
    settings: HubSettings,
    connections: DashMap<String, ConnectionEntry>,
    epoch: Instant,
}

impl SignalHub {
    /// Create a hub.
    #[must_use]
    pub fn new(
        registry: RegistryHandle,
        limiter: Arc<RateLimiter>,
        verifier: Arc<dyn CredentialVerifier>,
        metrics: Arc<HubMetrics>,
        settings: HubSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            limiter,
            verifier,
            metrics,
            settings,
            connections: DashMap::new(),
            epoch: Instant::now(),
        })
    }

    /// Accept connections until cancelled.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> io::Result<()> {
        if let Ok(addr) = listener.local_addr() {
            info!(target: "hub.server", addr = %addr, "Signal hub listening");
        }

        let reaper_hub = Arc::clone(&self);
        let reaper_token = cancel.child_token();
        tokio::spawn(async move {
            reaper_hub.run_reaper(reaper_token).await;
        });

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    // Per-connection tokens are children of this one, so
                    // every live connection is already winding down.
                    info!(target: "hub.server", "Signal hub shutting down");
                    break;
                }

                accepted = listener.accept() => {
                    let (stream, peer_addr) = accepted?;
                    let hub = Arc::clone(&self);
                    let conn_token = cancel.child_token();
                    tokio::spawn(async move {
                        if let Err(e) =
                            connection::handle_connection(hub, stream, peer_addr, conn_token).await
                        {
                            debug!(
                                target: "hub.server",
                                peer_addr = %peer_addr,
                                error = %e,
                                "Connection ended with error"
                            );
                        }
                    });
                }
            }
        }

        Ok(())
    }

    /// Number of live connections (for the health probe).
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Periodically cancel connections whose keep-alive is overdue.
    async fn run_reaper(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.reaper_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(target: "hub.reaper", "Reaper stopped");
                    break;
                }
                _ = interval.tick() => {
                    let reaped = self.reap_stale();
                    if reaped > 0 {
                        warn!(
                            target: "hub.reaper",
                            reaped,
                            "Evicted connections with missed keep-alives"
                        );
                    }
                }
            }
        }
    }

    /// Cancel stale connections. Their tasks run the normal leave path, so
    /// eviction looks like any other disconnect to the rest of the session.
    fn reap_stale(&self) -> usize {
        let now = self.now_ms();
        let timeout_ms = self.settings.heartbeat_timeout.as_millis() as u64;
        let mut reaped = 0;

        for entry in self.connections.iter() {
            let last_seen = entry.value().last_seen_ms.load(Ordering::Relaxed);
            if now.saturating_sub(last_seen) > timeout_ms {
                entry.value().cancel.cancel();
                reaped += 1;
            }
        }

        reaped
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn register_connection(&self, connection_id: &str, cancel: CancellationToken) -> Arc<AtomicU64> {
        let last_seen_ms = Arc::new(AtomicU64::new(self.now_ms()));
        self.connections.insert(
            connection_id.to_string(),
            ConnectionEntry {
                last_seen_ms: Arc::clone(&last_seen_ms),
                cancel,
            },
        );
        self.metrics.connection_opened();
        last_seen_ms
    }

    fn unregister_connection(&self, connection_id: &str) {
        self.connections.remove(connection_id);
        self.metrics.connection_closed();
    }
}
