//! Hub-wide counters and gauges.
//!
//! `HubMetrics` keeps atomics for cheap in-process reads (status endpoint,
//! shutdown logging) and mirrors the values into the `metrics` registry so
//! the Prometheus exporter picks them up.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared hub metrics.
#[derive(Debug, Default)]
pub struct HubMetrics {
    connections: AtomicUsize,
    sessions: AtomicUsize,
    peers: AtomicUsize,
    signals_relayed: AtomicU64,
    rate_limited: AtomicU64,
    deliveries_dropped: AtomicU64,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy)]
pub struct MetricsSnapshot {
    pub connections: usize,
    pub sessions: usize,
    pub peers: usize,
    pub signals_relayed: u64,
    pub rate_limited: u64,
    pub deliveries_dropped: u64,
}

impl HubMetrics {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn connection_opened(&self) {
        let count = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("lattice_connections").set(count as f64);
    }

    pub fn connection_closed(&self) {
        let count = self.connections.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        metrics::gauge!("lattice_connections").set(count as f64);
    }

    pub fn session_created(&self) {
        let count = self.sessions.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("lattice_sessions").set(count as f64);
    }

    pub fn session_removed(&self) {
        let count = self.sessions.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        metrics::gauge!("lattice_sessions").set(count as f64);
    }

    pub fn peer_joined(&self) {
        let count = self.peers.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::gauge!("lattice_peers").set(count as f64);
    }

    pub fn peer_left(&self) {
        let count = self.peers.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        metrics::gauge!("lattice_peers").set(count as f64);
    }

    pub fn signal_relayed(&self) {
        self.signals_relayed.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("lattice_signals_relayed_total").increment(1);
    }

    pub fn request_rate_limited(&self, category: &'static str) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("lattice_rate_limited_total", "category" => category).increment(1);
    }

    /// A server push was dropped because the receiver's outbound queue was
    /// full (delivery is best-effort).
    pub fn delivery_dropped(&self) {
        self.deliveries_dropped.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("lattice_deliveries_dropped_total").increment(1);
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections: self.connections.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
            peers: self.peers.load(Ordering::Relaxed),
            signals_relayed: self.signals_relayed.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            deliveries_dropped: self.deliveries_dropped.load(Ordering::Relaxed),
        }
    }
}
