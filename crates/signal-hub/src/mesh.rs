//! Mesh controller: the recurring maintenance cycle.
//!
//! Runs independently of request handling. Each cycle it:
//!
//! 1. Asks every session actor to re-plan its topology (the actor commits
//!    and broadcasts any change itself, so the decision is atomic per
//!    session and this task never touches session state directly)
//! 2. Removes sessions that stayed empty past the grace period
//! 3. Evicts idle rate-limit buckets
//!
//! A failure in one session's step is logged and skipped; the rest of the
//! cycle continues. The task exits cleanly on cancellation.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::actors::RegistryHandle;
use crate::ratelimit::RateLimiter;

/// Maintenance cycle knobs.
#[derive(Debug, Clone, Copy)]
pub struct MaintenanceSettings {
    /// Time between cycles.
    pub interval: Duration,
    /// How long a session may sit empty before removal.
    pub empty_session_grace: Duration,
}

/// What one cycle did (for logging and tests).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    pub sessions_seen: usize,
    pub topology_shifts: usize,
    pub sessions_removed: usize,
    pub buckets_evicted: usize,
}

/// Run the maintenance loop until cancelled.
#[instrument(skip_all, name = "hub.task.mesh_controller")]
pub async fn run_mesh_controller(
    registry: RegistryHandle,
    limiter: Arc<RateLimiter>,
    settings: MaintenanceSettings,
    cancel_token: CancellationToken,
) {
    info!(
        target: "hub.task.mesh_controller",
        interval_ms = settings.interval.as_millis() as u64,
        grace_secs = settings.empty_session_grace.as_secs(),
        "Mesh controller started"
    );

    let mut interval = tokio::time::interval(settings.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                info!(
                    target: "hub.task.mesh_controller",
                    "Mesh controller received shutdown signal, exiting"
                );
                break;
            }
            _ = interval.tick() => {
                let report = run_cycle(&registry, &limiter, &settings).await;
                if report.topology_shifts > 0 || report.sessions_removed > 0 {
                    info!(
                        target: "hub.task.mesh_controller",
                        sessions = report.sessions_seen,
                        shifts = report.topology_shifts,
                        removed = report.sessions_removed,
                        "Maintenance cycle applied changes"
                    );
                }
            }
        }
    }

    info!(target: "hub.task.mesh_controller", "Mesh controller stopped");
}

/// One maintenance cycle over every active session.
pub async fn run_cycle(
    registry: &RegistryHandle,
    limiter: &RateLimiter,
    settings: &MaintenanceSettings,
) -> CycleReport {
    let mut report = CycleReport::default();

    let sessions = match registry.sessions().await {
        Ok(sessions) => sessions,
        Err(e) => {
            warn!(
                target: "hub.task.mesh_controller",
                error = %e,
                "Registry unavailable, skipping cycle"
            );
            return report;
        }
    };
    report.sessions_seen = sessions.len();

    for session in sessions {
        let session_id = session.session_id().to_string();

        // Per-session isolation: one failing session must not abort the rest.
        match session.evaluate_topology().await {
            Ok(Some(shift)) => {
                report.topology_shifts += 1;
                debug!(
                    target: "hub.task.mesh_controller",
                    session_id = %session_id,
                    strategy = ?shift.strategy,
                    relays = shift.relays.len(),
                    "Topology shift committed"
                );
            }
            Ok(None) => {}
            Err(e) => {
                warn!(
                    target: "hub.task.mesh_controller",
                    session_id = %session_id,
                    error = %e,
                    "Topology evaluation failed, skipping session"
                );
                continue;
            }
        }

        match registry
            .remove_if_empty(session_id.clone(), settings.empty_session_grace)
            .await
        {
            Ok(true) => report.sessions_removed += 1,
            Ok(false) => {}
            Err(e) => {
                warn!(
                    target: "hub.task.mesh_controller",
                    session_id = %session_id,
                    error = %e,
                    "Empty-session check failed"
                );
            }
        }
    }

    report.buckets_evicted = limiter.evict_idle();
    report
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::actors::PeerSink;
    use crate::config::{RateLimitSettings, TopologySettings};
    use crate::observability::HubMetrics;
    use signal_protocol::{ServerMessage, TopologyStrategy};
    use tokio::sync::mpsc;

    fn fixture() -> (RegistryHandle, Arc<RateLimiter>, MaintenanceSettings) {
        let registry = RegistryHandle::new(
            TopologySettings {
                full_mesh_threshold: 3,
                relay_fanout: 3,
                max_latency_ms: 60_000,
            },
            HubMetrics::new(),
        );
        let limiter = Arc::new(RateLimiter::new(RateLimitSettings::default()));
        let settings = MaintenanceSettings {
            interval: Duration::from_millis(100),
            empty_session_grace: Duration::from_secs(60),
        };
        (registry, limiter, settings)
    }

    fn sink() -> (PeerSink, mpsc::Receiver<ServerMessage>) {
        mpsc::channel(32)
    }

    #[tokio::test]
    async fn test_cycle_commits_topology_shift() {
        let (registry, limiter, settings) = fixture();

        let mut receivers = Vec::new();
        for i in 0..3 {
            let (s, rx) = sink();
            registry
                .join("room1".into(), format!("p{i}"), false, format!("c{i}"), s)
                .await
                .unwrap();
            receivers.push(rx);
        }

        let report = run_cycle(&registry, &limiter, &settings).await;
        assert_eq!(report.sessions_seen, 1);
        assert_eq!(report.topology_shifts, 1);
        assert_eq!(report.sessions_removed, 0);

        // A second cycle over unchanged input is quiet.
        let report = run_cycle(&registry, &limiter, &settings).await;
        assert_eq!(report.topology_shifts, 0);

        // Each peer saw exactly one topology update.
        for rx in &mut receivers {
            let mut updates = 0;
            while let Ok(msg) = rx.try_recv() {
                if let ServerMessage::TopologyUpdate { strategy, .. } = msg {
                    assert_eq!(strategy, TopologyStrategy::RelayBased);
                    updates += 1;
                }
            }
            assert_eq!(updates, 1);
        }

        registry.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_removes_sessions_past_grace() {
        let (registry, limiter, settings) = fixture();
        let (s, _rx) = sink();

        let (_, session) = registry
            .join("room1".into(), "alice".into(), false, "c1".into(), s)
            .await
            .unwrap();
        session.leave("alice".into(), None).await.unwrap();

        tokio::time::advance(Duration::from_secs(30)).await;
        let report = run_cycle(&registry, &limiter, &settings).await;
        assert_eq!(report.sessions_removed, 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        let report = run_cycle(&registry, &limiter, &settings).await;
        assert_eq!(report.sessions_removed, 1);
        assert_eq!(registry.status().await.unwrap().session_count, 0);

        registry.cancel();
    }

    #[tokio::test]
    async fn test_controller_task_stops_on_cancellation() {
        let (registry, limiter, settings) = fixture();
        let cancel = CancellationToken::new();

        let task = tokio::spawn(run_mesh_controller(
            registry.clone(),
            limiter,
            settings,
            cancel.clone(),
        ));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("task should exit promptly")
            .expect("task should not panic");

        registry.cancel();
    }
}
