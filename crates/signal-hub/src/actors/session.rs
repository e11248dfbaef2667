//! `SessionActor` - per-session actor that owns session state.
//!
//! Each `SessionActor`:
//! - Owns all state for one session (peers, latencies, topology decision)
//! - Serializes every mutation through its mailbox, so concurrent joins,
//!   leaves and signals on the same session cannot race
//! - Commits topology changes and their broadcast in a single step
//!
//! Distinct sessions are distinct actors and never contend with each other.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use signal_protocol::{PeerSummary, ServerMessage, TopologyStrategy, BROADCAST_TARGET};

use crate::config::TopologySettings;
use crate::errors::HubError;
use crate::observability::HubMetrics;
use crate::topology::{self, CandidatePeer};

use super::messages::{JoinAccepted, PeerSink, SessionMessage, SessionSnapshot, TopologyShift};

/// Channel buffer size for the session mailbox.
const SESSION_CHANNEL_BUFFER: usize = 500;

/// Handle to a `SessionActor`.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionMessage>,
    cancel_token: CancellationToken,
    session_id: String,
}

impl SessionHandle {
    /// Get the session ID.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Admit a peer (idempotent per identity: a re-join replaces the
    /// delivery handle instead of creating a duplicate peer).
    pub async fn join(
        &self,
        identity: String,
        relay_capable: bool,
        connection_id: String,
        sink: PeerSink,
    ) -> Result<JoinAccepted, HubError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(SessionMessage::Join {
                identity,
                relay_capable,
                connection_id,
                sink,
                respond_to: tx,
            })
            .await
            .map_err(|e| HubError::RegistryUnavailable(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| HubError::RegistryUnavailable(format!("response receive failed: {e}")))
    }

    /// Remove a peer. Unknown identities are a no-op (`Ok(false)`).
    pub async fn leave(
        &self,
        identity: String,
        connection_id: Option<String>,
    ) -> Result<bool, HubError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(SessionMessage::Leave {
                identity,
                connection_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| HubError::RegistryUnavailable(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| HubError::RegistryUnavailable(format!("response receive failed: {e}")))
    }

    /// Forward a signal payload. Fire-and-forget: delivery is best-effort
    /// and unknown targets are dropped silently.
    pub async fn relay_signal(
        &self,
        from: String,
        target: String,
        payload: serde_json::Value,
    ) -> Result<(), HubError> {
        self.sender
            .send(SessionMessage::Signal {
                from,
                target,
                payload,
            })
            .await
            .map_err(|e| HubError::RegistryUnavailable(format!("channel send failed: {e}")))
    }

    /// Record a latency report.
    pub async fn report_latency(&self, from: String, to: String, millis: u64) -> Result<(), HubError> {
        self.sender
            .send(SessionMessage::ReportLatency { from, to, millis })
            .await
            .map_err(|e| HubError::RegistryUnavailable(format!("channel send failed: {e}")))
    }

    /// Re-run the topology planner. Returns the shift if the decision changed.
    pub async fn evaluate_topology(&self) -> Result<Option<TopologyShift>, HubError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(SessionMessage::EvaluateTopology { respond_to: tx })
            .await
            .map_err(|e| HubError::RegistryUnavailable(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| HubError::RegistryUnavailable(format!("response receive failed: {e}")))
    }

    /// Get current session state.
    pub async fn snapshot(&self) -> Result<SessionSnapshot, HubError> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.sender
            .send(SessionMessage::Snapshot { respond_to: tx })
            .await
            .map_err(|e| HubError::RegistryUnavailable(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| HubError::RegistryUnavailable(format!("response receive failed: {e}")))
    }

    /// Cancel the session actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Peer state within a session.
#[derive(Debug)]
struct Peer {
    identity: String,
    /// Connection currently backing this peer; replaced on re-join.
    connection_id: String,
    relay_capable: bool,
    is_relay: bool,
    joined_at: i64,
    /// Last reported latency per target identity, milliseconds.
    latencies: HashMap<String, u64>,
    sink: PeerSink,
}

impl Peer {
    fn summary(&self) -> PeerSummary {
        PeerSummary {
            identity: self.identity.clone(),
            relay_capable: self.relay_capable,
            is_relay: self.is_relay,
        }
    }

    fn avg_latency_ms(&self) -> Option<f64> {
        if self.latencies.is_empty() {
            return None;
        }
        let sum: u64 = self.latencies.values().sum();
        Some(sum as f64 / self.latencies.len() as f64)
    }
}

/// The `SessionActor` implementation.
pub struct SessionActor {
    session_id: String,
    receiver: mpsc::Receiver<SessionMessage>,
    cancel_token: CancellationToken,
    peers: HashMap<String, Peer>,
    strategy: TopologyStrategy,
    relays: BTreeSet<String>,
    settings: TopologySettings,
    created_at: i64,
    /// Set while the session has zero peers; drives grace-period removal.
    empty_since: Option<Instant>,
    metrics: Arc<HubMetrics>,
}

impl SessionActor {
    /// Spawn a new session actor. Returns a handle and the task join handle.
    pub fn spawn(
        session_id: String,
        cancel_token: CancellationToken,
        settings: TopologySettings,
        metrics: Arc<HubMetrics>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);

        let actor = Self {
            session_id: session_id.clone(),
            receiver,
            cancel_token: cancel_token.clone(),
            peers: HashMap::new(),
            strategy: TopologyStrategy::FullMesh,
            relays: BTreeSet::new(),
            settings,
            created_at: chrono::Utc::now().timestamp(),
            empty_since: Some(Instant::now()),
            metrics,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = SessionHandle {
            sender,
            cancel_token,
            session_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "hub.actor.session", fields(session_id = %self.session_id))]
    async fn run(mut self) {
        info!(
            target: "hub.actor.session",
            session_id = %self.session_id,
            "SessionActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "hub.actor.session",
                        session_id = %self.session_id,
                        remaining_peers = self.peers.len(),
                        "SessionActor received cancellation signal"
                    );
                    break;
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => self.handle_message(message),
                        None => {
                            info!(
                                target: "hub.actor.session",
                                session_id = %self.session_id,
                                "SessionActor channel closed, exiting"
                            );
                            break;
                        }
                    }
                }
            }
        }

        // Keep the shared peer gauge honest when the actor dies with peers.
        for _ in 0..self.peers.len() {
            self.metrics.peer_left();
        }

        info!(
            target: "hub.actor.session",
            session_id = %self.session_id,
            "SessionActor stopped"
        );
    }

    /// Handle a single message.
    fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::Join {
                identity,
                relay_capable,
                connection_id,
                sink,
                respond_to,
            } => {
                let result = self.handle_join(identity, relay_capable, connection_id, sink);
                let _ = respond_to.send(result);
            }

            SessionMessage::Leave {
                identity,
                connection_id,
                respond_to,
            } => {
                let removed = self.handle_leave(&identity, connection_id.as_deref());
                let _ = respond_to.send(removed);
            }

            SessionMessage::Signal {
                from,
                target,
                payload,
            } => {
                self.handle_signal(&from, &target, payload);
            }

            SessionMessage::ReportLatency { from, to, millis } => {
                self.handle_report_latency(&from, &to, millis);
            }

            SessionMessage::EvaluateTopology { respond_to } => {
                let shift = self.evaluate_topology();
                let _ = respond_to.send(shift);
            }

            SessionMessage::Snapshot { respond_to } => {
                let _ = respond_to.send(self.snapshot());
            }
        }
    }

    /// Handle a peer joining (or re-joining on a fresh connection).
    fn handle_join(
        &mut self,
        identity: String,
        relay_capable: bool,
        connection_id: String,
        sink: PeerSink,
    ) -> JoinAccepted {
        if let Some(existing) = self.peers.get_mut(&identity) {
            // Reconnection: replace the delivery handle in place. The rest of
            // the session never sees the peer leave.
            debug!(
                target: "hub.actor.session",
                session_id = %self.session_id,
                identity = %identity,
                "Peer re-joined, replacing connection handle"
            );
            existing.connection_id = connection_id;
            existing.relay_capable = relay_capable;
            existing.sink = sink;
        } else {
            let peer = Peer {
                identity: identity.clone(),
                connection_id,
                relay_capable,
                is_relay: false,
                joined_at: chrono::Utc::now().timestamp(),
                latencies: HashMap::new(),
                sink,
            };
            self.peers.insert(identity.clone(), peer);
            self.empty_since = None;
            self.metrics.peer_joined();

            self.broadcast_except(
                &identity,
                &ServerMessage::PeerArrived {
                    identity: identity.clone(),
                },
            );

            info!(
                target: "hub.actor.session",
                session_id = %self.session_id,
                identity = %identity,
                total_peers = self.peers.len(),
                "Peer joined"
            );
        }

        JoinAccepted {
            peers: self
                .peers
                .values()
                .filter(|p| p.identity != identity)
                .map(Peer::summary)
                .collect(),
            strategy: self.strategy,
            relays: self.relays.iter().cloned().collect(),
        }
    }

    /// Handle a peer leaving. Returns whether a peer was actually removed.
    fn handle_leave(&mut self, identity: &str, connection_id: Option<&str>) -> bool {
        let Some(peer) = self.peers.get(identity) else {
            return false;
        };

        // A disconnect from a superseded connection must not remove the peer
        // that re-joined on a newer one.
        if let Some(conn_id) = connection_id {
            if peer.connection_id != conn_id {
                debug!(
                    target: "hub.actor.session",
                    session_id = %self.session_id,
                    identity = %identity,
                    "Ignoring leave from superseded connection"
                );
                return false;
            }
        }

        let Some(removed) = self.peers.remove(identity) else {
            return false;
        };
        let was_relay = removed.is_relay;
        self.relays.remove(identity);
        self.metrics.peer_left();

        // Drop stale latency rows pointing at the departed peer.
        for peer in self.peers.values_mut() {
            peer.latencies.remove(identity);
        }

        self.broadcast_except(
            identity,
            &ServerMessage::PeerLeft {
                identity: identity.to_string(),
            },
        );

        info!(
            target: "hub.actor.session",
            session_id = %self.session_id,
            identity = %identity,
            remaining_peers = self.peers.len(),
            seconds_in_session = chrono::Utc::now().timestamp().saturating_sub(removed.joined_at),
            "Peer left"
        );

        if self.peers.is_empty() {
            self.empty_since = Some(Instant::now());
        } else if was_relay {
            // Losing a relay leaves the session with a stale routing plan.
            if let Some(shift) = self.evaluate_topology() {
                debug!(
                    target: "hub.actor.session",
                    session_id = %self.session_id,
                    relays = shift.relays.len(),
                    "Topology re-planned after relay departure"
                );
            }
        }

        true
    }

    /// Handle a signal: forward verbatim to the target, or to everyone else
    /// for a broadcast. Missing targets are dropped without an error.
    fn handle_signal(&mut self, from: &str, target: &str, payload: serde_json::Value) {
        if !self.peers.contains_key(from) {
            warn!(
                target: "hub.actor.session",
                session_id = %self.session_id,
                from = %from,
                "Signal from peer not in session"
            );
            return;
        }

        if target == BROADCAST_TARGET {
            let message = ServerMessage::SignalReceived {
                from: from.to_string(),
                payload,
            };
            self.broadcast_except(from, &message);
            self.metrics.signal_relayed();
            return;
        }

        match self.peers.get(target) {
            Some(peer) => {
                self.deliver(
                    peer,
                    ServerMessage::SignalReceived {
                        from: from.to_string(),
                        payload,
                    },
                );
                self.metrics.signal_relayed();
            }
            None => {
                // Fire-and-forget semantics: the sender is not told.
                debug!(
                    target: "hub.actor.session",
                    session_id = %self.session_id,
                    from = %from,
                    "Signal target not present, dropped"
                );
            }
        }
    }

    /// Record a latency report (last-write-wins per target).
    fn handle_report_latency(&mut self, from: &str, to: &str, millis: u64) {
        if millis > self.settings.max_latency_ms {
            debug!(
                target: "hub.actor.session",
                session_id = %self.session_id,
                from = %from,
                millis,
                "Discarding implausible latency report"
            );
            return;
        }

        if let Some(peer) = self.peers.get_mut(from) {
            peer.latencies.insert(to.to_string(), millis);
        }
    }

    /// Re-plan the topology. When the decision changed, the new strategy,
    /// relay flags and the broadcast to every peer are committed together,
    /// so no observer can see a partial update.
    fn evaluate_topology(&mut self) -> Option<TopologyShift> {
        let candidates: Vec<CandidatePeer> = self
            .peers
            .values()
            .map(|p| CandidatePeer {
                identity: p.identity.clone(),
                relay_capable: p.relay_capable,
                avg_latency_ms: p.avg_latency_ms(),
            })
            .collect();

        let plan = topology::plan(&candidates, &self.settings);
        let planned_relays: BTreeSet<String> = plan.relays.iter().cloned().collect();

        if plan.strategy == self.strategy && planned_relays == self.relays {
            return None;
        }

        self.strategy = plan.strategy;
        self.relays = planned_relays;
        for peer in self.peers.values_mut() {
            peer.is_relay = self.relays.contains(&peer.identity);
        }

        let relays: Vec<String> = self.relays.iter().cloned().collect();
        let update = ServerMessage::TopologyUpdate {
            strategy: self.strategy,
            relays: relays.clone(),
        };
        for peer in self.peers.values() {
            self.deliver(peer, update.clone());
        }

        info!(
            target: "hub.actor.session",
            session_id = %self.session_id,
            strategy = ?self.strategy,
            relay_count = relays.len(),
            peer_count = self.peers.len(),
            "Topology decision changed"
        );

        Some(TopologyShift {
            strategy: self.strategy,
            relays,
        })
    }

    /// Current session state.
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            session_id: self.session_id.clone(),
            peers: self.peers.values().map(Peer::summary).collect(),
            strategy: self.strategy,
            relays: self.relays.iter().cloned().collect(),
            empty_for: self.empty_since.map(|since| since.elapsed()),
            created_at: self.created_at,
        }
    }

    /// Push a message to every peer except `except_identity`.
    fn broadcast_except(&self, except_identity: &str, message: &ServerMessage) {
        for peer in self.peers.values() {
            if peer.identity != except_identity {
                self.deliver(peer, message.clone());
            }
        }
    }

    /// Best-effort push to one peer. A full outbound queue drops the message
    /// rather than stalling the whole session.
    fn deliver(&self, peer: &Peer, message: ServerMessage) {
        match peer.sink.try_send(message) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.metrics.delivery_dropped();
                warn!(
                    target: "hub.actor.session",
                    session_id = %self.session_id,
                    identity = %peer.identity,
                    "Outbound queue full, dropping delivery"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(
                    target: "hub.actor.session",
                    session_id = %self.session_id,
                    identity = %peer.identity,
                    "Outbound queue closed, peer connection gone"
                );
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc::Receiver;

    fn spawn_session(threshold: usize) -> (SessionHandle, JoinHandle<()>) {
        let settings = TopologySettings {
            full_mesh_threshold: threshold,
            relay_fanout: 6,
            max_latency_ms: 60_000,
        };
        SessionActor::spawn(
            "session-test".to_string(),
            CancellationToken::new(),
            settings,
            HubMetrics::new(),
        )
    }

    fn sink() -> (PeerSink, Receiver<ServerMessage>) {
        mpsc::channel(32)
    }

    fn drain(rx: &mut Receiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn test_join_returns_present_peers() {
        let (handle, _task) = spawn_session(6);
        let (sink_a, _rx_a) = sink();
        let (sink_b, _rx_b) = sink();

        let accepted = handle
            .join("alice".into(), false, "conn-a".into(), sink_a)
            .await
            .unwrap();
        assert!(accepted.peers.is_empty());
        assert_eq!(accepted.strategy, TopologyStrategy::FullMesh);

        let accepted = handle
            .join("bob".into(), false, "conn-b".into(), sink_b)
            .await
            .unwrap();
        assert_eq!(accepted.peers.len(), 1);
        assert_eq!(accepted.peers.first().unwrap().identity, "alice");

        handle.cancel();
    }

    #[tokio::test]
    async fn test_join_broadcasts_peer_arrived() {
        let (handle, _task) = spawn_session(6);
        let (sink_a, mut rx_a) = sink();
        let (sink_b, _rx_b) = sink();

        handle
            .join("alice".into(), false, "conn-a".into(), sink_a)
            .await
            .unwrap();
        handle
            .join("bob".into(), false, "conn-b".into(), sink_b)
            .await
            .unwrap();

        let messages = drain(&mut rx_a);
        assert!(messages
            .iter()
            .any(|m| matches!(m, ServerMessage::PeerArrived { identity } if identity == "bob")));

        handle.cancel();
    }

    #[tokio::test]
    async fn test_rejoin_replaces_handle_without_peer_left() {
        let (handle, _task) = spawn_session(6);
        let (sink_a1, _rx_a1) = sink();
        let (sink_a2, mut rx_a2) = sink();
        let (sink_b, mut rx_b) = sink();

        handle
            .join("alice".into(), false, "conn-1".into(), sink_a1)
            .await
            .unwrap();
        handle
            .join("bob".into(), false, "conn-b".into(), sink_b)
            .await
            .unwrap();
        drain(&mut rx_b);

        // Re-join on a new connection.
        let accepted = handle
            .join("alice".into(), false, "conn-2".into(), sink_a2)
            .await
            .unwrap();
        assert_eq!(accepted.peers.len(), 1);

        // Bob saw neither a leave nor a second arrival.
        assert!(drain(&mut rx_b).is_empty());

        // The new handle is live: bob's signal reaches it.
        handle
            .relay_signal("bob".into(), "alice".into(), serde_json::json!({"n": 1}))
            .await
            .unwrap();
        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.peers.len(), 2);

        tokio::time::sleep(Duration::from_millis(10)).await;
        let messages = drain(&mut rx_a2);
        assert!(messages
            .iter()
            .any(|m| matches!(m, ServerMessage::SignalReceived { from, .. } if from == "bob")));

        handle.cancel();
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let (handle, _task) = spawn_session(6);
        let (sink_a, _rx_a) = sink();

        handle
            .join("alice".into(), false, "conn-a".into(), sink_a)
            .await
            .unwrap();

        assert!(handle.leave("alice".into(), None).await.unwrap());
        assert!(!handle.leave("alice".into(), None).await.unwrap());
        assert!(!handle.leave("ghost".into(), None).await.unwrap());

        handle.cancel();
    }

    #[tokio::test]
    async fn test_superseded_connection_cannot_remove_peer() {
        let (handle, _task) = spawn_session(6);
        let (sink_a1, _rx_a1) = sink();
        let (sink_a2, _rx_a2) = sink();

        handle
            .join("alice".into(), false, "conn-1".into(), sink_a1)
            .await
            .unwrap();
        handle
            .join("alice".into(), false, "conn-2".into(), sink_a2)
            .await
            .unwrap();

        // The old connection's disconnect cleanup fires after the re-join.
        assert!(!handle
            .leave("alice".into(), Some("conn-1".into()))
            .await
            .unwrap());

        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.peers.len(), 1);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_signal_to_missing_target_is_silent() {
        let (handle, _task) = spawn_session(6);
        let (sink_a, mut rx_a) = sink();
        let (sink_b, mut rx_b) = sink();

        handle
            .join("alice".into(), false, "conn-a".into(), sink_a)
            .await
            .unwrap();
        handle
            .join("bob".into(), false, "conn-b".into(), sink_b)
            .await
            .unwrap();
        drain(&mut rx_a);
        drain(&mut rx_b);

        handle
            .relay_signal("alice".into(), "ghost".into(), serde_json::json!("x"))
            .await
            .unwrap();

        // Flush the mailbox with a round trip, then check nothing arrived.
        handle.snapshot().await.unwrap();
        assert!(drain(&mut rx_a).is_empty());
        assert!(drain(&mut rx_b).is_empty());

        handle.cancel();
    }

    #[tokio::test]
    async fn test_broadcast_signal_reaches_everyone_but_sender() {
        let (handle, _task) = spawn_session(6);
        let (sink_a, mut rx_a) = sink();
        let (sink_b, mut rx_b) = sink();
        let (sink_c, mut rx_c) = sink();

        for (id, s) in [("alice", sink_a), ("bob", sink_b), ("carol", sink_c)] {
            handle
                .join(id.into(), false, format!("conn-{id}"), s)
                .await
                .unwrap();
        }
        drain(&mut rx_a);
        drain(&mut rx_b);
        drain(&mut rx_c);

        handle
            .relay_signal("alice".into(), BROADCAST_TARGET.into(), serde_json::json!(1))
            .await
            .unwrap();
        handle.snapshot().await.unwrap();

        assert!(drain(&mut rx_a).is_empty());
        assert_eq!(drain(&mut rx_b).len(), 1);
        assert_eq!(drain(&mut rx_c).len(), 1);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_topology_shifts_exactly_once_at_threshold() {
        let (handle, _task) = spawn_session(6);

        let mut receivers = Vec::new();
        for i in 0..5 {
            let (s, rx) = sink();
            handle
                .join(format!("p{i}"), false, format!("conn-{i}"), s)
                .await
                .unwrap();
            receivers.push(rx);
        }

        // Five peers: still full mesh, nothing to change.
        assert!(handle.evaluate_topology().await.unwrap().is_none());

        // Sixth peer declares relay capability.
        let (s, rx) = sink();
        handle
            .join("volunteer".into(), true, "conn-v".into(), s)
            .await
            .unwrap();
        receivers.push(rx);

        let shift = handle.evaluate_topology().await.unwrap().expect("shift");
        assert_eq!(shift.strategy, TopologyStrategy::RelayBased);
        assert_eq!(shift.relays, vec!["volunteer".to_string()]);

        // Unchanged input: no second shift, no duplicate broadcast.
        assert!(handle.evaluate_topology().await.unwrap().is_none());

        // Every peer got exactly one topology update.
        for rx in &mut receivers {
            let updates = drain(rx)
                .into_iter()
                .filter(|m| matches!(m, ServerMessage::TopologyUpdate { .. }))
                .count();
            assert_eq!(updates, 1);
        }

        handle.cancel();
    }

    #[tokio::test]
    async fn test_relay_departure_replans_inline() {
        let (handle, _task) = spawn_session(2);

        let (sink_a, _rx_a) = sink();
        let (sink_b, mut rx_b) = sink();
        let (sink_c, mut rx_c) = sink();
        handle
            .join("alice".into(), true, "conn-a".into(), sink_a)
            .await
            .unwrap();
        handle
            .join("bob".into(), false, "conn-b".into(), sink_b)
            .await
            .unwrap();
        handle
            .join("carol".into(), false, "conn-c".into(), sink_c)
            .await
            .unwrap();

        let shift = handle.evaluate_topology().await.unwrap().expect("shift");
        assert_eq!(shift.relays, vec!["alice".to_string()]);

        // The relay leaves; the session re-plans without waiting for the
        // next maintenance cycle.
        assert!(handle.leave("alice".into(), None).await.unwrap());

        let snap = handle.snapshot().await.unwrap();
        assert!(!snap.relays.contains(&"alice".to_string()));
        assert!(!snap.relays.is_empty());

        let saw_update = |msgs: Vec<ServerMessage>| {
            msgs.iter()
                .filter(|m| matches!(m, ServerMessage::TopologyUpdate { .. }))
                .count()
        };
        // One update from the initial shift, one from the re-plan.
        assert_eq!(saw_update(drain(&mut rx_b)), 2);
        assert_eq!(saw_update(drain(&mut rx_c)), 2);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_latency_reports_rank_relay_candidates() {
        let (handle, _task) = spawn_session(2);

        for (id, latency) in [("near", 10u64), ("far", 500u64)] {
            let (s, _rx) = sink();
            handle
                .join(id.into(), true, format!("conn-{id}"), s)
                .await
                .unwrap();
            handle
                .report_latency(id.into(), "other".into(), latency)
                .await
                .unwrap();
        }

        let shift = handle.evaluate_topology().await.unwrap().expect("shift");
        assert_eq!(shift.relays, vec!["near".to_string()]);

        handle.cancel();
    }

    #[tokio::test]
    async fn test_implausible_latency_is_discarded() {
        let (handle, _task) = spawn_session(6);
        let (sink_a, _rx_a) = sink();

        handle
            .join("alice".into(), false, "conn-a".into(), sink_a)
            .await
            .unwrap();
        handle
            .report_latency("alice".into(), "bob".into(), 999_999_999)
            .await
            .unwrap();

        // The report was dropped, so the peer still ranks as unreported.
        let snap = handle.snapshot().await.unwrap();
        assert_eq!(snap.peers.len(), 1);

        handle.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_for_tracks_time_since_last_peer() {
        let (handle, _task) = spawn_session(6);
        let (sink_a, _rx_a) = sink();

        handle
            .join("alice".into(), false, "conn-a".into(), sink_a)
            .await
            .unwrap();
        let snap = handle.snapshot().await.unwrap();
        assert!(snap.empty_for.is_none());

        handle.leave("alice".into(), None).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;

        let snap = handle.snapshot().await.unwrap();
        assert!(snap.empty_for.expect("empty") >= Duration::from_secs(61));

        handle.cancel();
    }
}
