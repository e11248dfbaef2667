//! Message types for actor communication.
//!
//! All inter-actor communication uses strongly-typed message passing via
//! `tokio::sync::mpsc`. Request-reply uses `tokio::sync::oneshot`.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use signal_protocol::{PeerSummary, ServerMessage, TopologyStrategy};

use crate::errors::HubError;

use super::session::SessionHandle;

/// Outbound delivery handle for one connected peer. The connection side
/// drains this into the WebSocket; delivery through it is best-effort.
pub type PeerSink = mpsc::Sender<ServerMessage>;

/// Messages sent to the `RegistryActor`.
#[derive(Debug)]
pub enum RegistryMessage {
    /// Admit a peer into a session, creating the session on first join.
    Join {
        session_id: String,
        identity: String,
        relay_capable: bool,
        connection_id: String,
        sink: PeerSink,
        respond_to: oneshot::Sender<Result<(JoinAccepted, SessionHandle), HubError>>,
    },

    /// Handles to all active sessions (for the maintenance cycle).
    Sessions {
        respond_to: oneshot::Sender<Vec<SessionHandle>>,
    },

    /// Remove a session if it has been empty for at least `grace`.
    /// Serialized with joins, so removal never races a new peer in.
    RemoveIfEmpty {
        session_id: String,
        grace: Duration,
        respond_to: oneshot::Sender<bool>,
    },

    /// Current registry status (for health checks).
    Status {
        respond_to: oneshot::Sender<RegistryStatus>,
    },

    /// Initiate graceful shutdown.
    Shutdown {
        deadline: Duration,
        respond_to: oneshot::Sender<Result<(), HubError>>,
    },
}

/// Messages sent to a `SessionActor`.
#[derive(Debug)]
pub enum SessionMessage {
    /// A peer joins (or re-joins) the session.
    Join {
        identity: String,
        relay_capable: bool,
        connection_id: String,
        sink: PeerSink,
        respond_to: oneshot::Sender<JoinAccepted>,
    },

    /// A peer leaves. `connection_id` guards against a stale connection
    /// removing a peer that has since re-joined on a new connection; `None`
    /// removes unconditionally. Responds with whether a peer was removed.
    Leave {
        identity: String,
        connection_id: Option<String>,
        respond_to: oneshot::Sender<bool>,
    },

    /// Forward an opaque payload to one peer or to the whole session.
    Signal {
        from: String,
        target: String,
        payload: serde_json::Value,
    },

    /// A latency report from `from` about its link to `to`.
    ReportLatency {
        from: String,
        to: String,
        millis: u64,
    },

    /// Run the topology planner and, if the decision changed, commit it and
    /// broadcast the update in the same step.
    EvaluateTopology {
        respond_to: oneshot::Sender<Option<TopologyShift>>,
    },

    /// Current session state.
    Snapshot {
        respond_to: oneshot::Sender<SessionSnapshot>,
    },
}

// ----------------------------------------------------------------------------
// Supporting types
// ----------------------------------------------------------------------------

/// Result of a successful join: what the new peer needs to start connecting.
#[derive(Debug, Clone)]
pub struct JoinAccepted {
    /// Peers already present (excluding the joiner).
    pub peers: Vec<PeerSummary>,
    /// Current topology strategy.
    pub strategy: TopologyStrategy,
    /// Current relay identities.
    pub relays: Vec<String>,
}

/// A committed topology change.
#[derive(Debug, Clone)]
pub struct TopologyShift {
    pub strategy: TopologyStrategy,
    pub relays: Vec<String>,
}

/// Point-in-time state of a session.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub peers: Vec<PeerSummary>,
    pub strategy: TopologyStrategy,
    pub relays: Vec<String>,
    /// How long the session has had zero peers, if it is empty.
    pub empty_for: Option<Duration>,
    pub created_at: i64,
}

/// Registry status for health checks.
#[derive(Debug, Clone, Copy)]
pub struct RegistryStatus {
    pub session_count: usize,
    pub peer_count: usize,
    pub is_draining: bool,
}
