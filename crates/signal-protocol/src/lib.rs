//! Lattice signaling wire protocol.
//!
//! JSON messages exchanged over the persistent WebSocket between a peer and
//! the signal hub. Client-originated and server-pushed messages are separate
//! enums so each side only ever parses the frames it can receive.
//!
//! Signal payloads are opaque: the hub forwards them verbatim and never
//! inspects their contents.

use serde::{Deserialize, Serialize};

/// Target of the broadcast form of [`ClientMessage::Signal`].
pub const BROADCAST_TARGET: &str = "*";

/// Messages a client sends to the hub.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Present a credential. Must be the first frame on a new connection.
    Authenticate { token: String },

    /// Join a session under a display identity.
    Join {
        session_id: String,
        identity: String,
        #[serde(default)]
        relay_capable: bool,
    },

    /// Leave the current session (the connection stays open).
    Leave,

    /// Relay an opaque payload to one peer, or to the whole session when
    /// `target` is [`BROADCAST_TARGET`].
    Signal {
        target: String,
        payload: serde_json::Value,
    },

    /// Report a measured round-trip latency to another peer.
    ReportLatency { peer: String, millis: u64 },

    /// Keep-alive. Echoed back as [`ServerMessage::Pong`].
    Ping { timestamp: u64 },
}

/// Messages the hub pushes to a client.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Credential accepted; the connection may now join a session.
    Authenticated { identity: String },

    /// Join accepted. Carries the peers already present so the new peer can
    /// start connecting without waiting for arrival notifications to cross.
    Joined {
        session_id: String,
        peers: Vec<PeerSummary>,
        strategy: TopologyStrategy,
        relays: Vec<String>,
    },

    /// Another peer joined the session.
    PeerArrived { identity: String },

    /// A peer left the session (explicit leave, disconnect, or eviction).
    PeerLeft { identity: String },

    /// A relayed payload from another peer in the session.
    SignalReceived {
        from: String,
        payload: serde_json::Value,
    },

    /// The session's topology decision changed.
    TopologyUpdate {
        strategy: TopologyStrategy,
        relays: Vec<String>,
    },

    /// The request was rejected by admission control. `reset_at` is unix
    /// seconds; the caller should back off until then.
    RateLimited {
        limit: u32,
        remaining: u32,
        reset_at: u64,
    },

    /// Keep-alive response carrying the client's original timestamp.
    Pong { timestamp: u64 },

    /// Request rejected. Internal detail is never included.
    Error { code: ErrorCode, message: String },
}

/// Session-wide connectivity policy.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TopologyStrategy {
    /// Every peer connects to every other peer.
    FullMesh,
    /// Traffic is funneled through designated relay peers.
    RelayBased,
}

/// A peer as seen in join responses and snapshots.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerSummary {
    pub identity: String,
    pub relay_capable: bool,
    pub is_relay: bool,
}

/// Client-safe error codes.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Bad or expired credential. The connection is closed.
    AuthenticationFailed,
    /// A session operation was attempted before authenticating.
    NotAuthenticated,
    /// Join was attempted while already in a session.
    AlreadyInSession,
    /// Signal or latency report sent while not in a session.
    NotInSession,
    /// The frame could not be parsed.
    MalformedMessage,
    /// Something went wrong server-side.
    Internal,
}

impl ServerMessage {
    /// Build an error message.
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    /// Serialize to the wire encoding.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse from the wire encoding.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

impl ClientMessage {
    /// Serialize to the wire encoding.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse from the wire encoding.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
