//! Actor model for the session registry.
//!
//! ```text
//! RegistryActor (singleton)
//! └── supervises N SessionActors
//!     └── SessionActor (one per active session)
//!         └── owns peers, latencies, and the topology decision
//! ```
//!
//! Connections talk to the registry only to join; after that they hold a
//! `SessionHandle` and reach their session directly, so unrelated sessions
//! never contend.

mod messages;
mod registry;
mod session;

pub use messages::{
    JoinAccepted, PeerSink, RegistryStatus, SessionSnapshot, TopologyShift,
};
pub use registry::RegistryHandle;
pub use session::SessionHandle;
