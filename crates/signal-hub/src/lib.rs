//! Signal Hub Service Library
//!
//! The Lattice signal hub is a stateful WebSocket signaling server for
//! peer-to-peer audio/video sessions:
//!
//! - Admits authenticated peers into named sessions and relays opaque
//!   negotiation payloads between them
//! - Continuously decides, per session, whether peers should be fully
//!   meshed or routed through designated relay peers, driven by live
//!   latency telemetry
//! - Gates every operation behind per-identity admission control so abusive
//!   clients cannot degrade service for others
//!
//! # Architecture
//!
//! The session registry is an actor hierarchy:
//!
//! ```text
//! RegistryActor (singleton)
//! └── supervises N SessionActors
//!     └── SessionActor (one per active session)
//!         └── owns peers, latencies, and the topology decision
//! ```
//!
//! Connections are independent task pairs feeding events through one
//! dispatch point each; the mesh controller is a cancellable periodic task
//! that only ever talks to sessions through registry operations.
//!
//! # Modules
//!
//! - [`actors`] - session registry actor hierarchy
//! - [`hub`] - WebSocket listener, per-connection state machine, reaper
//! - [`ratelimit`] - fixed-window admission control
//! - [`topology`] - pure topology planner
//! - [`mesh`] - recurring maintenance cycle
//! - [`auth`] - credential verification boundary
//! - [`config`] - service configuration from environment
//! - [`observability`] - health probes, status counts, metrics

pub mod actors;
pub mod auth;
pub mod config;
pub mod errors;
pub mod hub;
pub mod mesh;
pub mod observability;
pub mod ratelimit;
pub mod topology;
