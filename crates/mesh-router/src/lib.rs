//! Peer-side mesh router.
//!
//! Tracks, per known peer, whether a direct link is live and the latest
//! latency estimate, and consumes the hub's topology updates. The router
//! never opens or closes connections itself: applying an event returns the
//! [`LinkAction`]s the embedding client should execute, and the client
//! reports the results back as further events. All inbound events flow
//! through the single [`MeshRouter::handle_event`] dispatch point.
//!
//! Routing degrades gracefully: an empty path from
//! [`MeshRouter::routing_path_for`] is not an error, it means "send this
//! through the signaling channel instead of a direct peer link."

use std::collections::{HashMap, HashSet};

use tracing::debug;

use signal_protocol::TopologyStrategy;

/// Inbound events, in the order the client observed them.
#[derive(Debug, Clone)]
pub enum RouterEvent {
    /// The hub committed a new topology decision.
    TopologyUpdate {
        strategy: TopologyStrategy,
        relays: Vec<String>,
    },
    /// A peer joined the session.
    PeerArrived { identity: String },
    /// A peer left the session.
    PeerLeft { identity: String },
    /// A direct link to a peer came up.
    LinkEstablished { identity: String },
    /// A direct link to a peer went down.
    LinkClosed { identity: String },
    /// A fresh latency measurement for a peer.
    LatencySample { identity: String, millis: u64 },
}

/// Connection work the embedding client should carry out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    /// Open a direct link to this peer.
    Open(String),
    /// Close the direct link to this peer.
    Close(String),
}

/// Per-peer link state.
#[derive(Debug, Clone, Default)]
struct Link {
    connected: bool,
    latency_ms: Option<u64>,
}

/// Router statistics for diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshStats {
    pub strategy: TopologyStrategy,
    pub known_peers: usize,
    pub connected_links: usize,
    pub relay_count: usize,
    pub min_latency_ms: Option<u64>,
    pub max_latency_ms: Option<u64>,
    pub avg_latency_ms: Option<f64>,
}

/// Topology-driven routing table for one session peer.
#[derive(Debug)]
pub struct MeshRouter {
    links: HashMap<String, Link>,
    strategy: TopologyStrategy,
    relays: HashSet<String>,
}

impl Default for MeshRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl MeshRouter {
    /// Create an empty router (full mesh until told otherwise).
    #[must_use]
    pub fn new() -> Self {
        Self {
            links: HashMap::new(),
            strategy: TopologyStrategy::FullMesh,
            relays: HashSet::new(),
        }
    }

    /// Current strategy.
    #[must_use]
    pub fn strategy(&self) -> TopologyStrategy {
        self.strategy
    }

    /// Identities currently designated as relays.
    #[must_use]
    pub fn relays(&self) -> &HashSet<String> {
        &self.relays
    }

    /// Feed one event through the router. Returns the connection work the
    /// client should carry out as a result.
    pub fn handle_event(&mut self, event: RouterEvent) -> Vec<LinkAction> {
        match event {
            RouterEvent::TopologyUpdate { strategy, relays } => {
                self.apply_topology(strategy, relays)
            }
            RouterEvent::PeerArrived { identity } => {
                self.links.entry(identity.clone()).or_default();
                match self.strategy {
                    // Full mesh: connect to everyone as they arrive.
                    TopologyStrategy::FullMesh => vec![LinkAction::Open(identity)],
                    // Relay routing: only relays get direct links.
                    TopologyStrategy::RelayBased => {
                        if self.relays.contains(&identity) {
                            vec![LinkAction::Open(identity)]
                        } else {
                            Vec::new()
                        }
                    }
                }
            }
            RouterEvent::PeerLeft { identity } => {
                let was_connected = self
                    .links
                    .remove(&identity)
                    .is_some_and(|link| link.connected);
                self.relays.remove(&identity);
                if was_connected {
                    vec![LinkAction::Close(identity)]
                } else {
                    Vec::new()
                }
            }
            RouterEvent::LinkEstablished { identity } => {
                self.links.entry(identity).or_default().connected = true;
                Vec::new()
            }
            RouterEvent::LinkClosed { identity } => {
                if let Some(link) = self.links.get_mut(&identity) {
                    link.connected = false;
                }
                Vec::new()
            }
            RouterEvent::LatencySample { identity, millis } => {
                self.links.entry(identity).or_default().latency_ms = Some(millis);
                Vec::new()
            }
        }
    }

    /// Compute the path for a message to `target`:
    ///
    /// - a live direct link wins: `[target]`
    /// - otherwise the connected relay with the lowest known latency:
    ///   `[relay, target]`
    /// - otherwise empty: fall back to the signaling channel
    #[must_use]
    pub fn routing_path_for(&self, target: &str) -> Vec<String> {
        if self
            .links
            .get(target)
            .is_some_and(|link| link.connected)
        {
            return vec![target.to_string()];
        }

        let mut candidates: Vec<(u64, &String)> = self
            .relays
            .iter()
            .filter(|relay| relay.as_str() != target)
            .filter_map(|relay| {
                let link = self.links.get(relay)?;
                link.connected
                    .then_some((link.latency_ms.unwrap_or(u64::MAX), relay))
            })
            .collect();
        candidates.sort();

        match candidates.first() {
            Some((_, relay)) => vec![(*relay).clone(), target.to_string()],
            None => Vec::new(),
        }
    }

    /// Summarize link and latency state.
    #[must_use]
    pub fn stats(&self) -> MeshStats {
        let latencies: Vec<u64> = self.links.values().filter_map(|l| l.latency_ms).collect();
        let avg = if latencies.is_empty() {
            None
        } else {
            Some(latencies.iter().sum::<u64>() as f64 / latencies.len() as f64)
        };

        MeshStats {
            strategy: self.strategy,
            known_peers: self.links.len(),
            connected_links: self.links.values().filter(|l| l.connected).count(),
            relay_count: self.relays.len(),
            min_latency_ms: latencies.iter().copied().min(),
            max_latency_ms: latencies.iter().copied().max(),
            avg_latency_ms: avg,
        }
    }

    /// Apply a topology decision and work out the link delta.
    fn apply_topology(
        &mut self,
        strategy: TopologyStrategy,
        relays: Vec<String>,
    ) -> Vec<LinkAction> {
        self.strategy = strategy;
        self.relays = relays.into_iter().collect();

        // Relays must be routable even if we only just learned about them.
        for relay in &self.relays {
            self.links.entry(relay.clone()).or_default();
        }

        let mut actions = Vec::new();
        match self.strategy {
            TopologyStrategy::FullMesh => {
                // Everyone should be directly connected.
                for (identity, link) in &self.links {
                    if !link.connected {
                        actions.push(LinkAction::Open(identity.clone()));
                    }
                }
            }
            TopologyStrategy::RelayBased => {
                // Drop direct links that are no longer part of the plan, then
                // make sure every relay is connected.
                for (identity, link) in &mut self.links {
                    if link.connected && !self.relays.contains(identity) {
                        link.connected = false;
                        actions.push(LinkAction::Close(identity.clone()));
                    }
                }
                for relay in &self.relays {
                    let connected = self
                        .links
                        .get(relay)
                        .is_some_and(|link| link.connected);
                    if !connected {
                        actions.push(LinkAction::Open(relay.clone()));
                    }
                }
            }
        }

        actions.sort_by_key(|action| match action {
            LinkAction::Close(id) => (0, id.clone()),
            LinkAction::Open(id) => (1, id.clone()),
        });

        debug!(
            target: "mesh.router",
            strategy = ?self.strategy,
            relays = self.relays.len(),
            actions = actions.len(),
            "Applied topology update"
        );

        actions
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn router_with_peers(peers: &[&str]) -> MeshRouter {
        let mut router = MeshRouter::new();
        for peer in peers {
            router.handle_event(RouterEvent::PeerArrived {
                identity: (*peer).to_string(),
            });
            router.handle_event(RouterEvent::LinkEstablished {
                identity: (*peer).to_string(),
            });
        }
        router
    }

    #[test]
    fn test_full_mesh_opens_links_on_arrival() {
        let mut router = MeshRouter::new();

        let actions = router.handle_event(RouterEvent::PeerArrived {
            identity: "bob".into(),
        });
        assert_eq!(actions, vec![LinkAction::Open("bob".into())]);
    }

    #[test]
    fn test_direct_path_when_link_is_live() {
        let router = router_with_peers(&["bob"]);
        assert_eq!(router.routing_path_for("bob"), vec!["bob".to_string()]);
    }

    #[test]
    fn test_relay_update_closes_non_relay_links() {
        let mut router = router_with_peers(&["bob", "carol", "relay1"]);

        let actions = router.handle_event(RouterEvent::TopologyUpdate {
            strategy: TopologyStrategy::RelayBased,
            relays: vec!["relay1".into()],
        });

        // bob and carol get cut; relay1 is already connected.
        assert_eq!(
            actions,
            vec![
                LinkAction::Close("bob".into()),
                LinkAction::Close("carol".into()),
            ]
        );
    }

    #[test]
    fn test_relay_update_opens_missing_relay_links() {
        let mut router = router_with_peers(&["bob"]);

        let actions = router.handle_event(RouterEvent::TopologyUpdate {
            strategy: TopologyStrategy::RelayBased,
            relays: vec!["relay1".into()],
        });

        assert_eq!(
            actions,
            vec![
                LinkAction::Close("bob".into()),
                LinkAction::Open("relay1".into()),
            ]
        );
    }

    #[test]
    fn test_path_through_lowest_latency_relay() {
        let mut router = MeshRouter::new();
        router.handle_event(RouterEvent::TopologyUpdate {
            strategy: TopologyStrategy::RelayBased,
            relays: vec!["r1".into(), "r2".into()],
        });
        for (relay, latency) in [("r1", 80), ("r2", 20)] {
            router.handle_event(RouterEvent::LinkEstablished {
                identity: relay.into(),
            });
            router.handle_event(RouterEvent::LatencySample {
                identity: relay.into(),
                millis: latency,
            });
        }

        assert_eq!(
            router.routing_path_for("bob"),
            vec!["r2".to_string(), "bob".to_string()]
        );
    }

    #[test]
    fn test_disconnected_relays_are_not_used() {
        let mut router = MeshRouter::new();
        router.handle_event(RouterEvent::TopologyUpdate {
            strategy: TopologyStrategy::RelayBased,
            relays: vec!["r1".into()],
        });
        // r1 never connected.
        assert!(router.routing_path_for("bob").is_empty());
    }

    #[test]
    fn test_empty_path_signals_fallback_not_error() {
        let router = MeshRouter::new();
        assert!(router.routing_path_for("nobody").is_empty());
    }

    #[test]
    fn test_peer_left_closes_and_forgets() {
        let mut router = router_with_peers(&["bob"]);

        let actions = router.handle_event(RouterEvent::PeerLeft {
            identity: "bob".into(),
        });
        assert_eq!(actions, vec![LinkAction::Close("bob".into())]);
        assert!(router.routing_path_for("bob").is_empty());

        // Leaving twice produces no duplicate work.
        let actions = router.handle_event(RouterEvent::PeerLeft {
            identity: "bob".into(),
        });
        assert!(actions.is_empty());
    }

    #[test]
    fn test_relay_is_not_its_own_relay_hop() {
        let mut router = MeshRouter::new();
        router.handle_event(RouterEvent::TopologyUpdate {
            strategy: TopologyStrategy::RelayBased,
            relays: vec!["r1".into()],
        });
        // r1's link is down, and routing to r1 must not suggest r1 itself.
        assert!(router.routing_path_for("r1").is_empty());
    }

    #[test]
    fn test_return_to_full_mesh_reopens_links() {
        let mut router = router_with_peers(&["bob", "carol"]);
        router.handle_event(RouterEvent::TopologyUpdate {
            strategy: TopologyStrategy::RelayBased,
            relays: vec!["bob".into()],
        });

        let actions = router.handle_event(RouterEvent::TopologyUpdate {
            strategy: TopologyStrategy::FullMesh,
            relays: vec![],
        });
        // carol was cut by the relay plan and needs reopening.
        assert_eq!(actions, vec![LinkAction::Open("carol".into())]);
    }

    #[test]
    fn test_stats_summarize_latency_spread() {
        let mut router = router_with_peers(&["a", "b", "c"]);
        for (peer, latency) in [("a", 10), ("b", 20), ("c", 60)] {
            router.handle_event(RouterEvent::LatencySample {
                identity: peer.into(),
                millis: latency,
            });
        }

        let stats = router.stats();
        assert_eq!(stats.known_peers, 3);
        assert_eq!(stats.connected_links, 3);
        assert_eq!(stats.min_latency_ms, Some(10));
        assert_eq!(stats.max_latency_ms, Some(60));
        assert_eq!(stats.avg_latency_ms, Some(30.0));
    }
}
