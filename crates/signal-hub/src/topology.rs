//! Topology planning: full mesh vs relay routing for one session.
//!
//! The planner is a pure function over a snapshot of the session's peers;
//! the owning session actor decides when to run it and commits the result.

use signal_protocol::TopologyStrategy;

use crate::config::TopologySettings;

/// A peer as seen by the planner.
#[derive(Debug, Clone)]
pub struct CandidatePeer {
    pub identity: String,
    /// Client-declared willingness to relay for others.
    pub relay_capable: bool,
    /// Mean of the peer's reported latencies to other session members.
    /// `None` when the peer has not reported yet.
    pub avg_latency_ms: Option<f64>,
}

/// The planner's output for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyPlan {
    pub strategy: TopologyStrategy,
    /// Selected relay identities, best candidate first. Empty for full mesh.
    pub relays: Vec<String>,
}

/// Compute the topology decision for a session.
///
/// Peer counts below the full-mesh threshold stay fully meshed. At or above
/// it, `ceil(peers / fanout)` relays are selected: peers that declared relay
/// capability are ranked by lowest average latency and chosen first; any
/// remaining slots are filled from the rest by the same ranking. Unreported
/// latencies rank last, and ties break on identity so repeated plans over
/// unchanged input are identical.
#[must_use]
pub fn plan(peers: &[CandidatePeer], settings: &TopologySettings) -> TopologyPlan {
    if peers.len() < settings.full_mesh_threshold {
        return TopologyPlan {
            strategy: TopologyStrategy::FullMesh,
            relays: Vec::new(),
        };
    }

    let fanout = settings.relay_fanout.max(1);
    let target = peers.len().div_ceil(fanout);

    let mut ranked: Vec<&CandidatePeer> = peers.iter().collect();
    ranked.sort_by(|a, b| {
        b.relay_capable
            .cmp(&a.relay_capable)
            .then_with(|| {
                a.avg_latency_ms
                    .unwrap_or(f64::INFINITY)
                    .total_cmp(&b.avg_latency_ms.unwrap_or(f64::INFINITY))
            })
            .then_with(|| a.identity.cmp(&b.identity))
    });

    TopologyPlan {
        strategy: TopologyStrategy::RelayBased,
        relays: ranked
            .into_iter()
            .take(target)
            .map(|p| p.identity.clone())
            .collect(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn peer(identity: &str, relay_capable: bool, avg_latency_ms: Option<f64>) -> CandidatePeer {
        CandidatePeer {
            identity: identity.to_string(),
            relay_capable,
            avg_latency_ms,
        }
    }

    fn settings() -> TopologySettings {
        TopologySettings {
            full_mesh_threshold: 6,
            relay_fanout: 6,
            max_latency_ms: 60_000,
        }
    }

    #[test]
    fn test_below_threshold_is_full_mesh() {
        let peers: Vec<_> = (0..5).map(|i| peer(&format!("p{i}"), true, None)).collect();

        let plan = plan(&peers, &settings());
        assert_eq!(plan.strategy, TopologyStrategy::FullMesh);
        assert!(plan.relays.is_empty());
    }

    #[test]
    fn test_at_threshold_selects_one_relay() {
        // Six peers, one relay-capable: ceil(6/6) = 1 relay, and the
        // declared-capable peer wins even with worse latency.
        let mut peers: Vec<_> = (0..5)
            .map(|i| peer(&format!("p{i}"), false, Some(10.0)))
            .collect();
        peers.push(peer("volunteer", true, Some(80.0)));

        let plan = plan(&peers, &settings());
        assert_eq!(plan.strategy, TopologyStrategy::RelayBased);
        assert_eq!(plan.relays, vec!["volunteer".to_string()]);
    }

    #[test]
    fn test_capable_peers_ranked_by_latency() {
        let peers = vec![
            peer("slow", true, Some(90.0)),
            peer("fast", true, Some(15.0)),
            peer("silent", true, None),
            peer("a", false, Some(1.0)),
            peer("b", false, Some(1.0)),
            peer("c", false, Some(1.0)),
            peer("d", false, Some(1.0)),
        ];

        // ceil(7/6) = 2: both slots go to capable peers, lowest latency first.
        let plan = plan(&peers, &settings());
        assert_eq!(plan.relays, vec!["fast".to_string(), "slow".to_string()]);
    }

    #[test]
    fn test_shortfall_filled_by_lowest_latency() {
        let mut peers = vec![peer("volunteer", true, Some(50.0))];
        peers.extend((0..12).map(|i| peer(&format!("p{i:02}"), false, Some(f64::from(i) + 1.0))));

        // 13 peers, fanout 6: ceil(13/6) = 3. One capable peer, then the two
        // lowest-latency regulars.
        let plan = plan(&peers, &settings());
        assert_eq!(
            plan.relays,
            vec![
                "volunteer".to_string(),
                "p00".to_string(),
                "p01".to_string()
            ]
        );
    }

    #[test]
    fn test_unreported_latency_ranks_last() {
        let peers = vec![
            peer("silent", true, None),
            peer("measured", true, Some(200.0)),
            peer("a", false, Some(1.0)),
            peer("b", false, Some(1.0)),
            peer("c", false, Some(1.0)),
            peer("d", false, Some(1.0)),
        ];

        let plan = plan(&peers, &settings());
        assert_eq!(plan.relays, vec!["measured".to_string()]);
    }

    #[test]
    fn test_plan_is_deterministic_on_ties() {
        let peers: Vec<_> = ["zeta", "alpha", "mid"]
            .iter()
            .map(|id| peer(id, false, Some(5.0)))
            .collect();

        let mut low = settings();
        low.full_mesh_threshold = 2;

        let first = plan(&peers, &low);
        let second = plan(&peers, &low);
        assert_eq!(first, second);
        assert_eq!(first.relays, vec!["alpha".to_string()]);
    }

    #[test]
    fn test_relay_count_follows_fanout() {
        let peers: Vec<_> = (0..20)
            .map(|i| peer(&format!("p{i:02}"), false, Some(1.0)))
            .collect();

        let mut cfg = settings();
        cfg.relay_fanout = 6;
        assert_eq!(plan(&peers, &cfg).relays.len(), 4); // ceil(20/6)

        cfg.relay_fanout = 10;
        assert_eq!(plan(&peers, &cfg).relays.len(), 2); // ceil(20/10)
    }
}
