use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use caderpc_common::{CadeError, Endpoint};
use rand::Rng;

/// Picks one endpoint out of a candidate list.
///
/// Candidate lists shrink as callers evict endpoints whose breakers are
/// open, so implementations must not assume the list is stable between
/// calls. An empty list yields `None`.
pub trait LoadBalancer: Send + Sync {
    fn select<'a>(&self, candidates: &'a [Endpoint]) -> Option<&'a Endpoint>;

    fn name(&self) -> &'static str;
}

/// Uniform random selection.
#[derive(Debug, Default)]
pub struct RandomLoadBalancer;

impl LoadBalancer for RandomLoadBalancer {
    fn select<'a>(&self, candidates: &'a [Endpoint]) -> Option<&'a Endpoint> {
        if candidates.is_empty() {
            return None;
        }
        let index = rand::rng().random_range(0..candidates.len());
        candidates.get(index)
    }

    fn name(&self) -> &'static str {
        "random"
    }
}

/// Round-robin over a shared, wrapping counter.
///
/// Concurrent callers may read the same counter value and pick the same
/// endpoint; the index is always reduced modulo the current list length.
#[derive(Debug, Default)]
pub struct RoundRobinLoadBalancer {
    next: AtomicUsize,
}

impl LoadBalancer for RoundRobinLoadBalancer {
    fn select<'a>(&self, candidates: &'a [Endpoint]) -> Option<&'a Endpoint> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        candidates.get(index % candidates.len())
    }

    fn name(&self) -> &'static str {
        "roundrobin"
    }
}

/// Load balancer choice in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalancerKind {
    #[default]
    Random,
    RoundRobin,
}

impl LoadBalancerKind {
    pub fn build(self) -> Arc<dyn LoadBalancer> {
        match self {
            LoadBalancerKind::Random => Arc::new(RandomLoadBalancer),
            LoadBalancerKind::RoundRobin => Arc::new(RoundRobinLoadBalancer::default()),
        }
    }
}

impl FromStr for LoadBalancerKind {
    type Err = CadeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "random" => Ok(LoadBalancerKind::Random),
            "roundrobin" => Ok(LoadBalancerKind::RoundRobin),
            other => Err(CadeError::Config(format!("unknown load balancer '{}'", other))),
        }
    }
}

impl fmt::Display for LoadBalancerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadBalancerKind::Random => f.write_str("random"),
            LoadBalancerKind::RoundRobin => f.write_str("roundrobin"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn endpoints(n: u16) -> Vec<Endpoint> {
        (0..n).map(|i| Endpoint::new("Calculator", "10.0.0.1", 9000 + i)).collect()
    }

    #[test]
    fn test_round_robin() {
        let lb = RoundRobinLoadBalancer::default();
        let nodes = endpoints(3);

        assert_eq!(lb.select(&nodes), Some(&nodes[0]));
        assert_eq!(lb.select(&nodes), Some(&nodes[1]));
        assert_eq!(lb.select(&nodes), Some(&nodes[2]));
        // wraps around
        assert_eq!(lb.select(&nodes), Some(&nodes[0]));
    }

    #[test]
    fn test_round_robin_visits_every_candidate() {
        let lb = RoundRobinLoadBalancer::default();
        for n in 1..=7 {
            let nodes = endpoints(n);
            let seen: HashSet<_> = (0..n).filter_map(|_| lb.select(&nodes)).collect();
            assert_eq!(seen.len(), n as usize);
        }
    }

    #[test]
    fn test_round_robin_survives_shrinking_list() {
        let lb = RoundRobinLoadBalancer::default();
        let mut nodes = endpoints(5);
        for _ in 0..4 {
            lb.select(&nodes);
        }
        nodes.truncate(2);
        for _ in 0..10 {
            assert!(lb.select(&nodes).is_some());
        }
    }

    #[test]
    fn test_round_robin_wraps_counter() {
        let lb = RoundRobinLoadBalancer {
            next: AtomicUsize::new(usize::MAX),
        };
        let nodes = endpoints(3);
        assert!(lb.select(&nodes).is_some());
        assert_eq!(lb.select(&nodes), Some(&nodes[0]));
    }

    #[test]
    fn test_random_stays_in_bounds() {
        let lb = RandomLoadBalancer;
        let nodes = endpoints(4);
        let seen: HashSet<_> = (0..200).filter_map(|_| lb.select(&nodes)).collect();
        assert!(seen.len() > 1);
        assert!(seen.iter().all(|e| nodes.contains(e)));
    }

    #[test]
    fn test_empty_nodes_returns_none() {
        assert_eq!(RandomLoadBalancer.select(&[]), None);
        assert_eq!(RoundRobinLoadBalancer::default().select(&[]), None);
    }

    #[test]
    fn test_single_node() {
        let nodes = endpoints(1);
        let lb = RoundRobinLoadBalancer::default();
        assert_eq!(lb.select(&nodes), Some(&nodes[0]));
        assert_eq!(lb.select(&nodes), Some(&nodes[0]));
        assert_eq!(RandomLoadBalancer.select(&nodes), Some(&nodes[0]));
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!("random".parse::<LoadBalancerKind>().unwrap(), LoadBalancerKind::Random);
        assert_eq!("RoundRobin".parse::<LoadBalancerKind>().unwrap(), LoadBalancerKind::RoundRobin);
        assert_eq!("round_robin".parse::<LoadBalancerKind>().unwrap(), LoadBalancerKind::RoundRobin);
        assert!("weighted".parse::<LoadBalancerKind>().is_err());
        assert_eq!(LoadBalancerKind::RoundRobin.build().name(), "roundrobin");
        assert_eq!(LoadBalancerKind::default().to_string(), "random");
    }
}
