//! Load balancing across the instances of a route

use clap::ValueEnum;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::registry::ServiceInstance;

/// Instance selection policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalancingPolicy {
    #[default]
    RoundRobin,
    Random,
    LeastConnections,
}

impl fmt::Display for BalancingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RoundRobin => "round-robin",
            Self::Random => "random",
            Self::LeastConnections => "least-connections",
        })
    }
}

/// Picks an instance per attempt and tracks in-flight requests
pub struct LoadBalancer {
    policy: BalancingPolicy,
    /// Per-service round-robin position
    counters: DashMap<String, AtomicUsize>,
    /// In-flight requests per instance key; idle keys are removed
    active: Arc<DashMap<String, Arc<AtomicUsize>>>,
}

impl LoadBalancer {
    pub fn new(policy: BalancingPolicy) -> Self {
        Self {
            policy,
            counters: DashMap::new(),
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn policy(&self) -> BalancingPolicy {
        self.policy
    }

    /// Choose an instance of `service` from `candidates`
    ///
    /// Instances whose id is in `exclude` (already tried by this request) are
    /// skipped while untried ones remain; once all have been tried, any
    /// candidate may be chosen again.
    pub fn select<'a>(
        &self,
        service: &str,
        candidates: &'a [ServiceInstance],
        exclude: &HashSet<String>,
    ) -> Option<&'a ServiceInstance> {
        if candidates.is_empty() {
            return None;
        }

        let untried: Vec<&ServiceInstance> = candidates
            .iter()
            .filter(|instance| !exclude.contains(&instance.instance_id))
            .collect();
        let eligible: Vec<&ServiceInstance> = if untried.is_empty() {
            candidates.iter().collect()
        } else {
            untried
        };

        let selected = match self.policy {
            BalancingPolicy::RoundRobin => {
                let index = self
                    .counters
                    .entry(service.to_string())
                    .or_insert_with(|| AtomicUsize::new(0))
                    .fetch_add(1, Ordering::Relaxed);
                eligible[index % eligible.len()]
            }
            BalancingPolicy::Random => {
                let index = rand::thread_rng().gen_range(0..eligible.len());
                eligible[index]
            }
            BalancingPolicy::LeastConnections => eligible
                .iter()
                .copied()
                .min_by_key(|instance| self.active_connections(instance))
                .unwrap_or(eligible[0]),
        };

        Some(selected)
    }

    /// Count a request against `instance` until the guard drops
    pub fn acquire(&self, instance: &ServiceInstance) -> ConnectionGuard {
        let key = instance.key();
        // Increment under the shard lock so a concurrent release cannot
        // remove the entry between lookup and increment
        let counter = {
            let entry = self
                .active
                .entry(key.clone())
                .or_insert_with(|| Arc::new(AtomicUsize::new(0)));
            entry.fetch_add(1, Ordering::AcqRel);
            Arc::clone(entry.value())
        };
        ConnectionGuard {
            active: Arc::clone(&self.active),
            key,
            counter,
        }
    }

    /// In-flight requests currently forwarded to `instance`
    pub fn active_connections(&self, instance: &ServiceInstance) -> usize {
        self.active
            .get(&instance.key())
            .map(|counter| counter.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Instances with at least one request in flight
    pub fn tracked_instances(&self) -> usize {
        self.active.len()
    }
}

/// Releases an in-flight slot on drop
pub struct ConnectionGuard {
    active: Arc<DashMap<String, Arc<AtomicUsize>>>,
    key: String,
    counter: Arc<AtomicUsize>,
}

impl fmt::Debug for ConnectionGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionGuard")
            .field("key", &self.key)
            .field("in_flight", &self.counter.load(Ordering::Acquire))
            .finish()
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.counter.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.active
                .remove_if(&self.key, |_, counter| counter.load(Ordering::Acquire) == 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::InstanceStatus;
    use chrono::Utc;

    fn instances(n: usize) -> Vec<ServiceInstance> {
        let now = Utc::now();
        (0..n)
            .map(|i| ServiceInstance {
                service_name: "user".into(),
                instance_id: format!("i-{}", i),
                host: "10.0.0.1".into(),
                port: 8000 + i as u16,
                status: InstanceStatus::Up,
                registered_at: now,
                last_renewed_at: now,
            })
            .collect()
    }

    #[test]
    fn test_round_robin_visits_each_once() {
        let balancer = LoadBalancer::new(BalancingPolicy::RoundRobin);
        let candidates = instances(3);
        let none = HashSet::new();

        let picked: HashSet<String> = (0..3)
            .map(|_| {
                balancer
                    .select("user", &candidates, &none)
                    .unwrap()
                    .instance_id
                    .clone()
            })
            .collect();
        assert_eq!(picked.len(), 3);
    }

    #[test]
    fn test_round_robin_counters_are_per_service() {
        let balancer = LoadBalancer::new(BalancingPolicy::RoundRobin);
        let candidates = instances(2);
        let none = HashSet::new();

        let first = balancer.select("user", &candidates, &none).unwrap().instance_id.clone();
        let other = balancer.select("review", &candidates, &none).unwrap().instance_id.clone();
        assert_eq!(first, other);
    }

    #[test]
    fn test_exclude_prefers_untried() {
        let candidates = instances(3);
        let mut tried = HashSet::new();
        tried.insert("i-0".to_string());
        tried.insert("i-1".to_string());

        for policy in [
            BalancingPolicy::RoundRobin,
            BalancingPolicy::Random,
            BalancingPolicy::LeastConnections,
        ] {
            let balancer = LoadBalancer::new(policy);
            for _ in 0..5 {
                let picked = balancer.select("user", &candidates, &tried).unwrap();
                assert_eq!(picked.instance_id, "i-2");
            }
        }
    }

    #[test]
    fn test_reuse_when_all_tried() {
        let balancer = LoadBalancer::new(BalancingPolicy::RoundRobin);
        let candidates = instances(1);
        let mut tried = HashSet::new();
        tried.insert("i-0".to_string());

        assert_eq!(
            balancer.select("user", &candidates, &tried).unwrap().instance_id,
            "i-0"
        );
        assert!(balancer.select("user", &[], &tried).is_none());
    }

    #[test]
    fn test_least_connections_and_guard() {
        let balancer = LoadBalancer::new(BalancingPolicy::LeastConnections);
        let candidates = instances(2);
        let none = HashSet::new();

        let guard = balancer.acquire(&candidates[0]);
        assert_eq!(balancer.active_connections(&candidates[0]), 1);
        assert_eq!(
            balancer.select("user", &candidates, &none).unwrap().instance_id,
            "i-1"
        );

        drop(guard);
        assert_eq!(balancer.active_connections(&candidates[0]), 0);
    }

    #[test]
    fn test_idle_instances_are_forgotten() {
        let balancer = LoadBalancer::new(BalancingPolicy::LeastConnections);
        let churned = instances(5000);

        for instance in &churned {
            let first = balancer.acquire(instance);
            let second = balancer.acquire(instance);
            drop(first);
            assert_eq!(balancer.active_connections(instance), 1);
            drop(second);
        }
        assert_eq!(balancer.tracked_instances(), 0);

        let held = balancer.acquire(&churned[0]);
        assert_eq!(balancer.tracked_instances(), 1);
        drop(held);
        assert_eq!(balancer.tracked_instances(), 0);
    }

    #[test]
    fn test_policy_parsing() {
        assert_eq!(
            BalancingPolicy::from_str("least-connections", true).unwrap(),
            BalancingPolicy::LeastConnections
        );
        assert_eq!(BalancingPolicy::default().to_string(), "round-robin");
    }
}
