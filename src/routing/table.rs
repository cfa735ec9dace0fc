//! Routing table
//!
//! An immutable mapping from route prefixes to the `UP` instances of their
//! target service. A table is never modified after it is built; the builder
//! publishes a new one instead.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use super::route::Route;
use crate::registry::{InstanceRegistry, ServiceInstance};

/// A route and the instances it may be forwarded to
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub route: Arc<Route>,
    pub instances: Vec<ServiceInstance>,
}

/// Prefix → instance set mapping, longest prefix first
#[derive(Debug, Clone)]
pub struct RoutingTable {
    entries: Vec<RouteEntry>,
    generation: u64,
    built_at: DateTime<Utc>,
}

impl RoutingTable {
    /// Table with every route and no instances
    pub fn empty(routes: &[Arc<Route>]) -> Self {
        Self::build(routes, &HashMap::new(), 0)
    }

    /// Build a table from per-service snapshots
    ///
    /// Services missing from `snapshots` get an empty instance set.
    pub fn build(
        routes: &[Arc<Route>],
        snapshots: &HashMap<String, Vec<ServiceInstance>>,
        generation: u64,
    ) -> Self {
        let mut entries: Vec<RouteEntry> = routes
            .iter()
            .map(|route| RouteEntry {
                route: Arc::clone(route),
                instances: snapshots.get(&route.service).cloned().unwrap_or_default(),
            })
            .collect();

        entries.sort_by(|a, b| {
            b.route
                .prefix
                .len()
                .cmp(&a.route.prefix.len())
                .then_with(|| a.route.prefix.cmp(&b.route.prefix))
        });

        Self {
            entries,
            generation,
            built_at: Utc::now(),
        }
    }

    /// Build from the registry's current snapshots
    pub fn from_registry(routes: &[Arc<Route>], registry: &InstanceRegistry) -> Self {
        let generation = registry.generation();
        let mut snapshots = HashMap::new();
        for route in routes {
            snapshots
                .entry(route.service.clone())
                .or_insert_with(|| registry.snapshot(&route.service));
        }
        Self::build(routes, &snapshots, generation)
    }

    /// Longest-prefix match for `path`
    pub fn resolve(&self, path: &str) -> Option<&RouteEntry> {
        self.entries.iter().find(|entry| entry.route.matches(path))
    }

    pub fn entries(&self) -> &[RouteEntry] {
        &self.entries
    }

    /// Registry generation the table was built from
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn built_at(&self) -> DateTime<Utc> {
        self.built_at
    }

    /// Whether every route has at least one instance
    pub fn is_fully_served(&self) -> bool {
        self.entries.iter().all(|entry| !entry.instances.is_empty())
    }

    /// Serializable view for the management API
    pub fn view(&self) -> RoutingTableView {
        RoutingTableView {
            generation: self.generation,
            built_at: self.built_at,
            routes: self
                .entries
                .iter()
                .map(|entry| RouteView {
                    route: entry.route.as_ref().clone(),
                    instances: entry.instances.iter().map(ServiceInstance::authority).collect(),
                })
                .collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteView {
    #[serde(flatten)]
    pub route: Route,
    pub instances: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RoutingTableView {
    pub generation: u64,
    pub built_at: DateTime<Utc>,
    pub routes: Vec<RouteView>,
}
