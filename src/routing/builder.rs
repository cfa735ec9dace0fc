//! Routing table builder
//!
//! Rebuilds the routing table whenever the registry reports a change and on
//! a fixed tick. The tick picks up instances that lapsed lazily (no sweep has
//! removed them yet), which bounds staleness even while the monitor is in
//! self-preservation.
//!
//! The current table lives in an `ArcSwap`; readers take one `Arc` and use it
//! for the whole request.

use arc_swap::ArcSwap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use super::route::Route;
use super::table::RoutingTable;
use crate::registry::InstanceRegistry;

/// Shared handle to the published routing table
pub type SharedTable = Arc<ArcSwap<RoutingTable>>;

/// Builds and publishes routing tables
pub struct TableBuilder {
    routes: Vec<Arc<Route>>,
    registry: Arc<InstanceRegistry>,
    table: SharedTable,
    rebuild_interval: Duration,
}

impl TableBuilder {
    /// Create a builder and publish an initial table
    pub fn new(routes: Vec<Route>, registry: Arc<InstanceRegistry>, rebuild_interval: Duration) -> Self {
        let routes: Vec<Arc<Route>> = routes.into_iter().map(Arc::new).collect();
        let initial = RoutingTable::from_registry(&routes, &registry);
        Self {
            routes,
            registry,
            table: Arc::new(ArcSwap::from_pointee(initial)),
            rebuild_interval,
        }
    }

    /// Handle readers use to load the current table
    pub fn table(&self) -> SharedTable {
        Arc::clone(&self.table)
    }

    /// Currently published table
    pub fn current(&self) -> Arc<RoutingTable> {
        self.table.load_full()
    }

    pub fn routes(&self) -> &[Arc<Route>] {
        &self.routes
    }

    /// Build from the registry and publish
    pub fn rebuild(&self) -> Arc<RoutingTable> {
        let table = Arc::new(RoutingTable::from_registry(&self.routes, &self.registry));
        self.table.store(Arc::clone(&table));
        debug!(
            generation = table.generation(),
            routes = table.entries().len(),
            "Published routing table"
        );
        table
    }

    /// Spawn the rebuild loop; it exits when `shutdown` flips to true
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        info!(
            routes = self.routes.len(),
            interval_ms = self.rebuild_interval.as_millis() as u64,
            "Starting routing table builder"
        );

        let mut changes = self.registry.subscribe();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(self.rebuild_interval);
            tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        changes.borrow_and_update();
                        self.rebuild();
                    }
                    _ = tick.tick() => {
                        self.rebuild();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Routing table builder stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{InstanceStatus, Registration};
    use crate::routing::{RouteConfig, RouteDefaults};

    fn builder(registry: Arc<InstanceRegistry>, interval: Duration) -> TableBuilder {
        let route =
            Route::from_config(&RouteConfig::new("/users/**", "user"), RouteDefaults::default())
                .unwrap();
        TableBuilder::new(vec![route], registry, interval)
    }

    fn instance_count(table: &RoutingTable) -> usize {
        table.resolve("/users/1").map(|e| e.instances.len()).unwrap_or(0)
    }

    #[tokio::test]
    async fn test_rebuild_reflects_registry() {
        let registry = Arc::new(InstanceRegistry::new(Duration::from_secs(30)));
        let builder = builder(Arc::clone(&registry), Duration::from_secs(5));
        assert_eq!(instance_count(&builder.current()), 0);

        registry
            .register(Registration::new("user", "10.0.0.1", 8080))
            .unwrap();
        // Not published until rebuilt
        assert_eq!(instance_count(&builder.current()), 0);

        builder.rebuild();
        assert_eq!(instance_count(&builder.current()), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_notification_triggers_rebuild() {
        let registry = Arc::new(InstanceRegistry::new(Duration::from_secs(30)));
        let builder = builder(Arc::clone(&registry), Duration::from_secs(3600));
        let table = builder.table();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = builder.spawn(shutdown_rx);

        registry
            .register(Registration::new("user", "10.0.0.1", 8080).with_instance_id("a"))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(instance_count(&table.load()), 1);

        registry
            .update_status("user", "a", InstanceStatus::OutOfService)
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(instance_count(&table.load()), 0);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_drops_lapsed_instances() {
        let registry = Arc::new(InstanceRegistry::new(Duration::from_secs(10)));
        registry
            .register(Registration::new("user", "10.0.0.1", 8080))
            .unwrap();

        let builder = builder(Arc::clone(&registry), Duration::from_secs(2));
        let table = builder.table();
        assert_eq!(instance_count(&table.load()), 1);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = builder.spawn(shutdown_rx);

        // No monitor running: only the rebuild tick can notice the lapse
        tokio::time::sleep(Duration::from_secs(12) + Duration::from_millis(1)).await;
        assert_eq!(instance_count(&table.load()), 0);
        assert_eq!(registry.instance_count(), 1);

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
