//! In-memory instance registry
//!
//! ## Thread Safety
//!
//! Instances are grouped per service in a `DashMap`, so writers for one
//! service only contend with readers of services in the same shard. Every
//! membership or status change bumps a generation counter on a `watch`
//! channel that the routing table builder subscribes to.
//!
//! Lease deadlines use `tokio::time::Instant` so expiry follows the runtime
//! clock. Reads apply lazy expiry: an instance past its deadline is never
//! returned, even if the monitor has not swept it yet.

use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

use super::instance::{
    normalize_service_name, InstanceStatus, Lease, Registration, ServiceInstance,
};
use crate::types::{GatewayError, Result};

/// A registered instance and its lease deadline
#[derive(Debug, Clone)]
struct InstanceRecord {
    instance: ServiceInstance,
    deadline: Instant,
}

impl InstanceRecord {
    fn is_expired(&self, now: Instant) -> bool {
        now > self.deadline
    }
}

/// Registry of live service instances
pub struct InstanceRegistry {
    /// service name → (instance id → record)
    services: DashMap<String, HashMap<String, InstanceRecord>>,
    lease_duration: Duration,
    changes: watch::Sender<u64>,
}

impl InstanceRegistry {
    /// Create an empty registry granting leases of `lease_duration`
    pub fn new(lease_duration: Duration) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            services: DashMap::new(),
            lease_duration,
            changes,
        }
    }

    pub fn lease_duration(&self) -> Duration {
        self.lease_duration
    }

    /// Subscribe to change notifications (value is a generation counter)
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.changes.subscribe()
    }

    /// Current change generation
    pub fn generation(&self) -> u64 {
        *self.changes.borrow()
    }

    fn notify(&self) {
        self.changes.send_modify(|generation| *generation += 1);
    }

    fn lease_for(&self, instance: &ServiceInstance) -> Lease {
        let ttl = chrono::Duration::from_std(self.lease_duration)
            .unwrap_or_else(|_| chrono::Duration::zero());
        Lease {
            service_name: instance.service_name.clone(),
            instance_id: instance.instance_id.clone(),
            duration_ms: self.lease_duration.as_millis() as u64,
            expires_at: instance.last_renewed_at + ttl,
        }
    }

    /// Insert or replace an instance and start a fresh lease
    ///
    /// Re-registering an existing instance resets its deadline and keeps its
    /// original registration timestamp.
    pub fn register(&self, registration: Registration) -> Result<Lease> {
        registration.validate()?;

        let service = registration.service_key();
        let instance_id = registration.resolved_instance_id();
        let now = Instant::now();
        let wall_now = Utc::now();

        let lease = {
            let mut instances = self.services.entry(service.clone()).or_default();

            let registered_at = instances
                .get(&instance_id)
                .filter(|existing| !existing.is_expired(now))
                .map(|existing| existing.instance.registered_at)
                .unwrap_or(wall_now);

            let instance = ServiceInstance {
                service_name: service.clone(),
                instance_id: instance_id.clone(),
                host: registration.host.trim().to_string(),
                port: registration.port,
                status: registration.status,
                registered_at,
                last_renewed_at: wall_now,
            };
            let lease = self.lease_for(&instance);

            instances.insert(
                instance_id.clone(),
                InstanceRecord {
                    instance,
                    deadline: now + self.lease_duration,
                },
            );
            lease
        };

        info!(
            service = %service,
            instance = %instance_id,
            host = %registration.host,
            port = registration.port,
            status = %registration.status,
            "Registered instance"
        );
        self.notify();
        Ok(lease)
    }

    /// Extend an instance's lease
    ///
    /// Fails with `NotFound` when the instance is unknown or its lease has
    /// already lapsed; the caller must register again.
    pub fn renew(&self, service_name: &str, instance_id: &str) -> Result<Lease> {
        let service = normalize_service_name(service_name);
        let now = Instant::now();

        let mut lapsed = false;
        let lease = match self.services.get_mut(&service) {
            Some(mut instances) => {
                let expired = instances
                    .get(instance_id)
                    .map(|record| record.is_expired(now));
                match expired {
                    Some(true) => {
                        instances.remove(instance_id);
                        lapsed = true;
                        None
                    }
                    Some(false) => instances.get_mut(instance_id).map(|record| {
                        record.deadline = now + self.lease_duration;
                        record.instance.last_renewed_at = Utc::now();
                        self.lease_for(&record.instance)
                    }),
                    None => None,
                }
            }
            None => None,
        };

        if lapsed {
            self.services.remove_if(&service, |_, instances| instances.is_empty());
            info!(service = %service, instance = %instance_id, "Renewal after lease expiry, instance dropped");
            self.notify();
        }

        match lease {
            Some(lease) => {
                debug!(service = %service, instance = %instance_id, "Renewed lease");
                Ok(lease)
            }
            None => Err(GatewayError::NotFound(format!(
                "instance {}/{} is not registered",
                service, instance_id
            ))),
        }
    }

    /// Change the status of a live instance
    pub fn update_status(
        &self,
        service_name: &str,
        instance_id: &str,
        status: InstanceStatus,
    ) -> Result<()> {
        let service = normalize_service_name(service_name);
        let now = Instant::now();

        let previous = self.services.get_mut(&service).and_then(|mut instances| {
            instances
                .get_mut(instance_id)
                .filter(|record| !record.is_expired(now))
                .map(|record| std::mem::replace(&mut record.instance.status, status))
        });

        match previous {
            Some(previous) => {
                if previous != status {
                    info!(
                        service = %service,
                        instance = %instance_id,
                        from = %previous,
                        to = %status,
                        "Instance status changed"
                    );
                    self.notify();
                }
                Ok(())
            }
            None => Err(GatewayError::NotFound(format!(
                "instance {}/{} is not registered",
                service, instance_id
            ))),
        }
    }

    /// Remove an instance immediately, regardless of lease state
    pub fn deregister(&self, service_name: &str, instance_id: &str) -> Result<ServiceInstance> {
        let service = normalize_service_name(service_name);

        let removed = self
            .services
            .get_mut(&service)
            .and_then(|mut instances| instances.remove(instance_id));
        self.services.remove_if(&service, |_, instances| instances.is_empty());

        match removed {
            Some(record) => {
                info!(service = %service, instance = %instance_id, "Deregistered instance");
                self.notify();
                Ok(record.instance)
            }
            None => Err(GatewayError::NotFound(format!(
                "instance {}/{} is not registered",
                service, instance_id
            ))),
        }
    }

    /// All `UP` instances of a service whose lease is still valid, by id
    pub fn snapshot(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.collect(service_name, |instance| instance.is_up())
    }

    /// Every unexpired instance of a service, whatever its status
    pub fn instances(&self, service_name: &str) -> Vec<ServiceInstance> {
        self.collect(service_name, |_| true)
    }

    fn collect(
        &self,
        service_name: &str,
        keep: impl Fn(&ServiceInstance) -> bool,
    ) -> Vec<ServiceInstance> {
        let service = normalize_service_name(service_name);
        let now = Instant::now();

        let mut instances: Vec<ServiceInstance> = self
            .services
            .get(&service)
            .map(|records| {
                records
                    .values()
                    .filter(|record| !record.is_expired(now) && keep(&record.instance))
                    .map(|record| record.instance.clone())
                    .collect()
            })
            .unwrap_or_default();

        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        instances
    }

    /// Names of all services holding at least one record, sorted
    pub fn all_services(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .services
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Total number of records, expired or not
    pub fn instance_count(&self) -> usize {
        self.services.iter().map(|entry| entry.value().len()).sum()
    }

    /// Instances whose lease lapsed before `now`
    pub fn expired_instances(&self, now: Instant) -> Vec<ServiceInstance> {
        self.services
            .iter()
            .flat_map(|entry| {
                entry
                    .value()
                    .values()
                    .filter(|record| record.is_expired(now))
                    .map(|record| record.instance.clone())
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Remove the given instances if they are still expired at `now`
    ///
    /// Instances renewed since they were selected are kept. Returns the
    /// number actually removed.
    pub fn evict(&self, candidates: &[ServiceInstance], now: Instant) -> usize {
        let mut evicted = 0;

        for candidate in candidates {
            let removed = self
                .services
                .get_mut(&candidate.service_name)
                .map(|mut instances| {
                    let expired = instances
                        .get(&candidate.instance_id)
                        .map(|record| record.is_expired(now))
                        .unwrap_or(false);
                    expired && instances.remove(&candidate.instance_id).is_some()
                })
                .unwrap_or(false);

            if removed {
                self.services
                    .remove_if(&candidate.service_name, |_, instances| instances.is_empty());
                info!(
                    service = %candidate.service_name,
                    instance = %candidate.instance_id,
                    "Evicted instance with expired lease"
                );
                evicted += 1;
            }
        }

        if evicted > 0 {
            self.notify();
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn registration(service: &str, id: &str, port: u16) -> Registration {
        Registration::new(service, "10.0.0.1", port).with_instance_id(id)
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_and_snapshot() {
        let registry = InstanceRegistry::new(Duration::from_secs(10));

        let lease = registry.register(registration("user", "a", 8080)).unwrap();
        assert_eq!(lease.instance_id, "a");
        assert_eq!(lease.duration_ms, 10_000);

        let snapshot = registry.snapshot("user");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].authority(), "10.0.0.1:8080");
        assert_eq!(registry.all_services(), vec!["user".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_service_names_are_case_insensitive() {
        let registry = InstanceRegistry::new(Duration::from_secs(10));
        registry.register(registration("USER", "a", 8080)).unwrap();

        assert_eq!(registry.snapshot("user").len(), 1);
        assert!(registry.renew("User", "a").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lapsed_instance_absent_without_sweep() {
        let registry = InstanceRegistry::new(Duration::from_secs(10));
        registry.register(registration("user", "a", 8080)).unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;

        assert!(registry.snapshot("user").is_empty());
        // Record is still held until swept
        assert_eq!(registry.instance_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewed_instance_stays_present() {
        let registry = InstanceRegistry::new(Duration::from_secs(10));
        registry.register(registration("user", "a", 8080)).unwrap();

        for _ in 0..10 {
            tokio::time::advance(Duration::from_secs(9)).await;
            registry.renew("user", "a").unwrap();
            assert_eq!(registry.snapshot("user").len(), 1);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_after_expiry_is_not_found() {
        let registry = InstanceRegistry::new(Duration::from_secs(10));
        registry.register(registration("user", "a", 8080)).unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;

        let err = registry.renew("user", "a").unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
        assert_eq!(registry.instance_count(), 0);

        // Re-registration heals
        registry.register(registration("user", "a", 8080)).unwrap();
        assert_eq!(registry.snapshot("user").len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_unknown_instance() {
        let registry = InstanceRegistry::new(Duration::from_secs(10));
        assert!(matches!(
            registry.renew("user", "ghost"),
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregistration_resets_deadline_keeps_timestamp() {
        let registry = InstanceRegistry::new(Duration::from_secs(10));
        registry.register(registration("user", "a", 8080)).unwrap();
        let first = registry.snapshot("user")[0].registered_at;

        tokio::time::advance(Duration::from_secs(8)).await;
        registry.register(registration("user", "a", 8081)).unwrap();
        tokio::time::advance(Duration::from_secs(8)).await;

        let snapshot = registry.snapshot("user");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].port, 8081);
        assert_eq!(snapshot[0].registered_at, first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_filters_snapshot() {
        let registry = InstanceRegistry::new(Duration::from_secs(10));
        registry.register(registration("user", "a", 8080)).unwrap();
        registry
            .register(registration("user", "b", 8081).with_status(InstanceStatus::Starting))
            .unwrap();

        assert_eq!(registry.snapshot("user").len(), 1);
        assert_eq!(registry.instances("user").len(), 2);

        registry.update_status("user", "b", InstanceStatus::Up).unwrap();
        registry
            .update_status("user", "a", InstanceStatus::OutOfService)
            .unwrap();

        let snapshot = registry.snapshot("user");
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].instance_id, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deregister() {
        let registry = InstanceRegistry::new(Duration::from_secs(10));
        registry.register(registration("user", "a", 8080)).unwrap();

        let removed = registry.deregister("user", "a").unwrap();
        assert_eq!(removed.instance_id, "a");
        assert!(registry.snapshot("user").is_empty());
        assert!(registry.all_services().is_empty());
        assert!(registry.deregister("user", "a").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_evict_skips_renewed_instances() {
        let registry = InstanceRegistry::new(Duration::from_secs(10));
        registry.register(registration("user", "a", 8080)).unwrap();
        registry.register(registration("user", "b", 8081)).unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        let candidates = registry.expired_instances(Instant::now());
        assert_eq!(candidates.len(), 2);

        // "b" re-registers between scan and eviction
        registry.register(registration("user", "b", 8081)).unwrap();

        let evicted = registry.evict(&candidates, Instant::now());
        assert_eq!(evicted, 1);
        assert_eq!(registry.snapshot("user")[0].instance_id, "b");
    }

    #[tokio::test(start_paused = true)]
    async fn test_mutations_notify_subscribers() {
        let registry = InstanceRegistry::new(Duration::from_secs(10));
        let rx = registry.subscribe();
        let start = *rx.borrow();

        registry.register(registration("user", "a", 8080)).unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(registry.generation(), start + 1);

        // Renewal does not change membership
        registry.renew("user", "a").unwrap();
        assert_eq!(registry.generation(), start + 1);

        registry.deregister("user", "a").unwrap();
        assert_eq!(registry.generation(), start + 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registrations() {
        let registry = Arc::new(InstanceRegistry::new(Duration::from_secs(30)));

        let handles: Vec<_> = (0..64u16)
            .map(|i| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move {
                    registry
                        .register(registration("user", &format!("i-{:02}", i), 9000 + i))
                        .unwrap();
                })
            })
            .collect();

        for handle in futures::future::join_all(handles).await {
            handle.unwrap();
        }

        let snapshot = registry.snapshot("user");
        assert_eq!(snapshot.len(), 64);
        let mut ids: Vec<_> = snapshot.iter().map(|i| i.instance_id.clone()).collect();
        ids.dedup();
        assert_eq!(ids.len(), 64);
    }
}
