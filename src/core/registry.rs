//! Dynamic service registry.
//!
//! Instances are grouped by logical service name in an `scc::HashMap`, so a
//! lookup for one service only contends on that service's bucket. A secondary
//! index maps instance ids back to their service for heartbeats and probes.
//!
//! The in-memory map is the source of truth for routing. Every mutation is
//! written through to the [`RegistryStore`]; persistence failures are logged and
//! never fail the operation.
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::{
    core::{
        error::GatewayError,
        instance::{ServiceInstance, ServiceRegistration, normalize_host},
    },
    ports::{clock::Clock, store::RegistryStore},
};

#[derive(Debug, Clone)]
struct TrackedInstance {
    instance: ServiceInstance,
    consecutive_failures: u32,
    consecutive_successes: u32,
}

impl TrackedInstance {
    fn new(instance: ServiceInstance) -> Self {
        Self {
            instance,
            consecutive_failures: 0,
            consecutive_successes: 0,
        }
    }
}

#[derive(Debug, Default)]
struct ServiceEntry {
    active: bool,
    instances: Vec<TrackedInstance>,
}

/// Snapshot of one logical service, used by the admin surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSnapshot {
    pub name: String,
    pub active: bool,
    pub instances: Vec<ServiceInstance>,
}

impl ServiceSnapshot {
    pub fn healthy_count(&self) -> usize {
        self.instances.iter().filter(|i| i.is_healthy).count()
    }
}

/// Outcome of applying one probe result to an instance.
#[derive(Debug, Clone)]
pub struct HealthUpdate {
    pub instance: ServiceInstance,
    pub was_healthy: bool,
    pub consecutive_failures: u32,
}

impl HealthUpdate {
    pub fn changed(&self) -> bool {
        self.was_healthy != self.instance.is_healthy
    }
}

pub struct ServiceRegistry {
    services: scc::HashMap<String, ServiceEntry>,
    index: scc::HashMap<String, String>,
    store: Arc<dyn RegistryStore>,
    clock: Arc<dyn Clock>,
    healthy_threshold: u32,
    unhealthy_threshold: u32,
}

impl ServiceRegistry {
    pub fn new(store: Arc<dyn RegistryStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            services: scc::HashMap::new(),
            index: scc::HashMap::new(),
            store,
            clock,
            healthy_threshold: 1,
            unhealthy_threshold: 1,
        }
    }

    /// Consecutive probe results needed before an instance flips state.
    pub fn with_thresholds(mut self, healthy: u32, unhealthy: u32) -> Self {
        self.healthy_threshold = healthy.max(1);
        self.unhealthy_threshold = unhealthy.max(1);
        self
    }

    /// Register an instance, or update the existing one at the same (host, port).
    pub async fn register_service(
        &self,
        registration: ServiceRegistration,
    ) -> Result<ServiceInstance, GatewayError> {
        registration.validate()?;

        let name = registration
            .name
            .as_deref()
            .map(str::trim)
            .unwrap_or_default()
            .to_string();
        let host = normalize_host(registration.host.as_deref().unwrap_or_default());
        let port = registration
            .port
            .and_then(|p| u16::try_from(p).ok())
            .unwrap_or_default();

        if let Some(requested) = registration.id.as_deref() {
            let owner = self.index.read_async(requested, |_, n| n.clone()).await;
            if let Some(owner) = owner {
                if owner != name {
                    return Err(GatewayError::Validation(format!(
                        "instance id '{requested}' is already registered to service '{owner}'"
                    )));
                }
                let same_address = self
                    .services
                    .read_async(&owner, |_, entry| {
                        entry.instances.iter().any(|t| {
                            t.instance.id == requested
                                && t.instance.host == host
                                && t.instance.port == port
                        })
                    })
                    .await
                    .unwrap_or(false);
                if !same_address {
                    return Err(GatewayError::Validation(format!(
                        "instance id '{requested}' is already registered at another address"
                    )));
                }
            }
        }

        let now = self.clock.now_utc();
        let (instance, reactivated) = {
            let mut entry = self
                .services
                .entry_async(name.clone())
                .await
                .or_insert_with(ServiceEntry::default);
            let service = entry.get_mut();
            let reactivated = !service.active && !service.instances.is_empty();
            service.active = true;

            let existing = service
                .instances
                .iter_mut()
                .find(|t| t.instance.host == host && t.instance.port == port);

            match existing {
                Some(tracked) => {
                    let id = tracked.instance.id.clone();
                    *tracked = TrackedInstance::new(registration.into_instance(id, now));
                    (tracked.instance.clone(), reactivated)
                }
                None => {
                    let id = registration
                        .id
                        .clone()
                        .unwrap_or_else(|| Uuid::new_v4().to_string());
                    let instance = registration.into_instance(id, now);
                    service.instances.push(TrackedInstance::new(instance.clone()));
                    (instance, reactivated)
                }
            }
        };

        let _ = self.index.remove_async(&instance.id).await;
        let _ = self
            .index
            .insert_async(instance.id.clone(), name.clone())
            .await;

        if let Err(e) = self.store.save_instance(&instance).await {
            tracing::warn!(error = %e, instance_id = %instance.id, "Failed to persist instance");
        }
        if let Err(e) = self.store.set_service_active(&name, true).await {
            tracing::warn!(error = %e, service = %name, "Failed to persist service state");
        }

        tracing::info!(
            service = %instance.name,
            instance_id = %instance.id,
            address = %format!("{}:{}", instance.host, instance.port),
            reactivated,
            "Registered service instance"
        );
        Ok(instance)
    }

    /// Remove one instance, or mark the whole service inactive when `instance_id` is `None`.
    pub async fn deregister_service(
        &self,
        name: &str,
        instance_id: Option<&str>,
    ) -> Result<(), GatewayError> {
        match instance_id {
            Some(id) => {
                let removed = {
                    let Some(mut entry) = self.services.get_async(name).await else {
                        return Err(service_not_found(name));
                    };
                    let service = entry.get_mut();
                    let position = service.instances.iter().position(|t| t.instance.id == id);
                    position.map(|pos| service.instances.remove(pos))
                };
                if removed.is_none() {
                    return Err(GatewayError::NotFound(format!(
                        "Instance '{id}' of service '{name}' not found"
                    )));
                }

                let _ = self.index.remove_async(id).await;
                if let Err(e) = self.store.delete_instance(id).await {
                    tracing::warn!(error = %e, instance_id = %id, "Failed to delete persisted instance");
                }
                tracing::info!(service = %name, instance_id = %id, "Deregistered service instance");
            }
            None => {
                {
                    let Some(mut entry) = self.services.get_async(name).await else {
                        return Err(service_not_found(name));
                    };
                    entry.get_mut().active = false;
                }
                if let Err(e) = self.store.set_service_active(name, false).await {
                    tracing::warn!(error = %e, service = %name, "Failed to persist service state");
                }
                tracing::info!(service = %name, "Deregistered service");
            }
        }
        Ok(())
    }

    /// Healthy instances of an active service, in registration order.
    pub async fn get_healthy_instances(&self, name: &str) -> Vec<ServiceInstance> {
        self.services
            .read_async(name, |_, entry| {
                if !entry.active {
                    return Vec::new();
                }
                entry
                    .instances
                    .iter()
                    .filter(|t| t.instance.is_healthy)
                    .map(|t| t.instance.clone())
                    .collect()
            })
            .await
            .unwrap_or_default()
    }

    /// Every service with every instance, sorted by name.
    pub async fn list_all(&self) -> Vec<ServiceSnapshot> {
        let mut snapshots = Vec::new();
        self.services
            .retain_async(|name, entry| {
                snapshots.push(ServiceSnapshot {
                    name: name.clone(),
                    active: entry.active,
                    instances: entry.instances.iter().map(|t| t.instance.clone()).collect(),
                });
                true
            })
            .await;
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    /// Refresh `last_heartbeat` of an instance.
    pub async fn heartbeat(&self, name: &str, id: &str) -> Result<ServiceInstance, GatewayError> {
        let now = self.clock.now_utc();
        let instance = {
            let Some(mut entry) = self.services.get_async(name).await else {
                return Err(service_not_found(name));
            };
            let tracked = entry
                .get_mut()
                .instances
                .iter_mut()
                .find(|t| t.instance.id == id)
                .ok_or_else(|| {
                    GatewayError::NotFound(format!("Instance '{id}' of service '{name}' not found"))
                })?;
            tracked.instance.last_heartbeat = now;
            tracked.instance.clone()
        };

        if let Err(e) = self.store.save_instance(&instance).await {
            tracing::warn!(error = %e, instance_id = %id, "Failed to persist heartbeat");
        }
        tracing::debug!(service = %name, instance_id = %id, "Heartbeat received");
        Ok(instance)
    }

    /// Apply one probe result, honouring the consecutive healthy/unhealthy thresholds.
    pub async fn set_health(&self, id: &str, healthy: bool) -> Result<HealthUpdate, GatewayError> {
        let name = self
            .index
            .read_async(id, |_, name| name.clone())
            .await
            .ok_or_else(|| instance_not_found(id))?;

        let update = {
            let Some(mut entry) = self.services.get_async(&name).await else {
                return Err(instance_not_found(id));
            };
            let tracked = entry
                .get_mut()
                .instances
                .iter_mut()
                .find(|t| t.instance.id == id)
                .ok_or_else(|| instance_not_found(id))?;

            let was_healthy = tracked.instance.is_healthy;
            if healthy {
                tracked.consecutive_failures = 0;
                tracked.consecutive_successes = tracked.consecutive_successes.saturating_add(1);
                if !was_healthy && tracked.consecutive_successes >= self.healthy_threshold {
                    tracked.instance.is_healthy = true;
                }
            } else {
                tracked.consecutive_successes = 0;
                tracked.consecutive_failures = tracked.consecutive_failures.saturating_add(1);
                if was_healthy && tracked.consecutive_failures >= self.unhealthy_threshold {
                    tracked.instance.is_healthy = false;
                }
            }

            HealthUpdate {
                instance: tracked.instance.clone(),
                was_healthy,
                consecutive_failures: tracked.consecutive_failures,
            }
        };

        if update.changed() {
            if let Err(e) = self.store.save_instance(&update.instance).await {
                tracing::warn!(error = %e, instance_id = %id, "Failed to persist health state");
            }
            tracing::info!(
                service = %update.instance.name,
                instance_id = %id,
                healthy = update.instance.is_healthy,
                "Instance health changed"
            );
        }
        Ok(update)
    }

    /// Remove an instance by id regardless of its service.
    pub async fn evict(&self, id: &str) -> Result<ServiceInstance, GatewayError> {
        let name = self
            .index
            .read_async(id, |_, name| name.clone())
            .await
            .ok_or_else(|| instance_not_found(id))?;

        let removed = {
            let Some(mut entry) = self.services.get_async(&name).await else {
                return Err(instance_not_found(id));
            };
            let service = entry.get_mut();
            let position = service.instances.iter().position(|t| t.instance.id == id);
            position.map(|pos| service.instances.remove(pos).instance)
        };
        let instance = removed.ok_or_else(|| instance_not_found(id))?;

        let _ = self.index.remove_async(id).await;
        if let Err(e) = self.store.delete_instance(id).await {
            tracing::warn!(error = %e, instance_id = %id, "Failed to delete persisted instance");
        }
        tracing::warn!(service = %name, instance_id = %id, "Evicted instance");
        Ok(instance)
    }

    pub async fn get_instance(&self, id: &str) -> Option<ServiceInstance> {
        let name = self.index.read_async(id, |_, name| name.clone()).await?;
        self.services
            .read_async(&name, |_, entry| {
                entry
                    .instances
                    .iter()
                    .find(|t| t.instance.id == id)
                    .map(|t| t.instance.clone())
            })
            .await
            .flatten()
    }

    /// Every instance of every active service, healthy or not.
    pub async fn instances_for_probe(&self) -> Vec<ServiceInstance> {
        let mut instances = Vec::new();
        self.services
            .retain_async(|_, entry| {
                if entry.active {
                    instances.extend(entry.instances.iter().map(|t| t.instance.clone()));
                }
                true
            })
            .await;
        instances
    }

    /// Names of active services, sorted.
    pub async fn active_service_names(&self) -> Vec<String> {
        let mut names = Vec::new();
        self.services
            .retain_async(|name, entry| {
                if entry.active {
                    names.push(name.clone());
                }
                true
            })
            .await;
        names.sort();
        names
    }

    /// Active services with at least one healthy instance.
    pub async fn healthy_service_count(&self) -> usize {
        let mut count = 0;
        let count_ref = &mut count;
        self.services
            .retain_async(|_, entry| {
                if entry.active && entry.instances.iter().any(|t| t.instance.is_healthy) {
                    *count_ref += 1;
                }
                true
            })
            .await;
        count
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    /// Reload persisted instances into memory. Called once at startup.
    pub async fn restore_from_store(&self) -> Result<usize, GatewayError> {
        let instances = self.store.load_instances().await?;
        let inactive = self.store.inactive_services().await?;
        let restored = instances.len();

        for instance in instances {
            let id = instance.id.clone();
            let name = instance.name.clone();
            {
                let mut entry = self
                    .services
                    .entry_async(name.clone())
                    .await
                    .or_insert_with(ServiceEntry::default);
                let service = entry.get_mut();
                service.active = !inactive.contains(&name);
                match service.instances.iter_mut().find(|t| t.instance.id == id) {
                    Some(tracked) => *tracked = TrackedInstance::new(instance),
                    None => service.instances.push(TrackedInstance::new(instance)),
                }
            }
            let _ = self.index.remove_async(&id).await;
            let _ = self.index.insert_async(id, name).await;
        }

        tracing::info!(restored, "Restored service instances from store");
        Ok(restored)
    }
}

fn service_not_found(name: &str) -> GatewayError {
    GatewayError::NotFound(format!("Service '{name}' not found"))
}

fn instance_not_found(id: &str) -> GatewayError {
    GatewayError::NotFound(format!("Instance '{id}' not found"))
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::{
        adapters::memory_store::MemoryRegistryStore,
        core::instance::ServiceHealthRecord,
        ports::{
            clock::ManualClock,
            store::{StoreError, StoreResult},
        },
    };

    fn registry() -> (ServiceRegistry, Arc<MemoryRegistryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryRegistryStore::new(100));
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let registry = ServiceRegistry::new(store.clone(), clock.clone());
        (registry, store, clock)
    }

    #[tokio::test]
    async fn re_registration_at_same_address_upserts() {
        let (registry, _, _) = registry();
        let first = registry
            .register_service(ServiceRegistration::new("orders", "10.0.0.1", 8080))
            .await
            .unwrap();
        let mut again = ServiceRegistration::new("orders", "10.0.0.1", 8080).with_weight(5);
        again.version = Some("2.0.0".to_string());
        let second = registry.register_service(again).await.unwrap();

        assert_eq!(first.id, second.id);
        let all = registry.list_all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].instances.len(), 1);
        assert_eq!(all[0].instances[0].weight, 5);
        assert_eq!(all[0].instances[0].version, "2.0.0");
    }

    #[tokio::test]
    async fn invalid_registration_is_rejected() {
        let (registry, _, _) = registry();
        let mut registration = ServiceRegistration::new("orders", "10.0.0.1", 8080);
        registration.port = Some(0);
        let err = registry.register_service(registration).await.unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        assert!(registry.list_all().await.is_empty());
    }

    #[tokio::test]
    async fn healthy_instances_only_and_in_registration_order() {
        let (registry, _, _) = registry();
        let a = registry
            .register_service(ServiceRegistration::new("orders", "10.0.0.1", 8080))
            .await
            .unwrap();
        let b = registry
            .register_service(ServiceRegistration::new("orders", "10.0.0.2", 8080))
            .await
            .unwrap();
        let c = registry
            .register_service(ServiceRegistration::new("orders", "10.0.0.3", 8080))
            .await
            .unwrap();

        registry.set_health(&b.id, false).await.unwrap();

        let healthy = registry.get_healthy_instances("orders").await;
        let ids: Vec<_> = healthy.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec![a.id.as_str(), c.id.as_str()]);
        assert!(healthy.iter().all(|i| i.is_healthy));
        assert!(registry.get_healthy_instances("unknown").await.is_empty());
    }

    #[tokio::test]
    async fn deregistering_whole_service_hides_instances_until_reregistered() {
        let (registry, store, _) = registry();
        registry
            .register_service(ServiceRegistration::new("users", "10.0.0.1", 9000))
            .await
            .unwrap();

        registry.deregister_service("users", None).await.unwrap();
        assert!(registry.get_healthy_instances("users").await.is_empty());
        assert!(registry.instances_for_probe().await.is_empty());
        assert_eq!(store.inactive_services().await.unwrap(), vec!["users"]);

        registry
            .register_service(ServiceRegistration::new("users", "10.0.0.1", 9000))
            .await
            .unwrap();
        assert_eq!(registry.get_healthy_instances("users").await.len(), 1);
    }

    #[tokio::test]
    async fn deregister_unknown_is_not_found() {
        let (registry, _, _) = registry();
        let err = registry.deregister_service("ghost", None).await.unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));

        registry
            .register_service(ServiceRegistration::new("users", "10.0.0.1", 9000))
            .await
            .unwrap();
        let err = registry
            .deregister_service("users", Some("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::NotFound(_)));
    }

    #[tokio::test]
    async fn deregister_single_instance_removes_it() {
        let (registry, store, _) = registry();
        let instance = registry
            .register_service(ServiceRegistration::new("users", "10.0.0.1", 9000))
            .await
            .unwrap();
        registry
            .deregister_service("users", Some(&instance.id))
            .await
            .unwrap();
        assert!(registry.get_instance(&instance.id).await.is_none());
        assert!(store.load_instances().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn thresholds_delay_state_changes() {
        let store = Arc::new(MemoryRegistryStore::new(10));
        let clock = Arc::new(ManualClock::new(0));
        let registry = ServiceRegistry::new(store, clock).with_thresholds(2, 3);
        let instance = registry
            .register_service(ServiceRegistration::new("users", "10.0.0.1", 9000))
            .await
            .unwrap();

        assert!(registry.set_health(&instance.id, false).await.unwrap().instance.is_healthy);
        assert!(registry.set_health(&instance.id, false).await.unwrap().instance.is_healthy);
        let update = registry.set_health(&instance.id, false).await.unwrap();
        assert!(!update.instance.is_healthy);
        assert!(update.changed());
        assert_eq!(update.consecutive_failures, 3);

        assert!(!registry.set_health(&instance.id, true).await.unwrap().instance.is_healthy);
        assert!(registry.set_health(&instance.id, true).await.unwrap().instance.is_healthy);
    }

    #[tokio::test]
    async fn heartbeat_refreshes_timestamp() {
        let (registry, _, clock) = registry();
        let instance = registry
            .register_service(ServiceRegistration::new("users", "10.0.0.1", 9000))
            .await
            .unwrap();
        clock.advance(5_000);
        let updated = registry.heartbeat("users", &instance.id).await.unwrap();
        assert_eq!(
            (updated.last_heartbeat - instance.last_heartbeat).num_milliseconds(),
            5_000
        );
        assert!(registry.heartbeat("users", "nope").await.is_err());
    }

    #[tokio::test]
    async fn restore_reloads_persisted_instances() {
        let (registry, store, clock) = registry();
        let instance = registry
            .register_service(ServiceRegistration::new("users", "10.0.0.1", 9000))
            .await
            .unwrap();
        registry
            .register_service(ServiceRegistration::new("billing", "10.0.0.9", 9100))
            .await
            .unwrap();
        registry.deregister_service("billing", None).await.unwrap();

        let fresh = ServiceRegistry::new(store, clock);
        assert_eq!(fresh.restore_from_store().await.unwrap(), 2);
        assert_eq!(fresh.get_instance(&instance.id).await.unwrap().name, "users");
        assert_eq!(fresh.healthy_service_count().await, 1);
        assert_eq!(fresh.active_service_names().await, vec!["users"]);
    }

    #[tokio::test]
    async fn supplied_id_cannot_be_reused_for_another_address() {
        let (registry, _, _) = registry();
        registry
            .register_service(ServiceRegistration::new("users", "10.0.0.1", 9000).with_id("u-1"))
            .await
            .unwrap();
        let err = registry
            .register_service(ServiceRegistration::new("users", "10.0.0.2", 9000).with_id("u-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
    }

    #[tokio::test]
    async fn supplied_id_cannot_be_claimed_by_another_service() {
        let (registry, _, _) = registry();
        registry
            .register_service(ServiceRegistration::new("orders", "10.0.0.1", 8080).with_id("x"))
            .await
            .unwrap();
        let err = registry
            .register_service(ServiceRegistration::new("users", "10.0.0.1", 8080).with_id("x"))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Validation(_)));
        assert!(registry.get_healthy_instances("users").await.is_empty());

        // the id still resolves to its original owner
        registry.deregister_service("orders", Some("x")).await.unwrap();
        assert!(matches!(
            registry.set_health("x", false).await,
            Err(GatewayError::NotFound(_))
        ));
        assert!(registry.list_all().await.iter().all(|s| s.instances.is_empty()));
    }

    struct BrokenStore;

    #[async_trait]
    impl RegistryStore for BrokenStore {
        async fn save_instance(&self, _: &ServiceInstance) -> StoreResult<()> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn delete_instance(&self, _: &str) -> StoreResult<()> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn set_service_active(&self, _: &str, _: bool) -> StoreResult<()> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn load_instances(&self) -> StoreResult<Vec<ServiceInstance>> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn inactive_services(&self) -> StoreResult<Vec<String>> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn append_health_record(&self, _: ServiceHealthRecord) -> StoreResult<()> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn health_history(
            &self,
            _: &str,
            _: DateTime<Utc>,
        ) -> StoreResult<Vec<ServiceHealthRecord>> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn store_failures_do_not_fail_registration() {
        let registry = ServiceRegistry::new(Arc::new(BrokenStore), Arc::new(ManualClock::new(0)));
        let instance = registry
            .register_service(ServiceRegistration::new("users", "10.0.0.1", 9000))
            .await
            .unwrap();
        assert_eq!(registry.get_healthy_instances("users").await[0].id, instance.id);
        assert!(registry.restore_from_store().await.is_err());
    }
}
