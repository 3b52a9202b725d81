use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::core::instance::{ServiceHealthRecord, ServiceInstance};

/// Error type for registry persistence
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StoreError {
    /// The backing store could not be reached
    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),

    /// A record could not be encoded or decoded
    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// Result type for persistence operations
pub type StoreResult<T> = Result<T, StoreError>;

/// RegistryStore defines the persistence port for registered instances and
/// their append-only health history.
///
/// The in-process registry stays authoritative for routing; the store exists so
/// registrations survive a restart and so uptime can be computed over history.
#[async_trait]
pub trait RegistryStore: Send + Sync + 'static {
    /// Insert or replace an instance record (keyed by instance id)
    async fn save_instance(&self, instance: &ServiceInstance) -> StoreResult<()>;

    /// Remove an instance record
    async fn delete_instance(&self, instance_id: &str) -> StoreResult<()>;

    /// Flag a whole logical service as active or inactive
    async fn set_service_active(&self, service_name: &str, active: bool) -> StoreResult<()>;

    /// Load every persisted instance
    async fn load_instances(&self) -> StoreResult<Vec<ServiceInstance>>;

    /// Names of services that were deregistered as a whole
    async fn inactive_services(&self) -> StoreResult<Vec<String>>;

    /// Append one probe result to the history
    async fn append_health_record(&self, record: ServiceHealthRecord) -> StoreResult<()>;

    /// Health history of an instance checked at or after `since`, oldest first
    async fn health_history(
        &self,
        instance_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<ServiceHealthRecord>>;
}
