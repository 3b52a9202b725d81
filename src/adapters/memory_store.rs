use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    core::instance::{ServiceHealthRecord, ServiceInstance},
    ports::store::{RegistryStore, StoreResult},
};

/// In-process [`RegistryStore`]. Instances keep their first-saved order; health
/// history is capped per instance.
pub struct MemoryRegistryStore {
    instances: scc::HashMap<String, (u64, ServiceInstance)>,
    inactive: scc::HashMap<String, ()>,
    history: scc::HashMap<String, VecDeque<ServiceHealthRecord>>,
    next_seq: AtomicU64,
    history_limit: usize,
}

impl MemoryRegistryStore {
    pub fn new(history_limit: usize) -> Self {
        Self {
            instances: scc::HashMap::new(),
            inactive: scc::HashMap::new(),
            history: scc::HashMap::new(),
            next_seq: AtomicU64::new(0),
            history_limit: history_limit.max(1),
        }
    }
}

impl Default for MemoryRegistryStore {
    fn default() -> Self {
        Self::new(1_000)
    }
}

#[async_trait]
impl RegistryStore for MemoryRegistryStore {
    async fn save_instance(&self, instance: &ServiceInstance) -> StoreResult<()> {
        let mut entry = self
            .instances
            .entry_async(instance.id.clone())
            .await
            .or_insert_with(|| (self.next_seq.fetch_add(1, Ordering::Relaxed), instance.clone()));
        entry.get_mut().1 = instance.clone();
        Ok(())
    }

    async fn delete_instance(&self, instance_id: &str) -> StoreResult<()> {
        let _ = self.instances.remove_async(instance_id).await;
        Ok(())
    }

    async fn set_service_active(&self, service_name: &str, active: bool) -> StoreResult<()> {
        if active {
            let _ = self.inactive.remove_async(service_name).await;
        } else {
            let _ = self.inactive.insert_async(service_name.to_string(), ()).await;
        }
        Ok(())
    }

    async fn load_instances(&self) -> StoreResult<Vec<ServiceInstance>> {
        let mut rows = Vec::new();
        self.instances
            .retain_async(|_, (seq, instance)| {
                rows.push((*seq, instance.clone()));
                true
            })
            .await;
        rows.sort_by_key(|(seq, _)| *seq);
        Ok(rows.into_iter().map(|(_, instance)| instance).collect())
    }

    async fn inactive_services(&self) -> StoreResult<Vec<String>> {
        let mut names = Vec::new();
        self.inactive
            .retain_async(|name, _| {
                names.push(name.clone());
                true
            })
            .await;
        names.sort();
        Ok(names)
    }

    async fn append_health_record(&self, record: ServiceHealthRecord) -> StoreResult<()> {
        let mut entry = self
            .history
            .entry_async(record.service_id.clone())
            .await
            .or_insert_with(VecDeque::new);
        let records = entry.get_mut();
        records.push_back(record);
        while records.len() > self.history_limit {
            records.pop_front();
        }
        Ok(())
    }

    async fn health_history(
        &self,
        instance_id: &str,
        since: DateTime<Utc>,
    ) -> StoreResult<Vec<ServiceHealthRecord>> {
        Ok(self
            .history
            .read_async(instance_id, |_, records| {
                records
                    .iter()
                    .filter(|r| r.checked_at >= since)
                    .cloned()
                    .collect()
            })
            .await
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn record(id: &str, healthy: bool, at: DateTime<Utc>) -> ServiceHealthRecord {
        ServiceHealthRecord {
            service_id: id.to_string(),
            service_name: "svc".to_string(),
            is_healthy: healthy,
            response_time_ms: 5,
            http_status: Some(200),
            error_message: None,
            checked_at: at,
        }
    }

    #[tokio::test]
    async fn history_is_capped_and_filtered() {
        let store = MemoryRegistryStore::new(3);
        let start = Utc::now();
        for i in 0..5 {
            store
                .append_health_record(record("a", i % 2 == 0, start + Duration::seconds(i)))
                .await
                .unwrap();
        }

        let all = store.health_history("a", start).await.unwrap();
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].checked_at, start + Duration::seconds(2));

        let recent = store
            .health_history("a", start + Duration::seconds(4))
            .await
            .unwrap();
        assert_eq!(recent.len(), 1);
        assert!(store.health_history("b", start).await.unwrap().is_empty());
    }
}
