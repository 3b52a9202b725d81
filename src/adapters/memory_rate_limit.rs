use async_trait::async_trait;

use crate::{
    core::rate_limiter::algorithms::{self, Admission, LimitRule, WindowState},
    ports::rate_limit_store::{RateLimitStore, RateLimitStoreResult},
};

/// Single-node bucket store on `scc::HashMap`. Each bucket remembers the rule it
/// was last counted under so idle detection needs no outside input.
#[derive(Default)]
pub struct MemoryRateLimitStore {
    buckets: scc::HashMap<String, (LimitRule, WindowState)>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RateLimitStore for MemoryRateLimitStore {
    async fn acquire(
        &self,
        key: &str,
        rule: &LimitRule,
        now_ms: u64,
    ) -> RateLimitStoreResult<Admission> {
        let mut entry = self
            .buckets
            .entry_async(key.to_string())
            .await
            .or_insert_with(|| {
                let state = algorithms::algorithm_for(rule.algorithm).initial(rule, now_ms);
                (*rule, state)
            });
        let (stored_rule, state) = entry.get_mut();
        *stored_rule = *rule;
        Ok(algorithms::acquire(state, rule, now_ms))
    }

    async fn purge_expired(&self, now_ms: u64) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain_async(|_, (rule, state)| !algorithms::is_idle(state, rule, now_ms))
            .await;
        before.saturating_sub(self.buckets.len())
    }

    fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}
