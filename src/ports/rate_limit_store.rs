use async_trait::async_trait;
use thiserror::Error;

use crate::core::rate_limiter::algorithms::{Admission, LimitRule};

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RateLimitStoreError {
    #[error("Rate limit store unavailable: {0}")]
    Unavailable(String),
}

pub type RateLimitStoreResult<T> = Result<T, RateLimitStoreError>;

/// Storage for rate-limit buckets.
///
/// The in-process adapter keeps buckets in memory; clustered deployments plug a
/// shared store in behind this same trait so every gateway node sees one count.
#[async_trait]
pub trait RateLimitStore: Send + Sync + 'static {
    /// Count one request against `key` under `rule` and report the decision.
    async fn acquire(
        &self,
        key: &str,
        rule: &LimitRule,
        now_ms: u64,
    ) -> RateLimitStoreResult<Admission>;

    /// Drop buckets whose window has fully elapsed. Returns how many were removed.
    async fn purge_expired(&self, now_ms: u64) -> usize;

    /// Number of live buckets.
    fn bucket_count(&self) -> usize;
}
