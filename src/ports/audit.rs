use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::models::RateLimitTier;

/// Emitted whenever a caller exceeds its rate limit.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitViolation {
    pub identity: String,
    pub tier: RateLimitTier,
    pub route: String,
    pub limit: u64,
    pub window_ms: u64,
    pub retry_after_secs: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Metrics/audit collaborator receiving limiter violations.
pub trait ViolationSink: Send + Sync + 'static {
    fn record_violation(&self, violation: &RateLimitViolation);
}

/// Default sink: a structured `warn` event per violation.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingViolationSink;

impl ViolationSink for TracingViolationSink {
    fn record_violation(&self, violation: &RateLimitViolation) {
        tracing::warn!(
            identity = %violation.identity,
            tier = %violation.tier,
            route = %violation.route,
            limit = violation.limit,
            window_ms = violation.window_ms,
            retry_after_secs = violation.retry_after_secs,
            "Rate limit exceeded"
        );
    }
}
