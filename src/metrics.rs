//! Metrics helpers for Keel.
//!
//! Thin wrappers over the `metrics` crate macros plus [`GatewayMetrics`], an
//! in-process tally that backs the admin summary endpoint (the facade cannot be
//! read back). The Prometheus recorder is installed once by the binary; without
//! it every macro call is a no-op, which keeps unit tests recorder-free.
//!
//! Provided metrics (labels vary by family):
//! * `keel_requests_total` (counter; service, outcome)
//! * `keel_errors_total` (counter; service, kind)
//! * `keel_upstream_duration_seconds` (histogram; service)
//! * `keel_healthy_services` (gauge)
//! * `keel_open_circuit_breakers` (gauge)
//! * `keel_rate_limit_violations_total` (counter; tier)
//! * `keel_instance_health` (gauge; service, instance)
use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};

use eyre::WrapErr;
use metrics::{
    Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::Lazy;
use serde::Serialize;

use crate::{config::RateLimitTier, core::error::GatewayError};

pub const KEEL_REQUESTS_TOTAL: &str = "keel_requests_total";
pub const KEEL_ERRORS_TOTAL: &str = "keel_errors_total";
pub const KEEL_UPSTREAM_DURATION_SECONDS: &str = "keel_upstream_duration_seconds";
pub const KEEL_HEALTHY_SERVICES: &str = "keel_healthy_services";
pub const KEEL_OPEN_CIRCUIT_BREAKERS: &str = "keel_open_circuit_breakers";
pub const KEEL_RATE_LIMIT_VIOLATIONS_TOTAL: &str = "keel_rate_limit_violations_total";
pub const KEEL_INSTANCE_HEALTH: &str = "keel_instance_health";

static DESCRIPTIONS: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        KEEL_REQUESTS_TOTAL,
        Unit::Count,
        "Requests handled by the router, by target service and outcome."
    );
    describe_counter!(
        KEEL_ERRORS_TOTAL,
        Unit::Count,
        "Requests that ended in an error, by target service and error kind."
    );
    describe_histogram!(
        KEEL_UPSTREAM_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of calls forwarded to backend instances."
    );
    describe_gauge!(
        KEEL_HEALTHY_SERVICES,
        "Active services with at least one healthy instance."
    );
    describe_gauge!(
        KEEL_OPEN_CIRCUIT_BREAKERS,
        "Circuit breakers currently open or half-open."
    );
    describe_counter!(
        KEEL_RATE_LIMIT_VIOLATIONS_TOTAL,
        Unit::Count,
        "Requests rejected by the rate limiter, by tier."
    );
    describe_gauge!(
        KEEL_INSTANCE_HEALTH,
        "Health of individual instances (1 for healthy, 0 for unhealthy)."
    );
});

/// Register metric descriptions (idempotent).
pub fn describe_metrics() {
    Lazy::force(&DESCRIPTIONS);
}

/// Install the global Prometheus recorder and return the handle used by `/metrics`.
pub fn install_prometheus_recorder() -> eyre::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .wrap_err("Failed to install Prometheus metrics recorder")?;
    describe_metrics();
    tracing::info!("Prometheus metrics recorder installed");
    Ok(handle)
}

/// Request outcome label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Forwarded and answered without a server error
    Success,
    /// Turned away before reaching a backend
    Rejected,
    /// The backend call itself failed
    Failure,
}

impl Outcome {
    pub fn of(result: &Result<(), GatewayError>) -> Self {
        match result {
            Ok(()) => Outcome::Success,
            Err(e) if e.is_retryable() || matches!(e, GatewayError::Internal(_)) => {
                Outcome::Failure
            }
            Err(_) => Outcome::Rejected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Rejected => "rejected",
            Outcome::Failure => "failure",
        }
    }
}

pub fn record_request(service: &str, outcome: Outcome) {
    counter!(
        KEEL_REQUESTS_TOTAL,
        "service" => service.to_string(),
        "outcome" => outcome.as_str()
    )
    .increment(1);
}

pub fn record_error(service: &str, kind: &'static str) {
    counter!(
        KEEL_ERRORS_TOTAL,
        "service" => service.to_string(),
        "kind" => kind
    )
    .increment(1);
}

pub fn record_upstream_duration(service: &str, duration: Duration) {
    histogram!(KEEL_UPSTREAM_DURATION_SECONDS, "service" => service.to_string())
        .record(duration.as_secs_f64());
}

pub fn set_healthy_services(count: usize) {
    gauge!(KEEL_HEALTHY_SERVICES).set(count as f64);
}

pub fn set_open_circuit_breakers(count: usize) {
    gauge!(KEEL_OPEN_CIRCUIT_BREAKERS).set(count as f64);
}

pub fn record_rate_limit_violation(tier: RateLimitTier) {
    counter!(KEEL_RATE_LIMIT_VIOLATIONS_TOTAL, "tier" => tier.as_str()).increment(1);
}

pub fn set_instance_health(service: &str, instance_id: &str, healthy: bool) {
    gauge!(
        KEEL_INSTANCE_HEALTH,
        "service" => service.to_string(),
        "instance" => instance_id.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// Aggregate view served by `GET {admin}/metrics/summary`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSummary {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub rejected_requests: u64,
    pub failed_requests: u64,
    pub errors_by_kind: BTreeMap<String, u64>,
    pub upstream_calls: u64,
    pub average_upstream_ms: f64,
    pub uptime_secs: u64,
}

/// Process-local request tallies.
pub struct GatewayMetrics {
    started: Instant,
    succeeded: AtomicU64,
    rejected: AtomicU64,
    failed: AtomicU64,
    upstream_calls: AtomicU64,
    upstream_micros: AtomicU64,
    errors: scc::HashMap<&'static str, u64>,
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayMetrics {
    pub fn new() -> Self {
        describe_metrics();
        Self {
            started: Instant::now(),
            succeeded: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            upstream_calls: AtomicU64::new(0),
            upstream_micros: AtomicU64::new(0),
            errors: scc::HashMap::new(),
        }
    }

    /// Count one finished request against `service`.
    pub async fn record(&self, service: &str, result: &Result<(), GatewayError>) {
        let outcome = Outcome::of(result);
        let tally = match outcome {
            Outcome::Success => &self.succeeded,
            Outcome::Rejected => &self.rejected,
            Outcome::Failure => &self.failed,
        };
        tally.fetch_add(1, Ordering::Relaxed);
        record_request(service, outcome);

        if let Err(e) = result {
            let kind = e.metric_kind();
            *self.errors.entry_async(kind).await.or_insert(0).get_mut() += 1;
            record_error(service, kind);
        }
    }

    /// Time one upstream call; recorded when the timer drops.
    pub fn upstream_timer<'a>(&'a self, service: &'a str) -> UpstreamTimer<'a> {
        UpstreamTimer {
            start: Instant::now(),
            service,
            metrics: self,
        }
    }

    fn observe_upstream(&self, service: &str, elapsed: Duration) {
        self.upstream_calls.fetch_add(1, Ordering::Relaxed);
        self.upstream_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        record_upstream_duration(service, elapsed);
    }

    pub async fn summary(&self) -> MetricsSummary {
        let succeeded = self.succeeded.load(Ordering::Relaxed);
        let rejected = self.rejected.load(Ordering::Relaxed);
        let failed = self.failed.load(Ordering::Relaxed);
        let upstream_calls = self.upstream_calls.load(Ordering::Relaxed);
        let upstream_micros = self.upstream_micros.load(Ordering::Relaxed);

        let mut errors_by_kind = BTreeMap::new();
        self.errors
            .retain_async(|kind, count| {
                errors_by_kind.insert(kind.to_string(), *count);
                true
            })
            .await;

        MetricsSummary {
            total_requests: succeeded + rejected + failed,
            successful_requests: succeeded,
            rejected_requests: rejected,
            failed_requests: failed,
            errors_by_kind,
            upstream_calls,
            average_upstream_ms: if upstream_calls == 0 {
                0.0
            } else {
                upstream_micros as f64 / upstream_calls as f64 / 1_000.0
            },
            uptime_secs: self.started.elapsed().as_secs(),
        }
    }
}

/// RAII helper measuring one upstream call, including early returns and timeouts.
pub struct UpstreamTimer<'a> {
    start: Instant,
    service: &'a str,
    metrics: &'a GatewayMetrics,
}

impl Drop for UpstreamTimer<'_> {
    fn drop(&mut self) {
        self.metrics
            .observe_upstream(self.service, self.start.elapsed());
    }
}
