use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use futures_util::{StreamExt, stream};
use serde::Serialize;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    config::HealthCheckConfig,
    core::{
        alerts::{AlertDispatcher, AlertMonitor, TickSummary},
        error::GatewayError,
        instance::{ServiceHealthRecord, ServiceInstance},
        load_balancer::LoadBalancer,
        registry::ServiceRegistry,
    },
    metrics,
    ports::{
        alerts::HealthAlert,
        clock::Clock,
        http_client::{HttpClient, ProbeResponse},
        store::RegistryStore,
    },
};

/// `status` values in a health body that mean the backend considers itself down.
const DOWN_STATUSES: &[&str] = &["down", "error", "unhealthy", "fail", "failed", "critical"];

/// Result of one probe against one instance.
#[derive(Debug, Clone)]
struct ProbeOutcome {
    instance: ServiceInstance,
    healthy: bool,
    response_time_ms: u64,
    http_status: Option<u16>,
    error: Option<String>,
}

/// What one health-check tick did.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TickReport {
    pub probed: usize,
    pub healthy: usize,
    pub evicted: Vec<String>,
    pub alerts: Vec<HealthAlert>,
}

/// Decide health from a probe response: 2xx, and no down/error marker in a JSON body.
pub fn evaluate_probe_response(response: &ProbeResponse) -> Result<(), String> {
    if !response.status.is_success() {
        return Err(format!("HTTP {}", response.status.as_u16()));
    }
    if response.body.is_empty() {
        return Ok(());
    }

    let Ok(Value::Object(body)) = serde_json::from_slice::<Value>(&response.body) else {
        // not JSON; the status code decides
        return Ok(());
    };

    if let Some(status) = body.get("status").and_then(Value::as_str) {
        if DOWN_STATUSES
            .iter()
            .any(|down| status.eq_ignore_ascii_case(down))
        {
            return Err(format!("backend reported status '{status}'"));
        }
    }
    match body.get("error") {
        Some(Value::Null) | None => Ok(()),
        Some(error) => Err(format!("backend reported error: {error}")),
    }
}

/// Periodic prober of every registered instance.
pub struct HealthChecker {
    registry: Arc<ServiceRegistry>,
    client: Arc<dyn HttpClient>,
    store: Arc<dyn RegistryStore>,
    monitor: AlertMonitor,
    dispatcher: Arc<AlertDispatcher>,
    balancer: Option<Arc<LoadBalancer>>,
    clock: Arc<dyn Clock>,
    config: HealthCheckConfig,
    running: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl HealthChecker {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        client: Arc<dyn HttpClient>,
        store: Arc<dyn RegistryStore>,
        monitor: AlertMonitor,
        dispatcher: Arc<AlertDispatcher>,
        clock: Arc<dyn Clock>,
        config: HealthCheckConfig,
    ) -> Self {
        Self {
            registry,
            client,
            store,
            monitor,
            dispatcher,
            balancer: None,
            clock,
            config,
            running: Mutex::new(None),
        }
    }

    /// Drop balancer bookkeeping for evicted instances.
    pub fn with_load_balancer(mut self, balancer: Arc<LoadBalancer>) -> Self {
        self.balancer = Some(balancer);
        self
    }

    pub fn config(&self) -> &HealthCheckConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<AlertDispatcher> {
        &self.dispatcher
    }

    /// Spawn the periodic loop. Returns `false` if it is disabled or already running.
    pub fn start(self: &Arc<Self>) -> bool {
        if !self.config.enabled {
            tracing::info!("Health checking is disabled");
            return false;
        }

        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running.is_some() {
            return false;
        }

        let token = CancellationToken::new();
        let checker = Arc::clone(self);
        let cancel = token.clone();
        let interval = self.config.interval().max(Duration::from_millis(100));
        let handle = tokio::spawn(async move {
            tracing::info!(
                interval_secs = checker.config.interval_secs,
                timeout_ms = checker.config.timeout_ms,
                concurrency = checker.config.concurrency,
                "Health checker started"
            );
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // the first tick completes immediately; let the server come up first
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let report = checker.run_once().await;
                        tracing::debug!(
                            probed = report.probed,
                            healthy = report.healthy,
                            alerts = report.alerts.len(),
                            "Health check cycle completed"
                        );
                    }
                }
            }
            tracing::info!("Health checker stopped");
        });

        *running = Some((token, handle));
        true
    }

    /// Cancel the loop and wait for it to finish.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some((token, handle)) = running {
            token.cancel();
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Health checker task ended abnormally");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Probe every instance once, apply the results and raise alerts.
    pub async fn run_once(&self) -> TickReport {
        let instances = self.registry.instances_for_probe().await;
        let timeout = self.config.timeout();
        let concurrency = self.config.concurrency.max(1);

        let outcomes: Vec<ProbeOutcome> = stream::iter(instances)
            .map(|instance| {
                let client = Arc::clone(&self.client);
                async move {
                    let fallback = instance.clone();
                    match tokio::spawn(probe(client, instance, timeout)).await {
                        Ok(outcome) => outcome,
                        Err(e) => ProbeOutcome {
                            instance: fallback,
                            healthy: false,
                            response_time_ms: 0,
                            http_status: None,
                            error: Some(format!("probe task failed: {e}")),
                        },
                    }
                }
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut report = TickReport {
            probed: outcomes.len(),
            ..TickReport::default()
        };
        let mut per_service: BTreeMap<String, (usize, usize, u64)> = BTreeMap::new();

        for outcome in outcomes {
            let tally = per_service
                .entry(outcome.instance.name.clone())
                .or_insert((0, 0, 0));
            tally.1 += 1;
            if outcome.healthy {
                tally.0 += 1;
                tally.2 += outcome.response_time_ms;
                report.healthy += 1;
            }

            if let Some(evicted) = self.apply(outcome).await {
                report.evicted.push(evicted);
            }
        }

        for (service, (healthy, total, latency_sum)) in per_service {
            let tick = TickSummary {
                healthy,
                total,
                average_latency_ms: if healthy == 0 {
                    0.0
                } else {
                    latency_sum as f64 / healthy as f64
                },
            };
            for alert in self.monitor.observe(&service, tick).await {
                let delivered = self.dispatcher.dispatch(&alert);
                tracing::warn!(
                    service = %alert.service,
                    kind = %alert.kind,
                    handlers = delivered,
                    "{}",
                    alert.message
                );
                report.alerts.push(alert);
            }
        }

        metrics::set_healthy_services(self.registry.healthy_service_count().await);
        report
    }

    /// Record one outcome. Returns the instance id if it was evicted.
    async fn apply(&self, outcome: ProbeOutcome) -> Option<String> {
        let id = outcome.instance.id.clone();
        let record = ServiceHealthRecord {
            service_id: id.clone(),
            service_name: outcome.instance.name.clone(),
            is_healthy: outcome.healthy,
            response_time_ms: outcome.response_time_ms,
            http_status: outcome.http_status,
            error_message: outcome.error.clone(),
            checked_at: self.clock.now_utc(),
        };
        if let Err(e) = self.store.append_health_record(record).await {
            tracing::warn!(error = %e, instance_id = %id, "Failed to append health record");
        }

        let update = match self.registry.set_health(&id, outcome.healthy).await {
            Ok(update) => update,
            Err(e) => {
                // deregistered while the probe was in flight
                tracing::debug!(error = %e, instance_id = %id, "Skipping probe result");
                return None;
            }
        };
        metrics::set_instance_health(&update.instance.name, &id, update.instance.is_healthy);

        if !outcome.healthy {
            tracing::debug!(
                service = %update.instance.name,
                instance_id = %id,
                failures = update.consecutive_failures,
                error = outcome.error.as_deref().unwrap_or(""),
                "Health probe failed"
            );
        }

        let limit = self.config.evict_after_failures?;
        if outcome.healthy || update.consecutive_failures < limit {
            return None;
        }
        match self.registry.evict(&id).await {
            Ok(_) => {
                if let Some(balancer) = &self.balancer {
                    balancer.forget_instance(&id).await;
                }
                Some(id)
            }
            Err(e) => {
                tracing::debug!(error = %e, instance_id = %id, "Eviction skipped");
                None
            }
        }
    }

    /// Share of healthy probes for an instance over the trailing `window`, in percent.
    /// `None` when there is no history in that window.
    pub async fn uptime_percentage(
        &self,
        instance_id: &str,
        window: Duration,
    ) -> Result<Option<f64>, GatewayError> {
        let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let since = self
            .clock
            .now_utc()
            .checked_sub_signed(window)
            .unwrap_or(chrono::DateTime::<chrono::Utc>::MIN_UTC);
        let history = self.store.health_history(instance_id, since).await?;
        if history.is_empty() {
            return Ok(None);
        }
        let healthy = history.iter().filter(|r| r.is_healthy).count();
        Ok(Some(healthy as f64 * 100.0 / history.len() as f64))
    }
}

async fn probe(client: Arc<dyn HttpClient>, instance: ServiceInstance, timeout: Duration) -> ProbeOutcome {
    let url = instance.health_url();
    let started = Instant::now();
    let result = client.probe(&url, timeout).await;
    let response_time_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(response) => {
            let verdict = evaluate_probe_response(&response);
            ProbeOutcome {
                instance,
                healthy: verdict.is_ok(),
                response_time_ms,
                http_status: Some(response.status.as_u16()),
                error: verdict.err(),
            }
        }
        Err(e) => ProbeOutcome {
            instance,
            healthy: false,
            response_time_ms,
            http_status: None,
            error: Some(e.to_string()),
        },
    }
}
