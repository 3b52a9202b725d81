//! Health alerting: a per-service state machine fed once per health-check tick,
//! and a bounded list of subscribers the resulting alerts are delivered to.
use std::{
    collections::{HashMap, VecDeque},
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, PoisonError, RwLock},
    time::Duration,
};

use thiserror::Error;

use crate::{
    config::AlertConfig,
    ports::{
        alerts::{AlertHandler, AlertKind, HealthAlert},
        clock::Clock,
    },
};

/// Aggregated probe results of one service for one tick.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TickSummary {
    pub healthy: usize,
    pub total: usize,
    pub average_latency_ms: f64,
}

#[derive(Debug, Default)]
struct ServiceWindow {
    ticks: VecDeque<TickSummary>,
    last_raised: HashMap<AlertKind, u64>,
    down_delivered: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct AlertRules {
    pub cooldown: Duration,
    pub failure_window: usize,
    pub latency_window: usize,
    pub latency_threshold_ms: u64,
}

impl AlertRules {
    pub fn from_config(config: &AlertConfig) -> Self {
        Self {
            cooldown: config.cooldown().unwrap_or(Duration::from_secs(300)),
            failure_window: config.failure_window.max(1),
            latency_window: config.latency_window.max(1),
            latency_threshold_ms: config.latency_threshold_ms,
        }
    }
}

pub struct AlertMonitor {
    rules: AlertRules,
    windows: scc::HashMap<String, ServiceWindow>,
    clock: Arc<dyn Clock>,
}

impl AlertMonitor {
    pub fn new(rules: AlertRules, clock: Arc<dyn Clock>) -> Self {
        Self {
            rules,
            windows: scc::HashMap::new(),
            clock,
        }
    }

    /// Feed one tick for `service` and return the alerts it raises.
    pub async fn observe(&self, service: &str, tick: TickSummary) -> Vec<HealthAlert> {
        let now = self.clock.now_millis();
        let rules = self.rules;
        let cooldown_ms = u64::try_from(rules.cooldown.as_millis()).unwrap_or(u64::MAX);

        let mut entry = self
            .windows
            .entry_async(service.to_string())
            .await
            .or_insert_with(ServiceWindow::default);
        let window = entry.get_mut();

        window.ticks.push_back(tick);
        let keep = rules.failure_window.max(rules.latency_window);
        while window.ticks.len() > keep {
            window.ticks.pop_front();
        }

        let cooled_down = |window: &ServiceWindow, kind: AlertKind| {
            window
                .last_raised
                .get(&kind)
                .is_none_or(|last| now.saturating_sub(*last) >= cooldown_ms)
        };

        let mut raised = Vec::new();

        let all_down = window.ticks.len() >= rules.failure_window
            && window
                .ticks
                .iter()
                .rev()
                .take(rules.failure_window)
                .all(|t| t.total > 0 && t.healthy == 0);
        if all_down && cooled_down(window, AlertKind::ServiceDown) {
            window.last_raised.insert(AlertKind::ServiceDown, now);
            window.down_delivered = true;
            raised.push(self.alert(
                AlertKind::ServiceDown,
                service,
                format!(
                    "Service '{service}' has had no healthy instance for {} consecutive checks",
                    rules.failure_window
                ),
                None,
            ));
        }

        if tick.healthy > 0 && window.down_delivered {
            window.down_delivered = false;
            raised.push(self.alert(
                AlertKind::Recovered,
                service,
                format!("Service '{service}' recovered ({}/{} instances healthy)", tick.healthy, tick.total),
                None,
            ));
        }

        let recent: Vec<f64> = window
            .ticks
            .iter()
            .rev()
            .take(rules.latency_window)
            .filter(|t| t.healthy > 0)
            .map(|t| t.average_latency_ms)
            .collect();
        if !recent.is_empty() {
            let average = recent.iter().sum::<f64>() / recent.len() as f64;
            if average > rules.latency_threshold_ms as f64
                && cooled_down(window, AlertKind::HighLatency)
            {
                window.last_raised.insert(AlertKind::HighLatency, now);
                raised.push(self.alert(
                    AlertKind::HighLatency,
                    service,
                    format!(
                        "Service '{service}' average response time {average:.0}ms exceeds {}ms",
                        rules.latency_threshold_ms
                    ),
                    Some(average),
                ));
            }
        }

        raised
    }

    /// Drop the window of a service that no longer exists.
    pub async fn forget(&self, service: &str) {
        let _ = self.windows.remove_async(service).await;
    }

    fn alert(
        &self,
        kind: AlertKind,
        service: &str,
        message: String,
        average_latency_ms: Option<f64>,
    ) -> HealthAlert {
        HealthAlert {
            kind,
            service: service.to_string(),
            message,
            average_latency_ms,
            raised_at: self.clock.now_utc(),
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AlertSubscriptionError {
    #[error("Alert handler limit of {0} reached")]
    TooManyHandlers(usize),

    #[error("Alert handler '{0}' is already registered")]
    Duplicate(String),
}

/// Bounded list of alert subscribers, invoked synchronously in registration order.
pub struct AlertDispatcher {
    handlers: RwLock<Vec<Arc<dyn AlertHandler>>>,
    max_handlers: usize,
}

impl AlertDispatcher {
    pub fn new(max_handlers: usize) -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            max_handlers,
        }
    }

    pub fn subscribe(&self, handler: Arc<dyn AlertHandler>) -> Result<(), AlertSubscriptionError> {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        if handlers.iter().any(|h| h.name() == handler.name()) {
            return Err(AlertSubscriptionError::Duplicate(handler.name().to_string()));
        }
        if handlers.len() >= self.max_handlers {
            return Err(AlertSubscriptionError::TooManyHandlers(self.max_handlers));
        }
        tracing::debug!(handler = handler.name(), "Alert handler subscribed");
        handlers.push(handler);
        Ok(())
    }

    pub fn unsubscribe(&self, name: &str) -> bool {
        let mut handlers = self.handlers.write().unwrap_or_else(PoisonError::into_inner);
        let before = handlers.len();
        handlers.retain(|h| h.name() != name);
        handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        self.handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver `alert` to every handler. A panicking handler is logged and skipped.
    pub fn dispatch(&self, alert: &HealthAlert) -> usize {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        tracing::warn!(
            kind = %alert.kind,
            service = %alert.service,
            message = %alert.message,
            "Health alert raised"
        );

        let mut delivered = 0;
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler.on_alert(alert))) {
                Ok(()) => delivered += 1,
                Err(_) => {
                    tracing::error!(handler = handler.name(), kind = %alert.kind, "Alert handler panicked")
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::ports::clock::ManualClock;

    fn monitor(latency_window: usize) -> (AlertMonitor, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let rules = AlertRules {
            cooldown: Duration::from_secs(300),
            failure_window: 3,
            latency_window,
            latency_threshold_ms: 2_000,
        };
        (AlertMonitor::new(rules, clock.clone()), clock)
    }

    fn down() -> TickSummary {
        TickSummary {
            healthy: 0,
            total: 2,
            average_latency_ms: 10.0,
        }
    }

    fn up(latency: f64) -> TickSummary {
        TickSummary {
            healthy: 2,
            total: 2,
            average_latency_ms: latency,
        }
    }

    fn kinds(alerts: &[HealthAlert]) -> Vec<AlertKind> {
        alerts.iter().map(|a| a.kind).collect()
    }

    #[tokio::test]
    async fn service_down_after_full_failure_window_then_cooldown() {
        let (monitor, clock) = monitor(5);
        assert!(monitor.observe("orders", down()).await.is_empty());
        assert!(monitor.observe("orders", down()).await.is_empty());
        let alerts = monitor.observe("orders", down()).await;
        assert_eq!(kinds(&alerts), vec![AlertKind::ServiceDown]);

        clock.advance(60_000);
        assert!(monitor.observe("orders", down()).await.is_empty());

        clock.advance(240_000);
        assert_eq!(
            kinds(&monitor.observe("orders", down()).await),
            vec![AlertKind::ServiceDown]
        );
    }

    #[tokio::test]
    async fn recovery_only_follows_a_delivered_down_alert() {
        let (monitor, _) = monitor(5);
        monitor.observe("orders", down()).await;
        assert!(monitor.observe("orders", up(10.0)).await.is_empty());

        for _ in 0..3 {
            monitor.observe("orders", down()).await;
        }
        assert_eq!(
            kinds(&monitor.observe("orders", up(10.0)).await),
            vec![AlertKind::Recovered]
        );
        assert!(monitor.observe("orders", up(10.0)).await.is_empty());
    }

    #[tokio::test]
    async fn high_latency_uses_rolling_average() {
        let (monitor, _) = monitor(2);
        assert!(monitor.observe("orders", up(1_500.0)).await.is_empty());
        let alerts = monitor.observe("orders", up(3_000.0)).await;
        assert_eq!(kinds(&alerts), vec![AlertKind::HighLatency]);
        assert_eq!(alerts[0].average_latency_ms, Some(2_250.0));
        assert!(monitor.observe("orders", up(5_000.0)).await.is_empty());
    }

    #[tokio::test]
    async fn ticks_without_healthy_instances_do_not_dilute_latency() {
        let (monitor, _) = monitor(3);
        let outage = TickSummary {
            healthy: 0,
            total: 2,
            average_latency_ms: 0.0,
        };
        assert!(monitor.observe("orders", outage).await.is_empty());
        assert!(monitor.observe("orders", outage).await.is_empty());

        let alerts = monitor.observe("orders", up(3_000.0)).await;
        assert_eq!(kinds(&alerts), vec![AlertKind::HighLatency]);
        assert_eq!(alerts[0].average_latency_ms, Some(3_000.0));
    }

    struct Recorder {
        name: String,
        seen: Mutex<Vec<AlertKind>>,
    }

    impl AlertHandler for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        fn on_alert(&self, alert: &HealthAlert) {
            self.seen.lock().unwrap().push(alert.kind);
        }
    }

    struct Panicker;

    impl AlertHandler for Panicker {
        fn name(&self) -> &str {
            "panicker"
        }

        fn on_alert(&self, _: &HealthAlert) {
            panic!("handler failure");
        }
    }

    fn recorder(name: &str) -> Arc<Recorder> {
        Arc::new(Recorder {
            name: name.to_string(),
            seen: Mutex::new(Vec::new()),
        })
    }

    fn sample_alert() -> HealthAlert {
        HealthAlert {
            kind: AlertKind::ServiceDown,
            service: "orders".to_string(),
            message: "down".to_string(),
            average_latency_ms: None,
            raised_at: chrono::Utc::now(),
        }
    }

    #[test]
    fn dispatcher_is_bounded_and_rejects_duplicates() {
        let dispatcher = AlertDispatcher::new(2);
        dispatcher.subscribe(recorder("a")).unwrap();
        assert_eq!(
            dispatcher.subscribe(recorder("a")),
            Err(AlertSubscriptionError::Duplicate("a".to_string()))
        );
        dispatcher.subscribe(recorder("b")).unwrap();
        assert_eq!(
            dispatcher.subscribe(recorder("c")),
            Err(AlertSubscriptionError::TooManyHandlers(2))
        );
        assert!(dispatcher.unsubscribe("a"));
        assert!(!dispatcher.unsubscribe("a"));
        assert_eq!(dispatcher.handler_count(), 1);
    }

    #[test]
    fn panicking_handler_does_not_stop_delivery() {
        let dispatcher = AlertDispatcher::new(4);
        let first = recorder("first");
        dispatcher.subscribe(Arc::new(Panicker)).unwrap();
        dispatcher.subscribe(first.clone()).unwrap();

        assert_eq!(dispatcher.dispatch(&sample_alert()), 1);
        assert_eq!(*first.seen.lock().unwrap(), vec![AlertKind::ServiceDown]);
    }
}
