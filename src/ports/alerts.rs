use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kinds of health alerts raised per logical service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    ServiceDown,
    HighLatency,
    Recovered,
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertKind::ServiceDown => write!(f, "service_down"),
            AlertKind::HighLatency => write!(f, "high_latency"),
            AlertKind::Recovered => write!(f, "recovered"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthAlert {
    pub kind: AlertKind,
    pub service: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_latency_ms: Option<f64>,
    pub raised_at: DateTime<Utc>,
}

/// Subscriber for health alerts.
///
/// Handlers are invoked synchronously on the health-check task, so anything
/// slow (network delivery) must hand the alert off instead of blocking.
pub trait AlertHandler: Send + Sync + 'static {
    /// Stable name used for unsubscribe and logging
    fn name(&self) -> &str;

    fn on_alert(&self, alert: &HealthAlert);
}
