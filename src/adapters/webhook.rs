use std::time::Duration;

use eyre::{Result, WrapErr};
use tokio::runtime::Handle;

use crate::{
    config::WebhookConfig,
    ports::alerts::{AlertHandler, HealthAlert},
};

/// Alert handler that POSTs each alert as JSON to a webhook.
///
/// Delivery runs on a spawned task so the health-check tick is never held up
/// by a slow receiver; failures are logged and dropped.
pub struct WebhookAlertHandler {
    name: String,
    url: String,
    client: reqwest::Client,
}

impl WebhookAlertHandler {
    pub fn new(config: &WebhookConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .wrap_err("Failed to build webhook HTTP client")?;
        Ok(Self {
            name: config
                .name
                .clone()
                .unwrap_or_else(|| format!("webhook:{}", config.url)),
            url: config.url.clone(),
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl AlertHandler for WebhookAlertHandler {
    fn name(&self) -> &str {
        &self.name
    }

    fn on_alert(&self, alert: &HealthAlert) {
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!(webhook = %self.name, "No async runtime, dropping webhook alert");
            return;
        };

        let request = self.client.post(&self.url).json(alert);
        let name = self.name.clone();
        let kind = alert.kind;
        let service = alert.service.clone();
        runtime.spawn(async move {
            match request.send().await.and_then(|r| r.error_for_status()) {
                Ok(_) => {
                    tracing::debug!(webhook = %name, kind = %kind, service = %service, "Alert delivered")
                }
                Err(e) => {
                    tracing::warn!(webhook = %name, kind = %kind, service = %service, error = %e, "Alert delivery failed")
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::ports::alerts::AlertKind;

    fn config(name: Option<&str>) -> WebhookConfig {
        WebhookConfig {
            url: "http://127.0.0.1:9/alerts".to_string(),
            name: name.map(str::to_string),
            timeout_ms: 200,
        }
    }

    #[test]
    fn handler_name_defaults_to_url() {
        let handler = WebhookAlertHandler::new(&config(None)).unwrap();
        assert_eq!(handler.name(), "webhook:http://127.0.0.1:9/alerts");

        let named = WebhookAlertHandler::new(&config(Some("pager"))).unwrap();
        assert_eq!(named.name(), "pager");
    }

    #[tokio::test]
    async fn delivery_failure_does_not_block_or_panic() {
        let handler = WebhookAlertHandler::new(&config(None)).unwrap();
        handler.on_alert(&HealthAlert {
            kind: AlertKind::ServiceDown,
            service: "orders".to_string(),
            message: "all instances down".to_string(),
            average_latency_ms: None,
            raised_at: Utc::now(),
        });
    }
}
