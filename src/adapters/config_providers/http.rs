use std::{
    hash::{DefaultHasher, Hash, Hasher},
    sync::{Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use config::FileFormat;
use eyre::{Result, WrapErr};
use reqwest::{Client, header::CONTENT_TYPE};
use tokio::sync::mpsc;

use crate::{
    config::{loader::parse_config_str, models::GatewayConfig, validation::ConfigValidator},
    ports::config_provider::ConfigProvider,
};

/// Configuration provider that fetches a document over HTTP and polls it for changes.
///
/// The document format follows the response `Content-Type` (JSON, YAML, or TOML
/// otherwise). A change is detected by hashing the raw body; the poller stops once
/// the watch receiver is dropped.
pub struct HttpConfigProvider {
    url: String,
    client: Client,
    update_rx: Mutex<Option<mpsc::Receiver<()>>>,
}

impl HttpConfigProvider {
    /// Must be called inside a Tokio runtime; spawns the polling task.
    pub fn new(url: impl Into<String>, poll_interval: Duration) -> Result<Self> {
        let url = url.into();
        let (tx, rx) = mpsc::channel(1);
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .wrap_err("Failed to build config HTTP client")?;

        let poll_client = client.clone();
        let poll_url = url.clone();
        tokio::spawn(async move {
            let mut last_hash: Option<u64> = None;
            let mut interval = tokio::time::interval(poll_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                if tx.is_closed() {
                    break;
                }

                match fetch_document(&poll_client, &poll_url).await {
                    Ok((body, _)) => {
                        let mut hasher = DefaultHasher::new();
                        body.hash(&mut hasher);
                        let hash = hasher.finish();
                        match last_hash {
                            Some(previous) if previous != hash => {
                                tracing::info!(url = %poll_url, "Remote configuration changed");
                                let _ = tx.try_send(());
                            }
                            _ => {}
                        }
                        last_hash = Some(hash);
                    }
                    Err(e) => {
                        tracing::warn!(url = %poll_url, error = %e, "Failed to poll remote config");
                    }
                }
            }
            tracing::debug!(url = %poll_url, "Remote config poller stopped");
        });

        Ok(Self {
            url,
            client,
            update_rx: Mutex::new(Some(rx)),
        })
    }
}

async fn fetch_document(client: &Client, url: &str) -> Result<(String, FileFormat)> {
    let response = client
        .get(url)
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .wrap_err_with(|| format!("Failed to fetch config from {url}"))?;

    let format = match response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        Some(ct) if ct.contains("json") => FileFormat::Json,
        Some(ct) if ct.contains("yaml") => FileFormat::Yaml,
        _ => FileFormat::Toml,
    };
    let body = response
        .text()
        .await
        .wrap_err("Failed to read config response body")?;
    Ok((body, format))
}

#[async_trait]
impl ConfigProvider for HttpConfigProvider {
    async fn load_config(&self) -> Result<GatewayConfig> {
        let (body, format) = fetch_document(&self.client, &self.url).await?;
        let config = parse_config_str(&body, format)?;
        ConfigValidator::validate(&config)
            .with_context(|| format!("Invalid configuration from {}", self.url))?;
        Ok(config)
    }

    fn watch(&self) -> Option<mpsc::Receiver<()>> {
        self.update_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{Json, Router, routing::get};
    use serde_json::{Value, json};
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn polls_and_signals_changes() -> Result<()> {
        let document = Arc::new(Mutex::new(json!({
            "listen_addr": "127.0.0.1:8080",
            "routes": [{ "path": "/api/orders", "target": "orders" }]
        })));

        let state = document.clone();
        let app = Router::new().route(
            "/config",
            get(move || async move { Json::<Value>(state.lock().unwrap().clone()) }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let url = format!("http://{}/config", listener.local_addr()?);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let provider = HttpConfigProvider::new(url, Duration::from_millis(100))?;
        let config = provider.load_config().await?;
        assert_eq!(config.routes.len(), 1);

        let mut rx = provider.watch().expect("first watch yields a receiver");

        // let the poller record the first hash
        tokio::time::sleep(Duration::from_millis(250)).await;
        document.lock().unwrap()["routes"]
            .as_array_mut()
            .unwrap()
            .push(json!({ "path": "/api/users", "target": "users" }));

        let notification = tokio::time::timeout(Duration::from_secs(2), rx.recv()).await;
        assert!(matches!(notification, Ok(Some(()))), "no reload signal");

        let config = provider.load_config().await?;
        assert_eq!(config.routes.len(), 2);
        Ok(())
    }
}
