//! Registry data model: instances, registrations and health history records.
use std::{collections::HashMap, net::Ipv6Addr};

use http::uri::Authority;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::GatewayError;

pub const DEFAULT_VERSION: &str = "1.0.0";
pub const DEFAULT_HEALTH_ENDPOINT: &str = "/health";

/// One running copy of a backend service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub id: String,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub version: String,
    pub base_path: String,
    pub health_endpoint: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    pub weight: u32,
    pub priority: i32,
    pub is_healthy: bool,
    pub last_heartbeat: DateTime<Utc>,
}

impl ServiceInstance {
    /// `http://{host}:{port}{basePath}`, with IPv6 literals bracketed.
    pub fn base_url(&self) -> String {
        format!("http://{}{}", authority(&self.host, self.port), self.base_path)
    }

    /// `http://{host}:{port}{basePath}{healthEndpoint}`
    pub fn health_url(&self) -> String {
        format!("{}{}", self.base_url(), self.health_endpoint)
    }

    pub fn address(&self) -> (&str, u16) {
        (&self.host, self.port)
    }
}

/// Registration request, as received from the admin API or the config file.
///
/// Every field is optional on the wire so that missing fields surface as
/// validation errors instead of deserialization failures. Config files may use
/// snake_case keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServiceRegistration {
    pub id: Option<String>,
    pub name: Option<String>,
    pub host: Option<String>,
    pub port: Option<i64>,
    pub version: Option<String>,
    #[serde(alias = "base_path")]
    pub base_path: Option<String>,
    #[serde(alias = "health_endpoint")]
    pub health_endpoint: Option<String>,
    pub tags: Option<Vec<String>>,
    pub metadata: Option<HashMap<String, String>>,
    pub weight: Option<u32>,
    pub priority: Option<i32>,
}

impl ServiceRegistration {
    pub fn new(name: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            name: Some(name.into()),
            host: Some(host.into()),
            port: Some(i64::from(port)),
            ..Self::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = Some(base_path.into());
        self
    }

    pub fn with_health_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.health_endpoint = Some(endpoint.into());
        self
    }

    pub fn with_tags(mut self, tags: &[&str]) -> Self {
        self.tags = Some(tags.iter().map(|t| t.to_string()).collect());
        self
    }

    /// Check name, host and port, reporting every problem at once.
    pub fn validate(&self) -> Result<(), GatewayError> {
        let mut problems = Vec::new();

        match self.name.as_deref().map(str::trim) {
            None | Some("") => problems.push("name is required".to_string()),
            Some(name) if name.contains('/') => {
                problems.push(format!("name '{name}' must not contain '/'"))
            }
            _ => {}
        }
        match self.host.as_deref().map(normalize_host) {
            None => problems.push("host is required".to_string()),
            Some(host) if host.is_empty() => problems.push("host is required".to_string()),
            Some(host) if host.contains('@') || authority(&host, 80).parse::<Authority>().is_err() => {
                problems.push(format!("host '{host}' is not a valid hostname or IP address"))
            }
            _ => {}
        }
        match self.port {
            None => problems.push("port is required".to_string()),
            Some(port) if !(1..=65535).contains(&port) => {
                problems.push(format!("port {port} is outside 1-65535"))
            }
            _ => {}
        }
        if self.weight == Some(0) {
            problems.push("weight must be at least 1".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::Validation(problems.join("; ")))
        }
    }

    /// Build a fresh instance from a validated registration.
    pub(crate) fn into_instance(self, id: String, now: DateTime<Utc>) -> ServiceInstance {
        ServiceInstance {
            id,
            name: self.name.unwrap_or_default().trim().to_string(),
            host: normalize_host(self.host.as_deref().unwrap_or_default()),
            port: self
                .port
                .and_then(|p| u16::try_from(p).ok())
                .unwrap_or_default(),
            version: self.version.unwrap_or_else(|| DEFAULT_VERSION.to_string()),
            base_path: normalize_base_path(self.base_path.as_deref().unwrap_or("")),
            health_endpoint: normalize_endpoint(
                self.health_endpoint
                    .as_deref()
                    .unwrap_or(DEFAULT_HEALTH_ENDPOINT),
            ),
            tags: self.tags.unwrap_or_default(),
            metadata: self.metadata.unwrap_or_default(),
            weight: self.weight.unwrap_or(1),
            priority: self.priority.unwrap_or(0),
            is_healthy: true,
            last_heartbeat: now,
        }
    }
}

/// Trim and drop the brackets around an IPv6 literal, so `[::1]` and `::1`
/// name the same address.
pub(crate) fn normalize_host(host: &str) -> String {
    let trimmed = host.trim();
    trimmed
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .filter(|h| h.parse::<Ipv6Addr>().is_ok())
        .unwrap_or(trimmed)
        .to_string()
}

/// `host:port`, bracketing IPv6 literals.
fn authority(host: &str, port: u16) -> String {
    if host.parse::<Ipv6Addr>().is_ok() {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn normalize_base_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn normalize_endpoint(path: &str) -> String {
    let trimmed = path.trim();
    if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{trimmed}")
    }
}

/// Append-only probe result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceHealthRecord {
    pub service_id: String,
    pub service_name: String,
    pub is_healthy: bool,
    pub response_time_ms: u64,
    pub http_status: Option<u16>,
    pub error_message: Option<String>,
    pub checked_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_reports_all_missing_fields() {
        let err = ServiceRegistration::default().validate().unwrap_err();
        let GatewayError::Validation(message) = err else {
            panic!("expected validation error");
        };
        assert!(message.contains("name is required"));
        assert!(message.contains("host is required"));
        assert!(message.contains("port is required"));
    }

    #[test]
    fn validation_rejects_out_of_range_port() {
        let mut registration = ServiceRegistration::new("orders", "10.0.0.1", 80);
        registration.port = Some(70_000);
        assert!(registration.validate().is_err());
        registration.port = Some(0);
        assert!(registration.validate().is_err());
        registration.port = Some(65_535);
        assert!(registration.validate().is_ok());
    }

    #[test]
    fn defaults_are_applied_on_conversion() {
        let now = Utc::now();
        let instance = ServiceRegistration::new("orders", "10.0.0.1", 8080)
            .with_base_path("api/")
            .with_health_endpoint("status")
            .into_instance("id-1".to_string(), now);

        assert_eq!(instance.version, DEFAULT_VERSION);
        assert_eq!(instance.weight, 1);
        assert_eq!(instance.priority, 0);
        assert!(instance.is_healthy);
        assert_eq!(instance.base_url(), "http://10.0.0.1:8080/api");
        assert_eq!(instance.health_url(), "http://10.0.0.1:8080/api/status");
    }

    #[test]
    fn ipv6_hosts_are_bracketed_in_urls() {
        let instance = ServiceRegistration::new("users", "::1", 9000)
            .into_instance("id-3".to_string(), Utc::now());
        assert_eq!(instance.host, "::1");
        assert_eq!(instance.health_url(), "http://[::1]:9000/health");
        assert!(instance.health_url().parse::<http::Uri>().is_ok());

        let bracketed = ServiceRegistration::new("users", "[::1]", 9000)
            .into_instance("id-4".to_string(), Utc::now());
        assert_eq!(bracketed.host, "::1");
        assert_eq!(bracketed.base_url(), instance.base_url());
    }

    #[test]
    fn validation_rejects_hosts_that_are_not_an_authority() {
        assert!(ServiceRegistration::new("users", "fe80::1", 9000).validate().is_ok());
        for host in ["bad host", "a/b", "user@10.0.0.1", "10.0.0.1:80"] {
            let err = ServiceRegistration::new("users", host, 9000)
                .validate()
                .unwrap_err();
            assert!(matches!(err, GatewayError::Validation(_)), "{host}");
        }
    }

    #[test]
    fn health_url_without_base_path() {
        let instance = ServiceRegistration::new("users", "localhost", 9000)
            .into_instance("id-2".to_string(), Utc::now());
        assert_eq!(instance.health_url(), "http://localhost:9000/health");
    }
}
