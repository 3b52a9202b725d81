use std::{collections::HashSet, net::SocketAddr};

use url::Url;

use crate::config::models::{
    AlertConfig, CircuitBreakerConfig, GatewayConfig, HealthCheckConfig, MAX_ROUTE_RETRIES,
    RateLimitSettings, RouteConfig,
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ConfigValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum ConfigValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },

    #[error("Route conflict detected: {message}")]
    RouteConflict { message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

const KNOWN_METHODS: &[&str] = &[
    "GET", "HEAD", "POST", "PUT", "PATCH", "DELETE", "OPTIONS", "TRACE", "CONNECT",
];

/// Gateway configuration validator. Collects every problem before failing.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the entire gateway configuration
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if let Err(e) = Self::validate_listen_address(&config.listen_addr) {
            errors.push(e);
        }

        for route in &config.routes {
            errors.extend(Self::validate_route(route));
        }
        errors.extend(Self::check_route_conflicts(&config.routes));

        if config.admin.enabled && !config.admin.path_prefix.starts_with('/') {
            errors.push(ConfigValidationError::InvalidField {
                field: "admin.path_prefix".to_string(),
                message: "Admin prefix must start with '/'".to_string(),
            });
        }

        for (i, registration) in config.services.iter().enumerate() {
            if let Err(e) = registration.validate() {
                errors.push(ConfigValidationError::InvalidField {
                    field: format!("services[{i}]"),
                    message: e.to_string(),
                });
            }
        }

        errors.extend(Self::validate_health_check(&config.health_check));
        errors.extend(Self::validate_alerts(&config.alerts));
        errors.extend(Self::validate_circuit_breaker(&config.circuit_breaker));
        errors.extend(Self::validate_rate_limit(&config.rate_limit));

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    /// Validate listen address format
    fn validate_listen_address(address: &str) -> ValidationResult<()> {
        if address.parse::<SocketAddr>().is_err() {
            return Err(ConfigValidationError::InvalidListenAddress {
                address: address.to_string(),
                reason: "Must be in format 'IP:PORT' (e.g., '127.0.0.1:3000' or '0.0.0.0:8080')"
                    .to_string(),
            });
        }
        Ok(())
    }

    fn validate_route(route: &RouteConfig) -> Vec<ConfigValidationError> {
        let mut errors = Vec::new();
        let path = &route.path;

        if !path.starts_with('/') {
            errors.push(ConfigValidationError::InvalidField {
                field: format!("route path: {path}"),
                message: "Route paths must start with '/'".to_string(),
            });
        }
        if route.target.trim().is_empty() {
            errors.push(ConfigValidationError::MissingField {
                field: format!("route '{path}' target"),
            });
        }
        for method in &route.methods {
            if !KNOWN_METHODS.contains(&method.to_ascii_uppercase().as_str()) {
                errors.push(ConfigValidationError::InvalidField {
                    field: format!("route '{path}' methods"),
                    message: format!("Unknown HTTP method '{method}'"),
                });
            }
        }
        if route.timeout_ms == 0 {
            errors.push(ConfigValidationError::InvalidField {
                field: format!("route '{path}' timeout_ms"),
                message: "Timeout must be greater than 0".to_string(),
            });
        }
        if route.retries > MAX_ROUTE_RETRIES {
            errors.push(ConfigValidationError::InvalidField {
                field: format!("route '{path}' retries"),
                message: format!("At most {MAX_ROUTE_RETRIES} retries are allowed"),
            });
        }
        if route.max_body_bytes == 0 {
            errors.push(ConfigValidationError::InvalidField {
                field: format!("route '{path}' max_body_bytes"),
                message: "Body limit must be greater than 0".to_string(),
            });
        }
        if !route.roles.is_empty() && !route.auth_required {
            errors.push(ConfigValidationError::InvalidField {
                field: format!("route '{path}' roles"),
                message: "Roles require auth_required = true".to_string(),
            });
        }
        if let Some(custom) = &route.rate_limit.custom {
            if custom.max_requests == 0 || custom.window_ms == 0 {
                errors.push(ConfigValidationError::InvalidField {
                    field: format!("route '{path}' rate_limit.custom"),
                    message: "max_requests and window_ms must be greater than 0".to_string(),
                });
            }
            if custom.refill_per_sec.is_some_and(|r| r <= 0.0 || !r.is_finite()) {
                errors.push(ConfigValidationError::InvalidField {
                    field: format!("route '{path}' rate_limit.custom.refill_per_sec"),
                    message: "Refill rate must be a positive number".to_string(),
                });
            }
        }

        errors
    }

    /// Two routes on the same normalized path with overlapping methods are ambiguous.
    fn check_route_conflicts(routes: &[RouteConfig]) -> Vec<ConfigValidationError> {
        let mut seen: HashSet<(String, String)> = HashSet::new();
        let mut errors = Vec::new();

        for route in routes {
            let path = route.path.trim_end_matches('/').to_string();
            let methods: Vec<String> = if route.methods.is_empty() {
                vec!["*".to_string()]
            } else {
                route.methods.iter().map(|m| m.to_ascii_uppercase()).collect()
            };
            for method in methods {
                let key = (path.clone(), method.clone());
                let wildcard = (path.clone(), "*".to_string());
                if seen.contains(&key) || (method != "*" && seen.contains(&wildcard)) {
                    errors.push(ConfigValidationError::RouteConflict {
                        message: format!("'{}' is defined more than once for {method}", route.path),
                    });
                }
                seen.insert(key);
            }
        }

        errors
    }

    fn validate_health_check(config: &HealthCheckConfig) -> Vec<ConfigValidationError> {
        let mut errors = Vec::new();
        if !config.enabled {
            return errors;
        }

        if config.interval_secs == 0 {
            errors.push(ConfigValidationError::InvalidField {
                field: "health_check.interval_secs".to_string(),
                message: "Interval must be greater than 0".to_string(),
            });
        }
        if config.timeout_ms == 0 {
            errors.push(ConfigValidationError::InvalidField {
                field: "health_check.timeout_ms".to_string(),
                message: "Timeout must be greater than 0".to_string(),
            });
        }
        if config.concurrency == 0 {
            errors.push(ConfigValidationError::InvalidField {
                field: "health_check.concurrency".to_string(),
                message: "Concurrency must be at least 1".to_string(),
            });
        }
        if config.healthy_threshold == 0 || config.unhealthy_threshold == 0 {
            errors.push(ConfigValidationError::InvalidField {
                field: "health_check thresholds".to_string(),
                message: "Healthy and unhealthy thresholds must be at least 1".to_string(),
            });
        }
        if config.evict_after_failures == Some(0) {
            errors.push(ConfigValidationError::InvalidField {
                field: "health_check.evict_after_failures".to_string(),
                message: "Use a positive count or omit the field".to_string(),
            });
        }

        errors
    }

    fn validate_alerts(config: &AlertConfig) -> Vec<ConfigValidationError> {
        let mut errors = Vec::new();

        if let Err(e) = config.cooldown() {
            errors.push(ConfigValidationError::InvalidField {
                field: "alerts.cooldown".to_string(),
                message: format!("Invalid duration '{}': {e}", config.cooldown),
            });
        }
        if config.failure_window == 0 || config.latency_window == 0 {
            errors.push(ConfigValidationError::InvalidField {
                field: "alerts windows".to_string(),
                message: "failure_window and latency_window must be at least 1".to_string(),
            });
        }
        if config.webhooks.len() > config.max_handlers {
            errors.push(ConfigValidationError::InvalidField {
                field: "alerts.webhooks".to_string(),
                message: format!("At most {} handlers can be registered", config.max_handlers),
            });
        }
        for webhook in &config.webhooks {
            match Url::parse(&webhook.url) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => {}
                Ok(url) => errors.push(ConfigValidationError::InvalidField {
                    field: "alerts.webhooks.url".to_string(),
                    message: format!("Unsupported scheme '{}' in '{}'", url.scheme(), webhook.url),
                }),
                Err(e) => errors.push(ConfigValidationError::InvalidField {
                    field: "alerts.webhooks.url".to_string(),
                    message: format!("Invalid URL '{}': {e}", webhook.url),
                }),
            }
        }

        errors
    }

    fn validate_circuit_breaker(config: &CircuitBreakerConfig) -> Vec<ConfigValidationError> {
        let mut errors = Vec::new();
        if config.threshold == 0 {
            errors.push(ConfigValidationError::InvalidField {
                field: "circuit_breaker.threshold".to_string(),
                message: "Threshold must be at least 1".to_string(),
            });
        }
        if config.timeout_ms == 0 {
            errors.push(ConfigValidationError::InvalidField {
                field: "circuit_breaker.timeout_ms".to_string(),
                message: "Timeout must be greater than 0".to_string(),
            });
        }
        errors
    }

    fn validate_rate_limit(settings: &RateLimitSettings) -> Vec<ConfigValidationError> {
        let mut errors = Vec::new();

        for (tier, limit) in settings.tiers.iter() {
            if limit.max_requests == 0 || limit.window_ms == 0 {
                errors.push(ConfigValidationError::InvalidField {
                    field: format!("rate_limit.tiers.{tier}"),
                    message: "max_requests and window_ms must be greater than 0".to_string(),
                });
            }
        }
        if let Err(e) = settings.purge_interval() {
            errors.push(ConfigValidationError::InvalidField {
                field: "rate_limit.purge_interval".to_string(),
                message: format!("Invalid duration '{}': {e}", settings.purge_interval),
            });
        }

        let factors = settings
            .context
            .country
            .iter()
            .chain(settings.context.device.iter());
        for (key, factor) in factors {
            if *factor <= 0.0 || !factor.is_finite() {
                errors.push(ConfigValidationError::InvalidField {
                    field: format!("rate_limit.context '{key}'"),
                    message: "Multipliers must be positive".to_string(),
                });
            }
        }
        for promotion in &settings.context.promotions {
            if promotion.ends_at <= promotion.starts_at {
                errors.push(ConfigValidationError::InvalidField {
                    field: format!("rate_limit.context.promotions '{}'", promotion.name),
                    message: "ends_at must be after starts_at".to_string(),
                });
            }
            if promotion.multiplier <= 0.0 || !promotion.multiplier.is_finite() {
                errors.push(ConfigValidationError::InvalidField {
                    field: format!("rate_limit.context.promotions '{}'", promotion.name),
                    message: "Multiplier must be positive".to_string(),
                });
            }
        }

        errors
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ConfigValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}
