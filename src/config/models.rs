//! Configuration data structures for Keel.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. They are
//! serde-friendly and carry defaults so that minimal configs stay concise.
//! Builders and enums here are part of the public API for embedding.
use std::{collections::HashMap, fmt, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{core::instance::ServiceRegistration, ports::authenticator::Principal};

fn default_true() -> bool {
    true
}

fn default_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

/// Top-level gateway configuration.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct GatewayConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub admin: AdminConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    /// Instances registered at startup
    #[serde(default)]
    pub services: Vec<ServiceRegistration>,
    #[serde(default)]
    pub health_check: HealthCheckConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    /// Algorithm used when a route does not pick its own
    #[serde(default)]
    pub load_balancer: LoadBalanceAlgorithm,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl GatewayConfig {
    /// Create a new gateway configuration builder
    pub fn builder() -> GatewayConfigBuilder {
        GatewayConfigBuilder::default()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            admin: AdminConfig::default(),
            auth: AuthConfig::default(),
            routes: Vec::new(),
            services: Vec::new(),
            health_check: HealthCheckConfig::default(),
            alerts: AlertConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitSettings::default(),
            load_balancer: LoadBalanceAlgorithm::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Builder for GatewayConfig, mostly used by embedders and tests
#[derive(Default)]
pub struct GatewayConfigBuilder {
    config: GatewayConfig,
}

impl GatewayConfigBuilder {
    /// Set the listen address
    pub fn listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.config.listen_addr = addr.into();
        self
    }

    /// Add a route
    pub fn route(mut self, route: RouteConfig) -> Self {
        self.config.routes.push(route);
        self
    }

    /// Add a startup service registration
    pub fn service(mut self, registration: ServiceRegistration) -> Self {
        self.config.services.push(registration);
        self
    }

    /// Register a static bearer token resolving to `principal`
    pub fn auth_token(mut self, token: impl Into<String>, principal: Principal) -> Self {
        self.config.auth.tokens.insert(token.into(), principal);
        self
    }

    /// Protect the admin surface with a bearer token
    pub fn admin_token(mut self, token: impl Into<String>) -> Self {
        self.config.admin.token = Some(token.into());
        self
    }

    /// Set health check configuration
    pub fn health_check(mut self, config: HealthCheckConfig) -> Self {
        self.config.health_check = config;
        self
    }

    /// Set alerting configuration
    pub fn alerts(mut self, config: AlertConfig) -> Self {
        self.config.alerts = config;
        self
    }

    /// Set circuit breaker configuration
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.config.circuit_breaker = config;
        self
    }

    /// Set rate limiting configuration
    pub fn rate_limit(mut self, settings: RateLimitSettings) -> Self {
        self.config.rate_limit = settings;
        self
    }

    /// Set the default load balancing algorithm
    pub fn load_balancer(mut self, algorithm: LoadBalanceAlgorithm) -> Self {
        self.config.load_balancer = algorithm;
        self
    }

    /// Build the final GatewayConfig
    pub fn build(self) -> GatewayConfig {
        self.config
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AdminConfig {
    pub enabled: bool,
    pub path_prefix: String,
    /// Bearer token required by every admin endpoint; open when unset
    pub token: Option<String>,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path_prefix: "/admin".to_string(),
            token: None,
        }
    }
}

/// Static token table consumed by the built-in authenticator.
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AuthConfig {
    pub tokens: HashMap<String, Principal>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when RUST_LOG is unset
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

/// Upper bound on `RouteConfig::retries`.
pub const MAX_ROUTE_RETRIES: u32 = 10;

fn default_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

/// One entry of the route table. Routes match on the longest path prefix.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct RouteConfig {
    /// Path prefix, e.g. "/api/orders"
    pub path: String,
    /// Logical service name resolved through the registry
    pub target: String,
    /// Allowed methods; empty means any
    #[serde(default)]
    pub methods: Vec<String>,
    #[serde(default)]
    pub auth_required: bool,
    /// Caller must hold at least one of these roles
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub rate_limit: RouteRateLimit,
    #[serde(default = "default_true")]
    pub circuit_breaker: bool,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Extra attempts after the first one; only used by idempotent routes
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub idempotent: bool,
    #[serde(default)]
    pub load_balancer: Option<LoadBalanceAlgorithm>,
    /// Remove the matched prefix before forwarding
    #[serde(default)]
    pub strip_prefix: bool,
    /// Largest request body buffered for forwarding; bigger bodies get 413
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl RouteConfig {
    pub fn new(path: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            target: target.into(),
            methods: Vec::new(),
            auth_required: false,
            roles: Vec::new(),
            rate_limit: RouteRateLimit::default(),
            circuit_breaker: true,
            timeout_ms: default_timeout_ms(),
            retries: 0,
            idempotent: false,
            load_balancer: None,
            strip_prefix: false,
            max_body_bytes: default_max_body_bytes(),
        }
    }

    pub fn methods(mut self, methods: &[&str]) -> Self {
        self.methods = methods.iter().map(|m| m.to_ascii_uppercase()).collect();
        self
    }

    /// Require authentication, optionally restricted to some roles
    pub fn require_auth(mut self, roles: &[&str]) -> Self {
        self.auth_required = true;
        self.roles = roles.iter().map(|r| r.to_string()).collect();
        self
    }

    pub fn timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    /// Mark the route idempotent and allow `retries` extra attempts
    pub fn idempotent(mut self, retries: u32) -> Self {
        self.idempotent = true;
        self.retries = retries;
        self
    }

    pub fn tier(mut self, tier: RateLimitTier) -> Self {
        self.rate_limit.tier = Some(tier);
        self
    }

    pub fn custom_limit(mut self, max_requests: u64, window_ms: u64) -> Self {
        self.rate_limit.custom = Some(CustomLimit {
            max_requests,
            window_ms,
            refill_per_sec: None,
        });
        self
    }

    pub fn algorithm(mut self, algorithm: RateLimitAlgorithm) -> Self {
        self.rate_limit.algorithm = Some(algorithm);
        self
    }

    pub fn without_rate_limit(mut self) -> Self {
        self.rate_limit.enabled = false;
        self
    }

    pub fn without_circuit_breaker(mut self) -> Self {
        self.circuit_breaker = false;
        self
    }

    pub fn load_balancer(mut self, algorithm: LoadBalanceAlgorithm) -> Self {
        self.load_balancer = Some(algorithm);
        self
    }

    pub fn strip_prefix(mut self) -> Self {
        self.strip_prefix = true;
        self
    }
}

/// Per-route rate limit settings.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RouteRateLimit {
    pub enabled: bool,
    /// Replaces the tier derived from the caller's roles
    pub tier: Option<RateLimitTier>,
    /// Overrides tier lookup entirely
    pub custom: Option<CustomLimit>,
    pub algorithm: Option<RateLimitAlgorithm>,
}

impl Default for RouteRateLimit {
    fn default() -> Self {
        Self {
            enabled: true,
            tier: None,
            custom: None,
            algorithm: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct CustomLimit {
    pub max_requests: u64,
    pub window_ms: u64,
    /// Token bucket refill rate; defaults to max_requests spread over the window
    #[serde(default)]
    pub refill_per_sec: Option<f64>,
}

/// Named rate-limit classes.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitTier {
    #[default]
    Anonymous,
    Registered,
    Vendor,
    Premium,
    Admin,
}

impl RateLimitTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitTier::Anonymous => "anonymous",
            RateLimitTier::Registered => "registered",
            RateLimitTier::Vendor => "vendor",
            RateLimitTier::Premium => "premium",
            RateLimitTier::Admin => "admin",
        }
    }
}

impl fmt::Display for RateLimitTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Algorithm used to enforce the quota semantics.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    #[default]
    FixedWindow,
    SlidingWindow,
    TokenBucket,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub struct TierLimit {
    pub max_requests: u64,
    pub window_ms: u64,
}

impl TierLimit {
    pub const fn per_minute(max_requests: u64) -> Self {
        Self {
            max_requests,
            window_ms: 60_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TierLimits {
    pub anonymous: TierLimit,
    pub registered: TierLimit,
    pub vendor: TierLimit,
    pub premium: TierLimit,
    pub admin: TierLimit,
}

impl TierLimits {
    pub fn get(&self, tier: RateLimitTier) -> TierLimit {
        match tier {
            RateLimitTier::Anonymous => self.anonymous,
            RateLimitTier::Registered => self.registered,
            RateLimitTier::Vendor => self.vendor,
            RateLimitTier::Premium => self.premium,
            RateLimitTier::Admin => self.admin,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (RateLimitTier, TierLimit)> + '_ {
        [
            RateLimitTier::Anonymous,
            RateLimitTier::Registered,
            RateLimitTier::Vendor,
            RateLimitTier::Premium,
            RateLimitTier::Admin,
        ]
        .into_iter()
        .map(|tier| (tier, self.get(tier)))
    }
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            anonymous: TierLimit::per_minute(60),
            registered: TierLimit::per_minute(300),
            vendor: TierLimit::per_minute(1_000),
            premium: TierLimit::per_minute(3_000),
            admin: TierLimit::per_minute(10_000),
        }
    }
}

/// Requests that bypass rate limiting entirely.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct SkipRules {
    pub health_paths: Vec<String>,
    /// Header carrying `true` for service-to-service calls
    pub internal_header: String,
    /// When set, internal calls must also present this value in `x-internal-token`
    pub internal_token: Option<String>,
    pub skip_admin: bool,
    /// User-agent substrings of monitoring agents (case-insensitive)
    pub monitoring_agents: Vec<String>,
}

impl Default for SkipRules {
    fn default() -> Self {
        Self {
            health_paths: vec![
                "/health".to_string(),
                "/healthz".to_string(),
                "/ready".to_string(),
            ],
            internal_header: "x-internal-service".to_string(),
            internal_token: None,
            skip_admin: true,
            monitoring_agents: vec![
                "kube-probe".to_string(),
                "prometheus".to_string(),
                "uptimerobot".to_string(),
                "pingdom".to_string(),
            ],
        }
    }
}

/// Time-boxed multiplier, e.g. a launch-week allowance bump.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Promotion {
    pub name: String,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub multiplier: f64,
    /// Tiers the promotion applies to; empty means all
    #[serde(default)]
    pub tiers: Vec<RateLimitTier>,
}

/// Multipliers applied on top of the tier limit.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(default)]
pub struct ContextualLimits {
    /// ISO country code (upper case) -> factor
    pub country: HashMap<String, f64>,
    /// Device class (mobile, tablet, desktop, bot) -> factor
    pub device: HashMap<String, f64>,
    pub promotions: Vec<Promotion>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RateLimitSettings {
    pub enabled: bool,
    pub default_algorithm: RateLimitAlgorithm,
    pub tiers: TierLimits,
    pub skip: SkipRules,
    pub context: ContextualLimits,
    /// How often idle buckets are swept, e.g. "60s"
    pub purge_interval: String,
}

impl RateLimitSettings {
    pub fn purge_interval(&self) -> Result<Duration, humantime::DurationError> {
        humantime::parse_duration(&self.purge_interval)
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            default_algorithm: RateLimitAlgorithm::default(),
            tiers: TierLimits::default(),
            skip: SkipRules::default(),
            context: ContextualLimits::default(),
            purge_interval: "60s".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub interval_secs: u64,
    pub timeout_ms: u64,
    /// Maximum probes in flight at once
    pub concurrency: usize,
    pub healthy_threshold: u32,
    pub unhealthy_threshold: u32,
    /// Remove an instance after this many consecutive failed probes
    pub evict_after_failures: Option<u32>,
    /// Health records retained per instance by the in-memory store
    pub history_limit: usize,
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            timeout_ms: 5_000,
            concurrency: 16,
            healthy_threshold: 1,
            unhealthy_threshold: 1,
            evict_after_failures: None,
            history_limit: 1_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_webhook_timeout_ms() -> u64 {
    5_000
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AlertConfig {
    /// Minimum gap between two alerts of one kind for one service, e.g. "5m"
    pub cooldown: String,
    /// Consecutive all-down ticks before `service_down`
    pub failure_window: usize,
    /// Ticks averaged for `high_latency`
    pub latency_window: usize,
    pub latency_threshold_ms: u64,
    pub max_handlers: usize,
    pub webhooks: Vec<WebhookConfig>,
}

impl AlertConfig {
    pub fn cooldown(&self) -> Result<Duration, humantime::DurationError> {
        humantime::parse_duration(&self.cooldown)
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            cooldown: "5m".to_string(),
            failure_window: 3,
            latency_window: 5,
            latency_threshold_ms: 2_000,
            max_handlers: 16,
            webhooks: Vec::new(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub threshold: u32,
    /// How long the circuit stays open before a trial request
    pub timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            threshold: 5,
            timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalanceAlgorithm {
    #[default]
    RoundRobin,
    LeastConnections,
    WeightedRoundRobin,
    IpHash,
}

impl fmt::Display for LoadBalanceAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadBalanceAlgorithm::RoundRobin => write!(f, "round_robin"),
            LoadBalanceAlgorithm::LeastConnections => write!(f, "least_connections"),
            LoadBalanceAlgorithm::WeightedRoundRobin => write!(f, "weighted_round_robin"),
            LoadBalanceAlgorithm::IpHash => write!(f, "ip_hash"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    #[serde(rename = "healthy")]
    Healthy,
    #[serde(rename = "unhealthy")]
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}
