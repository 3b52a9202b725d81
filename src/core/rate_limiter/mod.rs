//! Multi-tier rate limiting.
//!
//! [`RateLimiter::check`] resolves who is calling, which tier and limit apply,
//! and counts the request against a bucket held by the injected
//! [`RateLimitStore`]. Settings sit behind an `ArcSwap` so a config reload
//! swaps them without touching bucket state.
pub mod algorithms;
pub mod context;
pub mod identity;

use std::{net::IpAddr, sync::Arc};

use arc_swap::ArcSwap;
use http::{HeaderMap, header::USER_AGENT};

use self::{
    algorithms::{Admission, LimitRule},
    context::{RequestContext, contextual_multiplier, scale_limit},
    identity::{Identity, resolve_identity, tier_for},
};
use crate::{
    config::{RateLimitSettings, RateLimitTier, RouteConfig},
    core::error::GatewayError,
    metrics,
    ports::{
        audit::{RateLimitViolation, ViolationSink},
        authenticator::Principal,
        clock::Clock,
        rate_limit_store::RateLimitStore,
    },
};

/// Everything the limiter looks at for one request.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitRequest<'a> {
    pub route: &'a RouteConfig,
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    pub principal: Option<&'a Principal>,
    pub peer: Option<IpAddr>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    HealthCheck,
    InternalService,
    Admin,
    Monitoring,
    /// The store failed; the request is let through
    StoreUnavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    Skipped(SkipReason),
    Allowed(Admission),
}

pub struct RateLimiter {
    settings: ArcSwap<RateLimitSettings>,
    store: Arc<dyn RateLimitStore>,
    clock: Arc<dyn Clock>,
    violations: Arc<dyn ViolationSink>,
}

impl RateLimiter {
    pub fn new(
        settings: RateLimitSettings,
        store: Arc<dyn RateLimitStore>,
        clock: Arc<dyn Clock>,
        violations: Arc<dyn ViolationSink>,
    ) -> Self {
        Self {
            settings: ArcSwap::from_pointee(settings),
            store,
            clock,
            violations,
        }
    }

    pub fn settings(&self) -> Arc<RateLimitSettings> {
        self.settings.load_full()
    }

    /// Swap in new settings; existing buckets are kept.
    pub fn update_settings(&self, settings: RateLimitSettings) {
        self.settings.store(Arc::new(settings));
        tracing::info!("Rate limit settings updated");
    }

    /// Count the request, or reject it with `RateLimited`.
    pub async fn check(
        &self,
        request: RateLimitRequest<'_>,
    ) -> Result<RateLimitDecision, GatewayError> {
        let settings = self.settings.load();

        if !settings.enabled || !request.route.rate_limit.enabled {
            return Ok(RateLimitDecision::Skipped(SkipReason::Disabled));
        }
        if let Some(reason) = skip_reason(&settings, &request) {
            tracing::trace!(?reason, path = %request.path, "Rate limiting skipped");
            return Ok(RateLimitDecision::Skipped(reason));
        }

        let identity = resolve_identity(request.principal, request.headers, request.peer);
        let tier = request
            .route
            .rate_limit
            .tier
            .unwrap_or_else(|| tier_for(request.principal));
        let (rule, tier_label) = self.rule_for(&settings, &request, tier);
        let key = bucket_key(&identity, &request.route.path, tier_label, rule.window_ms);

        let now = self.clock.now_millis();
        let admission = match self.store.acquire(&key, &rule, now).await {
            Ok(admission) => admission,
            Err(e) => {
                tracing::warn!(error = %e, key = %key, "Rate limit store failed, allowing request");
                return Ok(RateLimitDecision::Skipped(SkipReason::StoreUnavailable));
            }
        };

        if admission.allowed {
            return Ok(RateLimitDecision::Allowed(admission));
        }

        let retry_after_secs = admission.retry_after_secs();
        let violation = RateLimitViolation {
            identity: identity.to_string(),
            tier,
            route: request.route.path.clone(),
            limit: rule.max_requests,
            window_ms: rule.window_ms,
            retry_after_secs,
            occurred_at: self.clock.now_utc(),
        };
        self.violations.record_violation(&violation);
        metrics::record_rate_limit_violation(tier);

        Err(GatewayError::RateLimited { retry_after_secs })
    }

    fn rule_for(
        &self,
        settings: &RateLimitSettings,
        request: &RateLimitRequest<'_>,
        tier: RateLimitTier,
    ) -> (LimitRule, &'static str) {
        let algorithm = request
            .route
            .rate_limit
            .algorithm
            .unwrap_or(settings.default_algorithm);

        if let Some(custom) = &request.route.rate_limit.custom {
            let mut rule = LimitRule::new(custom.max_requests, custom.window_ms, algorithm);
            rule.refill_per_sec = custom.refill_per_sec;
            return (rule, "custom");
        }

        let limit = settings.tiers.get(tier);
        let context = RequestContext::from_headers(request.headers);
        let multiplier =
            contextual_multiplier(&settings.context, &context, tier, self.clock.now_utc());
        let max_requests = scale_limit(limit.max_requests, multiplier);
        (
            LimitRule::new(max_requests, limit.window_ms, algorithm),
            tier.as_str(),
        )
    }

    /// Drop idle buckets. Returns the number removed.
    pub async fn purge_expired(&self) -> usize {
        let purged = self.store.purge_expired(self.clock.now_millis()).await;
        if purged > 0 {
            tracing::debug!(purged, remaining = self.store.bucket_count(), "Purged idle rate limit buckets");
        }
        purged
    }

    pub fn bucket_count(&self) -> usize {
        self.store.bucket_count()
    }
}

fn bucket_key(identity: &Identity, route: &str, tier: &str, window_ms: u64) -> String {
    format!("{identity}|{route}|{tier}|{window_ms}")
}

fn skip_reason(settings: &RateLimitSettings, request: &RateLimitRequest<'_>) -> Option<SkipReason> {
    let skip = &settings.skip;

    let is_health_path = skip.health_paths.iter().any(|p| {
        request.path == p
            || request
                .path
                .strip_prefix(p.as_str())
                .is_some_and(|rest| rest.starts_with('/'))
    });
    if is_health_path {
        return Some(SkipReason::HealthCheck);
    }

    let internal = request
        .headers
        .get(skip.internal_header.as_str())
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));
    if internal {
        let token_ok = match &skip.internal_token {
            None => true,
            Some(expected) => request
                .headers
                .get("x-internal-token")
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v == expected),
        };
        if token_ok {
            return Some(SkipReason::InternalService);
        }
    }

    if skip.skip_admin && request.principal.is_some_and(|p| p.has_role("admin")) {
        return Some(SkipReason::Admin);
    }

    let user_agent = request
        .headers
        .get(USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_ascii_lowercase);
    if let Some(ua) = user_agent {
        if skip
            .monitoring_agents
            .iter()
            .any(|agent| ua.contains(&agent.to_ascii_lowercase()))
        {
            return Some(SkipReason::Monitoring);
        }
    }

    None
}
