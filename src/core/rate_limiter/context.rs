//! Contextual limit scaling by country, device class and time-boxed promotions.
use chrono::{DateTime, Utc};
use http::{HeaderMap, header::USER_AGENT};

use crate::{
    config::{ContextualLimits, RateLimitTier},
    core::rate_limiter::identity::DeviceClass,
};

const COUNTRY_HEADERS: &[&str] = &["cf-ipcountry", "x-country-code"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Upper-case ISO country code when an edge proxy supplied one
    pub country: Option<String>,
    pub device: DeviceClass,
}

impl RequestContext {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let country = COUNTRY_HEADERS
            .iter()
            .filter_map(|name| headers.get(*name))
            .filter_map(|v| v.to_str().ok())
            .map(|v| v.trim().to_ascii_uppercase())
            .find(|v| !v.is_empty());
        let device =
            DeviceClass::from_user_agent(headers.get(USER_AGENT).and_then(|v| v.to_str().ok()));
        Self { country, device }
    }
}

/// Product of every factor that applies to this request at `at`.
pub fn contextual_multiplier(
    limits: &ContextualLimits,
    context: &RequestContext,
    tier: RateLimitTier,
    at: DateTime<Utc>,
) -> f64 {
    let mut multiplier = 1.0;

    if let Some(country) = &context.country {
        if let Some((_, factor)) = limits
            .country
            .iter()
            .find(|(code, _)| code.eq_ignore_ascii_case(country))
        {
            multiplier *= factor;
        }
    }

    if let Some((_, factor)) = limits
        .device
        .iter()
        .find(|(class, _)| class.eq_ignore_ascii_case(context.device.as_str()))
    {
        multiplier *= factor;
    }

    for promotion in &limits.promotions {
        let active = promotion.starts_at <= at && at < promotion.ends_at;
        let applies = promotion.tiers.is_empty() || promotion.tiers.contains(&tier);
        if active && applies {
            multiplier *= promotion.multiplier;
        }
    }

    multiplier
}

/// `max(1, floor(max_requests * multiplier))`
pub fn scale_limit(max_requests: u64, multiplier: f64) -> u64 {
    let scaled = (max_requests as f64 * multiplier).floor();
    if scaled.is_finite() && scaled >= 1.0 {
        scaled as u64
    } else {
        1
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;
    use http::HeaderValue;

    use super::*;
    use crate::config::Promotion;

    fn limits() -> ContextualLimits {
        let now = Utc::now();
        ContextualLimits {
            country: [("NG".to_string(), 0.5)].into_iter().collect(),
            device: [("mobile".to_string(), 2.0)].into_iter().collect(),
            promotions: vec![Promotion {
                name: "launch".to_string(),
                starts_at: now - Duration::hours(1),
                ends_at: now + Duration::hours(1),
                multiplier: 3.0,
                tiers: vec![RateLimitTier::Premium],
            }],
        }
    }

    #[test]
    fn factors_multiply() {
        let context = RequestContext {
            country: Some("NG".to_string()),
            device: DeviceClass::Mobile,
        };
        let now = Utc::now();
        assert_eq!(
            contextual_multiplier(&limits(), &context, RateLimitTier::Anonymous, now),
            1.0
        );
        assert_eq!(
            contextual_multiplier(&limits(), &context, RateLimitTier::Premium, now),
            3.0
        );
    }

    #[test]
    fn promotion_outside_its_window_is_ignored() {
        let context = RequestContext {
            country: None,
            device: DeviceClass::Desktop,
        };
        let later = Utc::now() + Duration::hours(2);
        assert_eq!(
            contextual_multiplier(&limits(), &context, RateLimitTier::Premium, later),
            1.0
        );
    }

    #[test]
    fn context_from_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("cf-ipcountry", HeaderValue::from_static("ng"));
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static("Mozilla/5.0 (Linux; Android 14) Mobile"),
        );
        let context = RequestContext::from_headers(&headers);
        assert_eq!(context.country.as_deref(), Some("NG"));
        assert_eq!(context.device, DeviceClass::Mobile);
    }

    #[test]
    fn scaled_limit_never_drops_below_one() {
        assert_eq!(scale_limit(60, 0.5), 30);
        assert_eq!(scale_limit(5, 0.1), 1);
        assert_eq!(scale_limit(7, 1.5), 10);
        assert_eq!(scale_limit(10, 0.0), 1);
    }
}
