//! Caller resolution for rate limiting.
use std::{
    fmt,
    hash::{DefaultHasher, Hash, Hasher},
    net::IpAddr,
};

use http::HeaderMap;

use crate::{config::RateLimitTier, ports::authenticator::Principal};

pub const API_KEY_HEADER: &str = "x-api-key";

/// Who a request is counted against, in priority order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identity {
    User(String),
    /// Fingerprint of the API key; the key itself is never kept
    ApiKey(String),
    Ip(IpAddr),
    /// Nothing identifying at all; every such caller shares one bucket
    Anonymous,
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::User(id) => write!(f, "user:{id}"),
            Identity::ApiKey(fingerprint) => write!(f, "key:{fingerprint}"),
            Identity::Ip(ip) => write!(f, "ip:{ip}"),
            Identity::Anonymous => write!(f, "anonymous"),
        }
    }
}

/// Authenticated user id > API key > client IP.
pub fn resolve_identity(
    principal: Option<&Principal>,
    headers: &HeaderMap,
    peer: Option<IpAddr>,
) -> Identity {
    if let Some(principal) = principal {
        return Identity::User(principal.user_id.clone());
    }

    let api_key = headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|k| !k.is_empty());
    if let Some(key) = api_key {
        return Identity::ApiKey(fingerprint(key));
    }

    match client_ip(headers, peer) {
        Some(ip) => Identity::Ip(ip),
        None => Identity::Anonymous,
    }
}

fn fingerprint(key: &str) -> String {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// First hop of `X-Forwarded-For`, then `X-Real-IP`, then the socket peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<IpAddr>) -> Option<IpAddr> {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|ip| ip.trim().parse().ok());
    if forwarded.is_some() {
        return forwarded;
    }

    let real_ip = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .and_then(|ip| ip.trim().parse().ok());
    real_ip.or(peer)
}

/// Tier implied by the caller's roles.
pub fn tier_for(principal: Option<&Principal>) -> RateLimitTier {
    let Some(principal) = principal else {
        return RateLimitTier::Anonymous;
    };
    if principal.has_role("admin") {
        RateLimitTier::Admin
    } else if principal.has_role("premium") {
        RateLimitTier::Premium
    } else if principal.has_role("vendor") {
        RateLimitTier::Vendor
    } else {
        RateLimitTier::Registered
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceClass {
    Mobile,
    Tablet,
    Desktop,
    Bot,
    Unknown,
}

impl DeviceClass {
    pub fn from_user_agent(user_agent: Option<&str>) -> Self {
        let Some(ua) = user_agent.map(str::to_ascii_lowercase) else {
            return DeviceClass::Unknown;
        };
        if ["bot", "crawler", "spider", "curl/", "wget/"]
            .iter()
            .any(|needle| ua.contains(needle))
        {
            DeviceClass::Bot
        } else if ua.contains("ipad") || ua.contains("tablet") {
            DeviceClass::Tablet
        } else if ua.contains("mobile") || ua.contains("iphone") || ua.contains("android") {
            DeviceClass::Mobile
        } else if ua.contains("windows") || ua.contains("macintosh") || ua.contains("linux") {
            DeviceClass::Desktop
        } else {
            DeviceClass::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Mobile => "mobile",
            DeviceClass::Tablet => "tablet",
            DeviceClass::Desktop => "desktop",
            DeviceClass::Bot => "bot",
            DeviceClass::Unknown => "unknown",
        }
    }
}
