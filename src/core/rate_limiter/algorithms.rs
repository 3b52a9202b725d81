//! Window algorithms. State is plain data ([`WindowState`]) so any store can
//! keep it; the behaviour lives behind [`WindowAlgorithm`].
use std::collections::VecDeque;

use crate::config::RateLimitAlgorithm;

/// Effective limit applied to one bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitRule {
    pub max_requests: u64,
    pub window_ms: u64,
    pub algorithm: RateLimitAlgorithm,
    /// Token bucket only; defaults to `max_requests` spread across the window
    pub refill_per_sec: Option<f64>,
}

impl LimitRule {
    pub fn new(max_requests: u64, window_ms: u64, algorithm: RateLimitAlgorithm) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window_ms: window_ms.max(1),
            algorithm,
            refill_per_sec: None,
        }
    }

    fn refill_per_ms(&self) -> f64 {
        match self.refill_per_sec {
            Some(rate) if rate > 0.0 => rate / 1_000.0,
            _ => self.max_requests as f64 / self.window_ms as f64,
        }
    }
}

/// Decision for one request against one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Milliseconds until the bucket has room again (denied) or fully resets (allowed)
    pub reset_after_ms: u64,
}

impl Admission {
    /// Whole seconds a rejected caller should wait, never less than one.
    pub fn retry_after_secs(&self) -> u64 {
        self.reset_after_ms.div_ceil(1_000).max(1)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WindowState {
    Fixed { window_start: u64, count: u64 },
    Sliding { hits: VecDeque<u64> },
    TokenBucket { tokens: f64, last_refill: u64 },
}

pub trait WindowAlgorithm: Send + Sync {
    fn initial(&self, rule: &LimitRule, now: u64) -> WindowState;

    /// Count one request. `state` is always of this algorithm's variant.
    fn acquire(&self, state: &mut WindowState, rule: &LimitRule, now: u64) -> Admission;

    /// `true` once the state carries no information (safe to drop).
    fn is_idle(&self, state: &WindowState, rule: &LimitRule, now: u64) -> bool;
}

pub struct FixedWindow;
pub struct SlidingWindow;
pub struct TokenBucket;

static FIXED: FixedWindow = FixedWindow;
static SLIDING: SlidingWindow = SlidingWindow;
static TOKEN_BUCKET: TokenBucket = TokenBucket;

pub fn algorithm_for(kind: RateLimitAlgorithm) -> &'static dyn WindowAlgorithm {
    match kind {
        RateLimitAlgorithm::FixedWindow => &FIXED,
        RateLimitAlgorithm::SlidingWindow => &SLIDING,
        RateLimitAlgorithm::TokenBucket => &TOKEN_BUCKET,
    }
}

fn matches_algorithm(state: &WindowState, kind: RateLimitAlgorithm) -> bool {
    matches!(
        (state, kind),
        (WindowState::Fixed { .. }, RateLimitAlgorithm::FixedWindow)
            | (WindowState::Sliding { .. }, RateLimitAlgorithm::SlidingWindow)
            | (WindowState::TokenBucket { .. }, RateLimitAlgorithm::TokenBucket)
    )
}

/// Apply `rule` to `state`, resetting the state first if the rule's algorithm changed.
pub fn acquire(state: &mut WindowState, rule: &LimitRule, now: u64) -> Admission {
    let algorithm = algorithm_for(rule.algorithm);
    if !matches_algorithm(state, rule.algorithm) {
        *state = algorithm.initial(rule, now);
    }
    algorithm.acquire(state, rule, now)
}

pub fn is_idle(state: &WindowState, rule: &LimitRule, now: u64) -> bool {
    !matches_algorithm(state, rule.algorithm) || algorithm_for(rule.algorithm).is_idle(state, rule, now)
}

impl WindowAlgorithm for FixedWindow {
    fn initial(&self, _rule: &LimitRule, now: u64) -> WindowState {
        WindowState::Fixed {
            window_start: now,
            count: 0,
        }
    }

    fn acquire(&self, state: &mut WindowState, rule: &LimitRule, now: u64) -> Admission {
        let WindowState::Fixed {
            window_start,
            count,
        } = state
        else {
            return deny_all(rule);
        };

        if now.saturating_sub(*window_start) >= rule.window_ms {
            *window_start = now;
            *count = 0;
        }
        let reset_after_ms = (*window_start + rule.window_ms).saturating_sub(now);

        if *count < rule.max_requests {
            *count += 1;
            Admission {
                allowed: true,
                limit: rule.max_requests,
                remaining: rule.max_requests - *count,
                reset_after_ms,
            }
        } else {
            Admission {
                allowed: false,
                limit: rule.max_requests,
                remaining: 0,
                reset_after_ms,
            }
        }
    }

    fn is_idle(&self, state: &WindowState, rule: &LimitRule, now: u64) -> bool {
        match state {
            WindowState::Fixed { window_start, .. } => {
                now.saturating_sub(*window_start) >= rule.window_ms
            }
            _ => true,
        }
    }
}

impl WindowAlgorithm for SlidingWindow {
    fn initial(&self, _rule: &LimitRule, _now: u64) -> WindowState {
        WindowState::Sliding {
            hits: VecDeque::new(),
        }
    }

    fn acquire(&self, state: &mut WindowState, rule: &LimitRule, now: u64) -> Admission {
        let WindowState::Sliding { hits } = state else {
            return deny_all(rule);
        };

        // hits inside [now - window, now] still count
        let floor = now.saturating_sub(rule.window_ms);
        while hits.front().is_some_and(|t| *t < floor) {
            hits.pop_front();
        }

        let count = hits.len() as u64;
        if count < rule.max_requests {
            hits.push_back(now);
            let oldest = hits.front().copied().unwrap_or(now);
            Admission {
                allowed: true,
                limit: rule.max_requests,
                remaining: rule.max_requests - count - 1,
                reset_after_ms: (oldest + rule.window_ms + 1).saturating_sub(now),
            }
        } else {
            let oldest = hits.front().copied().unwrap_or(now);
            Admission {
                allowed: false,
                limit: rule.max_requests,
                remaining: 0,
                reset_after_ms: (oldest + rule.window_ms + 1).saturating_sub(now),
            }
        }
    }

    fn is_idle(&self, state: &WindowState, rule: &LimitRule, now: u64) -> bool {
        match state {
            WindowState::Sliding { hits } => hits
                .back()
                .is_none_or(|t| *t < now.saturating_sub(rule.window_ms)),
            _ => true,
        }
    }
}

impl WindowAlgorithm for TokenBucket {
    fn initial(&self, rule: &LimitRule, now: u64) -> WindowState {
        WindowState::TokenBucket {
            tokens: rule.max_requests as f64,
            last_refill: now,
        }
    }

    fn acquire(&self, state: &mut WindowState, rule: &LimitRule, now: u64) -> Admission {
        let WindowState::TokenBucket {
            tokens,
            last_refill,
        } = state
        else {
            return deny_all(rule);
        };

        let capacity = rule.max_requests as f64;
        let rate = rule.refill_per_ms();
        let elapsed = now.saturating_sub(*last_refill) as f64;
        *tokens = (*tokens + elapsed * rate).min(capacity);
        *last_refill = now;

        if *tokens + TOKEN_EPSILON >= 1.0 {
            *tokens = (*tokens - 1.0).max(0.0);
            Admission {
                allowed: true,
                limit: rule.max_requests,
                remaining: tokens.floor() as u64,
                reset_after_ms: ((capacity - *tokens) / rate).ceil() as u64,
            }
        } else {
            Admission {
                allowed: false,
                limit: rule.max_requests,
                remaining: 0,
                reset_after_ms: ((1.0 - *tokens) / rate).ceil() as u64,
            }
        }
    }

    fn is_idle(&self, state: &WindowState, rule: &LimitRule, now: u64) -> bool {
        match state {
            WindowState::TokenBucket {
                tokens,
                last_refill,
            } => {
                let elapsed = now.saturating_sub(*last_refill) as f64;
                *tokens + elapsed * rule.refill_per_ms() + TOKEN_EPSILON >= rule.max_requests as f64
            }
            _ => true,
        }
    }
}

/// Absorbs float drift from repeated partial refills.
const TOKEN_EPSILON: f64 = 1e-9;

fn deny_all(rule: &LimitRule) -> Admission {
    Admission {
        allowed: false,
        limit: rule.max_requests,
        remaining: 0,
        reset_after_ms: rule.window_ms,
    }
}
