//! Per-service circuit breaker.
//!
//! Each breaker is a single `AtomicU64` holding the state, the consecutive
//! failure count and a millisecond timestamp:
//!
//! ```text
//!  63..62   61..42        41..0
//!  state    failures      next_attempt_at (OPEN) / trial_started_at (HALF_OPEN)
//! ```
//!
//! Every transition is one compare-and-set on that word, so the OPEN -> HALF_OPEN
//! flip can be won by exactly one caller, which becomes the trial holder.
use std::sync::{
    Arc,
    atomic::{AtomicU64, AtomicUsize, Ordering},
};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::{
    config::CircuitBreakerConfig,
    ports::clock::{Clock, millis_to_utc},
};

const STATE_SHIFT: u32 = 62;
const FAILURE_SHIFT: u32 = 42;
const FAILURE_MASK: u64 = (1 << 20) - 1;
const TIME_MASK: u64 = (1 << FAILURE_SHIFT) - 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_bits(bits: u64) -> Self {
        match bits {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }

    fn bits(self) -> u64 {
        match self {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        }
    }

    fn is_closed(self) -> bool {
        self == CircuitState::Closed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Word {
    state: CircuitState,
    failures: u32,
    at_ms: u64,
}

impl Word {
    const CLOSED: Word = Word {
        state: CircuitState::Closed,
        failures: 0,
        at_ms: 0,
    };

    fn decode(raw: u64) -> Self {
        Self {
            state: CircuitState::from_bits(raw >> STATE_SHIFT),
            failures: ((raw >> FAILURE_SHIFT) & FAILURE_MASK) as u32,
            at_ms: raw & TIME_MASK,
        }
    }

    fn encode(self) -> u64 {
        (self.state.bits() << STATE_SHIFT)
            | ((u64::from(self.failures) & FAILURE_MASK) << FAILURE_SHIFT)
            | (self.at_ms & TIME_MASK)
    }
}

#[derive(Debug, Default)]
struct Breaker {
    word: AtomicU64,
}

impl Breaker {
    fn load(&self) -> Word {
        Word::decode(self.word.load(Ordering::Acquire))
    }

    fn swap(&self, current: Word, next: Word) -> bool {
        self.word
            .compare_exchange(
                current.encode(),
                next.encode(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }
}

/// How a request got past the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerAdmission {
    /// Circuit closed (or never failed)
    Closed,
    /// This request is the single HALF_OPEN trial
    Trial,
}

/// Admin view of one breaker.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerStatus {
    pub service: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub threshold: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
}

pub struct CircuitBreakerRegistry {
    breakers: scc::HashMap<String, Arc<Breaker>>,
    threshold: u32,
    timeout_ms: u64,
    clock: Arc<dyn Clock>,
    not_closed: AtomicUsize,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            breakers: scc::HashMap::new(),
            threshold: config.threshold.max(1),
            timeout_ms: config.timeout_ms,
            clock,
            not_closed: AtomicUsize::new(0),
        }
    }

    fn now(&self) -> u64 {
        self.clock.now_millis() & TIME_MASK
    }

    async fn lookup(&self, service: &str) -> Option<Arc<Breaker>> {
        self.breakers
            .read_async(service, |_, breaker| breaker.clone())
            .await
    }

    /// Decide whether a request to `service` may proceed.
    pub async fn admit(&self, service: &str) -> Option<BreakerAdmission> {
        let Some(breaker) = self.lookup(service).await else {
            return Some(BreakerAdmission::Closed);
        };

        loop {
            let current = breaker.load();
            let now = self.now();
            match current.state {
                CircuitState::Closed => return Some(BreakerAdmission::Closed),
                CircuitState::Open => {
                    if now < current.at_ms {
                        return None;
                    }
                }
                CircuitState::HalfOpen => {
                    // a trial that never reported back is replaced after one timeout
                    if now < current.at_ms.saturating_add(self.timeout_ms) {
                        return None;
                    }
                }
            }

            let trial = Word {
                state: CircuitState::HalfOpen,
                failures: current.failures,
                at_ms: now,
            };
            if breaker.swap(current, trial) {
                tracing::info!(service = %service, "Circuit breaker half-open, admitting trial request");
                return Some(BreakerAdmission::Trial);
            }
        }
    }

    /// `true` when a request to `service` may proceed.
    pub async fn allow_request(&self, service: &str) -> bool {
        self.admit(service).await.is_some()
    }

    /// Report the outcome of a call to `service`.
    pub async fn record_result(&self, service: &str, success: bool) {
        if success {
            self.record_success(service).await;
        } else {
            self.record_failure(service).await;
        }
    }

    async fn record_success(&self, service: &str) {
        let Some(breaker) = self.lookup(service).await else {
            return;
        };

        loop {
            let current = breaker.load();
            let next = match current.state {
                CircuitState::Closed if current.failures == 0 => return,
                CircuitState::Closed | CircuitState::HalfOpen => Word::CLOSED,
                // a straggler finishing after the circuit opened does not close it
                CircuitState::Open => return,
            };
            if breaker.swap(current, next) {
                if current.state == CircuitState::HalfOpen {
                    self.not_closed.fetch_sub(1, Ordering::AcqRel);
                    tracing::info!(service = %service, "Circuit breaker closed after successful trial");
                }
                return;
            }
        }
    }

    async fn record_failure(&self, service: &str) {
        let breaker = self
            .breakers
            .entry_async(service.to_string())
            .await
            .or_insert_with(|| Arc::new(Breaker::default()))
            .get()
            .clone();

        loop {
            let current = breaker.load();
            let now = self.now();
            let failures = current.failures.saturating_add(1).min(FAILURE_MASK as u32);
            let open = Word {
                state: CircuitState::Open,
                failures,
                at_ms: now.saturating_add(self.timeout_ms) & TIME_MASK,
            };
            let next = match current.state {
                CircuitState::Closed if failures >= self.threshold => open,
                CircuitState::Closed => Word {
                    failures,
                    ..current
                },
                CircuitState::HalfOpen => open,
                CircuitState::Open => Word {
                    failures,
                    ..current
                },
            };
            if breaker.swap(current, next) {
                match (current.state, next.state) {
                    (CircuitState::Closed, CircuitState::Open) => {
                        self.not_closed.fetch_add(1, Ordering::AcqRel);
                        tracing::warn!(
                            service = %service,
                            failures,
                            timeout_ms = self.timeout_ms,
                            "Circuit breaker opened"
                        );
                    }
                    (CircuitState::HalfOpen, CircuitState::Open) => {
                        tracing::warn!(service = %service, "Trial request failed, circuit breaker re-opened");
                    }
                    _ => {}
                }
                return;
            }
        }
    }

    pub async fn status(&self, service: &str) -> Option<BreakerStatus> {
        let breaker = self.lookup(service).await?;
        Some(self.describe(service, breaker.load()))
    }

    /// Every breaker that has observed a failure, sorted by service.
    pub async fn snapshot(&self) -> Vec<BreakerStatus> {
        let mut statuses = Vec::new();
        self.breakers
            .retain_async(|service, breaker| {
                statuses.push(self.describe(service, breaker.load()));
                true
            })
            .await;
        statuses.sort_by(|a, b| a.service.cmp(&b.service));
        statuses
    }

    /// Force a breaker back to CLOSED. Returns `false` when it had no state.
    pub async fn reset(&self, service: &str) -> bool {
        let Some(breaker) = self.lookup(service).await else {
            return false;
        };
        let previous = Word::decode(breaker.word.swap(Word::CLOSED.encode(), Ordering::AcqRel));
        if !previous.state.is_closed() {
            self.not_closed.fetch_sub(1, Ordering::AcqRel);
        }
        tracing::info!(service = %service, "Circuit breaker reset");
        true
    }

    /// Breakers currently OPEN or HALF_OPEN.
    pub fn open_count(&self) -> usize {
        self.not_closed.load(Ordering::Acquire)
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    fn describe(&self, service: &str, word: Word) -> BreakerStatus {
        BreakerStatus {
            service: service.to_string(),
            state: word.state,
            failure_count: word.failures,
            threshold: self.threshold,
            next_attempt_at: match word.state {
                CircuitState::Open => Some(millis_to_utc(word.at_ms)),
                CircuitState::HalfOpen => {
                    Some(millis_to_utc(word.at_ms.saturating_add(self.timeout_ms)))
                }
                CircuitState::Closed => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::Barrier;

    use super::*;
    use crate::ports::clock::ManualClock;

    const START: u64 = 1_700_000_000_000;

    fn breakers() -> (Arc<CircuitBreakerRegistry>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        let registry = CircuitBreakerRegistry::new(
            CircuitBreakerConfig {
                threshold: 3,
                timeout_ms: 1_000,
            },
            clock.clone(),
        );
        (Arc::new(registry), clock)
    }

    async fn fail(registry: &CircuitBreakerRegistry, service: &str, times: usize) {
        for _ in 0..times {
            registry.record_result(service, false).await;
        }
    }

    #[test]
    fn word_layout_round_trips() {
        let word = Word {
            state: CircuitState::HalfOpen,
            failures: 17,
            at_ms: START,
        };
        assert_eq!(Word::decode(word.encode()), word);
    }

    #[tokio::test]
    async fn unknown_service_is_admitted_without_state() {
        let (registry, _) = breakers();
        assert!(registry.allow_request("orders").await);
        registry.record_result("orders", true).await;
        assert!(registry.status("orders").await.is_none());
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn threshold_timeout_and_trial_lifecycle() {
        let (registry, clock) = breakers();

        fail(&registry, "orders", 2).await;
        assert!(registry.allow_request("orders").await);
        fail(&registry, "orders", 1).await;

        let status = registry.status("orders").await.unwrap();
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(status.failure_count, 3);
        assert_eq!(registry.open_count(), 1);
        assert!(!registry.allow_request("orders").await);

        clock.advance(999);
        assert!(!registry.allow_request("orders").await);

        clock.advance(1);
        assert_eq!(
            registry.admit("orders").await,
            Some(BreakerAdmission::Trial)
        );
        assert_eq!(
            registry.status("orders").await.unwrap().state,
            CircuitState::HalfOpen
        );
        assert!(!registry.allow_request("orders").await);

        registry.record_result("orders", true).await;
        let status = registry.status("orders").await.unwrap();
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.failure_count, 0);
        assert_eq!(registry.open_count(), 0);
        assert_eq!(registry.admit("orders").await, Some(BreakerAdmission::Closed));
    }

    #[tokio::test]
    async fn failed_trial_reopens_for_another_timeout() {
        let (registry, clock) = breakers();
        fail(&registry, "orders", 3).await;
        clock.advance(1_000);
        assert!(registry.allow_request("orders").await);

        registry.record_result("orders", false).await;
        let status = registry.status("orders").await.unwrap();
        assert_eq!(status.state, CircuitState::Open);
        assert_eq!(
            status.next_attempt_at.unwrap().timestamp_millis() as u64,
            START + 2_000
        );
        assert!(!registry.allow_request("orders").await);
        assert_eq!(registry.open_count(), 1);
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let (registry, _) = breakers();
        fail(&registry, "orders", 2).await;
        registry.record_result("orders", true).await;
        fail(&registry, "orders", 2).await;
        assert_eq!(
            registry.status("orders").await.unwrap().state,
            CircuitState::Closed
        );
    }

    #[tokio::test]
    async fn abandoned_trial_is_reissued_after_timeout() {
        let (registry, clock) = breakers();
        fail(&registry, "orders", 3).await;
        clock.advance(1_000);
        assert!(registry.allow_request("orders").await);
        clock.advance(500);
        assert!(!registry.allow_request("orders").await);
        clock.advance(500);
        assert!(registry.allow_request("orders").await);
    }

    #[tokio::test]
    async fn breakers_are_independent_per_service() {
        let (registry, _) = breakers();
        fail(&registry, "orders", 3).await;
        assert!(!registry.allow_request("orders").await);
        assert!(registry.allow_request("users").await);
    }

    #[tokio::test]
    async fn reset_closes_circuit() {
        let (registry, _) = breakers();
        fail(&registry, "orders", 3).await;
        assert!(registry.reset("orders").await);
        assert!(registry.allow_request("orders").await);
        assert_eq!(registry.open_count(), 0);
        assert!(!registry.reset("unknown").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn exactly_one_trial_under_contention() {
        let (registry, clock) = breakers();
        fail(&registry, "orders", 3).await;
        clock.advance(1_000);

        let tasks = 32;
        let barrier = Arc::new(Barrier::new(tasks));
        let mut handles = Vec::new();
        for _ in 0..tasks {
            let registry = registry.clone();
            let barrier = barrier.clone();
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                registry.allow_request("orders").await
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }
}
