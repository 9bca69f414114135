//! Circuit breaker (C1): protects every call into an external dependency
//! (profile service, limit-sync endpoints, federation peers) from
//! cascading into the calling worker pool.
//!
//! Three states: closed (calls flow), open (calls rejected until the
//! cooldown elapses), half-open (a bounded number of probe calls are
//! allowed through to decide whether to close or reopen). Unlike a
//! generic breaker tuned for flaky network peers, this one is tuned to
//! trip fast and recover on a single clean probe: a single failed probe
//! sends it straight back to open.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::CircuitConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// A single named breaker. Cheap to poll (`allow`), cheap to update
/// (`record_success`/`record_failure`), safe to share behind an `Arc`.
pub struct CircuitBreaker {
    name: String,
    config: CircuitConfig,
    state: RwLock<CircuitState>,
    consecutive_failures: AtomicU32,
    half_open_probes_in_flight: AtomicU32,
    opened_at: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: RwLock::new(CircuitState::Closed),
            consecutive_failures: AtomicU32::new(0),
            half_open_probes_in_flight: AtomicU32::new(0),
            opened_at: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> CircuitState {
        *self.state.read()
    }

    /// Self-heal: if open and the cooldown has elapsed, move to half-open.
    /// Called both eagerly from `allow` and periodically by the health
    /// tick so a breaker with no traffic still recovers.
    fn maybe_enter_half_open(&self) {
        let mut state = self.state.write();
        if *state == CircuitState::Open {
            let opened_at = self.opened_at.load(Ordering::Acquire);
            if now_secs().saturating_sub(opened_at) >= self.config.open_cooldown_secs {
                *state = CircuitState::HalfOpen;
                self.half_open_probes_in_flight.store(0, Ordering::Release);
                debug!(breaker = %self.name, "circuit half-open after cooldown");
            }
        }
    }

    /// Returns whether a call is allowed through right now. Half-open
    /// admits at most `half_open_probe_limit` concurrent probes.
    pub fn allow(&self) -> bool {
        self.maybe_enter_half_open();
        match *self.state.read() {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                let prior = self
                    .half_open_probes_in_flight
                    .fetch_add(1, Ordering::AcqRel);
                if prior < self.config.half_open_probe_limit {
                    true
                } else {
                    self.half_open_probes_in_flight
                        .fetch_sub(1, Ordering::AcqRel);
                    false
                }
            }
        }
    }

    /// A single success in half-open closes the breaker; in closed it
    /// just resets the failure streak.
    pub fn record_success(&self) {
        let mut state = self.state.write();
        match *state {
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::Release);
            }
            CircuitState::HalfOpen => {
                *state = CircuitState::Closed;
                self.consecutive_failures.store(0, Ordering::Release);
                self.half_open_probes_in_flight.store(0, Ordering::Release);
                debug!(breaker = %self.name, "circuit closed after successful probe");
            }
            CircuitState::Open => {}
        }
    }

    /// A single failure in half-open reopens the breaker. In closed,
    /// `failure_threshold` consecutive failures trips it open.
    pub fn record_failure(&self) {
        let mut state = self.state.write();
        match *state {
            CircuitState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold {
                    self.transition_to_open(&mut state);
                }
            }
            CircuitState::HalfOpen => {
                self.transition_to_open(&mut state);
            }
            CircuitState::Open => {}
        }
    }

    pub fn force_open(&self, reason: &str) {
        let mut state = self.state.write();
        warn!(breaker = %self.name, reason, "circuit forced open");
        self.transition_to_open(&mut state);
    }

    fn transition_to_open(&self, state: &mut CircuitState) {
        *state = CircuitState::Open;
        self.opened_at.store(now_secs(), Ordering::Release);
        self.half_open_probes_in_flight.store(0, Ordering::Release);
        warn!(breaker = %self.name, "circuit opened");
    }

    /// Runs `f`, recording success/failure and rejecting outright with
    /// `Error::CircuitOpen` when the breaker is tripped.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        if !self.allow() {
            return Err(Error::CircuitOpen {
                dependency: self.name.clone(),
            });
        }
        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(err)
            }
        }
    }
}

/// Named registry of breakers, one per external dependency, created
/// lazily on first use.
pub struct CircuitBreakerManager {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: CircuitConfig,
}

impl CircuitBreakerManager {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
        }
    }

    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.config.clone())))
            .clone()
    }

    /// Scans every known breaker and nudges open ones past cooldown into
    /// half-open. Intended to be driven by a periodic health tick so
    /// idle dependencies still recover without waiting for traffic.
    pub fn health_tick(&self) {
        for entry in self.breakers.iter() {
            entry.value().maybe_enter_half_open();
        }
    }

    pub fn states(&self) -> Vec<(String, CircuitState)> {
        self.breakers
            .iter()
            .map(|e| (e.key().clone(), e.value().state()))
            .collect()
    }

    pub fn reset_all(&self) {
        self.breakers.clear();
    }
}

pub async fn sleep_until_cooldown(cooldown: Duration) {
    tokio::time::sleep(cooldown).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> CircuitConfig {
        CircuitConfig {
            failure_threshold: 3,
            open_cooldown_secs: 0,
            half_open_probe_limit: 1,
        }
    }

    #[test]
    fn closed_allows_calls_until_threshold() {
        let cb = CircuitBreaker::new("dep", test_config());
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn open_rejects_until_cooldown_then_half_opens() {
        let cb = CircuitBreaker::new("dep", test_config());
        cb.force_open("test");
        assert!(!cb.allow());
        // cooldown is zero in test config so the next allow() call
        // should observe half-open immediately.
        assert!(cb.allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_closes_on_single_success() {
        let cb = CircuitBreaker::new("dep", test_config());
        cb.force_open("test");
        assert!(cb.allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_reopens_on_single_failure() {
        let cb = CircuitBreaker::new("dep", test_config());
        cb.force_open("test");
        assert!(cb.allow());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn half_open_caps_concurrent_probes() {
        let cb = CircuitBreaker::new("dep", test_config());
        cb.force_open("test");
        assert!(cb.allow());
        // a second concurrent probe beyond half_open_probe_limit=1 is rejected
        assert!(!cb.allow());
    }

    #[tokio::test]
    async fn call_wraps_success_and_failure() {
        let cb = CircuitBreaker::new("dep", test_config());
        let ok: Result<u32> = cb.call(|| async { Ok(7) }).await;
        assert_eq!(ok.unwrap(), 7);

        for _ in 0..3 {
            let _ = cb
                .call(|| async { Err::<u32, _>(Error::Internal("boom".into())) })
                .await;
        }
        assert_eq!(cb.state(), CircuitState::Open);
        let rejected = cb.call(|| async { Ok(1u32) }).await;
        assert!(matches!(rejected, Err(Error::CircuitOpen { .. })));
    }

    #[test]
    fn manager_creates_and_reuses_breakers() {
        let mgr = CircuitBreakerManager::new(test_config());
        let a = mgr.get_or_create("profile-service");
        let b = mgr.get_or_create("profile-service");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(mgr.states().len(), 1);
    }
}
