//! LRU-with-TTL cache in front of the remote profile service.
//!
//! `get` never fails: a circuit-open or downstream error degrades to a
//! default profile with an empty `sources_used`, which the caller must
//! treat as reduced-confidence input rather than an outage to retry.
//! Uses a DashMap-plus-scan-for-LRU-victim eviction shape, generalized
//! to carry an absolute per-entry TTL and to sit in front of a real
//! network call.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::model::{BehaviorProfile, FraudHistory, ProfileSource, SpendingProfile, UserProfile};
use crate::resilience::circuit_breaker::CircuitBreaker;
use crate::resilience::retry_backoff::{retry_with_backoff, BackoffPolicy};

#[derive(Clone)]
struct CacheEntry {
    value: UserProfile,
    inserted_at: Instant,
    last_accessed: Instant,
}

/// Abstraction over the remote profile service so tests can substitute a
/// fake without standing up HTTP infrastructure.
#[async_trait]
pub trait ProfileFetcher: Send + Sync {
    async fn fetch_profile(&self, user_id: &str) -> Result<UserProfile>;
}

/// Fetches the three sub-profiles (`behavior`, `fraud_history`,
/// `spending`) as independent `GET {svc}/{user_id}/{endpoint}` calls,
/// each retried up to 3 times with exponential backoff. A sub-profile
/// that never succeeds is simply omitted from `sources_used`; the whole
/// call only fails when every endpoint is unreachable, in which case the
/// caller falls back to a fully-default profile.
pub struct HttpProfileFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpProfileFetcher {
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .expect("reqwest client builder");
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    async fn fetch_endpoint<T: serde::de::DeserializeOwned>(&self, user_id: &str, endpoint: &str) -> Result<T> {
        let url = format!("{}/{}/{}", self.base_url, user_id, endpoint);
        let policy = BackoffPolicy::new(3, 100);
        let client = self.client.clone();
        retry_with_backoff(policy, endpoint, || {
            let client = client.clone();
            let url = url.clone();
            async move {
                let resp = client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| Error::ProfileUnavailable {
                        user_id: format!("{e}"),
                    })?;
                if !resp.status().is_success() {
                    return Err(Error::ProfileUnavailable {
                        user_id: format!("status {}", resp.status()),
                    });
                }
                resp.json::<T>()
                    .await
                    .map_err(|e| Error::ProfileUnavailable {
                        user_id: format!("{e}"),
                    })
            }
        })
        .await
    }
}

#[async_trait]
impl ProfileFetcher for HttpProfileFetcher {
    async fn fetch_profile(&self, user_id: &str) -> Result<UserProfile> {
        let mut profile = UserProfile::default_for(user_id);
        let mut any_ok = false;

        if let Ok(behavior) = self
            .fetch_endpoint::<BehaviorProfile>(user_id, "behavior")
            .await
        {
            profile.behavior = behavior;
            profile.sources_used.insert(ProfileSource::Behavior);
            any_ok = true;
        }
        if let Ok(fraud_history) = self
            .fetch_endpoint::<FraudHistory>(user_id, "fraud_history")
            .await
        {
            profile.fraud_history = fraud_history;
            profile.sources_used.insert(ProfileSource::FraudHistory);
            any_ok = true;
        }
        if let Ok(spending) = self
            .fetch_endpoint::<SpendingProfile>(user_id, "spending")
            .await
        {
            profile.spending = spending;
            profile.sources_used.insert(ProfileSource::Spending);
            any_ok = true;
        }

        if !any_ok {
            return Err(Error::ProfileUnavailable {
                user_id: user_id.to_string(),
            });
        }
        Ok(profile)
    }
}

pub struct ProfileCache {
    entries: DashMap<String, CacheEntry>,
    capacity: usize,
    ttl: Duration,
    fetcher: Arc<dyn ProfileFetcher>,
    breaker: Arc<CircuitBreaker>,
}

impl ProfileCache {
    pub fn new(config: &CacheConfig, fetcher: Arc<dyn ProfileFetcher>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            entries: DashMap::with_capacity(config.profile_cache_size),
            capacity: config.profile_cache_size,
            ttl: Duration::from_secs(config.profile_cache_ttl_secs),
            fetcher,
            breaker,
        }
    }

    /// Never errors: a miss that can't be satisfied degrades to a
    /// default profile instead of propagating failure to the caller.
    pub async fn get(&self, user_id: &str) -> UserProfile {
        if let Some(mut entry) = self.entries.get_mut(user_id) {
            if entry.inserted_at.elapsed() < self.ttl {
                entry.last_accessed = Instant::now();
                return entry.value.clone();
            }
        }
        self.entries.remove(user_id);

        if !self.breaker.allow() {
            warn!(user_id, "profile circuit open, returning degraded default");
            return UserProfile::default_for(user_id);
        }

        let fetcher = self.fetcher.clone();
        let uid = user_id.to_string();
        match fetcher.fetch_profile(&uid).await {
            Ok(profile) => {
                self.breaker.record_success();
                self.insert(user_id, profile.clone());
                profile
            }
            Err(err) => {
                self.breaker.record_failure();
                warn!(user_id, error = %err, "profile fetch failed, returning degraded default");
                UserProfile::default_for(user_id)
            }
        }
    }

    /// Like `get`, but fails fast with `ProfileUnavailable` instead of
    /// degrading when the circuit is open or the fetch itself errors.
    /// Used by the Spend Controller, which needs to distinguish "no
    /// profile, proceed with defaults" from "dependency is down".
    pub async fn get_or_fail(&self, user_id: &str) -> Result<UserProfile> {
        if let Some(mut entry) = self.entries.get_mut(user_id) {
            if entry.inserted_at.elapsed() < self.ttl {
                entry.last_accessed = Instant::now();
                return Ok(entry.value.clone());
            }
        }
        self.entries.remove(user_id);

        if !self.breaker.allow() {
            return Err(Error::ProfileUnavailable {
                user_id: user_id.to_string(),
            });
        }

        match self.fetcher.fetch_profile(user_id).await {
            Ok(profile) => {
                self.breaker.record_success();
                self.insert(user_id, profile.clone());
                Ok(profile)
            }
            Err(err) => {
                self.breaker.record_failure();
                Err(err)
            }
        }
    }

    fn insert(&self, user_id: &str, value: UserProfile) {
        if self.entries.len() >= self.capacity && !self.entries.contains_key(user_id) {
            self.evict_lru();
        }
        let now = Instant::now();
        self.entries.insert(
            user_id.to_string(),
            CacheEntry {
                value,
                inserted_at: now,
                last_accessed: now,
            },
        );
    }

    fn evict_lru(&self) {
        let mut oldest_key: Option<String> = None;
        let mut oldest_time = Instant::now();
        for entry in self.entries.iter() {
            if entry.value().last_accessed <= oldest_time {
                oldest_time = entry.value().last_accessed;
                oldest_key = Some(entry.key().clone());
            }
        }
        if let Some(key) = oldest_key {
            self.entries.remove(&key);
        }
    }

    /// Sweeps entries whose TTL has elapsed. Intended to be driven on a
    /// 60 s tick by a background janitor task.
    pub fn sweep_expired(&self) -> usize {
        let ttl = self.ttl;
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.value().inserted_at.elapsed() >= ttl)
            .map(|e| e.key().clone())
            .collect();
        let count = expired.len();
        for key in expired {
            self.entries.remove(&key);
        }
        if count > 0 {
            debug!(count, "profile cache janitor evicted expired entries");
        }
        count
    }

    /// Prefetches a configured warmup list in parallel so the first
    /// request per user after a cold start doesn't pay the fetch latency.
    pub async fn warmup(&self, user_ids: &[String]) {
        let futures = user_ids.iter().map(|uid| self.get(uid));
        futures::future::join_all(futures).await;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::CircuitBreaker;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FlakyFetcher {
        fail_next: AtomicU32,
    }

    #[async_trait]
    impl ProfileFetcher for FlakyFetcher {
        async fn fetch_profile(&self, user_id: &str) -> Result<UserProfile> {
            if self.fail_next.load(Ordering::SeqCst) > 0 {
                self.fail_next.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::ProfileUnavailable {
                    user_id: user_id.to_string(),
                });
            }
            let mut p = UserProfile::default_for(user_id);
            p.sources_used.insert(ProfileSource::Behavior);
            Ok(p)
        }
    }

    fn test_cache(fail_next: u32) -> ProfileCache {
        let config = CacheConfig {
            profile_cache_size: 4,
            profile_cache_ttl_secs: 60,
            warmup_users: Vec::new(),
        };
        let fetcher = Arc::new(FlakyFetcher {
            fail_next: AtomicU32::new(fail_next),
        });
        let breaker = Arc::new(CircuitBreaker::new(
            "profile",
            crate::config::CircuitConfig {
                failure_threshold: 5,
                open_cooldown_secs: 300,
                half_open_probe_limit: 1,
            },
        ));
        ProfileCache::new(&config, fetcher, breaker)
    }

    #[tokio::test]
    async fn hit_after_fetch_skips_network() {
        let cache = test_cache(0);
        let a = cache.get("u1").await;
        assert!(a.sources_used.contains(&ProfileSource::Behavior));
        let b = cache.get("u1").await;
        assert_eq!(a.user_id, b.user_id);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn fetch_failure_degrades_to_default() {
        let cache = test_cache(1);
        let profile = cache.get("u2").await;
        assert!(profile.sources_used.is_empty());
        assert!(profile.is_degraded());
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let cache = test_cache(0);
        cache.get("u1").await;
        cache.get("u2").await;
        cache.get("u3").await;
        cache.get("u4").await;
        assert_eq!(cache.len(), 4);
        cache.get("u5").await;
        assert_eq!(cache.len(), 4);
    }

    #[tokio::test]
    async fn sweep_expired_removes_stale_entries() {
        let config = CacheConfig {
            profile_cache_size: 4,
            profile_cache_ttl_secs: 0,
            warmup_users: Vec::new(),
        };
        let fetcher = Arc::new(FlakyFetcher {
            fail_next: AtomicU32::new(0),
        });
        let breaker = Arc::new(CircuitBreaker::new(
            "profile",
            crate::config::CircuitConfig {
                failure_threshold: 5,
                open_cooldown_secs: 300,
                half_open_probe_limit: 1,
            },
        ));
        let cache = ProfileCache::new(&config, fetcher, breaker);
        cache.get("u1").await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        let removed = cache.sweep_expired();
        assert_eq!(removed, 1);
        assert!(cache.is_empty());
    }
}
