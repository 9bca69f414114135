//! Phantom Engine (C10): seeds decoy transactions across a pool of
//! users, keeps an O(1)-lookup TTL cache keyed by decoy marker so the
//! trap engine can match an incoming transaction against a live decoy
//! without scanning disk, and retires decoys once `phantom_ttl` elapses.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::seq::SliceRandom;
use rand::Rng;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::PhantomConfig;
use crate::error::Result;
use crate::model::{new_id, now_ts, RiskLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DecoyStatus {
    Active,
    Triggered,
    Expired,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decoy {
    pub decoy_id: String,
    pub user_id: String,
    pub merchant_id: String,
    pub location: String,
    pub amount: Decimal,
    pub profile_similarity: f64,
    pub decoy_marker: String,
    pub created_at: DateTime<Utc>,
    pub status: DecoyStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggeredDecoy {
    pub decoy_id: String,
    pub access_time: DateTime<Utc>,
    pub source_ip: String,
    pub geo: String,
    pub device_fingerprint: String,
    pub threat_level: RiskLevel,
    /// Free-text origin of the access, e.g. "dark_web_feed" or
    /// "direct_access", carried through for forensic triage.
    pub breach_source: String,
}

/// One row from the access log that `monitor_decoys` scans.
#[derive(Debug, Clone)]
pub struct AccessLogRow {
    pub decoy_marker: String,
    pub accessed: bool,
    pub access_time: DateTime<Utc>,
    pub source_ip: String,
    pub geo: String,
    pub device_fingerprint: String,
    pub breach_source: String,
}

/// Durable storage for decoy records, abstracted so the engine doesn't
/// hard-code a filesystem layout into its core logic.
#[async_trait]
pub trait DecoyPersistence: Send + Sync {
    async fn persist(&self, decoy: &Decoy) -> Result<()>;
}

pub struct FileDecoyStore {
    directory: std::path::PathBuf,
}

impl FileDecoyStore {
    pub fn new(directory: impl Into<std::path::PathBuf>) -> Self {
        Self { directory: directory.into() }
    }
}

#[async_trait]
impl DecoyPersistence for FileDecoyStore {
    async fn persist(&self, decoy: &Decoy) -> Result<()> {
        std::fs::create_dir_all(&self.directory)?;
        let path = self.directory.join(format!("{}.json", decoy.decoy_id));
        let tmp = self.directory.join(format!("{}.json.tmp", decoy.decoy_id));
        std::fs::write(&tmp, serde_json::to_vec_pretty(decoy)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }
}

struct CachedDecoy {
    decoy: Decoy,
    inserted_at: Instant,
}

pub struct PhantomEngine {
    config: PhantomConfig,
    merchants: Vec<String>,
    locations: Vec<String>,
    far_locations: Vec<String>,
    persistence: Arc<dyn DecoyPersistence>,
    cache: DashMap<String, CachedDecoy>,
}

impl PhantomEngine {
    pub fn new(
        config: PhantomConfig,
        merchants: Vec<String>,
        locations: Vec<String>,
        far_locations: Vec<String>,
        persistence: Arc<dyn DecoyPersistence>,
    ) -> Self {
        Self {
            config,
            merchants,
            locations,
            far_locations,
            persistence,
            cache: DashMap::new(),
        }
    }

    /// Samples `count` users from `active_users` (with replacement if
    /// the pool is smaller than `count`) and writes a decoy for each.
    pub async fn generate_decoys(&self, count: usize, active_users: &[String]) -> Vec<Decoy> {
        if active_users.is_empty() || self.merchants.is_empty() || self.locations.is_empty() {
            return Vec::new();
        }
        let mut decoys = Vec::with_capacity(count);
        for _ in 0..count {
            let (user_id, merchant_id, location, amount, profile_similarity) = {
                let mut rng = rand::thread_rng();
                let user_id = active_users.choose(&mut rng).unwrap().clone();
                let merchant_id = self.merchants.choose(&mut rng).unwrap().clone();
                let mut location = self.locations.choose(&mut rng).unwrap().clone();
                if !self.far_locations.is_empty() && rng.gen_bool(self.config.geo_dispersion.clamp(0.0, 1.0)) {
                    location = self.far_locations.choose(&mut rng).unwrap().clone();
                }
                let amount = Decimal::new(rng.gen_range(1000..50_000), 2);
                let profile_similarity = rng.gen_range(0.70..=1.0);
                (user_id, merchant_id, location, amount, profile_similarity)
            };

            let decoy = Decoy {
                decoy_id: new_id(),
                user_id,
                merchant_id,
                location,
                amount,
                profile_similarity,
                decoy_marker: new_id(),
                created_at: now_ts(),
                status: DecoyStatus::Active,
            };

            if let Err(err) = self.persistence.persist(&decoy).await {
                tracing::warn!(decoy_id = %decoy.decoy_id, error = %err, "failed to persist decoy");
                continue;
            }
            self.cache.insert(
                decoy.decoy_marker.clone(),
                CachedDecoy {
                    decoy: decoy.clone(),
                    inserted_at: Instant::now(),
                },
            );
            decoys.push(decoy);
        }
        decoys
    }

    /// Scans `access_log` for rows marking a decoy as accessed, flips
    /// the cached decoy's status, and returns one `TriggeredDecoy` per
    /// match. The caller (Fraud Trap Engine) is responsible for
    /// deduplicating repeated triggers of the same decoy.
    pub fn monitor_decoys(&self, access_log: &[AccessLogRow]) -> Vec<TriggeredDecoy> {
        let mut triggered = Vec::new();
        for row in access_log {
            if !row.accessed {
                continue;
            }
            if let Some(mut cached) = self.cache.get_mut(&row.decoy_marker) {
                cached.decoy.status = DecoyStatus::Triggered;
                triggered.push(TriggeredDecoy {
                    decoy_id: cached.decoy.decoy_id.clone(),
                    access_time: row.access_time,
                    source_ip: row.source_ip.clone(),
                    geo: row.geo.clone(),
                    device_fingerprint: row.device_fingerprint.clone(),
                    threat_level: RiskLevel::High,
                    breach_source: row.breach_source.clone(),
                });
            }
        }
        triggered
    }

    pub fn find_by_marker(&self, marker: &str) -> Option<Decoy> {
        self.cache.get(marker).map(|c| c.decoy.clone())
    }

    /// Evicts decoys older than `phantom_ttl` from the active cache.
    pub fn cleanup_expired_decoys(&self) -> usize {
        let ttl = Duration::from_secs(self.config.ttl_secs);
        let expired: Vec<String> = self
            .cache
            .iter()
            .filter(|e| e.value().inserted_at.elapsed() >= ttl)
            .map(|e| e.key().clone())
            .collect();
        let count = expired.len();
        for key in expired {
            self.cache.remove(&key);
        }
        if count > 0 {
            debug!(count, "phantom engine evicted expired decoys");
        }
        count
    }

    pub fn active_count(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullStore;
    #[async_trait]
    impl DecoyPersistence for NullStore {
        async fn persist(&self, _decoy: &Decoy) -> Result<()> {
            Ok(())
        }
    }

    fn test_engine() -> PhantomEngine {
        PhantomEngine::new(
            PhantomConfig { ttl_secs: 3600, geo_dispersion: 0.0 },
            vec!["M1".into(), "M2".into()],
            vec!["US".into(), "CA".into()],
            vec!["RU".into()],
            Arc::new(NullStore),
        )
    }

    #[tokio::test]
    async fn generates_requested_count_with_valid_profile_similarity() {
        let engine = test_engine();
        let users = vec!["u1".to_string(), "u2".to_string()];
        let decoys = engine.generate_decoys(5, &users).await;
        assert_eq!(decoys.len(), 5);
        for decoy in &decoys {
            assert!(decoy.profile_similarity >= 0.70 && decoy.profile_similarity <= 1.0);
        }
        assert_eq!(engine.active_count(), 5);
    }

    #[tokio::test]
    async fn monitor_decoys_flags_accessed_rows() {
        let engine = test_engine();
        let users = vec!["u1".to_string()];
        let decoys = engine.generate_decoys(1, &users).await;
        let marker = decoys[0].decoy_marker.clone();

        let log = vec![AccessLogRow {
            decoy_marker: marker.clone(),
            accessed: true,
            access_time: now_ts(),
            source_ip: "1.2.3.4".into(),
            geo: "US".into(),
            device_fingerprint: "d1".into(),
            breach_source: "direct_access".into(),
        }];
        let triggered = engine.monitor_decoys(&log);
        assert_eq!(triggered.len(), 1);
        assert_eq!(engine.find_by_marker(&marker).unwrap().status, DecoyStatus::Triggered);
    }

    #[tokio::test]
    async fn cleanup_evicts_expired_decoys() {
        let mut engine = test_engine();
        engine.config.ttl_secs = 0;
        let users = vec!["u1".to_string()];
        engine.generate_decoys(2, &users).await;
        std::thread::sleep(Duration::from_millis(5));
        let removed = engine.cleanup_expired_decoys();
        assert_eq!(removed, 2);
        assert_eq!(engine.active_count(), 0);
    }
}
