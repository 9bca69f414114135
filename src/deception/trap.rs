//! Fraud Trap Engine (C12): watches transactions for a match against a
//! live decoy, captures forensic evidence, and contains the account
//! that touched it. `analyze_transaction` is a best-effort adjunct to
//! the authoritative pipeline — a full queue drops the newest submission
//! rather than applying backpressure to the Spend Controller.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use hkdf::Hkdf;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::TrapConfig;
use crate::deception::phantom::Decoy;
use crate::error::Result;
use crate::model::{now_ts, RiskLevel, Transaction};

const TRAP_ID_INFO: &[u8] = b"fortiguard-fraud-trap-v1";
const TRAP_ID_SALT: &[u8] = b"fortiguard-static-salt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrapStatus {
    Active,
    Triggered,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkForensics {
    pub source_ip: String,
    pub geo: String,
    pub device_fingerprint: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForensicEvidence {
    pub transaction: Transaction,
    pub session_context: Option<serde_json::Value>,
    pub network_forensics: NetworkForensics,
    pub captured_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudTrap {
    pub trap_id: String,
    pub decoy: Decoy,
    pub status: TrapStatus,
    pub evidence: Vec<ForensicEvidence>,
}

#[derive(Debug, Clone)]
pub struct TrapIntelligenceReport {
    pub trap_id: String,
    pub temporal_cluster: bool,
    pub geo_cluster: bool,
    pub device_diversity: f64,
    pub risk_level: RiskLevel,
}

/// External collaborators invoked on containment. Opaque by design: the
/// engine only needs to know these calls were made, not how.
#[async_trait]
pub trait ContainmentActions: Send + Sync {
    async fn terminate_session(&self, user_id: &str);
    async fn block_source_ip(&self, ip: &str);
    async fn capture_system_snapshot(&self, trap_id: &str);
    async fn emit_critical_alert(&self, trap_id: &str, user_id: &str);
    async fn freeze_account(&self, user_id: &str);
}

/// Signals a confirmed trap hit out to the federation learning pipeline.
/// Kept abstract so the Fraud Trap Engine (C12) never has to import the
/// Federation Coordinator (C13) directly — the bridge that turns this
/// into a real `federation::Case` lives in `deception::mod`.
#[async_trait]
pub trait PatternFeed: Send + Sync {
    async fn propagate(&self, pattern_hash: String, embedding: Vec<f32>);
}

pub struct NoopPatternFeed;

#[async_trait]
impl PatternFeed for NoopPatternFeed {
    async fn propagate(&self, _pattern_hash: String, _embedding: Vec<f32>) {}
}

pub struct LoggingContainmentActions;

#[async_trait]
impl ContainmentActions for LoggingContainmentActions {
    async fn terminate_session(&self, user_id: &str) {
        warn!(user_id, "containment: session terminated");
    }
    async fn block_source_ip(&self, ip: &str) {
        warn!(ip, "containment: source IP blocked");
    }
    async fn capture_system_snapshot(&self, trap_id: &str) {
        info!(trap_id, "containment: system-state snapshot captured");
    }
    async fn emit_critical_alert(&self, trap_id: &str, user_id: &str) {
        warn!(trap_id, user_id, "containment: critical alert emitted");
    }
    async fn freeze_account(&self, user_id: &str) {
        warn!(user_id, "containment: account frozen");
    }
}

fn derive_trap_id(decoy: &Decoy) -> Result<String> {
    let bytes = serde_json::to_vec(decoy)?;
    let hk = Hkdf::<Sha256>::new(Some(TRAP_ID_SALT), &bytes);
    let mut okm = [0u8; 16];
    hk.expand(TRAP_ID_INFO, &mut okm)
        .map_err(|e| crate::error::Error::CryptoUnavailable(format!("trap id derivation failed: {e}")))?;
    Ok(hex::encode(okm))
}

fn amount_close(a: rust_decimal::Decimal, b: rust_decimal::Decimal) -> bool {
    (a - b).abs() < rust_decimal::Decimal::new(10, 0)
}

fn merchants_match(a: &str, b: &str) -> bool {
    let (a, b) = (a.to_lowercase(), b.to_lowercase());
    a.contains(&b) || b.contains(&a)
}

const ANOMALY_THRESHOLD: f64 = 0.85;

/// Dollar movement against the decoy's baseline amount, normalized by
/// how little time has passed since the decoy was planted. A large
/// delta arriving within seconds of trap creation scores near 1.0; the
/// same delta spread over hours scores near 0.
fn amount_velocity(tx: &Transaction, decoy: &Decoy) -> f64 {
    let delta = rust_decimal::prelude::ToPrimitive::to_f64(&(tx.amount - decoy.amount).abs()).unwrap_or(0.0);
    let elapsed_secs = (tx.timestamp - decoy.created_at).num_seconds().unsigned_abs().max(1) as f64;
    (delta / elapsed_secs / 50.0).min(1.0)
}

/// Models "impossible travel": a transaction from a different geo than
/// the decoy's planted location scores higher the sooner it arrives
/// after trap creation, and zero when the geo matches.
fn geo_velocity(tx: &Transaction, decoy: &Decoy) -> f64 {
    if tx.geo_code.eq_ignore_ascii_case(&decoy.location) {
        return 0.0;
    }
    let elapsed_hours = (tx.timestamp - decoy.created_at).num_seconds().unsigned_abs().max(1) as f64 / 3600.0;
    (1.0 / elapsed_hours).min(1.0)
}

/// Shannon entropy of the fingerprint string, normalized against the
/// ~6.5 bits/char ceiling of printable ASCII. Automated fraud tooling
/// tends to mint high-entropy, randomized fingerprints where a real
/// device's string is comparatively structured and low-entropy.
fn device_entropy(fingerprint: &str) -> f64 {
    if fingerprint.is_empty() {
        return 0.0;
    }
    let mut counts: HashMap<char, usize> = HashMap::new();
    for c in fingerprint.chars() {
        *counts.entry(c).or_insert(0) += 1;
    }
    let len = fingerprint.chars().count() as f64;
    let entropy = -counts
        .values()
        .map(|&c| {
            let p = c as f64 / len;
            p * p.log2()
        })
        .sum::<f64>();
    (entropy / 6.0).min(1.0)
}

/// Composite anomaly score combining amount velocity, geo velocity, and
/// device-fingerprint entropy.
fn anomaly_score(tx: &Transaction, decoy: &Decoy) -> f64 {
    0.4 * amount_velocity(tx, decoy) + 0.35 * geo_velocity(tx, decoy) + 0.25 * device_entropy(&tx.device_fingerprint)
}

fn detect_match(tx: &Transaction, decoy: &Decoy) -> bool {
    if let Some(marker) = &tx.decoy_marker {
        if marker == &decoy.decoy_marker {
            return true;
        }
    }
    if amount_close(tx.amount, decoy.amount) {
        return true;
    }
    if merchants_match(&tx.merchant_id, &decoy.merchant_id) {
        return true;
    }
    let time_delta = (tx.timestamp - decoy.created_at).num_seconds().abs();
    if time_delta < 30 {
        return true;
    }
    anomaly_score(tx, decoy) > ANOMALY_THRESHOLD
}

pub struct FraudTrapEngine {
    config: TrapConfig,
    directory: PathBuf,
    traps: DashMap<String, FraudTrap>,
    triggered_ids: Mutex<HashSet<String>>,
    queue: (crossbeam_channel::Sender<Transaction>, crossbeam_channel::Receiver<Transaction>),
    containment: Arc<dyn ContainmentActions>,
    pattern_feed: parking_lot::RwLock<Arc<dyn PatternFeed>>,
}

impl FraudTrapEngine {
    pub fn new(config: TrapConfig, containment: Arc<dyn ContainmentActions>) -> Self {
        let directory = PathBuf::from(&config.directory);
        let queue = crossbeam_channel::bounded(config.queue_capacity);
        Self {
            config,
            directory,
            traps: DashMap::new(),
            triggered_ids: Mutex::new(HashSet::new()),
            queue,
            containment,
            pattern_feed: parking_lot::RwLock::new(Arc::new(NoopPatternFeed)),
        }
    }

    /// Wires in the federation learning pipeline once it exists. Called
    /// post-construction since the Federation Coordinator is optional
    /// and constructed after this engine.
    pub fn set_pattern_feed(&self, feed: Arc<dyn PatternFeed>) {
        *self.pattern_feed.write() = feed;
    }

    pub fn register_trap(&self, decoy: Decoy) -> Result<String> {
        let trap_id = derive_trap_id(&decoy)?;
        let trap = FraudTrap {
            trap_id: trap_id.clone(),
            decoy,
            status: TrapStatus::Active,
            evidence: Vec::new(),
        };
        self.persist_trap(&trap)?;
        self.traps.insert(trap_id.clone(), trap);
        Ok(trap_id)
    }

    fn persist_trap(&self, trap: &FraudTrap) -> Result<()> {
        std::fs::create_dir_all(&self.directory)?;
        let path = self.directory.join(format!("{}.json", trap.trap_id));
        let tmp = self.directory.join(format!("{}.json.tmp", trap.trap_id));
        std::fs::write(&tmp, serde_json::to_vec_pretty(trap)?)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Non-blocking submit. Drops the transaction with a warning if the
    /// queue is already at `queue_capacity`.
    pub fn analyze_transaction(&self, tx: Transaction) {
        if self.queue.0.try_send(tx).is_err() {
            warn!("fraud trap analysis queue full, dropping transaction");
        }
    }

    /// Runs as one of `worker_count` workers draining the analysis queue.
    pub async fn run_worker(self: Arc<Self>) {
        loop {
            let tx = {
                let receiver = self.queue.1.clone();
                match tokio::task::spawn_blocking(move || receiver.recv_timeout(Duration::from_millis(500))).await {
                    Ok(Ok(tx)) => tx,
                    Ok(Err(_)) => continue,
                    Err(_) => break,
                }
            };
            self.process_transaction(tx).await;
        }
    }

    async fn process_transaction(&self, tx: Transaction) {
        let matched_trap_id = self
            .traps
            .iter()
            .filter(|e| e.value().status == TrapStatus::Active)
            .find(|e| detect_match(&tx, &e.value().decoy))
            .map(|e| e.key().clone());

        let Some(trap_id) = matched_trap_id else {
            return;
        };

        {
            let mut triggered = self.triggered_ids.lock();
            if triggered.contains(&trap_id) {
                return;
            }
            triggered.insert(trap_id.clone());
        }

        if let Some(mut trap) = self.traps.get_mut(&trap_id) {
            trap.status = TrapStatus::Triggered;
            trap.evidence.push(ForensicEvidence {
                network_forensics: NetworkForensics {
                    source_ip: tx.source_ip.clone(),
                    geo: tx.geo_code.clone(),
                    device_fingerprint: tx.device_fingerprint.clone(),
                },
                session_context: None,
                captured_at: now_ts(),
                transaction: tx.clone(),
            });
            if let Err(err) = self.persist_trap(&trap) {
                warn!(trap_id, error = %err, "failed to persist triggered trap");
            }
        }

        self.containment.terminate_session(&tx.user_id).await;
        self.containment.block_source_ip(&tx.source_ip).await;
        self.containment.capture_system_snapshot(&trap_id).await;
        self.containment.emit_critical_alert(&trap_id, &tx.user_id).await;
        self.containment.freeze_account(&tx.user_id).await;

        let embedding = vec![
            rust_decimal::prelude::ToPrimitive::to_f64(&tx.amount).unwrap_or(0.0) as f32 / 1000.0,
            if tx.cross_border { 1.0 } else { 0.0 },
            self.traps.get(&trap_id).map(|t| t.evidence.len()).unwrap_or(1) as f32,
        ];
        let feed = self.pattern_feed.read().clone();
        feed.propagate(trap_id, embedding).await;
    }

    /// Every 10 s, builds an intelligence report per triggered trap.
    pub async fn run_analyzer(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.config.analyzer_interval_secs));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    for report in self.build_reports() {
                        info!(trap_id = %report.trap_id, temporal = report.temporal_cluster, geo = report.geo_cluster, diversity = report.device_diversity, "trap intelligence report");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    fn build_reports(&self) -> Vec<TrapIntelligenceReport> {
        self.traps
            .iter()
            .filter(|e| e.value().status == TrapStatus::Triggered)
            .map(|e| {
                let trap = e.value();
                let times: Vec<i64> = trap.evidence.iter().map(|ev| ev.captured_at.timestamp()).collect();
                let temporal_cluster = times.len() >= 2
                    && times.iter().max().unwrap() - times.iter().min().unwrap() < 60;
                let geos: HashSet<&str> = trap.evidence.iter().map(|ev| ev.network_forensics.geo.as_str()).collect();
                let geo_cluster = geos.len() == 1;
                let devices: HashSet<&str> =
                    trap.evidence.iter().map(|ev| ev.network_forensics.device_fingerprint.as_str()).collect();
                let device_diversity = if trap.evidence.is_empty() {
                    0.0
                } else {
                    devices.len() as f64 / trap.evidence.len() as f64
                };
                let risk_level = if device_diversity > 0.5 {
                    RiskLevel::Critical
                } else {
                    RiskLevel::High
                };
                TrapIntelligenceReport {
                    trap_id: trap.trap_id.clone(),
                    temporal_cluster,
                    geo_cluster,
                    device_diversity,
                    risk_level,
                }
            })
            .collect()
    }

    pub fn active_trap_count(&self) -> usize {
        self.traps.iter().filter(|e| e.value().status == TrapStatus::Active).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deception::phantom::DecoyStatus;
    use crate::model::TransactionStatus;
    use rust_decimal_macros::dec;

    fn sample_decoy() -> Decoy {
        Decoy {
            decoy_id: "d1".into(),
            user_id: "u1".into(),
            merchant_id: "TrapMerchant".into(),
            location: "US".into(),
            amount: dec!(123.45),
            profile_similarity: 0.9,
            decoy_marker: "marker-1".into(),
            created_at: now_ts(),
            status: DecoyStatus::Active,
        }
    }

    fn sample_tx(marker: Option<&str>) -> Transaction {
        Transaction {
            id: "t1".into(),
            user_id: "u1".into(),
            amount: dec!(123.45),
            currency: "USD".into(),
            merchant_id: "other".into(),
            merchant_category: "retail".into(),
            timestamp: now_ts(),
            device_fingerprint: "d1".into(),
            source_ip: "10.0.0.1".into(),
            geo_code: "US".into(),
            cross_border: false,
            decoy_marker: marker.map(|m| m.to_string()),
            status: TransactionStatus::Pending,
        }
    }

    fn test_engine() -> FraudTrapEngine {
        let dir = tempfile::tempdir().unwrap();
        let config = TrapConfig {
            directory: dir.path().to_string_lossy().to_string(),
            queue_capacity: 10,
            worker_count: 1,
            analyzer_interval_secs: 10,
        };
        std::mem::forget(dir);
        FraudTrapEngine::new(config, Arc::new(LoggingContainmentActions))
    }

    #[test]
    fn marker_match_detects() {
        let decoy = sample_decoy();
        let tx = sample_tx(Some("marker-1"));
        assert!(detect_match(&tx, &decoy));
    }

    #[test]
    fn amount_proximity_detects() {
        let decoy = sample_decoy();
        let tx = sample_tx(None);
        assert!(detect_match(&tx, &decoy));
    }

    #[tokio::test]
    async fn register_then_process_triggers_and_dedups() {
        let engine = test_engine();
        let trap_id = engine.register_trap(sample_decoy()).unwrap();
        assert_eq!(engine.active_trap_count(), 1);

        engine.process_transaction(sample_tx(Some("marker-1"))).await;
        assert_eq!(engine.active_trap_count(), 0);
        assert_eq!(engine.traps.get(&trap_id).unwrap().evidence.len(), 1);

        engine.process_transaction(sample_tx(Some("marker-1"))).await;
        assert_eq!(engine.traps.get(&trap_id).unwrap().evidence.len(), 1);
    }

    struct RecordingPatternFeed(Mutex<Vec<(String, Vec<f32>)>>);

    #[async_trait]
    impl PatternFeed for RecordingPatternFeed {
        async fn propagate(&self, pattern_hash: String, embedding: Vec<f32>) {
            self.0.lock().push((pattern_hash, embedding));
        }
    }

    #[tokio::test]
    async fn trap_hit_propagates_to_pattern_feed() {
        let engine = test_engine();
        let feed = Arc::new(RecordingPatternFeed(Mutex::new(Vec::new())));
        engine.set_pattern_feed(feed.clone());
        let trap_id = engine.register_trap(sample_decoy()).unwrap();

        engine.process_transaction(sample_tx(Some("marker-1"))).await;

        let calls = feed.0.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, trap_id);
    }

    #[test]
    fn large_fast_cross_geo_transfer_with_random_device_triggers_anomaly() {
        let decoy = Decoy {
            created_at: now_ts() - chrono::Duration::seconds(60),
            location: "US".into(),
            ..sample_decoy()
        };
        let tx = Transaction {
            device_fingerprint: "Zq7#kP2$vN9!mX4&".into(),
            amount: dec!(9999.00),
            geo_code: "RU".into(),
            merchant_id: "completely-unrelated-merchant".into(),
            ..sample_tx(None)
        };
        assert!(!amount_close(tx.amount, decoy.amount));
        assert!(!merchants_match(&tx.merchant_id, &decoy.merchant_id));
        assert!((tx.timestamp - decoy.created_at).num_seconds().abs() >= 30);
        assert!(anomaly_score(&tx, &decoy) > ANOMALY_THRESHOLD);
        assert!(detect_match(&tx, &decoy));
    }

    #[test]
    fn ordinary_transaction_does_not_trigger_anomaly_alone() {
        let decoy = Decoy {
            created_at: now_ts() - chrono::Duration::hours(2),
            location: "US".into(),
            ..sample_decoy()
        };
        let tx = Transaction {
            device_fingerprint: "laptop-home-001".into(),
            amount: dec!(200.00),
            geo_code: "US".into(),
            merchant_id: "completely-unrelated-merchant".into(),
            ..sample_tx(None)
        };
        assert!(!amount_close(tx.amount, decoy.amount));
        assert!(anomaly_score(&tx, &decoy) <= ANOMALY_THRESHOLD);
        assert!(!detect_match(&tx, &decoy));
    }

    #[test]
    fn trap_id_is_deterministic_for_same_decoy() {
        let decoy = sample_decoy();
        let a = derive_trap_id(&decoy).unwrap();
        let b = derive_trap_id(&decoy).unwrap();
        assert_eq!(a, b);
    }
}
