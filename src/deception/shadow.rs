//! Shadow Session (C11): a per-user mirror of live activity. Admits
//! transactions only after HMAC verification, tracks a running fraud
//! score, and periodically injects Phantom Engine decoys into the
//! mirrored context at a cadence set by the session's behavior profile.
//!
//! Session and MAC keys use HKDF-SHA256 with a random salt and a fixed
//! info string, generalized to also derive a second, shorter MAC key via
//! SHAKE-128 rather than a second HKDF expand.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::Shake128;
use subtle::ConstantTimeEq;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::ShadowConfig;
use crate::deception::phantom::{Decoy, PhantomEngine};
use crate::error::{Error, Result};
use crate::model::{RiskLevel, Transaction};

/// Arms a decoy injected into a mirrored session as a live trap. Kept
/// abstract so Shadow Session (C11) never has to import the Fraud Trap
/// Engine (C12) directly.
#[async_trait]
pub trait DecoyArmer: Send + Sync {
    async fn arm(&self, decoy: &Decoy);
}

pub struct NoopDecoyArmer;

#[async_trait]
impl DecoyArmer for NoopDecoyArmer {
    async fn arm(&self, _decoy: &Decoy) {}
}

/// Routes a fraud-score-triggered limit reduction into the Spend
/// Controller's normal limit-update pipeline (sync + audit), rather than
/// a side channel that would bypass it. Abstract for the same reason as
/// `DecoyArmer`: the controller (C9) is constructed after the session
/// manager and would otherwise create a construction cycle, so this is
/// wired in with `set_spend_sink` once the controller exists.
#[async_trait]
pub trait SpendControlSink: Send + Sync {
    async fn scale_down(&self, user_id: &str, scale: f64);
}

pub struct NoopSpendControlSink;

#[async_trait]
impl SpendControlSink for NoopSpendControlSink {
    async fn scale_down(&self, _user_id: &str, _scale: f64) {}
}

/// Fraud-score bands that trigger an automatic limit reduction: 0.9+
/// cuts a user's limits to 10% of current, 0.7+ cuts them in half.
const CRITICAL_BAND: f64 = 0.9;
const ELEVATED_BAND: f64 = 0.7;

fn scale_for_score(score: f64) -> Option<f64> {
    if score >= CRITICAL_BAND {
        Some(0.1)
    } else if score >= ELEVATED_BAND {
        Some(0.5)
    } else {
        None
    }
}

const HKDF_INFO: &[u8] = b"fortiguard-shadow-session-v1";
const SESSION_KEY_LEN: usize = 32;
const MAC_KEY_LEN: usize = 16;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BehaviorProfileKind {
    Default,
    HighValue,
    Suspicious,
}

impl BehaviorProfileKind {
    fn cadence(&self) -> (Duration, &'static [&'static str], f64) {
        match self {
            BehaviorProfileKind::Default => (Duration::from_secs(120), &["amount", "merchant", "timing"], 0.70),
            BehaviorProfileKind::HighValue => (Duration::from_secs(60), &["amount", "geolocation"], 0.90),
            BehaviorProfileKind::Suspicious => (Duration::from_secs(30), &["merchant", "device"], 0.95),
        }
    }
}

fn derive_session_key(salt: &[u8; 16], ctx: &[u8]) -> [u8; SESSION_KEY_LEN] {
    let hk = Hkdf::<Sha256>::new(Some(salt.as_slice()), ctx);
    let mut okm = [0u8; SESSION_KEY_LEN];
    hk.expand(HKDF_INFO, &mut okm).expect("32 bytes is a valid HKDF-SHA256 output length");
    okm
}

fn derive_mac_key(session_key: &[u8]) -> [u8; MAC_KEY_LEN] {
    let mut hasher = Shake128::default();
    hasher.update(session_key);
    let mut reader = hasher.finalize_xof();
    let mut mac_key = [0u8; MAC_KEY_LEN];
    reader.read(&mut mac_key);
    mac_key
}

pub struct Session {
    pub user_id: String,
    session_key: [u8; SESSION_KEY_LEN],
    mac_key: [u8; MAC_KEY_LEN],
    created_at: Instant,
    last_activity: Instant,
    last_injection: Instant,
    history: VecDeque<Transaction>,
    pub fraud_score: f64,
    pub risk_level: RiskLevel,
    pub decoys_injected: Vec<crate::deception::phantom::Decoy>,
    pub behavior_profile: BehaviorProfileKind,
    applied_scale: Option<f64>,
}

const HISTORY_CAP: usize = 100;

impl Session {
    fn new(user_id: String, ctx: &[u8]) -> Self {
        let mut salt = [0u8; 16];
        {
            use rand::RngCore;
            rand::thread_rng().fill_bytes(&mut salt);
        }
        let session_key = derive_session_key(&salt, ctx);
        let mac_key = derive_mac_key(&session_key);
        let now = Instant::now();
        Self {
            user_id,
            session_key,
            mac_key,
            created_at: now,
            last_activity: now,
            last_injection: now,
            history: VecDeque::with_capacity(HISTORY_CAP),
            fraud_score: 0.0,
            risk_level: RiskLevel::Low,
            decoys_injected: Vec::new(),
            behavior_profile: BehaviorProfileKind::Default,
            applied_scale: None,
        }
    }

    fn expected_tag(&self, tx: &Transaction) -> Vec<u8> {
        let mut mac = HmacSha256::new_from_slice(&self.mac_key).expect("hmac accepts any key length");
        Mac::update(&mut mac, tx.id.as_bytes());
        Mac::update(&mut mac, tx.amount.to_string().as_bytes());
        Mac::update(&mut mac, tx.timestamp.timestamp().to_string().as_bytes());
        mac.finalize().into_bytes().to_vec()
    }

    fn admit(&mut self, tx: Transaction, tag: &[u8]) -> Result<()> {
        let expected = self.expected_tag(&tx);
        let tags_match: bool = expected.ct_eq(tag).into();
        if !tags_match {
            return Err(Error::IntegrityViolation(format!(
                "shadow session HMAC mismatch for tx {}",
                tx.id
            )));
        }
        if self.history.len() >= HISTORY_CAP {
            self.history.pop_front();
        }
        let recent_amount: rust_decimal::Decimal = self.history.iter().map(|t| t.amount).sum::<rust_decimal::Decimal>() + tx.amount;
        let window_secs = self
            .history
            .front()
            .map(|first| (tx.timestamp - first.timestamp).num_seconds().max(1) as f64)
            .unwrap_or(1.0);
        let velocity = rust_decimal::prelude::ToPrimitive::to_f64(&recent_amount).unwrap_or(0.0) / window_secs;
        self.fraud_score = (velocity / 1000.0).tanh().clamp(0.0, 1.0);
        self.risk_level = if self.fraud_score > 0.85 {
            RiskLevel::Critical
        } else if self.fraud_score > 0.6 {
            RiskLevel::High
        } else if self.fraud_score > 0.3 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };
        self.history.push_back(tx);
        self.last_activity = Instant::now();
        Ok(())
    }
}

pub struct ShadowSessionManager {
    config: ShadowConfig,
    sessions: DashMap<String, Session>,
    phantom: Arc<PhantomEngine>,
    armer: Arc<dyn DecoyArmer>,
    spend_sink: RwLock<Arc<dyn SpendControlSink>>,
}

impl ShadowSessionManager {
    pub fn new(config: ShadowConfig, phantom: Arc<PhantomEngine>) -> Self {
        Self::with_armer(config, phantom, Arc::new(NoopDecoyArmer))
    }

    pub fn with_armer(config: ShadowConfig, phantom: Arc<PhantomEngine>, armer: Arc<dyn DecoyArmer>) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            phantom,
            armer,
            spend_sink: RwLock::new(Arc::new(NoopSpendControlSink)),
        }
    }

    /// Wires in the Spend Controller's limit-reduction path once it
    /// exists. Called post-construction to avoid a cycle with the
    /// controller, which itself holds a reference to this manager.
    pub fn set_spend_sink(&self, sink: Arc<dyn SpendControlSink>) {
        *self.spend_sink.write() = sink;
    }

    /// Creates a session for `user_id` if one doesn't already exist.
    pub fn start_shadowing(&self, user_id: &str, ctx: &[u8]) {
        self.sessions
            .entry(user_id.to_string())
            .or_insert_with(|| Session::new(user_id.to_string(), ctx));
    }

    pub fn record_transaction(&self, user_id: &str, tx: Transaction, hmac_tag: &[u8]) -> Result<()> {
        let mut session = self
            .sessions
            .get_mut(user_id)
            .ok_or_else(|| Error::Internal(format!("no shadow session for {user_id}")))?;
        session.admit(tx, hmac_tag)
    }

    pub fn session_snapshot(&self, user_id: &str) -> Option<(f64, RiskLevel, usize)> {
        self.sessions
            .get(user_id)
            .map(|s| (s.fraud_score, s.risk_level, s.decoys_injected.len()))
    }

    /// Runs with 100 ms precision, checking every session's cadence and
    /// injecting a decoy from the Phantom Engine when it's due.
    pub async fn run_decoy_dispatcher(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.dispatch_due_decoys().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn dispatch_due_decoys(&self) {
        let due: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| {
                let (cadence, _, _) = e.value().behavior_profile.cadence();
                e.value().last_injection.elapsed() >= cadence
            })
            .map(|e| e.key().clone())
            .collect();

        for user_id in due {
            let decoys = self.phantom.generate_decoys(1, std::slice::from_ref(&user_id)).await;
            for decoy in &decoys {
                self.armer.arm(decoy).await;
            }
            if let Some(mut session) = self.sessions.get_mut(&user_id) {
                session.last_injection = Instant::now();
                session.decoys_injected.extend(decoys);
            }
        }
    }

    /// Terminates sessions inactive beyond `session_timeout`, archiving
    /// each to `archive_directory` with its decoy counts before removal.
    pub async fn run_cleanup_scheduler(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(60));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_inactive_sessions(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    fn sweep_inactive_sessions(&self) {
        let timeout = Duration::from_secs(self.config.session_timeout_secs);
        let stale: Vec<String> = self
            .sessions
            .iter()
            .filter(|e| e.value().last_activity.elapsed() >= timeout)
            .map(|e| e.key().clone())
            .collect();
        for user_id in stale {
            if let Some((_, session)) = self.sessions.remove(&user_id) {
                if let Err(err) = self.archive_session(&session) {
                    warn!(user_id, error = %err, "failed to archive shadow session");
                } else {
                    info!(user_id, decoys = session.decoys_injected.len(), "shadow session archived and terminated");
                }
            }
        }
    }

    fn archive_session(&self, session: &Session) -> Result<()> {
        std::fs::create_dir_all(&self.config.archive_directory)?;
        let path = std::path::Path::new(&self.config.archive_directory)
            .join(format!("{}_{}.json", session.user_id, crate::model::unix_seconds()));
        let record = serde_json::json!({
            "user_id": session.user_id,
            "created_at_elapsed_secs": session.created_at.elapsed().as_secs(),
            "decoy_count": session.decoys_injected.len(),
            "final_fraud_score": session.fraud_score,
            "final_risk_level": format!("{:?}", session.risk_level),
        });
        std::fs::write(path, serde_json::to_vec_pretty(&record)?)?;
        Ok(())
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Every 5 s, scans sessions for a fraud score that crossed a
    /// containment band since the last scale-down was applied, and
    /// routes the reduction through the Spend Controller.
    pub async fn run_spend_control_sweep(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(5));
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep_spend_control().await,
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn sweep_spend_control(&self) {
        let due: Vec<(String, f64)> = self
            .sessions
            .iter()
            .filter_map(|e| {
                let target = scale_for_score(e.value().fraud_score)?;
                if e.value().applied_scale == Some(target) {
                    None
                } else {
                    Some((e.key().clone(), target))
                }
            })
            .collect();

        for (user_id, scale) in due {
            let sink = self.spend_sink.read().clone();
            sink.scale_down(&user_id, scale).await;
            if let Some(mut session) = self.sessions.get_mut(&user_id) {
                session.applied_scale = Some(scale);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deception::phantom::FileDecoyStore;
    use crate::model::{now_ts, TransactionStatus};
    use rust_decimal_macros::dec;

    fn sample_tx(id: &str, amount: rust_decimal::Decimal) -> Transaction {
        Transaction {
            id: id.into(),
            user_id: "u1".into(),
            amount,
            currency: "USD".into(),
            merchant_id: "m1".into(),
            merchant_category: "retail".into(),
            timestamp: now_ts(),
            device_fingerprint: "d1".into(),
            source_ip: "10.0.0.1".into(),
            geo_code: "US".into(),
            cross_border: false,
            decoy_marker: None,
            status: TransactionStatus::Pending,
        }
    }

    fn test_manager() -> ShadowSessionManager {
        let dir = tempfile::tempdir().unwrap();
        let phantom = Arc::new(PhantomEngine::new(
            crate::config::PhantomConfig { ttl_secs: 3600, geo_dispersion: 0.0 },
            vec!["M1".into()],
            vec!["US".into()],
            vec![],
            Arc::new(FileDecoyStore::new(dir.path().join("decoys"))),
        ));
        std::mem::forget(dir);
        ShadowSessionManager::new(ShadowConfig::default(), phantom)
    }

    #[test]
    fn start_shadowing_is_idempotent() {
        let mgr = test_manager();
        mgr.start_shadowing("u1", b"ctx");
        mgr.start_shadowing("u1", b"ctx");
        assert_eq!(mgr.active_session_count(), 1);
    }

    #[test]
    fn valid_hmac_admits_transaction() {
        let mgr = test_manager();
        mgr.start_shadowing("u1", b"ctx");
        let tx = sample_tx("t1", dec!(50));
        let tag = mgr.sessions.get("u1").unwrap().expected_tag(&tx);
        assert!(mgr.record_transaction("u1", tx, &tag).is_ok());
        let snapshot = mgr.session_snapshot("u1").unwrap();
        assert_eq!(snapshot.2, 0);
    }

    #[test]
    fn invalid_hmac_is_rejected() {
        let mgr = test_manager();
        mgr.start_shadowing("u1", b"ctx");
        let tx = sample_tx("t1", dec!(50));
        let result = mgr.record_transaction("u1", tx, b"not-a-real-tag-not-a-real-tag!!");
        assert!(result.is_err());
    }

    #[test]
    fn session_key_derivation_is_salt_dependent() {
        let a = derive_session_key(&[1u8; 16], b"ctx");
        let b = derive_session_key(&[2u8; 16], b"ctx");
        assert_ne!(a, b);
    }

    #[test]
    fn scale_bands_match_fraud_score_thresholds() {
        assert_eq!(scale_for_score(0.95), Some(0.1));
        assert_eq!(scale_for_score(0.75), Some(0.5));
        assert_eq!(scale_for_score(0.5), None);
    }

    struct RecordingSink(std::sync::Mutex<Vec<(String, f64)>>);

    #[async_trait]
    impl SpendControlSink for RecordingSink {
        async fn scale_down(&self, user_id: &str, scale: f64) {
            self.0.lock().unwrap().push((user_id.to_string(), scale));
        }
    }

    #[tokio::test]
    async fn sweep_scales_down_once_per_band_change() {
        let mgr = test_manager();
        let sink = Arc::new(RecordingSink(std::sync::Mutex::new(Vec::new())));
        mgr.set_spend_sink(sink.clone());
        mgr.start_shadowing("u1", b"ctx");
        mgr.sessions.get_mut("u1").unwrap().fraud_score = 0.95;

        mgr.sweep_spend_control().await;
        mgr.sweep_spend_control().await;

        let calls = sink.0.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], ("u1".to_string(), 0.1));
    }
}
