//! Centralized configuration, loaded from a TOML file with env-var
//! override for secrets. An aggregate-of-subconfigs `Config`, one struct
//! per module, so each module owns its own defaults and validation.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    pub general_capacity: usize,
    pub emergency_capacity: usize,
    pub poll_timeout_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            general_capacity: 100_000,
            emergency_capacity: 100,
            poll_timeout_ms: 250,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitConfig {
    pub failure_threshold: u32,
    pub open_cooldown_secs: u64,
    pub half_open_probe_limit: u32,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_cooldown_secs: 300,
            half_open_probe_limit: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub profile_cache_size: usize,
    pub profile_cache_ttl_secs: u64,
    pub warmup_users: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            profile_cache_size: 10_000,
            profile_cache_ttl_secs: 300,
            warmup_users: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskWeights {
    pub amount: f64,
    pub merchant_risk: f64,
    pub geo_velocity: f64,
    pub device_trust: f64,
    pub behavior_anomaly: f64,
    pub user_history: f64,
    pub time_of_day: f64,
    pub network_analysis: f64,
    pub bin_analysis: f64,
}

impl Default for RiskWeights {
    fn default() -> Self {
        Self {
            amount: 0.22,
            merchant_risk: 0.18,
            geo_velocity: 0.15,
            device_trust: 0.12,
            behavior_anomaly: 0.10,
            user_history: 0.08,
            time_of_day: 0.07,
            network_analysis: 0.05,
            bin_analysis: 0.03,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskThresholds {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
}

impl Default for RiskThresholds {
    fn default() -> Self {
        Self {
            critical: 0.90,
            high: 0.70,
            medium: 0.40,
        }
    }
}

impl Default for RiskHysteresis {
    fn default() -> Self {
        Self {
            critical: 0.02,
            high: 0.03,
            medium: 0.05,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RiskHysteresis {
    pub critical: f64,
    pub high: f64,
    pub medium: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    pub weights: RiskWeights,
    pub thresholds: RiskThresholds,
    pub hysteresis: RiskHysteresis,
    pub recalibration_interval_secs: u64,
    pub recalibration_window: usize,
    pub target_fraud_rate: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            weights: RiskWeights::default(),
            thresholds: RiskThresholds::default(),
            hysteresis: RiskHysteresis::default(),
            recalibration_interval_secs: 300,
            recalibration_window: 100,
            target_fraud_rate: 0.02,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BaseLimits {
    pub daily: rust_decimal::Decimal,
    pub transaction: rust_decimal::Decimal,
    pub weekly: rust_decimal::Decimal,
}

impl Default for BaseLimits {
    fn default() -> Self {
        use rust_decimal_macros::dec;
        Self {
            daily: dec!(5000),
            transaction: dec!(1000),
            weekly: dec!(35000),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub base: BaseLimits,
    pub decay_rate: f64,
    pub history_window: usize,
    pub policy_slack: rust_decimal::Decimal,
    pub inactive_days: i64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            base: BaseLimits::default(),
            decay_rate: 0.1,
            history_window: 30,
            policy_slack: rust_decimal::Decimal::new(11, 1), // 1.1
            inactive_days: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRetryConfig {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

impl Default for SyncRetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 200,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncConfig {
    pub endpoints: Vec<String>,
    pub retry: SyncRetryConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    pub directory: String,
    pub max_log_size_bytes: u64,
    pub retention_days: u64,
    pub writer_workers: usize,
    /// Source key material for PBKDF2 derivation of the AEAD key.
    /// Overridden by `FORTIGUARD_AUDIT_SECRET` at load time.
    #[serde(skip_serializing)]
    pub secret: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            directory: "./data/audit".into(),
            max_log_size_bytes: 100 * 1024 * 1024,
            retention_days: 90,
            writer_workers: 4,
            secret: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShadowConfig {
    pub cleanup_interval_secs: u64,
    pub session_timeout_secs: u64,
    pub decoy_strategy: String,
    pub archive_directory: String,
}

impl Default for ShadowConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_secs: 60,
            session_timeout_secs: 1800,
            decoy_strategy: "default".into(),
            archive_directory: "./data/shadow_archives".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhantomConfig {
    pub ttl_secs: u64,
    pub geo_dispersion: f64,
}

impl Default for PhantomConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            geo_dispersion: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrapConfig {
    pub directory: String,
    pub queue_capacity: usize,
    pub worker_count: usize,
    pub analyzer_interval_secs: u64,
}

impl Default for TrapConfig {
    fn default() -> Self {
        Self {
            directory: "./data/traps".into(),
            queue_capacity: 1000,
            worker_count: 4,
            analyzer_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationConfig {
    pub peers: Vec<String>,
    #[serde(skip_serializing)]
    pub secret: String,
    pub epsilon: f64,
    pub delta: f64,
    pub model_registry_dir: String,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            secret: String::new(),
            epsilon: 1.0,
            delta: 1e-5,
            model_registry_dir: "./data/model_registry".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    pub rules_path: String,
    pub poll_interval_secs: u64,
    pub merchant_risk_cache_size: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            rules_path: "./config/policy.json".into(),
            poll_interval_secs: 5,
            merchant_risk_cache_size: 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub controller_workers: usize,
    pub queue: QueueConfig,
    pub circuit: CircuitConfig,
    pub cache: CacheConfig,
    pub risk: RiskConfig,
    pub limits: LimitsConfig,
    pub sync: SyncConfig,
    pub audit: AuditConfig,
    pub shadow: ShadowConfig,
    pub phantom: PhantomConfig,
    pub traps: TrapConfig,
    pub federation: FederationConfig,
    pub policy: PolicyConfig,
    pub large_amount_threshold: rust_decimal::Decimal,
}

impl Default for Config {
    fn default() -> Self {
        use rust_decimal_macros::dec;
        Self {
            controller_workers: 32,
            queue: QueueConfig::default(),
            circuit: CircuitConfig::default(),
            cache: CacheConfig::default(),
            risk: RiskConfig::default(),
            limits: LimitsConfig::default(),
            sync: SyncConfig::default(),
            audit: AuditConfig::default(),
            shadow: ShadowConfig::default(),
            phantom: PhantomConfig::default(),
            traps: TrapConfig::default(),
            federation: FederationConfig::default(),
            policy: PolicyConfig::default(),
            large_amount_threshold: dec!(10000),
        }
    }
}

impl Config {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        let mut config: Config = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("invalid config at {}: {e}", path.display())))?;
        if let Ok(secret) = std::env::var("FORTIGUARD_FEDERATION_SECRET") {
            config.federation.secret = secret;
        }
        if let Ok(secret) = std::env::var("FORTIGUARD_AUDIT_SECRET") {
            config.audit.secret = secret;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let w = &self.risk.weights;
        let sum = w.amount
            + w.merchant_risk
            + w.geo_velocity
            + w.device_trust
            + w.behavior_anomaly
            + w.user_history
            + w.time_of_day
            + w.network_analysis
            + w.bin_analysis;
        if (sum - 1.0).abs() > 1e-6 {
            return Err(Error::Config(format!(
                "risk.weights must sum to 1.0, got {sum}"
            )));
        }
        if self.federation.epsilon <= 0.0 {
            return Err(Error::Config("federation.epsilon must be > 0".into()));
        }
        if !(0.0 < self.federation.delta && self.federation.delta < 1.0) {
            return Err(Error::Config("federation.delta must be in (0,1)".into()));
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.queue.poll_timeout_ms)
    }
}
