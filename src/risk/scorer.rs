//! Two-phase risk scoring: **scoring** (feature extraction + rule/ML
//! blend) then **evaluation** (contextual adjustment, hysteresis-banded
//! level, action-set union). Every weighting, blend ratio, and threshold
//! below is load-bearing, not a placeholder.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{Datelike, Timelike};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tracing::warn;

use crate::config::{RiskConfig, RiskHysteresis, RiskThresholds, RiskWeights};
use crate::error::Result;
use crate::model::{RiskAction, RiskAssessment, RiskFactors, RiskLevel, Transaction, UserProfile};
use crate::policy::PolicyRules;

#[derive(Debug, Clone, Copy, Default)]
pub struct Features {
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

impl Features {
    pub fn weighted_sum(&self, w: &RiskWeights) -> f64 {
        (w.amount * self.amount
            + w.merchant_risk * self.merchant_risk
            + w.geo_velocity * self.geo_velocity
            + w.device_trust * self.device_trust
            + w.behavior_anomaly * self.behavior_anomaly
            + w.user_history * self.user_history
            + w.time_of_day * self.time_of_day
            + w.network_analysis * self.network_analysis
            + w.bin_analysis * self.bin_analysis)
            .clamp(0.0, 1.0)
    }
}

/// Deterministic stand-in for an external reputation feed (IP/BIN
/// intelligence). Real deployments would swap this for a live lookup;
/// callers only need a feature in [0,1].
fn hash_to_unit(s: &str) -> f64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in s.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    (hash % 1000) as f64 / 1000.0
}

const AMOUNT_NORMALIZATION_SCALE: f64 = 10_000.0;
const VELOCITY_NORMALIZATION_SCALE: f64 = 5_000.0;

pub fn extract_features(tx: &Transaction, profile: &UserProfile, policy: &PolicyRules) -> Features {
    let amount_f64: f64 = tx.amount.to_string().parse().unwrap_or(0.0);
    let velocity_f64: f64 = profile.spending_velocity.to_string().parse().unwrap_or(0.0);

    let geo_velocity = ((velocity_f64 / VELOCITY_NORMALIZATION_SCALE)
        + if tx.cross_border { 0.2 } else { 0.0 })
    .clamp(0.0, 1.0);

    let hour = tx.timestamp.hour();
    let time_of_day = if hour < 6 {
        0.9
    } else if hour < 9 || hour > 22 {
        0.5
    } else {
        0.2
    };

    Features {
        amount: (amount_f64 / AMOUNT_NORMALIZATION_SCALE).tanh().clamp(0.0, 1.0),
        merchant_risk: policy.get_merchant_risk(&tx.merchant_id).clamp(0.0, 1.0),
        geo_velocity,
        device_trust: (1.0 - profile.behavior.device_trust).clamp(0.0, 1.0),
        behavior_anomaly: profile.behavior.anomaly_score.clamp(0.0, 1.0),
        user_history: profile
            .fraud_history
            .current_score
            .max(profile.fraud_history.mean_30_day)
            .clamp(0.0, 1.0),
        time_of_day,
        network_analysis: hash_to_unit(&tx.source_ip),
        bin_analysis: hash_to_unit(&tx.device_fingerprint),
    }
}

/// An opaque ML predictor. Two are blended; if one fails the surviving
/// prediction is used, and if both fail the scorer degrades to the
/// rule-based score alone.
#[async_trait]
pub trait MlPredictor: Send + Sync {
    async fn predict(&self, tx: &Transaction, profile: &UserProfile, features: &Features) -> Result<f64>;
}

fn is_holiday(month: u32, day: u32) -> bool {
    matches!((month, day), (1, 1) | (7, 4) | (12, 25))
}

struct LevelScaleState {
    critical: f64,
    high: f64,
    medium: f64,
}

impl Default for LevelScaleState {
    fn default() -> Self {
        Self {
            critical: 1.0,
            high: 1.0,
            medium: 1.0,
        }
    }
}

impl LevelScaleState {
    fn factor_for(&self, level: RiskLevel) -> f64 {
        match level {
            RiskLevel::Critical => self.critical,
            RiskLevel::High => self.high,
            RiskLevel::Medium => self.medium,
            RiskLevel::Low => 1.0,
        }
    }
}

pub struct RiskScorer {
    config: RiskConfig,
    predictors: Vec<std::sync::Arc<dyn MlPredictor>>,
    last_scored_at: Mutex<Option<std::time::Instant>>,
    level_scale: RwLock<LevelScaleState>,
    history: Mutex<VecDeque<(String, RiskLevel, f64)>>,
    history_capacity: usize,
    /// Ground-truth labels fed back via `record_outcome`, keyed by
    /// transaction id. Entries are dropped once their transaction ages
    /// out of `history`, so this never grows past `history_capacity`.
    outcomes: Mutex<HashMap<String, bool>>,
}

impl RiskScorer {
    pub fn new(config: RiskConfig, predictors: Vec<std::sync::Arc<dyn MlPredictor>>) -> Self {
        let history_capacity = config.recalibration_window;
        Self {
            config,
            predictors,
            last_scored_at: Mutex::new(None),
            level_scale: RwLock::new(LevelScaleState::default()),
            history: Mutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity,
            outcomes: Mutex::new(HashMap::new()),
        }
    }

    /// Feeds a confirmed fraud/legitimate label back into the
    /// recalibration window so `recalibrate` weighs ground truth over
    /// the predicted level for transactions it has a label for.
    pub fn record_outcome(&self, tx_id: &str, was_fraud: bool) {
        self.outcomes.lock().insert(tx_id.to_string(), was_fraud);
    }

    fn level(&self, s: f64) -> RiskLevel {
        let t = &self.config.thresholds;
        let h = &self.config.hysteresis;
        if s > t.critical - h.critical {
            RiskLevel::Critical
        } else if s > t.high - h.high {
            RiskLevel::High
        } else if s > t.medium - h.medium {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    fn actions_for(&self, level: RiskLevel) -> HashSet<RiskAction> {
        use RiskAction::*;
        match level {
            RiskLevel::Low => HashSet::from([Approve]),
            RiskLevel::Medium => HashSet::from([ManualReview]),
            RiskLevel::High => HashSet::from([ManualReview, ManagerApproval]),
            RiskLevel::Critical => HashSet::from([
                Block,
                FreezeAccount,
                AlertSoc,
                ManagerApproval,
                EnhancedKycCheck,
            ]),
        }
    }

    async fn ml_score(&self, tx: &Transaction, profile: &UserProfile, features: &Features) -> (f64, bool) {
        let mut successes = Vec::new();
        for predictor in &self.predictors {
            match predictor.predict(tx, profile, features).await {
                Ok(score) => successes.push(score.clamp(0.0, 1.0)),
                Err(err) => warn!(error = %err, "ml predictor failed, continuing with survivors"),
            }
        }
        if successes.is_empty() {
            (0.0, true)
        } else {
            (successes.iter().sum::<f64>() / successes.len() as f64, false)
        }
    }

    pub async fn score(
        &self,
        tx: &Transaction,
        profile: &UserProfile,
        policy: &PolicyRules,
        large_amount_threshold: Decimal,
    ) -> Result<RiskAssessment> {
        let features = extract_features(tx, profile, policy);
        let rule_score = features.weighted_sum(&self.config.weights);
        let (ml_raw, ml_failed) = self.ml_score(tx, profile, &features).await;
        let ml_score = if ml_failed { rule_score } else { ml_raw };

        let delta_t = {
            let mut last = self.last_scored_at.lock();
            let now = std::time::Instant::now();
            let delta = last.map(|t| now.duration_since(t).as_secs_f64()).unwrap_or(3600.0);
            *last = Some(now);
            delta
        };

        let combined = (0.7 * ml_score + 0.3 * rule_score * (1.0 + (delta_t / 3600.0).tanh())).clamp(0.0, 1.0);

        let mut a = 1.0_f64;
        let hour = tx.timestamp.hour();
        if hour < 6 {
            a *= 1.15;
        }
        a *= policy.get_location_risk(&tx.geo_code);
        if policy.is_blacklisted(&tx.merchant_id) {
            a *= 1.25;
        }
        let recent_velocity_flag = profile.spending_velocity > large_amount_threshold;
        if recent_velocity_flag {
            a *= 1.30;
        }
        if is_holiday(tx.timestamp.month(), tx.timestamp.day()) {
            a *= 1.10;
        }

        let scale_key = self.level(combined);
        let level_scale_factor = self.level_scale.read().factor_for(scale_key);
        let adjusted = (combined * a * level_scale_factor).min(1.0);
        let level = self.level(adjusted);

        let mut actions = self.actions_for(level);
        if policy.is_blacklisted(&tx.merchant_id) {
            actions.insert(RiskAction::AlertSoc);
        }
        if tx.cross_border {
            actions.insert(RiskAction::EnhancedKycCheck);
        }
        if tx.amount > large_amount_threshold {
            actions.insert(RiskAction::ManagerApproval);
        }
        let mut actions: Vec<RiskAction> = actions.into_iter().collect();
        actions.sort();

        self.record_history(&tx.id, level, adjusted);

        Ok(RiskAssessment {
            user_id: tx.user_id.clone(),
            raw_score: combined,
            adjusted_score: adjusted,
            level,
            actions,
            factors: RiskFactors {
                contextual_multiplier: a,
                level_scale: level_scale_factor,
                combined_score: combined,
            },
            degraded: ml_failed,
        })
    }

    /// Rule-only fallback used when the ML dependency's circuit breaker
    /// is open. Skips the blend entirely instead of calling predictors.
    pub fn fallback_rule_only(
        &self,
        tx: &Transaction,
        profile: &UserProfile,
        policy: &PolicyRules,
        large_amount_threshold: Decimal,
    ) -> RiskAssessment {
        let features = extract_features(tx, profile, policy);
        let rule_score = features.weighted_sum(&self.config.weights);
        let level = self.level(rule_score);
        let mut actions: Vec<RiskAction> = self.actions_for(level).into_iter().collect();
        actions.sort();
        self.record_history(&tx.id, level, rule_score);
        RiskAssessment {
            user_id: tx.user_id.clone(),
            raw_score: rule_score,
            adjusted_score: rule_score,
            level,
            actions,
            factors: RiskFactors {
                contextual_multiplier: 1.0,
                level_scale: 1.0,
                combined_score: rule_score,
            },
            degraded: true,
        }
    }

    fn record_history(&self, tx_id: &str, level: RiskLevel, score: f64) {
        let mut history = self.history.lock();
        if history.len() >= self.history_capacity {
            if let Some((evicted_id, _, _)) = history.pop_front() {
                self.outcomes.lock().remove(&evicted_id);
            }
        }
        history.push_back((tx_id.to_string(), level, score));
    }

    /// Recomputes `critical`/`high`/`medium` level-scale factors from
    /// the last `recalibration_window` scores against the configured
    /// target fraud rate. Intended to run every `recalibration_interval`.
    /// Transactions with a confirmed outcome (`record_outcome`) weigh in
    /// with their ground-truth label instead of the predicted level.
    pub fn recalibrate(&self) {
        let history = self.history.lock();
        if history.is_empty() {
            return;
        }
        let outcomes = self.outcomes.lock();
        let total = history.len() as f64;
        let target = self.config.target_fraud_rate;
        let mut scale = self.level_scale.write();
        for level in [RiskLevel::Critical, RiskLevel::High, RiskLevel::Medium] {
            let flagged = history
                .iter()
                .filter(|(tx_id, lvl, _)| outcomes.get(tx_id).copied().unwrap_or(*lvl >= level))
                .count() as f64;
            let rate = flagged / total;
            let step = if rate > target { -0.05 } else { 0.05 };
            let current = match level {
                RiskLevel::Critical => &mut scale.critical,
                RiskLevel::High => &mut scale.high,
                RiskLevel::Medium => &mut scale.medium,
                RiskLevel::Low => unreachable!(),
            };
            *current = (*current + step).clamp(0.5, 1.5);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PolicyConfig;
    use crate::model::{now_ts, TransactionStatus};
    use rust_decimal_macros::dec;

    fn sample_policy() -> PolicyRules {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(
            &path,
            r#"{"global":{"default_constraints":{},"default_merchant_risk":0.1,"blacklist_merchants":["BLACK"],"category_rules":{},"merchant_risk":{}},"locations":{}}"#,
        )
        .unwrap();
        let config = PolicyConfig {
            rules_path: path.to_string_lossy().to_string(),
            poll_interval_secs: 5,
            merchant_risk_cache_size: 16,
        };
        let rules = PolicyRules::load(&config).unwrap();
        std::mem::forget(dir);
        rules
    }

    fn sample_tx(merchant: &str, amount: rust_decimal::Decimal, cross_border: bool) -> Transaction {
        Transaction {
            id: "t1".into(),
            user_id: "u1".into(),
            amount,
            currency: "USD".into(),
            merchant_id: merchant.into(),
            merchant_category: "retail".into(),
            timestamp: now_ts(),
            device_fingerprint: "d1".into(),
            source_ip: "10.0.0.1".into(),
            geo_code: "US".into(),
            cross_border,
            decoy_marker: None,
            status: TransactionStatus::Pending,
        }
    }

    #[tokio::test]
    async fn low_risk_transaction_approves() {
        let scorer = RiskScorer::new(RiskConfig::default(), Vec::new());
        let policy = sample_policy();
        let profile = UserProfile::default_for("u1");
        let tx = sample_tx("M1", dec!(50), false);
        let assessment = scorer.score(&tx, &profile, &policy, dec!(10000)).await.unwrap();
        assert!(assessment.raw_score >= 0.0 && assessment.raw_score <= 1.0);
        assert_eq!(assessment.level, RiskLevel::Low);
        assert!(assessment.actions.contains(&RiskAction::Approve));
    }

    #[tokio::test]
    async fn blacklisted_merchant_escalates_actions() {
        let scorer = RiskScorer::new(RiskConfig::default(), Vec::new());
        let policy = sample_policy();
        let mut profile = UserProfile::default_for("u2");
        profile.behavior.anomaly_score = 0.95;
        profile.fraud_history.current_score = 0.95;
        let tx = sample_tx("BLACK", dec!(15000), true);
        let assessment = scorer.score(&tx, &profile, &policy, dec!(10000)).await.unwrap();
        assert!(assessment.actions.contains(&RiskAction::AlertSoc));
        assert!(assessment.actions.contains(&RiskAction::EnhancedKycCheck));
    }

    #[test]
    fn hysteresis_boundary_is_strict() {
        let mut config = RiskConfig::default();
        config.hysteresis = RiskHysteresis {
            critical: 0.0,
            high: 0.0,
            medium: 0.0,
        };
        let scorer = RiskScorer::new(config.clone(), Vec::new());
        let exact = config.thresholds.critical;
        assert_ne!(scorer.level(exact), RiskLevel::Critical);
        assert_eq!(scorer.level(exact + 0.001), RiskLevel::Critical);
    }

    #[test]
    fn recalibration_clips_to_bounds() {
        let scorer = RiskScorer::new(RiskConfig::default(), Vec::new());
        for i in 0..200 {
            scorer.record_history(&format!("tx-{i}"), RiskLevel::Critical, 0.95);
        }
        for _ in 0..50 {
            scorer.recalibrate();
        }
        let scale = scorer.level_scale.read();
        assert!(scale.critical >= 0.5 && scale.critical <= 1.5);
    }

    #[test]
    fn recorded_outcome_overrides_predicted_level_in_recalibration() {
        // Both scorers see the same (under-predicted) history: every
        // transaction scored Low. One is additionally told every one of
        // them was confirmed fraud; recalibration should treat that
        // differently from trusting the Low prediction at face value.
        let without_outcomes = RiskScorer::new(RiskConfig::default(), Vec::new());
        let with_outcomes = RiskScorer::new(RiskConfig::default(), Vec::new());
        for i in 0..50 {
            without_outcomes.record_history(&format!("tx-{i}"), RiskLevel::Low, 0.05);
            with_outcomes.record_history(&format!("tx-{i}"), RiskLevel::Low, 0.05);
            with_outcomes.record_outcome(&format!("tx-{i}"), true);
        }
        without_outcomes.recalibrate();
        with_outcomes.recalibrate();
        assert_ne!(
            without_outcomes.level_scale.read().medium,
            with_outcomes.level_scale.read().medium
        );
    }
}
