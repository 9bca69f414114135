//! Core data types shared across the pipeline: transactions, profiles,
//! limits, and risk assessments. Closed record types so a missing field
//! is a compile error rather than a runtime surprise.

use std::collections::{HashSet, VecDeque};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub fn now_ts() -> DateTime<Utc> {
    Utc::now()
}

pub fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransactionStatus {
    Pending,
    Safe,
    Locked,
    Invalidated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub user_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub merchant_id: String,
    pub merchant_category: String,
    pub timestamp: DateTime<Utc>,
    pub device_fingerprint: String,
    pub source_ip: String,
    pub geo_code: String,
    pub cross_border: bool,
    pub decoy_marker: Option<String>,
    pub status: TransactionStatus,
}

impl Transaction {
    /// Validates required invariants before the transaction is allowed to
    /// enter any queue. A failure here is a permanent-input rejection.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("transaction id must not be empty".into());
        }
        if self.user_id.is_empty() {
            return Err("user_id must not be empty".into());
        }
        if self.amount.is_sign_negative() {
            return Err("amount must not be negative".into());
        }
        if self.merchant_id.is_empty() {
            return Err("merchant_id must not be empty".into());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BehaviorProfile {
    pub anomaly_score: f64,
    pub session_risk: f64,
    pub device_trust: f64,
    pub swipe_speed: f64,
    pub phone_angle: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FraudHistory {
    pub current_score: f64,
    pub mean_30_day: f64,
    pub last_incident: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpendingProfile {
    pub recent_transactions: Vec<Decimal>,
    pub common_categories: Vec<String>,
    pub daily_aggregate: Decimal,
    pub weekly_aggregate: Decimal,
}

/// Which sub-profiles were live (fetched) vs. defaulted on this load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProfileSource {
    Behavior,
    FraudHistory,
    Spending,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub behavior: BehaviorProfile,
    pub fraud_history: FraudHistory,
    pub spending: SpendingProfile,
    pub sources_used: HashSet<ProfileSource>,
    /// Money moved in the trailing 60 minutes; computed, not fetched.
    pub spending_velocity: Decimal,
}

impl UserProfile {
    pub fn default_for(user_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            sources_used: HashSet::new(),
            ..Default::default()
        }
    }

    /// Weighted mean of behavior, fraud, and spending sub-scores in [0,1].
    pub fn composite_risk(&self) -> f64 {
        let behavior = (self.behavior.anomaly_score + self.behavior.session_risk) / 2.0;
        let fraud = self.fraud_history.current_score.max(self.fraud_history.mean_30_day);
        let spending = if self.spending.weekly_aggregate > Decimal::ZERO {
            (self.spending.daily_aggregate / self.spending.weekly_aggregate)
                .min(Decimal::ONE)
                .to_string()
                .parse::<f64>()
                .unwrap_or(0.0)
        } else {
            0.0
        };
        let composite = 0.5 * behavior + 0.35 * fraud + 0.15 * spending;
        composite.clamp(0.0, 1.0)
    }

    pub fn is_degraded(&self) -> bool {
        self.sources_used.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LimitSet {
    pub daily: Decimal,
    pub transaction: Decimal,
    pub weekly: Decimal,
}

impl LimitSet {
    /// `policy_slack` widens the weekly/7 envelope transaction is checked
    /// against: transaction <= daily <= weekly/7 * slack.
    pub fn is_consistent(&self, policy_slack: Decimal) -> bool {
        self.transaction >= Decimal::ZERO
            && self.daily >= Decimal::ZERO
            && self.weekly >= Decimal::ZERO
            && self.transaction <= self.daily
            && self.daily <= (self.weekly / Decimal::from(7)) * policy_slack
    }

    pub fn clamp_to_invariant(mut self, policy_slack: Decimal) -> Self {
        self.daily = self.daily.max(Decimal::ZERO);
        self.transaction = self.transaction.max(Decimal::ZERO).min(self.daily);
        let weekly_cap = (self.weekly / Decimal::from(7)) * policy_slack;
        if self.daily > weekly_cap && weekly_cap >= Decimal::ZERO {
            self.daily = weekly_cap;
            self.transaction = self.transaction.min(self.daily);
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConditions {
    pub fraud_index: f64,
    pub economic_index: f64,
    pub volatility: f64,
}

impl Default for MarketConditions {
    fn default() -> Self {
        Self {
            fraud_index: 0.15,
            economic_index: 0.92,
            volatility: 0.30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitHistorySample {
    pub timestamp: DateTime<Utc>,
    pub risk_score: f64,
    pub market: MarketConditions,
    pub usage: f64,
}

#[derive(Debug, Clone)]
pub struct UserLimitState {
    pub current: LimitSet,
    pub history: VecDeque<LimitHistorySample>,
    pub history_capacity: usize,
    pub consecutive_approvals: u32,
    pub recent_declines: u32,
    pub last_updated: DateTime<Utc>,
}

impl UserLimitState {
    pub fn new(base: LimitSet, history_capacity: usize) -> Self {
        Self {
            current: base,
            history: VecDeque::with_capacity(history_capacity),
            history_capacity,
            consecutive_approvals: 0,
            recent_declines: 0,
            last_updated: now_ts(),
        }
    }

    pub fn push_sample(&mut self, sample: LimitHistorySample) {
        if self.history.len() >= self.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(sample);
        self.last_updated = now_ts();
    }

    pub fn is_inactive(&self, now: DateTime<Utc>, inactive_days: i64) -> bool {
        (now - self.last_updated).num_days() >= inactive_days
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskAction {
    Approve,
    ManualReview,
    Block,
    FreezeAccount,
    AlertSoc,
    ManagerApproval,
    EnhancedKycCheck,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskFactors {
    pub contextual_multiplier: f64,
    pub level_scale: f64,
    pub combined_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    pub user_id: String,
    pub raw_score: f64,
    pub adjusted_score: f64,
    pub level: RiskLevel,
    pub actions: Vec<RiskAction>,
    pub factors: RiskFactors,
    /// True when produced by the rule-only fallback path (ML blend down).
    pub degraded: bool,
}

pub fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}
