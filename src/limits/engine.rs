//! Adaptive per-user spend limits.
//!
//! `target = base·(1−risk)·market_factor`; `adjusted = current +
//! (target−current)·behavior_factor`; `new = max(0, adjusted·(1−decay))`.
//! Every coefficient below is load-bearing, not a placeholder.

use dashmap::DashMap;
use rust_decimal::prelude::*;
use tracing::debug;

use crate::config::LimitsConfig;
use crate::error::{Error, Result};
use crate::model::{now_ts, LimitHistorySample, LimitSet, MarketConditions, UserLimitState};
use crate::policy::PolicyRules;

pub struct LimitEngine {
    config: LimitsConfig,
    states: DashMap<String, UserLimitState>,
}

fn behavior_factor(consecutive_approvals: u32, recent_declines: u32) -> f64 {
    if consecutive_approvals > 5 {
        0.2
    } else if recent_declines > 3 {
        -0.3
    } else {
        0.1
    }
}

fn market_factor(market: &MarketConditions) -> f64 {
    let product = (1.0 - market.fraud_index) * market.economic_index * (1.0 - market.volatility);
    product.max(0.0).cbrt()
}

fn decay_factor(history: &std::collections::VecDeque<LimitHistorySample>, decay_rate: f64) -> f64 {
    if history.len() < 3 {
        return 0.0;
    }
    let last_three: f64 = history.iter().rev().take(3).map(|s| s.usage).sum::<f64>() / 3.0;
    (last_three * decay_rate).min(1.0)
}

fn adjust_one(base: Decimal, current: Decimal, risk: f64, market_f: f64, behavior_f: f64, decay_f: f64) -> Decimal {
    let base_f = base.to_f64().unwrap_or(0.0);
    let current_f = current.to_f64().unwrap_or(0.0);
    let target = base_f * (1.0 - risk) * market_f;
    let adjusted = current_f + (target - current_f) * behavior_f;
    let new_value = (adjusted * (1.0 - decay_f)).max(0.0);
    Decimal::from_f64(new_value).unwrap_or(Decimal::ZERO)
}

impl LimitEngine {
    pub fn new(config: LimitsConfig) -> Self {
        Self {
            config,
            states: DashMap::new(),
        }
    }

    fn base_limits(&self) -> LimitSet {
        LimitSet {
            daily: self.config.base.daily,
            transaction: self.config.base.transaction,
            weekly: self.config.base.weekly,
        }
    }

    pub fn compute_new_limits(
        &self,
        user_id: &str,
        risk_score: f64,
        market: &MarketConditions,
        policy: &PolicyRules,
        location: &str,
        usage_ratio: f64,
    ) -> Result<LimitSet> {
        let risk = risk_score.clamp(0.0, 1.0);
        let base = self.base_limits();
        let history_window = self.config.history_window;

        let mut entry = self
            .states
            .entry(user_id.to_string())
            .or_insert_with(|| UserLimitState::new(base, history_window));

        let market_f = market_factor(market);
        let behavior_f = behavior_factor(entry.consecutive_approvals, entry.recent_declines);
        let decay_f = decay_factor(&entry.history, self.config.decay_rate);

        let new_daily = adjust_one(base.daily, entry.current.daily, risk, market_f, behavior_f, decay_f);
        let new_transaction = adjust_one(
            base.transaction,
            entry.current.transaction,
            risk,
            market_f,
            behavior_f,
            decay_f,
        );
        let new_weekly = adjust_one(base.weekly, entry.current.weekly, risk, market_f, behavior_f, decay_f);

        let constraints = policy.get_location_constraints(location);
        let capped = LimitSet {
            daily: constraints.daily.map_or(new_daily, |c| new_daily.min(c)),
            transaction: constraints.transaction.map_or(new_transaction, |c| new_transaction.min(c)),
            weekly: constraints.weekly.map_or(new_weekly, |c| new_weekly.min(c)),
        }
        .clamp_to_invariant(self.config.policy_slack);

        let delta_sign = (capped.daily - entry.current.daily).signum();
        if delta_sign > Decimal::ZERO {
            entry.consecutive_approvals += 1;
            entry.recent_declines = 0;
        } else if delta_sign < Decimal::ZERO {
            entry.recent_declines += 1;
            entry.consecutive_approvals = 0;
        }

        entry.push_sample(LimitHistorySample {
            timestamp: now_ts(),
            risk_score: risk,
            market: market.clone(),
            usage: usage_ratio.clamp(0.0, 1.0),
        });
        entry.current = capped;

        if !capped.is_consistent(self.config.policy_slack) {
            return Err(Error::LimitComputation {
                user_id: user_id.to_string(),
                reason: "computed limit set violates transaction<=daily<=weekly invariant".into(),
            });
        }

        Ok(capped)
    }

    pub fn current_limits(&self, user_id: &str) -> LimitSet {
        self.states
            .get(user_id)
            .map(|s| s.current)
            .unwrap_or_else(|| self.base_limits())
    }

    /// Admin override: resets a user back to base limits and clears
    /// accumulated behavior counters and history.
    pub fn reset_user_state(&self, user_id: &str) {
        self.states.remove(user_id);
        debug!(user_id, "limit state reset to base");
    }

    /// Background janitor: drops state for users inactive beyond
    /// `inactive_days`, freeing memory for dormant accounts.
    pub fn drop_inactive(&self) -> usize {
        let now = now_ts();
        let inactive_days = self.config.inactive_days;
        let stale: Vec<String> = self
            .states
            .iter()
            .filter(|e| e.value().is_inactive(now, inactive_days))
            .map(|e| e.key().clone())
            .collect();
        let count = stale.len();
        for key in stale {
            self.states.remove(&key);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn test_config() -> LimitsConfig {
        LimitsConfig {
            base: crate::config::BaseLimits {
                daily: dec!(5000),
                transaction: dec!(1000),
                weekly: dec!(35000),
            },
            decay_rate: 0.1,
            history_window: 30,
            policy_slack: dec!(1.1),
            inactive_days: 30,
        }
    }

    fn sample_policy() -> PolicyRules {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        std::fs::write(
            &path,
            r#"{"global":{"default_constraints":{},"default_merchant_risk":0.1,"blacklist_merchants":[],"category_rules":{},"merchant_risk":{}},"locations":{}}"#,
        )
        .unwrap();
        let config = crate::config::PolicyConfig {
            rules_path: path.to_string_lossy().to_string(),
            poll_interval_secs: 5,
            merchant_risk_cache_size: 16,
        };
        let rules = PolicyRules::load(&config).unwrap();
        std::mem::forget(dir);
        rules
    }

    #[test]
    fn ordinary_approval_expands_limits_slightly() {
        let engine = LimitEngine::new(test_config());
        let policy = sample_policy();
        let market = MarketConditions {
            fraud_index: 0.15,
            economic_index: 0.92,
            volatility: 0.30,
        };
        let result = engine
            .compute_new_limits("u1", 0.35, &market, &policy, "US", 0.2)
            .unwrap();
        // behavior_factor defaults to +0.1 (first transaction, no streaks yet)
        // so the new daily limit should move toward the target, staying
        // within a reasonable band of the base.
        assert!(result.daily > Decimal::ZERO);
        assert!(result.daily <= dec!(5000));
    }

    #[test]
    fn critical_risk_shrinks_limits() {
        let engine = LimitEngine::new(test_config());
        let policy = sample_policy();
        let market = MarketConditions {
            fraud_index: 0.15,
            economic_index: 0.92,
            volatility: 0.30,
        };
        let result = engine
            .compute_new_limits("u2", 0.96, &market, &policy, "US", 0.2)
            .unwrap();
        assert!(result.daily < dec!(5000));
    }

    #[test]
    fn consecutive_approvals_shift_behavior_factor() {
        let engine = LimitEngine::new(test_config());
        let policy = sample_policy();
        let market = MarketConditions::default();
        for _ in 0..7 {
            engine
                .compute_new_limits("u3", 0.1, &market, &policy, "US", 0.0)
                .unwrap();
        }
        let state_approvals = engine.states.get("u3").unwrap().consecutive_approvals;
        assert!(state_approvals > 5);
    }

    #[test]
    fn decay_factor_zero_until_three_samples() {
        let history = std::collections::VecDeque::new();
        assert_eq!(decay_factor(&history, 0.5), 0.0);
    }

    #[test]
    fn reset_user_state_clears_history() {
        let engine = LimitEngine::new(test_config());
        let policy = sample_policy();
        let market = MarketConditions::default();
        engine
            .compute_new_limits("u4", 0.2, &market, &policy, "US", 0.1)
            .unwrap();
        assert!(engine.states.contains_key("u4"));
        engine.reset_user_state("u4");
        assert!(!engine.states.contains_key("u4"));
    }
}
