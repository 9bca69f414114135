//! Holds the current ruleset behind an atomically-replaceable snapshot.
//! A background watcher polls the backing file's mtime every 5 s; a
//! parse/validate failure on reload logs and keeps the previous
//! snapshot in force rather than tearing anything down.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::time::SystemTime;

use arc_swap::ArcSwap;
use lru::LruCache;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::{error, warn};

use crate::config::PolicyConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LocationConstraints {
    pub daily: Option<Decimal>,
    pub transaction: Option<Decimal>,
    pub weekly: Option<Decimal>,
}

impl LocationConstraints {
    /// Location-specific fields win; missing fields fall back to the
    /// global default.
    fn merged_over(self, default: LocationConstraints) -> LocationConstraints {
        LocationConstraints {
            daily: self.daily.or(default.daily),
            transaction: self.transaction.or(default.transaction),
            weekly: self.weekly.or(default.weekly),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MerchantCategoryRule {
    pub risk_multiplier: f64,
    pub max_transaction: Option<Decimal>,
    pub requires_review: bool,
}

impl MerchantCategoryRule {
    fn merged_over(self, default: Option<&MerchantCategoryRule>) -> MerchantCategoryRule {
        match default {
            None => self,
            Some(d) => MerchantCategoryRule {
                risk_multiplier: if self.risk_multiplier != 0.0 {
                    self.risk_multiplier
                } else {
                    d.risk_multiplier
                },
                max_transaction: self.max_transaction.or(d.max_transaction),
                requires_review: self.requires_review || d.requires_review,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalRules {
    pub default_constraints: LocationConstraints,
    pub default_merchant_risk: f64,
    #[serde(default)]
    pub blacklist_merchants: Vec<String>,
    #[serde(default)]
    pub category_rules: HashMap<String, MerchantCategoryRule>,
    #[serde(default)]
    pub merchant_risk: HashMap<String, f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocationRules {
    #[serde(default)]
    pub constraints: LocationConstraints,
    pub location_risk: Option<f64>,
    #[serde(default)]
    pub merchant_risk: HashMap<String, f64>,
    #[serde(default)]
    pub category_rules: HashMap<String, MerchantCategoryRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRuleSet {
    pub global: GlobalRules,
    #[serde(default)]
    pub locations: HashMap<String, LocationRules>,
}

impl RawRuleSet {
    /// Required-keys check. `global` is already required by serde to
    /// parse at all; this additionally rejects values that parsed but
    /// are semantically nonsensical.
    fn validate(&self) -> Result<()> {
        if self.global.default_merchant_risk < 0.0 {
            return Err(Error::PolicyInvalid(
                "global.default_merchant_risk must be non-negative".into(),
            ));
        }
        for (name, rule) in &self.global.category_rules {
            if rule.risk_multiplier < 0.0 {
                return Err(Error::PolicyInvalid(format!(
                    "category rule {name} has negative risk_multiplier"
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MergedRules {
    pub constraints: LocationConstraints,
    pub category_rule: MerchantCategoryRule,
    pub location_risk: f64,
}

pub struct PolicyRules {
    snapshot: ArcSwap<RawRuleSet>,
    path: PathBuf,
    last_mtime: StdMutex<Option<SystemTime>>,
    merchant_risk_cache: StdMutex<LruCache<String, f64>>,
}

impl PolicyRules {
    pub fn load(config: &PolicyConfig) -> Result<Self> {
        let path = PathBuf::from(&config.rules_path);
        let (ruleset, mtime) = Self::read_and_validate(&path)?;
        let cache_size = NonZeroUsize::new(config.merchant_risk_cache_size.max(1)).unwrap();
        Ok(Self {
            snapshot: ArcSwap::from_pointee(ruleset),
            path,
            last_mtime: StdMutex::new(mtime),
            merchant_risk_cache: StdMutex::new(LruCache::new(cache_size)),
        })
    }

    fn read_and_validate(path: &Path) -> Result<(RawRuleSet, Option<SystemTime>)> {
        let text = std::fs::read_to_string(path)?;
        let ruleset: RawRuleSet = serde_json::from_str(&text)
            .map_err(|e| Error::PolicyInvalid(format!("{}: {e}", path.display())))?;
        ruleset.validate()?;
        let mtime = std::fs::metadata(path).ok().and_then(|m| m.modified().ok());
        Ok((ruleset, mtime))
    }

    /// Checks the file's mtime and reloads if it changed. Returns
    /// `true` if a new snapshot was installed. A parse/validation
    /// failure is logged and the previous snapshot stays in force.
    pub fn poll_once(&self) -> bool {
        let current_mtime = std::fs::metadata(&self.path).ok().and_then(|m| m.modified().ok());
        let mut last = self.last_mtime.lock().unwrap();
        if current_mtime == *last {
            return false;
        }
        match Self::read_and_validate(&self.path) {
            Ok((ruleset, mtime)) => {
                self.snapshot.store(Arc::new(ruleset));
                self.merchant_risk_cache.lock().unwrap().clear();
                *last = mtime;
                true
            }
            Err(err) => {
                error!(error = %err, path = %self.path.display(), "policy reload rejected, keeping previous snapshot");
                *last = current_mtime;
                false
            }
        }
    }

    pub async fn run_watcher(self: Arc<Self>, poll_interval: std::time::Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => { self.poll_once(); }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    pub fn get_rules(&self, location: &str, category: &str) -> MergedRules {
        let snapshot = self.snapshot.load();
        let location_rules = snapshot.locations.get(location);

        let constraints = location_rules
            .map(|l| l.constraints)
            .unwrap_or_default()
            .merged_over(snapshot.global.default_constraints);

        let global_category = snapshot.global.category_rules.get(category);
        let category_rule = location_rules
            .and_then(|l| l.category_rules.get(category).cloned())
            .unwrap_or_default()
            .merged_over(global_category);

        let location_risk = location_rules.and_then(|l| l.location_risk).unwrap_or(1.0);

        MergedRules {
            constraints,
            category_rule,
            location_risk,
        }
    }

    pub fn get_location_constraints(&self, location: &str) -> LocationConstraints {
        let snapshot = self.snapshot.load();
        snapshot
            .locations
            .get(location)
            .map(|l| l.constraints)
            .unwrap_or_default()
            .merged_over(snapshot.global.default_constraints)
    }

    pub fn get_location_risk(&self, location: &str) -> f64 {
        let snapshot = self.snapshot.load();
        snapshot
            .locations
            .get(location)
            .and_then(|l| l.location_risk)
            .unwrap_or(1.0)
    }

    /// Cached merchant risk lookup; blacklisted merchants always read
    /// 1.0 regardless of the configured table.
    pub fn get_merchant_risk(&self, merchant_id: &str) -> f64 {
        if let Some(cached) = self.merchant_risk_cache.lock().unwrap().get(merchant_id) {
            return *cached;
        }
        let snapshot = self.snapshot.load();
        let risk = if snapshot
            .global
            .blacklist_merchants
            .iter()
            .any(|m| m == merchant_id)
        {
            1.0
        } else {
            snapshot
                .locations
                .values()
                .find_map(|l| l.merchant_risk.get(merchant_id).copied())
                .or_else(|| snapshot.global.merchant_risk.get(merchant_id).copied())
                .unwrap_or(snapshot.global.default_merchant_risk)
        };
        self.merchant_risk_cache
            .lock()
            .unwrap()
            .put(merchant_id.to_string(), risk);
        risk
    }

    pub fn is_blacklisted(&self, merchant_id: &str) -> bool {
        self.snapshot
            .load()
            .global
            .blacklist_merchants
            .iter()
            .any(|m| m == merchant_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_ruleset(path: &Path, default_merchant_risk: f64) {
        let json = format!(
            r#"{{
                "global": {{
                    "default_constraints": {{"daily": "5000", "transaction": "1000", "weekly": "35000"}},
                    "default_merchant_risk": {default_merchant_risk},
                    "blacklist_merchants": ["MERC_BLACK_123"],
                    "category_rules": {{"gambling": {{"risk_multiplier": 1.5, "requires_review": true}}}},
                    "merchant_risk": {{}}
                }},
                "locations": {{
                    "NG": {{"location_risk": 1.4, "constraints": {{"daily": "2000"}}}}
                }}
            }}"#
        );
        std::fs::write(path, json).unwrap();
    }

    #[test]
    fn loads_and_merges_location_over_global() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        write_ruleset(&path, 0.2);
        let config = PolicyConfig {
            rules_path: path.to_string_lossy().to_string(),
            poll_interval_secs: 5,
            merchant_risk_cache_size: 8,
        };
        let rules = PolicyRules::load(&config).unwrap();
        let merged = rules.get_rules("NG", "gambling");
        assert_eq!(merged.constraints.daily, Some(Decimal::new(2000, 0)));
        assert_eq!(merged.constraints.transaction, Some(Decimal::new(1000, 0)));
        assert!(merged.category_rule.requires_review);
        assert_eq!(rules.get_location_risk("NG"), 1.4);
        assert_eq!(rules.get_location_risk("US"), 1.0);
    }

    #[test]
    fn blacklisted_merchant_risk_is_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        write_ruleset(&path, 0.2);
        let config = PolicyConfig {
            rules_path: path.to_string_lossy().to_string(),
            poll_interval_secs: 5,
            merchant_risk_cache_size: 8,
        };
        let rules = PolicyRules::load(&config).unwrap();
        assert_eq!(rules.get_merchant_risk("MERC_BLACK_123"), 1.0);
        assert_eq!(rules.get_merchant_risk("unknown"), 0.2);
    }

    #[test]
    fn invalid_reload_keeps_previous_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.json");
        write_ruleset(&path, 0.2);
        let config = PolicyConfig {
            rules_path: path.to_string_lossy().to_string(),
            poll_interval_secs: 5,
            merchant_risk_cache_size: 8,
        };
        let rules = PolicyRules::load(&config).unwrap();
        assert_eq!(rules.get_merchant_risk("unknown"), 0.2);

        let mut file = std::fs::OpenOptions::new().write(true).truncate(true).open(&path).unwrap();
        file.write_all(b"not json").unwrap();
        drop(file);

        let reloaded = rules.poll_once();
        assert!(!reloaded);
        assert_eq!(rules.get_merchant_risk("unknown"), 0.2);
    }
}
