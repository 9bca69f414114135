//! Policy Rules (C4): hot-reloadable ruleset consulted by the Risk
//! Scorer and Limit Engine.

pub mod rules;

pub use rules::{LocationConstraints, MerchantCategoryRule, MergedRules, PolicyRules, RawRuleSet};
