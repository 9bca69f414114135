//! Spend Controller (C9): the orchestrator that drives every transaction
//! through profile resolution, risk scoring, limit recomputation, sync,
//! and audit. A fixed pool of workers pull from a shared queue, a
//! dedicated loop handles the emergency lane, and a slow monitor tick
//! adjusts pool behavior from circuit breaker state.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::prelude::*;
use rust_decimal::Decimal;
use sha2::Sha256;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::audit::{AuditEntry, AuditLog};
use crate::cache::ProfileCache;
use crate::config::Config;
use crate::error::Result;
use crate::intake::IntakeQueue;
use crate::limits::{LimitEngine, LimitSync};
use crate::model::{now_ts, LimitSet, MarketConditions, Transaction};
use crate::policy::PolicyRules;
use crate::resilience::circuit_breaker::CircuitBreakerManager;
use crate::risk::RiskScorer;

type HmacSha256 = Hmac<Sha256>;

const MATERIALITY_THRESHOLD: f64 = 0.01;

/// Side effects the controller hands off to the deception subsystem when
/// a transaction is classified emergency. Kept as an abstract signal
/// rather than a direct dependency so C9 never has to import C10/C11
/// directly, matching the "capability interface breaks the cycle" design
/// note.
#[async_trait]
pub trait ContainmentHook: Send + Sync {
    async fn on_emergency(&self, tx: &Transaction);
}

/// No-op default used when no deception subsystem is wired in (e.g. unit
/// tests of the controller alone).
pub struct NoopContainmentHook;

#[async_trait]
impl ContainmentHook for NoopContainmentHook {
    async fn on_emergency(&self, _tx: &Transaction) {}
}

/// External market-data feed. Refreshing it is someone else's job (a
/// pricing/economic-indicator service); the controller only consumes the
/// current snapshot.
#[async_trait]
pub trait MarketConditionsSource: Send + Sync {
    async fn current(&self) -> MarketConditions;
}

pub struct StaticMarketConditions(pub MarketConditions);

#[async_trait]
impl MarketConditionsSource for StaticMarketConditions {
    async fn current(&self) -> MarketConditions {
        self.0.clone()
    }
}

/// Hands every transaction the controller processes to the deception
/// subsystem's best-effort trap analysis queue. Every transaction, not
/// just emergency ones, can be the one that touches a live decoy.
pub trait TrapFeed: Send + Sync {
    fn analyze(&self, tx: &Transaction);
}

pub struct NoopTrapFeed;

impl TrapFeed for NoopTrapFeed {
    fn analyze(&self, _tx: &Transaction) {}
}

fn is_emergency(tx: &Transaction, large_amount_threshold: Decimal) -> bool {
    tx.amount > large_amount_threshold || tx.merchant_category == "chargeback_reversal"
}

/// `max_k |new_k - current_k| / max(1, current_k) >= 0.01`
fn is_material_change(current: &LimitSet, new: &LimitSet) -> bool {
    let one = Decimal::ONE;
    let ratio = |c: Decimal, n: Decimal| -> f64 {
        let denom = c.max(one);
        ((n - c).abs() / denom).to_f64().unwrap_or(0.0)
    };
    let max_ratio = ratio(current.daily, new.daily)
        .max(ratio(current.transaction, new.transaction))
        .max(ratio(current.weekly, new.weekly));
    max_ratio >= MATERIALITY_THRESHOLD
}

fn sign_limits(secret: &str, user_id: &str, limits: &LimitSet) -> String {
    let mut salter = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    salter.update(user_id.as_bytes());
    let salted_key = salter.finalize().into_bytes();

    let mut signer = HmacSha256::new_from_slice(&salted_key).expect("hmac accepts any key length");
    signer.update(limits.daily.to_string().as_bytes());
    signer.update(limits.transaction.to_string().as_bytes());
    signer.update(limits.weekly.to_string().as_bytes());
    hex::encode(signer.finalize().into_bytes())
}

pub struct SpendController {
    config: Config,
    queue: Arc<IntakeQueue>,
    profiles: Arc<ProfileCache>,
    risk: Arc<RiskScorer>,
    limits: Arc<LimitEngine>,
    sync: Arc<LimitSync>,
    audit: Arc<AuditLog>,
    policy: Arc<PolicyRules>,
    breakers: Arc<CircuitBreakerManager>,
    market: Arc<dyn MarketConditionsSource>,
    containment: Arc<dyn ContainmentHook>,
    trap_feed: Arc<dyn TrapFeed>,
    active_workers: AtomicUsize,
}

impl SpendController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        queue: Arc<IntakeQueue>,
        profiles: Arc<ProfileCache>,
        risk: Arc<RiskScorer>,
        limits: Arc<LimitEngine>,
        sync: Arc<LimitSync>,
        audit: Arc<AuditLog>,
        policy: Arc<PolicyRules>,
        breakers: Arc<CircuitBreakerManager>,
        market: Arc<dyn MarketConditionsSource>,
        containment: Arc<dyn ContainmentHook>,
        trap_feed: Arc<dyn TrapFeed>,
    ) -> Self {
        let target_workers = config.controller_workers;
        Self {
            config,
            queue,
            profiles,
            risk,
            limits,
            sync,
            audit,
            policy,
            breakers,
            market,
            containment,
            trap_feed,
            active_workers: AtomicUsize::new(target_workers),
        }
    }

    /// Validates and classifies a transaction into the general priority
    /// queue or the emergency lane.
    pub fn process_transaction(&self, tx: Transaction, priority: i32) -> Result<()> {
        tx.validate().map_err(crate::error::Error::InvalidTransaction)?;
        if is_emergency(&tx, self.config.large_amount_threshold) {
            self.queue.enqueue_emergency(tx)
        } else {
            self.queue.enqueue_general(tx, priority)
        }
    }

    /// Spawns the worker pool, the emergency worker, and the monitor
    /// loop, returning once `shutdown` fires.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut handles = Vec::new();
        for worker_id in 0..self.config.controller_workers {
            let this = self.clone();
            let mut shutdown_rx = shutdown.clone();
            handles.push(tokio::spawn(async move {
                this.general_worker_loop(worker_id, &mut shutdown_rx).await;
            }));
        }

        {
            let this = self.clone();
            let mut shutdown_rx = shutdown.clone();
            handles.push(tokio::spawn(async move {
                this.emergency_worker_loop(&mut shutdown_rx).await;
            }));
        }

        {
            let this = self.clone();
            let mut shutdown_rx = shutdown.clone();
            handles.push(tokio::spawn(async move {
                this.monitor_loop(&mut shutdown_rx).await;
            }));
        }

        let _ = shutdown.changed().await;
        for handle in handles {
            let _ = handle.await;
        }
    }

    async fn general_worker_loop(&self, worker_id: usize, shutdown: &mut watch::Receiver<bool>) {
        let poll_timeout = self.config.poll_timeout();
        loop {
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                item = self.queue.dequeue_general(poll_timeout) => {
                    if let Some(item) = item {
                        self.handle_transaction(item.transaction, false).await;
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!(worker_id, "general worker shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn emergency_worker_loop(&self, shutdown: &mut watch::Receiver<bool>) {
        let poll_timeout = self.config.poll_timeout();
        loop {
            if *shutdown.borrow() {
                return;
            }
            tokio::select! {
                item = self.queue.dequeue_emergency(poll_timeout) => {
                    if let Some(item) = item {
                        self.handle_transaction(item.transaction, true).await;
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

    /// Every 10 s, scans circuit breaker states and scales the reported
    /// active worker count down when dependencies are unhealthy. The
    /// pool itself is fixed-size (tokio tasks are cheap to leave idle);
    /// this only affects how much of it we advertise as doing useful work.
    async fn monitor_loop(&self, shutdown: &mut watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(10));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.breakers.health_tick();
                    let open_count = self.breakers.states().iter().filter(|(_, s)| {
                        matches!(s, crate::resilience::CircuitState::Open)
                    }).count();
                    let target = self.config.controller_workers.saturating_sub(open_count * 4).max(1);
                    self.active_workers.store(target, Ordering::Relaxed);
                    if open_count > 0 {
                        warn!(open_count, target_workers = target, "degraded dependencies, throttling reported capacity");
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

    pub fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::Relaxed)
    }

    /// Applies a fraud-score-triggered scale-down from the shadow
    /// session subsystem through the normal sync + audit path, skipping
    /// the materiality check since the caller has already decided this
    /// change matters.
    pub async fn apply_shadow_scale(&self, user_id: &str, scale: f64) {
        let current = self.limits.current_limits(user_id);
        let factor = Decimal::from_f64(scale).unwrap_or(Decimal::ONE);
        let new_limits = LimitSet {
            daily: current.daily * factor,
            transaction: current.transaction * factor,
            weekly: current.weekly * factor,
        };

        let _sync_id = self.sync.apply(user_id, new_limits.clone());
        let signature = sign_limits(&self.config.audit.secret, user_id, &new_limits);
        self.audit.log(AuditEntry {
            timestamp: now_ts(),
            user_id: user_id.to_string(),
            daily: new_limits.daily,
            transaction: new_limits.transaction,
            weekly: new_limits.weekly,
            hmac_signature: signature,
            note: Some(format!("shadow session containment scale-down x{scale}")),
        });
        warn!(user_id, scale, "shadow session fraud score crossed containment band, limits scaled down");
    }

    async fn handle_transaction(&self, tx: Transaction, emergency: bool) {
        self.trap_feed.analyze(&tx);

        let profile = match self.profiles.get_or_fail(&tx.user_id).await {
            Ok(profile) => profile,
            Err(err) => {
                warn!(tx_id = %tx.id, error = %err, "profile unavailable, aborting pipeline for this transaction");
                return;
            }
        };

        let risk_breaker = self.breakers.get_or_create("risk");
        let assessment = if risk_breaker.allow() {
            match self
                .risk
                .score(&tx, &profile, &self.policy, self.config.large_amount_threshold)
                .await
            {
                Ok(assessment) => {
                    if assessment.degraded {
                        risk_breaker.record_failure();
                    } else {
                        risk_breaker.record_success();
                    }
                    assessment
                }
                Err(err) => {
                    risk_breaker.record_failure();
                    warn!(tx_id = %tx.id, error = %err, "risk scoring failed, using rule-only fallback");
                    self.risk
                        .fallback_rule_only(&tx, &profile, &self.policy, self.config.large_amount_threshold)
                }
            }
        } else {
            self.risk
                .fallback_rule_only(&tx, &profile, &self.policy, self.config.large_amount_threshold)
        };

        let current = self.limits.current_limits(&tx.user_id);
        let usage_ratio = if current.daily > Decimal::ZERO {
            (tx.amount / current.daily).to_f64().unwrap_or(0.0).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let market = self.market.current().await;

        let new_limits = match self.limits.compute_new_limits(
            &tx.user_id,
            assessment.adjusted_score,
            &market,
            &self.policy,
            &tx.geo_code,
            usage_ratio,
        ) {
            Ok(limits) => limits,
            Err(err) => {
                error!(tx_id = %tx.id, error = %err, "limit computation failed, skipping sync this round");
                if emergency {
                    self.containment.on_emergency(&tx).await;
                }
                return;
            }
        };

        if is_material_change(&current, &new_limits) {
            let _sync_id = self.sync.apply(&tx.user_id, new_limits);
            let signature = sign_limits(&self.config.audit.secret, &tx.user_id, &new_limits);
            self.audit.log(AuditEntry {
                timestamp: now_ts(),
                user_id: tx.user_id.clone(),
                daily: new_limits.daily,
                transaction: new_limits.transaction,
                weekly: new_limits.weekly,
                hmac_signature: signature,
                note: if assessment.degraded {
                    Some("degraded risk assessment".into())
                } else {
                    None
                },
            });
        }

        if emergency {
            self.containment.on_emergency(&tx).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn emergency_predicate_fires_on_large_amount() {
        let tx = sample_tx(dec!(50000), "retail");
        assert!(is_emergency(&tx, dec!(10000)));
    }

    #[test]
    fn emergency_predicate_fires_on_chargeback_category() {
        let tx = sample_tx(dec!(10), "chargeback_reversal");
        assert!(is_emergency(&tx, dec!(10000)));
    }

    #[test]
    fn ordinary_transaction_is_not_emergency() {
        let tx = sample_tx(dec!(150), "retail");
        assert!(!is_emergency(&tx, dec!(10000)));
    }

    #[test]
    fn materiality_test_flags_large_relative_change() {
        let current = LimitSet {
            daily: dec!(5000),
            transaction: dec!(1000),
            weekly: dec!(35000),
        };
        let new = LimitSet {
            daily: dec!(5100),
            transaction: dec!(1000),
            weekly: dec!(35000),
        };
        assert!(is_material_change(&current, &new));
    }

    #[test]
    fn materiality_test_ignores_tiny_change() {
        let current = LimitSet {
            daily: dec!(5000),
            transaction: dec!(1000),
            weekly: dec!(35000),
        };
        let new = LimitSet {
            daily: dec!(5001),
            transaction: dec!(1000),
            weekly: dec!(35000),
        };
        assert!(!is_material_change(&current, &new));
    }

    #[test]
    fn signature_is_deterministic_and_user_scoped() {
        let limits = LimitSet {
            daily: dec!(5000),
            transaction: dec!(1000),
            weekly: dec!(35000),
        };
        let a = sign_limits("secret", "u1", &limits);
        let b = sign_limits("secret", "u1", &limits);
        let c = sign_limits("secret", "u2", &limits);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    fn sample_tx(amount: Decimal, category: &str) -> Transaction {
        Transaction {
            id: "t1".into(),
            user_id: "u1".into(),
            amount,
            currency: "USD".into(),
            merchant_id: "m1".into(),
            merchant_category: category.into(),
            timestamp: now_ts(),
            device_fingerprint: "d1".into(),
            source_ip: "10.0.0.1".into(),
            geo_code: "US".into(),
            cross_border: false,
            decoy_marker: None,
            status: crate::model::TransactionStatus::Pending,
        }
    }
}
