//! Deception subsystem: Phantom Engine (C10) seeds and tracks decoy
//! transactions, Shadow Session (C11) mirrors a user's live activity and
//! injects decoys into it, and the Fraud Trap Engine (C12) watches for a
//! decoy being touched and contains the account that touched it.

pub mod phantom;
pub mod shadow;
pub mod trap;

pub use phantom::{Decoy, DecoyStatus, PhantomEngine};
pub use shadow::{BehaviorProfileKind, DecoyArmer, ShadowSessionManager, SpendControlSink};
pub use trap::{FraudTrap, FraudTrapEngine, PatternFeed};

/// Arms a generated decoy as a live fraud trap by registering it with
/// the Fraud Trap Engine.
pub struct TrapDecoyArmer(pub std::sync::Arc<FraudTrapEngine>);

#[async_trait::async_trait]
impl shadow::DecoyArmer for TrapDecoyArmer {
    async fn arm(&self, decoy: &Decoy) {
        if let Err(err) = self.0.register_trap(decoy.clone()) {
            tracing::warn!(decoy_id = %decoy.decoy_id, error = %err, "failed to arm decoy as trap");
        }
    }
}

/// Opens a mirrored session for a user the moment the Spend Controller
/// flags one of their transactions emergency, so Phantom Engine decoys
/// start landing in their context immediately.
pub struct ShadowContainmentHook(pub std::sync::Arc<ShadowSessionManager>);

#[async_trait::async_trait]
impl crate::controller::ContainmentHook for ShadowContainmentHook {
    async fn on_emergency(&self, tx: &crate::model::Transaction) {
        self.0.start_shadowing(&tx.user_id, tx.id.as_bytes());
    }
}

/// Routes a shadow session's fraud-score-triggered scale-down through
/// the Spend Controller's real limit-update pipeline.
pub struct ControllerSpendSink(pub std::sync::Arc<crate::controller::SpendController>);

#[async_trait::async_trait]
impl shadow::SpendControlSink for ControllerSpendSink {
    async fn scale_down(&self, user_id: &str, scale: f64) {
        self.0.apply_shadow_scale(user_id, scale).await;
    }
}

/// Feeds every transaction the Spend Controller processes into the
/// Fraud Trap Engine's best-effort analysis queue.
pub struct ControllerTrapFeed(pub std::sync::Arc<FraudTrapEngine>);

impl crate::controller::TrapFeed for ControllerTrapFeed {
    fn analyze(&self, tx: &crate::model::Transaction) {
        self.0.analyze_transaction(tx.clone());
    }
}

/// Turns a confirmed trap hit into a federation `Case` and hands it to
/// the Federation Coordinator, completing the "trap hits ... feed C13"
/// data flow.
pub struct TrapPatternFeed(pub std::sync::Arc<crate::federation::FederationCoordinator>);

#[async_trait::async_trait]
impl trap::PatternFeed for TrapPatternFeed {
    async fn propagate(&self, pattern_hash: String, embedding: Vec<f32>) {
        let case = crate::federation::Case { pattern_hash, embedding };
        if let Err(err) = self.0.process_pattern(&case).await {
            tracing::warn!(error = %err, "failed to propagate trap pattern to federation");
        }
    }
}
