//! FortiGuard CLI entrypoint: loads configuration, wires every component,
//! and runs the worker pools until a shutdown signal arrives.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use fortiguard::audit::AuditLog;
use fortiguard::cache::{HttpProfileFetcher, ProfileCache};
use fortiguard::config::Config;
use fortiguard::controller::{SpendController, StaticMarketConditions};
use fortiguard::deception::phantom::FileDecoyStore;
use fortiguard::deception::trap::{FraudTrapEngine, LoggingContainmentActions};
use fortiguard::deception::{PhantomEngine, ShadowSessionManager};
use fortiguard::federation::{FederationCoordinator, NoopChainClient, NoopPeerTransport};
use fortiguard::intake::IntakeQueue;
use fortiguard::limits::{LimitEngine, LimitSync};
use fortiguard::policy::PolicyRules;
use fortiguard::resilience::circuit_breaker::CircuitBreakerManager;
use fortiguard::risk::RiskScorer;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Real-time fraud detection, containment, and deception platform", long_about = None)]
struct Args {
    /// Log verbosity (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    verbosity: String,

    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "./config/fortiguard.toml")]
    config: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    fmt().with_env_filter(EnvFilter::new(&args.verbosity)).init();

    let config = match Config::load_from_file(std::path::Path::new(&args.config)) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            return ExitCode::from(1);
        }
    };

    info!("starting FortiGuard");

    let policy = match PolicyRules::load(&config.policy) {
        Ok(policy) => Arc::new(policy),
        Err(err) => {
            error!(error = %err, "failed to load policy rules");
            return ExitCode::from(2);
        }
    };

    let audit = match AuditLog::open(&config.audit) {
        Ok(audit) => Arc::new(audit),
        Err(err) => {
            error!(error = %err, "audit log unavailable, refusing to start");
            return ExitCode::from(3);
        }
    };

    let breakers = Arc::new(CircuitBreakerManager::new(config.circuit.clone()));
    let profile_breaker = breakers.get_or_create("profile");
    let fetcher = Arc::new(HttpProfileFetcher::new("http://localhost:9000"));
    let profiles = Arc::new(ProfileCache::new(&config.cache, fetcher, profile_breaker));
    profiles.warmup(&config.cache.warmup_users).await;

    let risk = Arc::new(RiskScorer::new(config.risk.clone(), Vec::new()));
    let limits = Arc::new(LimitEngine::new(config.limits.clone()));
    let sync = Arc::new(LimitSync::new(
        config.sync.clone(),
        std::path::PathBuf::from("./data/sync_status"),
    ));

    let decoy_store = Arc::new(FileDecoyStore::new("./data/decoys"));
    let phantom = Arc::new(PhantomEngine::new(
        config.phantom.clone(),
        vec!["MERCHANT_A".into(), "MERCHANT_B".into(), "MERCHANT_C".into()],
        vec!["US".into(), "CA".into(), "GB".into()],
        vec!["RU".into(), "KP".into()],
        decoy_store,
    ));
    let trap = Arc::new(FraudTrapEngine::new(config.traps.clone(), Arc::new(LoggingContainmentActions)));
    let shadow = Arc::new(ShadowSessionManager::with_armer(
        config.shadow.clone(),
        phantom.clone(),
        Arc::new(fortiguard::deception::TrapDecoyArmer(trap.clone())),
    ));

    let federation = if config.federation.secret.is_empty() {
        info!("federation secret not configured, coordinator disabled");
        None
    } else {
        match FederationCoordinator::new(
            config.federation.clone(),
            Default::default(),
            Arc::new(NoopPeerTransport),
            Arc::new(NoopChainClient),
        ) {
            Ok(coordinator) => Some(Arc::new(coordinator)),
            Err(err) => {
                error!(error = %err, "federation coordinator misconfigured, disabling");
                None
            }
        }
    };
    if let Some(federation) = &federation {
        trap.set_pattern_feed(Arc::new(fortiguard::deception::TrapPatternFeed(federation.clone())));
    }

    let queue = Arc::new(IntakeQueue::new(
        config.queue.general_capacity,
        config.queue.emergency_capacity,
    ));

    let controller = Arc::new(SpendController::new(
        config.clone(),
        queue,
        profiles.clone(),
        risk,
        limits,
        sync.clone(),
        audit.clone(),
        policy.clone(),
        breakers,
        Arc::new(StaticMarketConditions(Default::default())),
        Arc::new(fortiguard::deception::ShadowContainmentHook(shadow.clone())),
        Arc::new(fortiguard::deception::ControllerTrapFeed(trap.clone())),
    ));
    shadow.set_spend_sink(Arc::new(fortiguard::deception::ControllerSpendSink(controller.clone())));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let audit_writer = tokio::spawn({
        let audit = audit.clone();
        async move { audit.run_writer().await }
    });
    let sync_worker = tokio::spawn({
        let sync = sync.clone();
        async move { sync.run_worker().await }
    });
    let shadow_dispatcher = tokio::spawn({
        let shadow = shadow.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move { shadow.run_decoy_dispatcher(shutdown_rx).await }
    });
    let shadow_cleanup = tokio::spawn({
        let shadow = shadow.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move { shadow.run_cleanup_scheduler(shutdown_rx).await }
    });
    let shadow_spend_control = tokio::spawn({
        let shadow = shadow.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move { shadow.run_spend_control_sweep(shutdown_rx).await }
    });
    let trap_workers: Vec<_> = (0..config.traps.worker_count)
        .map(|_| {
            let trap = trap.clone();
            tokio::spawn(async move { trap.run_worker().await })
        })
        .collect();
    let trap_analyzer = tokio::spawn({
        let trap = trap.clone();
        let shutdown_rx = shutdown_rx.clone();
        async move { trap.run_analyzer(shutdown_rx).await }
    });
    let policy_watcher = tokio::spawn({
        let policy = policy.clone();
        let shutdown_rx = shutdown_rx.clone();
        let interval = std::time::Duration::from_secs(config.policy.poll_interval_secs);
        async move { policy.run_watcher(interval, shutdown_rx).await }
    });

    let controller_handle = tokio::spawn({
        let controller = controller.clone();
        async move { controller.run(shutdown_rx).await }
    });

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received, draining workers");
    let _ = shutdown_tx.send(true);

    let _ = controller_handle.await;
    let _ = policy_watcher.await;
    let _ = shadow_dispatcher.await;
    let _ = shadow_cleanup.await;
    let _ = shadow_spend_control.await;
    let _ = trap_analyzer.await;
    for handle in trap_workers {
        let _ = handle.await;
    }
    audit_writer.abort();
    sync_worker.abort();

    ExitCode::SUCCESS
}
