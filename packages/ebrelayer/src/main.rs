//! Peggy ebrelayer
//!
//! Watches the Ethereum bridge contract for `lock`/`burn` calls, signs a
//! claim for each, and aggregates claims and withdraw co-signatures from all
//! validators until a supermajority of voting power certifies them.

use std::sync::Arc;
use std::time::Duration;

use ebrelayer::api::{self, AppState};
use ebrelayer::config::Config;
use ebrelayer::db::PgStateStore;
use ebrelayer::dispatcher::Dispatcher;
use ebrelayer::rpc::EvmRpcClient;
use ebrelayer::settlement::{Broadcaster, HttpBroadcaster, LogBroadcaster, SettlementGate};
use ebrelayer::sink::LocalClaimSink;
use ebrelayer::watchers::{load_watermark, ChainWatcher, WatcherSettings};
use peggy_core::store::StateStore;
use peggy_core::{
    ClaimBuilder, ClaimSigner, LocalKeySigner, MemoryStore, ProphecyAggregator, StaticRegistry,
    ValidatorRegistry, WithdrawAggregator,
};
use tokio::sync::watch;

/// How often expired records are swept and unsettled certifications retried
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(30);

fn main() -> eyre::Result<()> {
    // Install color-eyre for better error reporting
    color_eyre::install()?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main())
}

async fn async_main() -> eyre::Result<()> {
    init_logging();

    tracing::info!("Starting Peggy ebrelayer");

    let config = Config::load()?;
    tracing::info!(
        chain_id = config.evm.chain_id,
        bridge = %config.evm.bridge_address,
        rpc_endpoints = config.evm.all_rpc_urls().len(),
        confirmation_depth = config.watcher.confirmation_depth,
        supermajority = %config.aggregation.supermajority,
        "Configuration loaded"
    );

    let store: Arc<dyn StateStore> = match &config.database.url {
        Some(url) => {
            let store = PgStateStore::connect(url).await?;
            tracing::info!("Database connected, migrations complete");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set; using in-memory state that does not survive restarts");
            Arc::new(MemoryStore::new())
        }
    };

    let registry: Arc<dyn ValidatorRegistry> =
        Arc::new(StaticRegistry::parse(&config.validator.validator_set)?);
    let signer = Arc::new(LocalKeySigner::from_private_key(&config.validator.private_key)?);
    tracing::info!(validator = %signer.validator(), "Validator key loaded");

    let threshold = config.aggregation.supermajority;
    let prophecies = Arc::new(ProphecyAggregator::new(
        store.clone(),
        registry.clone(),
        threshold,
    ));
    let withdrawals = Arc::new(WithdrawAggregator::new(
        config.aggregation.cosmos_chain_id.clone(),
        store.clone(),
        registry,
        threshold,
    ));
    let recovered_prophecies = prophecies.recover_pending().await?;
    let recovered_withdrawals = withdrawals.recover_pending().await?;
    tracing::info!(
        prophecies = recovered_prophecies,
        withdrawals = recovered_withdrawals,
        "Pending records recovered"
    );

    let broadcaster: Arc<dyn Broadcaster> = match &config.settlement.url {
        Some(url) => Arc::new(HttpBroadcaster::new(url.clone(), config.watcher.rpc_timeout())?),
        None => Arc::new(LogBroadcaster),
    };
    let gate = Arc::new(SettlementGate::new(store.clone(), broadcaster));
    let dispatcher = Arc::new(Dispatcher::new(prophecies, withdrawals, store.clone(), gate));

    // Create shutdown channel and signal handler
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let forwarders = dispatcher.spawn_settlement_forwarders(shutdown_rx.clone());
    if let Err(e) = dispatcher.resettle_certified().await {
        tracing::warn!(error = %e, "Initial resettle pass failed; will retry");
    }

    let api_state = AppState {
        dispatcher: dispatcher.clone(),
        store: store.clone(),
        chain_id: config.evm.chain_id,
    };
    let api_bind = config.api.bind_address.clone();
    let api_port = config.api.port;
    let api_shutdown = shutdown_rx.clone();
    let api_task = tokio::spawn(async move {
        if let Err(e) = api::start_api_server(&api_bind, api_port, api_state, api_shutdown).await {
            tracing::error!(error = %e, "API server error");
        }
    });

    let maintenance_task = tokio::spawn(run_maintenance(
        dispatcher.clone(),
        store.clone(),
        config.evm.chain_id,
        config.aggregation.prophecy_timeout_blocks,
        shutdown_rx.clone(),
    ));

    let mut builder = ClaimBuilder::new(config.evm.chain_id, config.evm.bridge_bytes()?);
    if let Some(prefix) = &config.aggregation.receiver_prefix {
        builder = builder.with_receiver_prefix(prefix.clone());
    }
    let sink = Arc::new(LocalClaimSink::new(builder, signer, dispatcher.clone()));
    let chain = Arc::new(EvmRpcClient::new(
        config.evm.all_rpc_urls(),
        config.watcher.rpc_timeout(),
    )?);
    let watcher = ChainWatcher::new(WatcherSettings::from_config(&config)?, chain, store, sink);

    tracing::info!("Relayer initialized, starting chain watcher");
    let result = watcher.run(shutdown_rx).await;

    for task in forwarders {
        let _ = task.await;
    }
    let _ = maintenance_task.await;
    let _ = api_task.await;

    tracing::info!("Peggy ebrelayer stopped");
    result
}

/// Periodically fail timed-out records and retry unsettled certifications
async fn run_maintenance(
    dispatcher: Arc<Dispatcher>,
    store: Arc<dyn StateStore>,
    chain_id: u64,
    timeout_blocks: Option<u64>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(MAINTENANCE_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
                continue;
            }
        }

        if let Some(timeout) = timeout_blocks {
            match load_watermark(store.as_ref(), chain_id).await {
                Ok(Some(watermark)) if watermark >= timeout => {
                    if let Err(e) = dispatcher.sweep_expired(watermark - timeout).await {
                        tracing::warn!(error = %e, "Expiry sweep failed");
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::warn!(error = %e, "Could not read watermark for expiry sweep"),
            }
        }

        if let Err(e) = dispatcher.resettle_certified().await {
            tracing::warn!(error = %e, "Resettle pass failed");
        }
    }
}

/// Initialize tracing/logging with structured output
fn init_logging() {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,ebrelayer=debug,peggy_core=debug"));

    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }
}

/// Wait for shutdown signals (SIGINT/SIGTERM)
async fn wait_for_shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
