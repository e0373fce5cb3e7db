//! Claw Arcade service binary
//!
//! Opens the queue store, recovers abandoned turns, then runs the scheduler,
//! hardware link, sync loop, round manager and HTTP/WebSocket API until
//! Ctrl+C or SIGTERM.

use claw_arcade::{
    api::{shutdown_signal, ApiServer},
    broadcast::Broadcaster,
    config::{ArcadeConfig, ConfigLoader, SettlementMode},
    errors::{ArcadeResult, ConfigurationError, StorageError},
    hardware::{HardwareDriver, HardwareLink},
    metrics::ArcadeMetrics,
    queue_store::{InMemoryQueueStore, QueueStore, RocksQueueStore},
    reconciler::Reconciler,
    rounds::RoundManager,
    scheduler::TurnScheduler,
    settlement::{GatewaySettlement, RetryPolicy, RetryingSettlement, SettlementClient, SimulatedLedger},
    state::ProcessState,
    storage::OptimizedStorage,
    sync::SyncBroadcaster,
    Engine,
};
use clap::Parser;
use futures_util::future::join_all;
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "claw-arcade")]
#[command(about = "Claw machine turn queue service", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file path (TOML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// API server host
    #[arg(long)]
    host: Option<String>,

    /// API server port
    #[arg(long)]
    port: Option<u16>,

    /// Queue database directory
    #[arg(long)]
    data_dir: Option<String>,

    /// Hardware controller WebSocket URL
    #[arg(long)]
    hardware_url: Option<String>,

    /// Use the in-process ledger instead of the settlement gateway
    #[arg(long)]
    simulated_ledger: bool,

    /// Keep the queue in memory only
    #[arg(long)]
    ephemeral: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> ArcadeResult<()> {
    let args = Args::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &args.config {
        loader = loader.with_path(path);
    }
    let mut config = loader.load()?;
    apply_args(&mut config, &args);
    config.validate()?;

    if args.print_config {
        let rendered = toml::to_string_pretty(&config)
            .map_err(|e| ConfigurationError::SaveFailed(e.to_string()))?;
        println!("{}", rendered);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "claw_arcade={},tower_http=info",
                    config.monitoring.log_level.as_filter()
                )
                .into()
            }),
        )
        .init();

    info!("Starting Claw Arcade v{}", env!("CARGO_PKG_VERSION"));
    info!("   Turn: {}s, inter-turn delay: {}s", config.game.turn_duration_secs, config.game.inter_turn_delay_secs);
    info!("   Round boundary: {:02}:00 UTC", config.game.round_boundary_hour_utc);

    let store = open_store(&config, args.ephemeral)?;
    let settlement = build_settlement(&config)?;

    let first = store
        .ensure_first_round(config.game.default_max_fee, config.game.default_fee_growth)
        .await?;
    info!(round_id = first.id, "Current round");

    let state = Arc::new(ProcessState::new());
    match settlement.game_totals().await {
        Ok(totals) => state.set_totals(totals),
        Err(e) => warn!("Could not load game totals, starting from zero: {}", e),
    }

    let (hardware, commands_rx) = HardwareLink::new(config.hardware.command_buffer);
    let (events_tx, events_rx) = mpsc::channel(config.hardware.command_buffer);

    let engine = Arc::new(Engine {
        store,
        state,
        broadcaster: Broadcaster::default(),
        hardware,
        settlement: RetryingSettlement::new(settlement, RetryPolicy::from(&config.settlement)),
        config: config.game.clone(),
        metrics: ArcadeMetrics::new()?,
    });

    let recovered = engine.recover().await?;
    if recovered > 0 {
        info!(recovered, "Closed turns abandoned by a previous run");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);

    let driver = HardwareDriver::new(
        config.hardware.url.clone(),
        config.hardware.reconnect_delay(),
        commands_rx,
        events_tx,
    );
    let loops = vec![
        tokio::spawn(driver.run(shutdown_rx.clone())),
        tokio::spawn(Reconciler::new(engine.clone(), events_rx).run(shutdown_rx.clone())),
        tokio::spawn(TurnScheduler::new(engine.clone()).run(shutdown_rx.clone())),
        tokio::spawn(SyncBroadcaster::new(engine.clone()).run(shutdown_rx.clone())),
        tokio::spawn(RoundManager::new(engine.clone()).run(shutdown_rx.clone())),
    ];

    let signal_tx = shutdown_tx.clone();
    let signals = tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutting down");
        let _ = signal_tx.send(true);
    });

    let server = ApiServer::new(config.api.clone(), config.monitoring.enable_metrics, engine);
    let served = server.run(shutdown_rx).await;
    if let Err(e) = &served {
        error!("API server failed: {}", e);
    }

    // Loops finish their in-flight transition before observing the flag
    signals.abort();
    let _ = shutdown_tx.send(true);
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, join_all(loops)).await.is_err() {
        warn!("Background loops did not stop within {:?}", SHUTDOWN_TIMEOUT);
    }

    info!("Claw Arcade stopped");
    served
}

fn apply_args(config: &mut ArcadeConfig, args: &Args) {
    if let Some(host) = &args.host {
        config.api.host = host.clone();
    }
    if let Some(port) = args.port {
        config.api.port = port;
    }
    if let Some(dir) = &args.data_dir {
        config.storage.data_directory = dir.clone();
    }
    if let Some(url) = &args.hardware_url {
        config.hardware.url = url.clone();
    }
    if args.simulated_ledger {
        config.settlement.mode = SettlementMode::Simulated;
    }
}

fn open_store(config: &ArcadeConfig, ephemeral: bool) -> ArcadeResult<Arc<dyn QueueStore>> {
    if ephemeral {
        warn!("Queue kept in memory; entries are lost on exit");
        return Ok(Arc::new(InMemoryQueueStore::new()));
    }

    let path = &config.storage.data_directory;
    info!("Opening queue database: {}", path);
    let storage = if config.storage.clear_on_start {
        OptimizedStorage::open_clean(path)
    } else {
        OptimizedStorage::new(path)
    }
    .map_err(|e| StorageError::DatabaseOpenFailed(format!("{}: {}", path, e)))?;

    Ok(Arc::new(RocksQueueStore::open(storage)?))
}

fn build_settlement(config: &ArcadeConfig) -> ArcadeResult<Arc<dyn SettlementClient>> {
    match config.settlement.mode {
        SettlementMode::Simulated => {
            warn!("Using simulated ledger; no funds move");
            Ok(Arc::new(SimulatedLedger::new()))
        }
        SettlementMode::Gateway => {
            let url = config
                .settlement
                .gateway_url
                .clone()
                .ok_or_else(|| ConfigurationError::MissingRequired("settlement.gateway_url".to_string()))?;
            info!("Settlement gateway: {}", url);
            Ok(Arc::new(GatewaySettlement::new(url, config.settlement.request_timeout())?))
        }
    }
}
