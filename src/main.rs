use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tradebot::config::{AppConfig, VenueConfig};
use tradebot::events::{EventLog, EventLogConfig};
use tradebot::exchange::{ExchangeRegistry, PaperExchange};
use tradebot::execution::{ExecutionEngine, InFlightTable, PositionStore};
use tradebot::orchestrator::{Orchestrator, Plugins, StrategyTuple};
use tradebot::persistence::{
    EventRepository, InMemoryStore, OrderRepository, PositionRepository, PostgresStore,
    StrategyRepository,
};
use tradebot::risk::{RiskEvaluator, RiskMonitor};
use tradebot::shutdown::{Shutdown, ShutdownReason};
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "tradebot", about = "Strategy orchestration and risk-managed order execution")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every enabled strategy until Ctrl+C.
    Run {
        /// Path to a TOML config file. Defaults to config/default.toml when present.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Simulate orders on the paper venue.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Load and validate the configuration, then exit.
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Print the event history of one order, position or signal.
    Replay {
        aggregate_id: Uuid,

        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    match Cli::parse().command {
        Command::Run { config, dry_run } => run(config, dry_run).await,
        Command::CheckConfig { config } => check_config(config),
        Command::Replay {
            aggregate_id,
            config,
        } => replay(aggregate_id, config).await,
    }
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("tradebot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: Option<PathBuf>) -> Result<(AppConfig, Plugins)> {
    let config = AppConfig::load(path.as_deref()).context("loading configuration")?;
    let plugins = Plugins::builtin();
    config
        .validate(&plugins.strategies)
        .context("validating configuration")?;
    Ok((config, plugins))
}

fn check_config(path: Option<PathBuf>) -> Result<()> {
    let (config, _) = load_config(path)?;
    println!("✅ Configuration is valid");
    println!("  Mode: {}", if config.dry_run { "dry-run" } else { "live" });
    println!("  Initial capital: {}", config.initial_capital);
    println!("  Venues: {}", config.venues.len());
    for tuple in config.enabled_strategies() {
        println!(
            "    - {}: {} on {} {} @ {}",
            tuple.id, tuple.strategy, tuple.pair, tuple.timeframe, tuple.venue
        );
    }
    Ok(())
}

async fn replay(aggregate_id: Uuid, path: Option<PathBuf>) -> Result<()> {
    let config = AppConfig::load(path.as_deref()).context("loading configuration")?;
    let Some(database_url) = config.database_url.as_deref() else {
        bail!("replay reads the Postgres event log; set database_url or TRADEBOT__DATABASE_URL");
    };
    let store = Arc::new(PostgresStore::connect(database_url).await?);
    let log = EventLog::new(store, EventLogConfig::default(), Shutdown::new());

    let mut events = log.replay(aggregate_id);
    let mut count = 0;
    while let Some(event) = events.next().await {
        println!("{}", serde_json::to_string(&event?)?);
        count += 1;
    }
    if count == 0 {
        tracing::warn!("⚠️  No events recorded for {}", aggregate_id);
    }
    Ok(())
}

async fn run(path: Option<PathBuf>, dry_run: bool) -> Result<()> {
    let (mut config, plugins) = load_config(path)?;
    config.dry_run |= dry_run;

    tracing::info!("🚀 tradebot starting");
    if !config.dry_run {
        bail!("no live venue adapter is built in; run with --dry-run to use the paper venue");
    }

    match config.database_url.clone() {
        Some(url) => {
            let store = PostgresStore::connect(&url)
                .await
                .context("connecting to Postgres")?;
            tracing::info!("✅ Connected to Postgres");
            start(config, plugins, Arc::new(store)).await
        }
        None => {
            tracing::warn!("⚠️  No database_url configured, state lives in memory only");
            start(config, plugins, Arc::new(InMemoryStore::new())).await
        }
    }
}

async fn start<R>(config: AppConfig, plugins: Plugins, repo: Arc<R>) -> Result<()>
where
    R: OrderRepository + PositionRepository + EventRepository + StrategyRepository + 'static,
{
    let shutdown = Shutdown::new();
    let log = EventLog::new(repo.clone(), EventLogConfig::default(), shutdown.clone());
    let store = Arc::new(PositionStore::new(repo.clone(), repo.clone(), log));
    store.load().await.context("restoring positions")?;
    sync_strategies(repo.as_ref(), &config.strategies).await?;

    let exchanges = Arc::new(paper_venues(&config.venues));
    let policy = Arc::new(config.risk.clone());
    let in_flight = InFlightTable::new();
    let engine = Arc::new(ExecutionEngine::new(
        exchanges.clone(),
        store.clone(),
        policy.clone(),
        in_flight.clone(),
        config.execution.clone(),
    ));

    let reconciled = engine
        .reconcile_open_orders()
        .await
        .context("reconciling open orders")?;
    if reconciled > 0 {
        tracing::info!("🔄 Reconciled {} order(s) left open by the last run", reconciled);
    }

    let evaluator = Arc::new(RiskEvaluator::new(
        policy.clone(),
        store.clone(),
        in_flight,
        config.initial_capital,
        config.execution.order_timeout(),
        config.execution.max_exit_retry_rounds,
    ));
    evaluator.restore().await.context("restoring risk state")?;
    let monitor = Arc::new(RiskMonitor::new(
        evaluator.clone(),
        engine.clone(),
        config.orchestrator.fetch_timeout(),
    ));
    let orchestrator = Arc::new(Orchestrator::new(
        config.orchestrator.clone(),
        &config.strategies,
        &plugins,
        evaluator,
        engine.clone(),
        monitor.clone(),
        shutdown.clone(),
    )?);

    tracing::info!("📊 Configuration:");
    tracing::info!("  Mode: {}", if config.dry_run { "dry-run" } else { "live" });
    tracing::info!("  Initial capital: {}", config.initial_capital);
    tracing::info!(
        "  Stop loss: {}% | Take profit: {}% | Trailing: {}% after {}%",
        policy.stop_loss_pct(),
        policy.take_profit_pct(),
        policy.trailing_stop_pct(),
        policy.trailing_activation_pct()
    );
    tracing::info!(
        "  Max drawdown: {}% | Emergency exit: {}%",
        policy.drawdown.max_drawdown_pct,
        policy.drawdown.emergency_exit_pct
    );
    tracing::info!("  Open positions: {}", store.open_positions().await.len());
    for tuple in config.enabled_strategies() {
        tracing::info!(
            "    - {}: {} on {} {} @ {}",
            tuple.id,
            tuple.strategy,
            tuple.pair,
            tuple.timeframe,
            tuple.venue
        );
    }
    tracing::info!("Press Ctrl+C to stop...");

    let running = tokio::spawn(orchestrator.run());

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("⚠️  Received Ctrl+C, shutting down...");
            shutdown.trigger(ShutdownReason::Requested);
        }
        reason = shutdown.wait() => {
            tracing::error!("🚨 Stopping: {:?}", reason);
        }
    }

    let unreconciled = running.await.context("orchestrator task")??;
    if unreconciled > 0 {
        tracing::error!(
            "❌ {} order(s) unreconciled; they are re-checked against the venue on next start",
            unreconciled
        );
    }

    if config.dry_run {
        for venue in exchanges.names() {
            if let Err(e) = engine.cancel_all(&venue).await {
                tracing::warn!("⚠️  Could not cancel open orders on {}: {}", venue, e);
            }
        }
    }

    let stats = monitor.statistics();
    tracing::info!(
        "📈 {} risk sweeps, {} exits triggered, realized P&L {}",
        stats.sweeps,
        stats.triggers.values().sum::<u64>(),
        store.realized_pnl().await.round_dp(2)
    );

    if shutdown.reason() == Some(ShutdownReason::EventLogFailure) {
        bail!("event log became unwritable; stopped to preserve the audit trail");
    }
    tracing::info!("👋 tradebot stopped");
    Ok(())
}

fn paper_venues(venues: &[VenueConfig]) -> ExchangeRegistry {
    let mut registry = ExchangeRegistry::new();
    for venue in venues {
        let mut paper = PaperExchange::new(&venue.name, venue.seed).with_fee_rate(venue.fee_rate);
        for market in &venue.markets {
            paper = paper.with_market(&market.pair, market.price);
        }
        registry.register(Arc::new(paper), venue.limits.clone());
    }
    registry
}

/// Keep the strategies table in line with the configuration.
async fn sync_strategies<R: StrategyRepository>(repo: &R, tuples: &[StrategyTuple]) -> Result<()> {
    for tuple in tuples {
        if StrategyRepository::get(repo, &tuple.id).await?.is_some() {
            StrategyRepository::update(repo, tuple).await?;
        } else {
            StrategyRepository::create(repo, tuple).await?;
        }
    }
    Ok(())
}
