use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use riskbot::config::Settings;
use riskbot::db::{InMemoryPositionStore, PositionStore, PostgresPositionStore};
use riskbot::execution::{
    DexScreenerOracle, ExitExecutor, PaperTradeExecutor, PositionMonitor, SweepScheduler,
};
use riskbot::risk::{BreakerConfig, BreakerRegistry};

#[derive(Parser)]
#[command(name = "riskbot", about = "Autonomous position risk monitor")]
struct Cli {
    /// TOML settings file (defaults to ./riskbot.toml if present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the position monitor
    Run {
        /// Run a single sweep and exit
        #[arg(long)]
        once: bool,
    },
    /// Print the effective settings as JSON
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    setup_logging();

    let cli = Cli::parse();
    let settings = Settings::load(cli.config.as_deref()).context("Failed to load settings")?;

    match cli.command {
        Command::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
        Command::Run { once } => run(settings, once).await,
    }
}

async fn run(settings: Settings, once: bool) -> anyhow::Result<()> {
    tracing::info!("🚀 riskbot starting");

    let breakers = BreakerRegistry::new(
        BreakerConfig::from(&settings.breakers.price_feed),
        BreakerConfig::from(&settings.breakers.trade_execution),
        BreakerConfig::from(&settings.breakers.persistence),
    );

    let store = connect_store(&settings).await?;

    let oracle = Arc::new(
        DexScreenerOracle::new(
            settings.price_feed.base_url.clone(),
            settings.price_feed.chain_id.clone(),
            settings.price_feed.requests_per_minute,
            Duration::from_secs(settings.price_feed.request_timeout_secs),
        )
        .map_err(|e| anyhow::anyhow!("Failed to build price oracle: {}", e))?,
    );

    let exits = Arc::new(ExitExecutor::new(
        store.clone(),
        Arc::new(PaperTradeExecutor),
        breakers.clone(),
    ));
    let monitor = Arc::new(PositionMonitor::new(
        store,
        oracle,
        breakers.clone(),
        exits,
        settings.monitor.price_concurrency,
    ));

    let scheduler_config = settings.monitor.scheduler_config();

    tracing::info!("\n📊 Configuration:");
    tracing::info!("  Sweep interval: {:?}", scheduler_config.interval);
    tracing::info!("  Max sweep duration: {:?}", scheduler_config.max_sweep_duration);
    tracing::info!("  Price concurrency: {}", settings.monitor.price_concurrency);
    tracing::info!("  Price feed: {}", settings.price_feed.base_url);

    if once {
        SweepScheduler::run_once(&monitor, scheduler_config.max_sweep_duration).await;
        log_breaker_statuses(&breakers);
        return Ok(());
    }

    let handle = SweepScheduler::start(monitor, scheduler_config);
    tracing::info!("\nPress Ctrl+C to stop...\n");
    #[cfg(unix)]
    tracing::info!("  SIGUSR1 halts exits, SIGUSR2 resumes them");

    wait_for_shutdown(&breakers).await?;
    tracing::info!("\n⚠️  Received Ctrl+C, shutting down...");

    let completed = handle.stop().await;
    tracing::info!("Completed {} sweeps", completed);
    log_breaker_statuses(&breakers);

    tracing::info!("👋 riskbot stopped");
    Ok(())
}

/// Wait for Ctrl+C. On Unix, SIGUSR1/SIGUSR2 toggle the emergency stop.
#[cfg(unix)]
async fn wait_for_shutdown(breakers: &BreakerRegistry) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut halt = signal(SignalKind::user_defined1()).context("Failed to listen for SIGUSR1")?;
    let mut resume = signal(SignalKind::user_defined2()).context("Failed to listen for SIGUSR2")?;

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                return result.context("Failed to listen for Ctrl+C");
            }
            _ = halt.recv() => {
                breakers.emergency_stop();
                log_breaker_statuses(breakers);
            }
            _ = resume.recv() => {
                breakers.release_emergency_stop();
                log_breaker_statuses(breakers);
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_breakers: &BreakerRegistry) -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")
}

fn setup_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("riskbot=info"));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn connect_store(settings: &Settings) -> anyhow::Result<Arc<dyn PositionStore>> {
    let max_open = settings.monitor.max_open_positions_per_owner;
    let database_url = settings
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    match database_url {
        Some(url) => {
            let store = PostgresPositionStore::connect(&url, max_open)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to connect to Postgres: {}", e))?;
            Ok(Arc::new(store))
        }
        None => {
            tracing::warn!("No database configured, using in-memory position store");
            Ok(Arc::new(InMemoryPositionStore::new(max_open)))
        }
    }
}

fn log_breaker_statuses(breakers: &BreakerRegistry) {
    for status in breakers.statuses() {
        tracing::info!(
            breaker = %status.name,
            state = ?status.state,
            failures = status.failure_count,
            healthy = status.is_healthy,
            forced_open = status.forced_open,
            "Circuit breaker status"
        );
    }
}
