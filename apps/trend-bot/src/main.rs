//! Trend Bot Binary
//!
//! Runs the SMA rebalancer against Alpaca.
//!
//! # Usage
//!
//! ```bash
//! trend-bot                      # daily at the configured time
//! trend-bot --once               # single cycle, then exit
//! trend-bot --config spy.yaml --preset equity
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `ALPACA_API_KEY`: Broker API key
//! - `ALPACA_SECRET_KEY`: Broker API secret
//!
//! ## Optional
//! - `ALPACA_PAPER`: true | false (default: true)
//! - `TREND_BOT_SYMBOL`, `TREND_BOT_PRESET`, `TREND_BOT_STATE_DIR`
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: enable span export
//! - `RUST_LOG`: Log filter (default: trend_bot=info)

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use trend_bot::broker::alpaca::AlpacaBroker;
use trend_bot::config::{Config, load_config};
use trend_bot::observability::{init_metrics, init_tracing};
use trend_bot::strategy::Preset;
use trend_bot::{DailySchedule, RebalanceBot};

/// Scheduled SMA trend-following bot.
#[derive(Debug, Parser)]
#[command(name = "trend-bot", version, about)]
struct Cli {
    /// Configuration file (default: ./config.yaml, else built-in defaults).
    #[arg(short, long)]
    config: Option<String>,

    /// Run a single rebalance cycle and exit.
    #[arg(long)]
    once: bool,

    /// Override the configured parameter preset (crypto | equity).
    #[arg(long)]
    preset: Option<Preset>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    load_dotenv();
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref()).context("failed to load configuration")?;
    if let Some(preset) = cli.preset {
        config.bot.preset = preset;
    }

    let tracing_guard = init_tracing(&config.tracing_config())?;
    if let Some(metrics) = config.metrics_config() {
        init_metrics(&metrics)?;
    }
    log_config(&config);

    let broker = AlpacaBroker::new(&config.alpaca_config()).context("failed to create broker")?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let bot = RebalanceBot::from_config(&config, broker, shutdown.clone());

    let result = if cli.once {
        match bot.run_once().await {
            Ok(_) => Ok(()),
            Err(e) if e.is_skip() => Ok(()),
            Err(e) => Err(e.into()),
        }
    } else {
        let schedule = DailySchedule::new(
            config.schedule.hour,
            config.schedule.minute,
            config.schedule.utc_offset_hours,
        )
        .context("invalid schedule")?;
        bot.run(schedule, shutdown).await;
        Ok(())
    };

    tracing::info!("Trend bot stopped");
    tracing_guard.shutdown();
    result
}

/// Load `.env` from the working directory or the nearest ancestor.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }
    if let Ok(cwd) = std::env::current_dir() {
        for dir in cwd.ancestors().skip(1) {
            let env_path = dir.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
        }
    }
}

fn log_config(config: &Config) {
    let params = config.strategy_params();
    tracing::info!(
        symbol = %config.bot.symbol,
        preset = ?config.bot.preset,
        sma_window = params.sma_window,
        allocation = %params.allocation,
        stop_loss_pct = %params.stop_loss_pct,
        volatility_threshold = %params.volatility_threshold,
        paper = config.broker.paper,
        state_dir = %config.state_dir.display(),
        "Trend bot initialized"
    );
    if !config.broker.paper {
        tracing::warn!("LIVE trading enabled - orders use real money");
    }
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
///
/// # Panics
///
/// Panics if signal handlers cannot be installed.
#[allow(clippy::expect_used)]
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }

    shutdown.cancel();
}
