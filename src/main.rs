//! Dealing-desk trading and risk engine.
//!
//! Executes leveraged market and pending orders against cached quotes,
//! monitors open positions for SL/TP, margin calls and stop-outs, mirrors
//! master trades to copy-trade followers, and distributes copy-trade and
//! introducing-broker commissions on close.

mod charges;
mod config;
mod engine;
mod error;
mod events;
mod instruments;
mod models;
mod pricing;
mod store;

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

use crate::charges::ChargeResolver;
use crate::config::EngineConfig;
use crate::engine::{Engine, PositionMonitor};
use crate::events::{LogSink, Outbox};
use crate::models::Side;
use crate::pricing::{PriceCache, PriceTick};
use crate::store::Store;

/// Dealing-desk engine CLI.
#[derive(Parser)]
#[command(name = "dealdesk")]
#[command(about = "Trading execution and risk engine", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine: consume JSON ticks on stdin, drive the monitor
    Run {
        /// Seconds between position-monitor scan cycles
        #[arg(short, long, default_value = "2")]
        interval: u64,
    },

    /// Estimate the charge breakdown for a proposed order
    Estimate {
        /// Instrument symbol, e.g. EURUSD
        #[arg(short, long)]
        symbol: String,

        /// buy or sell
        #[arg(long, default_value = "buy")]
        side: String,

        /// Lot size
        #[arg(long)]
        lots: Decimal,

        /// Requested leverage
        #[arg(long, default_value = "100")]
        leverage: u32,

        /// Quoted execution price
        #[arg(short, long)]
        price: Decimal,
    },
}

fn build_engine(config: EngineConfig) -> Arc<Engine> {
    let store = Arc::new(Store::new());
    let prices = Arc::new(PriceCache::new());
    let charges = Arc::new(ChargeResolver::new());
    let outbox = Outbox::spawn(Box::new(LogSink));
    Arc::new(Engine::new(config, store, prices, charges, outbox))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run { interval } => {
            let config = EngineConfig {
                monitor_interval_secs: interval,
                ..EngineConfig::default()
            };
            let engine = build_engine(config);

            let monitor = Arc::new(PositionMonitor::new(engine.clone()));
            let monitor_task = tokio::spawn(monitor.run());

            // Market-data collaborator: one JSON tick per stdin line
            let (tx, rx) = mpsc::unbounded_channel::<PriceTick>();
            let prices = engine.prices().clone();
            let feed_task = tokio::spawn(async move { prices.run_feed(rx).await });

            let stdin_task = tokio::spawn(async move {
                let mut lines = BufReader::new(tokio::io::stdin()).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<PriceTick>(&line) {
                        Ok(tick) => {
                            if tx.send(tick).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!(error = %e, "Ignoring malformed tick line"),
                    }
                }
            });

            info!(interval, "Engine running, feed on stdin; ctrl-c to stop");
            tokio::signal::ctrl_c().await?;
            info!("Shutdown signal received");

            stdin_task.abort();
            feed_task.abort();
            monitor_task.abort();
        }

        Commands::Estimate {
            symbol,
            side,
            lots,
            leverage,
            price,
        } => {
            let engine = build_engine(EngineConfig::default());
            let side = match side.to_lowercase().as_str() {
                "sell" => Side::Sell,
                _ => Side::Buy,
            };

            let leverage = leverage.clamp(1, engine.config().max_leverage);
            let breakdown = engine
                .compute_charges(Uuid::nil(), &symbol, lots, leverage, price, true)
                .await;

            println!("Charge estimate for {} {} {} @ {}", side.as_str(), lots, symbol, price);
            println!("  Margin:      {:>12}", breakdown.margin);
            println!("  Fee:         {:>12}", breakdown.fee);
            println!("  Commission:  {:>12}", breakdown.commission);
            println!("  Spread cost: {:>12}", breakdown.spread_cost);
            println!("  Total:       {:>12}", breakdown.total_required());
        }
    }

    Ok(())
}
