//! Tradewind CLI
//!
//! Backtest runner over CSV bar files. Live trading is wired through the
//! library's engine API with a venue-specific `BrokerClient`.

use clap::{Parser, Subcommand};
use tradewind::{
    config::Config,
    engine::Engine,
    feed::CsvBarSource,
    strategy::MomentumStrategy,
};
use rust_decimal::Decimal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "tradewind")]
#[command(about = "Event-driven trading engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "tradewind.toml")]
    config: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a CSV bar history through the pipeline
    Backtest {
        /// CSV file with instrument,timestamp,open,high,low,close,volume
        data: String,
        /// Print the full report as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },
    /// Show what a CSV bar file contains
    Inspect {
        data: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Backtest { data, json } => run_backtest(&cli.config, &data, json).await,
        Commands::Inspect { data } => inspect(&data),
    }
}

async fn run_backtest(config_path: &str, data: &str, json: bool) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let bars = CsvBarSource::load(data)?;
    tracing::info!("loaded {} bars from {}", bars.len(), data);

    let strategy = MomentumStrategy::new(config.strategy.momentum_period);
    let engine = Engine::new(config);
    let output = engine.run_backtest(bars, Box::new(strategy)).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    let report = &output.performance;
    println!("\n=== Backtest Report ===\n");
    println!("Trades:           {}", report.trade_count);
    println!("Cancelled orders: {}", output.cancelled_orders);
    if let (Some(initial), Some(last)) = (report.initial_equity, report.final_equity) {
        println!("Equity:           {initial:.2} -> {last:.2}");
    }
    if let Some(total_return) = report.total_return {
        println!("Total return:     {:.2}%", total_return * Decimal::ONE_HUNDRED);
    }
    if let Some(drawdown) = report.max_drawdown {
        println!("Max drawdown:     {:.2}%", drawdown * Decimal::ONE_HUNDRED);
    }
    if let Some(sharpe) = report.sharpe {
        println!("Sharpe:           {sharpe:.3}");
    }
    if let Some(win_rate) = report.win_rate {
        println!("Win rate:         {:.1}%", win_rate * Decimal::ONE_HUNDRED);
    }
    println!("Commission paid:  {:.2}", report.total_commission);
    println!("Final cash:       {:.2}", output.ledger.cash);
    for (instrument, position) in &output.ledger.positions {
        if !position.quantity.is_zero() {
            println!(
                "Position:         {} {} @ {:.2}",
                position.quantity, instrument, position.avg_cost
            );
        }
    }

    Ok(())
}

fn inspect(data: &str) -> anyhow::Result<()> {
    let bars = CsvBarSource::load(data)?;
    if bars.is_empty() {
        println!("no parseable bars in {data}");
        return Ok(());
    }

    let mut instruments: Vec<&str> = bars.iter().map(|b| b.instrument.as_str()).collect();
    instruments.sort_unstable();
    instruments.dedup();

    let first = bars.iter().map(|b| b.timestamp).min();
    let last = bars.iter().map(|b| b.timestamp).max();

    println!("{} bars, {} instrument(s)", bars.len(), instruments.len());
    println!("instruments: {}", instruments.join(", "));
    if let (Some(first), Some(last)) = (first, last) {
        println!("range: {first} -> {last}");
    }
    Ok(())
}
