// Grid Bot - command line entry point
// Runs the XRP/GBP grid and inspects its ledger

use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::{error, info, warn};

use xrp_grid_bot::core::error_handler::ErrorHandler;
use xrp_grid_bot::core::orchestrator::{clear_halt, BotStatus, OrchestratorState};
use xrp_grid_bot::core::report;
use xrp_grid_bot::{
    BotConfig, Database, EventSink, ExchangeGateway, KrakenRestClient, Orchestrator, TradingError, TradingResult,
};

#[derive(Parser)]
#[command(name = "grid-bot")]
#[command(version)]
#[command(about = "XRP/GBP grid trading bot", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long, global = true, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Start the trading loop
    Run {
        /// Run a single tick and exit
        #[arg(long)]
        once: bool,
    },

    /// Print realized margins from the trade ledger
    Margins {
        /// List every matched pair
        #[arg(short, long)]
        detailed: bool,
    },

    /// Show grid, open orders and halt state
    Status,

    /// Summarize the persisted error log
    Errors {
        /// Look-back window in hours
        #[arg(long, default_value = "24")]
        hours: i64,
    },

    /// Clear a fail-safe halt after checking the exchange by hand
    Resume,

    /// Write a performance report (market moves, orders, margins) as JSON
    Report {
        /// Days of daily bars to include
        #[arg(long, default_value = "7")]
        days: u32,

        /// Directory for the report file (defaults to storage.report_dir)
        #[arg(short, long)]
        output: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Setup logging first (before config load so we can see config errors)
    let log_level = if cli.verbose { "debug" } else { "info" };
    std::env::set_var("RUST_LOG", log_level);
    tracing_subscriber::fmt::init();

    let result = match cli.command {
        Commands::Init { force } => init_config(&cli.config, force),
        Commands::Run { once } => run(&cli.config, once).await,
        Commands::Margins { detailed } => show_margins(&cli.config, detailed),
        Commands::Status => show_status(&cli.config),
        Commands::Errors { hours } => show_errors(&cli.config, hours),
        Commands::Resume => resume(&cli.config),
        Commands::Report { days, output } => write_report(&cli.config, days, output).await,
    };

    if let Err(e) = result {
        error!("❌ [{}] {}", e.category(), e.user_message());
        std::process::exit(1);
    }
}

fn load_config(path: &str) -> TradingResult<BotConfig> {
    let config = BotConfig::from_file(path)?;
    info!("📁 Config: {}", path);
    Ok(config)
}

fn open_database(config: &BotConfig) -> TradingResult<Database> {
    Ok(Database::new(&config.storage.db_path)?)
}

fn init_config(path: &str, force: bool) -> TradingResult<()> {
    if std::path::Path::new(path).exists() && !force {
        warn!("⚠️  {} already exists, skipping (use --force to overwrite)", path);
        return Ok(());
    }

    BotConfig::default().to_file(path)?;
    info!("📝 Created {}", path);
    info!("💡 Next steps:");
    info!("   1. Add your Kraken API key and secret to {}", path);
    info!("   2. Run: grid-bot run --once");
    Ok(())
}

async fn run(path: &str, once: bool) -> TradingResult<()> {
    let config = load_config(path)?;
    if !config.has_valid_api_keys() {
        return Err(TradingError::ConfigValidation(
            "exchange.api_key and exchange.api_secret are still placeholders".to_string(),
        ));
    }

    let db = open_database(&config)?;
    let transport = Arc::new(KrakenRestClient::new(&config.exchange).map_err(|e| TradingError::Internal(e.to_string()))?);

    let (events, mut receiver) = EventSink::channel();
    tokio::spawn(async move {
        while let Some(event) = receiver.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => info!(target: "grid_bot::events", "{}", json),
                Err(e) => warn!("⚠️  Could not serialize event: {}", e),
            }
        }
    });

    let mut orchestrator = Orchestrator::new(config, transport, &db, events)?;
    orchestrator.watch_config(path);

    if let OrchestratorState::Halted { reason, .. } = orchestrator.state() {
        return Err(TradingError::Halted(reason.clone()));
    }

    if once {
        let report = orchestrator.tick().await?;
        info!("✅ Tick complete ({})", report.skipped.as_deref().unwrap_or("traded"));
        return Ok(());
    }

    orchestrator.run().await
}

fn show_margins(path: &str, detailed: bool) -> TradingResult<()> {
    let config = load_config(path)?;
    let db = open_database(&config)?;
    let report = xrp_grid_bot::TradeLedger::new(&db).margin_report()?;

    info!("💰 Margin report");
    info!("   Matched pairs:   {}", report.margins.len());
    info!("   Matched volume:  {:.4}", report.total_matched_volume);
    info!("   Gross margin:    £{:.4}", report.total_gross_margin);
    info!("   Fees:            £{:.4}", report.total_fees);
    info!("   Average margin:  {:.3}%", report.average_margin_percent * 100.0);

    if !report.unmatched_sells.is_empty() {
        let unmatched: f64 = report.unmatched_sells.iter().map(|u| u.unmatched_volume).sum();
        info!("   Unmatched sells: {} ({:.4} units)", report.unmatched_sells.len(), unmatched);
    }

    if detailed {
        for m in &report.margins {
            info!(
                "   {} → {}: {:.4} @ £{:.5} → £{:.5} = £{:.4} ({:.3}%)",
                &m.buy_trade_id[..8.min(m.buy_trade_id.len())],
                &m.sell_trade_id[..8.min(m.sell_trade_id.len())],
                m.matched_volume,
                m.buy_price,
                m.sell_price,
                m.gross_margin,
                m.margin_percent * 100.0
            );
        }
    }
    Ok(())
}

fn show_status(path: &str) -> TradingResult<()> {
    let config = load_config(path)?;
    let db = open_database(&config)?;
    let status = BotStatus::load(&db)?;

    info!("📊 Grid bot status ({})", config.trading.trading_pair);
    match &status.state {
        OrchestratorState::Running => info!("   State: running"),
        OrchestratorState::Halted { reason, since } => {
            warn!("   State: HALTED since {} ({})", since.format("%Y-%m-%d %H:%M:%S"), reason)
        }
    }

    if let Some(stop_loss) = &status.stop_loss {
        info!("   Stop-loss: {}", serde_json::to_string(stop_loss)?);
    }

    match &status.active_generation {
        Some(g) => info!(
            "   Generation {}: £{:.5} ±{:.2}% ({}, {}, created {})",
            g.id,
            g.reference_price,
            g.range_percent / 2.0,
            g.trigger.as_str(),
            g.trend.as_str(),
            g.created_at.format("%Y-%m-%d %H:%M")
        ),
        None => info!("   No active generation"),
    }
    if let Some(p) = &status.pending_generation {
        warn!("   Regeneration {} pending (resumes on the next tick)", p.id);
    }

    info!("   Open orders: {}", status.open_orders.len());
    for trade in &status.open_orders {
        info!(
            "     {} {:.1} @ £{:.5} [{}] {}",
            trade.side,
            trade.requested_volume,
            trade.requested_price,
            trade.status,
            trade.external_order_id.as_deref().unwrap_or("-")
        );
    }
    info!("   Filled trades: {}", status.filled_trades);
    Ok(())
}

fn show_errors(path: &str, hours: i64) -> TradingResult<()> {
    let config = load_config(path)?;
    let Some(log_path) = &config.errors.error_log_path else {
        warn!("⚠️  errors.error_log_path is not set, nothing is persisted");
        return Ok(());
    };

    let records = match ErrorHandler::read_log(log_path) {
        Ok(records) => records,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    let summary = ErrorHandler::summarize(&records, hours, chrono::Utc::now());

    info!("🚨 {} errors in the last {}h", summary.total_errors, summary.time_period_hours);
    for (category, count) in &summary.by_category {
        info!("   {:<24} {}", category, count);
    }
    for (severity, count) in &summary.by_severity {
        info!("   {:<24} {}", severity, count);
    }
    for record in &summary.most_recent {
        info!(
            "   {} [{}/{}] {}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.category.as_str(),
            record.severity.as_str(),
            record.message
        );
    }
    Ok(())
}

fn resume(path: &str) -> TradingResult<()> {
    let config = load_config(path)?;
    let db = open_database(&config)?;
    if !clear_halt(&db)? {
        info!("ℹ️  Bot is not halted");
    }
    Ok(())
}

async fn write_report(path: &str, days: u32, output: Option<String>) -> TradingResult<()> {
    let config = load_config(path)?;
    let db = open_database(&config)?;
    let transport = Arc::new(KrakenRestClient::new(&config.exchange).map_err(|e| TradingError::Internal(e.to_string()))?);
    let errors = Arc::new(ErrorHandler::new(config.errors.clone(), EventSink::disabled()));
    let gateway = ExchangeGateway::new(transport, &config, errors);

    let report = report::generate(&gateway, &db, &config, days, config.has_valid_api_keys(), chrono::Utc::now()).await?;

    info!("📈 Performance report ({}, {} days)", report.pair, report.period_days);
    if let Some(price) = report.current_price {
        info!("   Current price:   £{:.5}", price);
    }
    if let Some(value) = report.portfolio_value {
        info!("   Portfolio value: £{:.2}", value);
    }
    match &report.market {
        Some(m) => {
            info!("   Price change:    {:+.2}%", m.price_change_percent);
            info!("   Volatility:      {:.2}%", m.volatility_percent);
            info!("   Max drawdown:    {:.2}%", m.max_drawdown_percent);
        }
        None => warn!("   No market data for the period"),
    }
    info!(
        "   Orders:          {} filled, {} open, {} canceled, {} failed",
        report.completed_orders, report.active_orders, report.canceled_orders, report.failed_orders
    );
    info!(
        "   Margin:          £{:.4} over {} pairs ({:.3}%)",
        report.margins.gross_margin, report.margins.matched_pairs, report.margins.average_margin_percent
    );
    if let Some(reason) = &report.halt_reason {
        warn!("   HALTED: {}", reason);
    }

    let dir = output.unwrap_or_else(|| config.storage.report_dir.clone());
    let file = report.save(&dir)?;
    info!("💾 Saved {}", file.display());
    Ok(())
}
