//! Position Guard CLI
//!
//! Inspects strategy profiles, sizes entries, evaluates single positions and
//! replays profit trajectories through the monitor or the backtester.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use position_guard::backtest::{BacktestConfig, Backtester};
use position_guard::db::Database;
use position_guard::executor::PaperExecutor;
use position_guard::interfaces::{
    FeeEstimator, FeeOverrides, FlatFeeEstimator, ReplayFeed, Scenario, SystemClock,
};
use position_guard::monitor::{Monitor, MonitorConfig};
use position_guard::profile::{ProfileProvider, SignalStrength, StrategyProfile, StrategyStyle};
use position_guard::trading::{
    DecisionEvaluator, EvaluatorConfig, SizingConfig, TickContext, VolatilityAdjuster,
    VolatilityRegime,
};
use position_guard::PositionState;

/// Risk guard for leveraged positions.
#[derive(Parser)]
#[command(name = "posguard")]
#[command(about = "Staged stop-loss, trailing stop and take-profit decisions for leveraged positions", long_about = None)]
struct Cli {
    /// Database file path
    #[arg(short, long, env = "POSGUARD_DATABASE", default_value = "sqlite:./posguard.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Account-wide maximum leverage the profile is scaled to
    #[arg(long, env = "POSGUARD_MAX_LEVERAGE", default_value = "20")]
    max_leverage: u32,

    /// Strategy style
    #[arg(long, env = "POSGUARD_STYLE", default_value = "ultra-short")]
    style: StrategyStyle,

    /// Load a custom profile from JSON instead of a built-in style
    #[arg(long, env = "POSGUARD_PROFILE_FILE")]
    profile_file: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the active strategy profile
    Profile,

    /// Recommend leverage and position size for an entry
    Size {
        /// Volatility regime (high, normal, low)
        #[arg(short, long, default_value = "normal")]
        regime: VolatilityRegime,

        /// Signal strength (normal, good, strong); omit to size from the band midpoints
        #[arg(short, long)]
        strength: Option<SignalStrength>,

        /// Comma-separated fractional returns; classifies the regime instead of --regime
        #[arg(long, value_delimiter = ',', allow_hyphen_values = true)]
        returns: Option<Vec<f64>>,

        /// Return std-dev at or above which --returns classify as high volatility
        #[arg(long, default_value = "0.02")]
        high_vol_threshold: f64,

        /// Return std-dev at or below which --returns classify as low volatility
        #[arg(long, default_value = "0.005")]
        low_vol_threshold: f64,
    },

    /// Evaluate a single position once
    Evaluate {
        /// Position leverage
        #[arg(long)]
        leverage: u32,

        /// Current unrealized profit (% of margin)
        #[arg(long, allow_hyphen_values = true)]
        profit: Decimal,

        /// Peak profit seen so far (defaults to current)
        #[arg(long)]
        peak: Option<Decimal>,

        /// Share of the original size already closed
        #[arg(long, default_value = "0")]
        closed: Decimal,

        /// Minutes since entry
        #[arg(long, default_value = "0")]
        age_mins: i64,

        /// Round-trip fee cost (% of margin); defaults to the flat fee estimate
        #[arg(long)]
        fee: Option<Decimal>,
    },

    /// Replay scenario trajectories through the evaluator
    Backtest {
        /// Scenario JSON file
        #[arg(short, long)]
        scenario: String,
    },

    /// Run the live monitor loop against a replayed feed with paper fills
    Monitor {
        /// Scenario JSON file
        #[arg(short, long)]
        scenario: String,

        /// Tick interval in seconds
        #[arg(short, long, default_value = "1")]
        tick_secs: u64,

        /// Round-trip fee rate on notional
        #[arg(long, default_value = "0.0008")]
        fee_rate: Decimal,
    },

    /// Show open positions and recent decisions
    Status {
        /// Number of recent decisions to show
        #[arg(short, long, default_value = "20")]
        limit: i64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Setup logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let profile = Arc::new(load_profile(&cli)?);

    match cli.command {
        Commands::Profile => print_profile(&profile),

        Commands::Size { regime, strength, returns, high_vol_threshold, low_vol_threshold } => {
            let sizing = SizingConfig {
                high_volatility_threshold: high_vol_threshold,
                low_volatility_threshold: low_vol_threshold,
            };
            sizing.validate()?;
            let regime = match returns {
                Some(returns) => {
                    let classified = VolatilityRegime::classify(&returns, &sizing);
                    info!(samples = returns.len(), regime = %classified, "Classified volatility");
                    classified
                }
                None => regime,
            };
            let rec = match strength {
                Some(strength) => VolatilityAdjuster::adjust_for_strength(&profile, strength, regime)?,
                None => VolatilityAdjuster::adjust(&profile, regime)?,
            };

            println!("\n=== Entry Sizing ({}) ===", profile.name);
            println!("Regime:        {}", regime);
            println!("Leverage:      {}x (allowed {}-{}x)", rec.leverage, profile.leverage_min, profile.leverage_max);
            println!(
                "Position Size: {}% (allowed {}-{}%)",
                rec.position_size_percent, profile.position_size_min, profile.position_size_max
            );
        }

        Commands::Evaluate { leverage, profit, peak, closed, age_mins, fee } => {
            let evaluator = DecisionEvaluator::new(profile.clone(), EvaluatorConfig::default())?;
            let now = Utc::now();
            let mut state = PositionState::new("CLI", leverage, profile.position_size_min, now - Duration::minutes(age_mins));
            state.update_profit(profit, now);
            state.peak_profit_percent = peak.unwrap_or(profit).max(Decimal::ZERO);
            state.closed_percent = closed;

            let fee_cost = fee.unwrap_or_else(|| FlatFeeEstimator::default().fee_cost_percent(leverage));
            let risk = evaluator.risk_snapshot(&state, now)?;
            let decision = evaluator.evaluate(&mut state, &TickContext::new(now, fee_cost))?;

            println!("\n=== Position {}x @ {}% ===", leverage, profit);
            println!("Peak:            {}%", state.peak_profit_percent);
            println!("Closed:          {}%", state.closed_percent);
            println!("Held:            {} min", risk.holding_minutes);
            println!("Fee Cost:        {}%", fee_cost);
            println!("\n--- Exits ---");
            println!(
                "Stop Loss:       {}% ({}, {} pts away)",
                risk.stop_loss_percent, risk.stop_loss_tier, risk.distance_to_stop
            );
            match (&risk.trailing_stage, risk.trailing_floor) {
                (Some(stage), Some(floor)) => println!("Trailing Floor:  {}% ({})", floor, stage),
                _ => println!("Trailing Floor:  inactive"),
            }
            match risk.peak_drawdown_floor {
                Some(floor) => println!("Peak Drawdown:   {:.2}%", floor),
                None => println!("Peak Drawdown:   inactive"),
            }
            match &risk.next_take_profit {
                Some((stage, trigger)) => println!("Next TP:         +{}% ({})", trigger, stage),
                None => println!("Next TP:         none"),
            }
            println!("\nDecision:        {}", decision);
            println!("Urgency:         {:?}", decision.urgency());
        }

        Commands::Backtest { scenario } => {
            let scenarios = Scenario::load_all(&scenario)?;
            let backtester = Backtester::new(profile.clone(), BacktestConfig::default())?;
            let results = backtester.run(&scenarios)?;

            println!("\n{:<12} {:>5} {:>8} {:>8} {:>10}  {}", "SYMBOL", "LEV", "PEAK%", "CLOSED%", "REALIZED", "EXIT");
            println!("{}", "-".repeat(64));
            for trade in &results.trades {
                println!(
                    "{:<12} {:>4}x {:>8.2} {:>8.2} {:>10.2}  {}",
                    truncate(&trade.symbol, 12),
                    trade.leverage,
                    trade.peak_profit,
                    trade.closed_percent,
                    trade.realized_profit,
                    trade.exit_reason().unwrap_or("-")
                );
            }
            println!("{}", results);
        }

        Commands::Monitor { scenario, tick_secs, fee_rate } => {
            let scenarios = Scenario::load_all(&scenario)?;
            let db = Database::new(&cli.database).await?;
            let evaluator = Arc::new(DecisionEvaluator::new(profile.clone(), EvaluatorConfig::default())?);

            let (feed, positions) = ReplayFeed::from_scenarios(&profile, &scenarios, Utc::now())
                .await
                .context("Scenario rejected by profile")?;
            let longest = scenarios.iter().map(|s| s.ticks.len()).max().unwrap_or(0);
            let config = MonitorConfig {
                tick_interval_secs: tick_secs,
                stop_when_flat: true,
                max_ticks: Some(longest as u64 + 1),
                ..Default::default()
            };
            let (tx, rx) = config.channel();

            let fees = FeeOverrides::from_scenarios(
                Arc::new(FlatFeeEstimator { round_trip_fee_rate: fee_rate }),
                &scenarios,
                &positions,
            );
            let feed = Arc::new(feed);

            let monitor = Monitor::new(
                evaluator,
                feed.clone(),
                Arc::new(fees),
                Arc::new(SystemClock),
                tx,
                config,
                Some(db.clone()),
            );
            let restored = monitor.restore().await.context("Failed to restore open positions")?;
            if restored > 0 {
                info!(restored, "Resuming positions left open by a previous run");
            }
            for state in positions {
                monitor.add_position(state).await?;
            }

            let executor = tokio::spawn(PaperExecutor::new(monitor.book(), Some(db)).run(rx));
            let stats = monitor.run().await?;
            drop(monitor);
            let paper = executor.await.context("Paper executor panicked")??;

            let unread = feed.remaining().await;
            if unread > 0 {
                info!(unread, "Scenario readings left unreplayed");
            }

            println!("\n{}", stats);
            println!("{}", paper);
        }

        Commands::Status { limit } => {
            let db = Database::new(&cli.database).await?;
            let open = db.get_open_positions().await?;

            println!("\n--- Open Positions ({}) ---", open.len());
            if !open.is_empty() {
                println!("{:<10} {:<12} {:>5} {:>9} {:>9} {:>8}", "ID", "SYMBOL", "LEV", "PROFIT%", "PEAK%", "CLOSED%");
                for p in &open {
                    println!(
                        "{:<10} {:<12} {:>4}x {:>9.2} {:>9.2} {:>8.2}",
                        truncate(&p.id, 10),
                        truncate(&p.symbol, 12),
                        p.leverage,
                        p.current_profit_percent,
                        p.peak_profit_percent,
                        p.closed_percent
                    );
                }
            }

            let decisions = db.recent_decisions(limit).await?;
            println!("\n--- Recent Decisions ({}) ---", decisions.len());
            for d in &decisions {
                println!(
                    "{}  {:<10} {:<12} {}",
                    d.decided_at,
                    truncate(&d.position_id, 10),
                    truncate(&d.symbol, 12),
                    d.detail
                );
            }

            let counts = db.decision_counts().await?;
            if !counts.is_empty() {
                println!("\n--- Decisions by Reason ---");
                for (reason, n) in counts {
                    println!("{:<16} {}", reason, n);
                }
            }
        }
    }

    Ok(())
}

fn load_profile(cli: &Cli) -> Result<StrategyProfile> {
    match &cli.profile_file {
        Some(path) => ProfileProvider::from_file(path),
        None => ProfileProvider::load(cli.style, cli.max_leverage)
            .with_context(|| format!("Failed to build {} profile", cli.style.as_str())),
    }
}

fn print_profile(p: &StrategyProfile) {
    println!("\n=== Profile: {} ===", p.name);
    if !p.description.is_empty() {
        println!("{}", p.description);
    }
    println!("Leverage:        {}-{}x (normal {}x, good {}x, strong {}x)",
        p.leverage_min, p.leverage_max,
        p.leverage_recommend.normal, p.leverage_recommend.good, p.leverage_recommend.strong);
    println!("Position Size:   {}-{}% (normal {}, good {}, strong {})",
        p.position_size_min, p.position_size_max,
        p.position_size_recommend.normal, p.position_size_recommend.good, p.position_size_recommend.strong);
    println!("Peak Drawdown:   {}% of peak", p.peak_drawdown_protection);
    println!("Code Protection: {}", if p.enable_code_level_protection { "enabled" } else { "disabled" });

    println!("\n--- Stop-Loss Tiers ---");
    for t in &p.stop_loss_tiers {
        let band = match t.max_leverage {
            Some(max) => format!("{}-{}x", t.min_leverage, max),
            None => format!("{}x+", t.min_leverage),
        };
        println!("{:<12} {:<10} {:>6}%", t.name, band, t.stop_loss_percent);
    }

    println!("\n--- Trailing Stages ---");
    for s in &p.trailing_stages {
        let band = match s.max_profit {
            Some(max) => format!("{}-{}%", s.min_profit, max),
            None => format!("{}%+", s.min_profit),
        };
        println!("{:<8} {:<10} giveback {}% (floor from {}%)", s.name, band, s.drawdown_percent, s.advisory_floor());
    }

    println!("\n--- Take Profit ---");
    for (stage, target) in p.take_profit_targets() {
        println!("{:<8} +{}% close {}% (total {}%)", stage.name, stage.trigger, stage.close_percent, target);
    }

    println!("\n--- Advisory ---");
    println!("Stop Loss:       {}% / {}% / {}%",
        p.advisory_stop_loss.low, p.advisory_stop_loss.mid, p.advisory_stop_loss.high);
    for level in &p.advisory_trailing {
        println!("Trail:           at +{}% move stop to +{}%", level.trigger, level.stop_at);
    }
    for (label, value) in [("Entry", &p.entry_condition), ("Risk", &p.risk_tolerance), ("Style", &p.trading_style)] {
        if !value.is_empty() {
            println!("{:<16} {}", format!("{label}:"), value);
        }
    }
    println!("\nVolatility: high x{}/x{}, normal x{}/x{}, low x{}/x{} (leverage/size)",
        p.volatility_adjustment.high.leverage_factor, p.volatility_adjustment.high.position_factor,
        p.volatility_adjustment.normal.leverage_factor, p.volatility_adjustment.normal.position_factor,
        p.volatility_adjustment.low.leverage_factor, p.volatility_adjustment.low.position_factor);
}

/// Truncate a string for display
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{head}...")
    }
}
