//! Backtesting engine for replaying profit trajectories through the
//! evaluator.
//!
//! Features:
//! - Replay recorded or synthetic trajectories on a simulated clock
//! - Apply every non-hold decision as an immediate fill
//! - Attribute each exit to the rule that produced it
//! - Summarize realized profit with mean / standard deviation

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use statrs::statistics::Statistics;
use tracing::{debug, info};

use crate::interfaces::{FeeEstimator, FlatFeeEstimator, Scenario};
use crate::profile::StrategyProfile;
use crate::trading::{DecisionEvaluator, EvaluatorConfig, TickContext};

/// Backtesting configuration.
#[derive(Debug, Clone)]
pub struct BacktestConfig {
    /// Exit rule policy
    pub evaluator_config: EvaluatorConfig,

    /// Fee model for scenarios without an explicit fee cost
    pub fees: FlatFeeEstimator,

    /// Simulated entry time of every scenario
    pub start_time: DateTime<Utc>,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            evaluator_config: EvaluatorConfig::default(),
            fees: FlatFeeEstimator::default(),
            start_time: Utc::now(),
        }
    }
}

/// One simulated fill.
#[derive(Debug, Clone)]
pub struct BacktestFill {
    pub at: DateTime<Utc>,
    pub kind: &'static str,
    pub reason: String,
    pub percent: Decimal,
    pub profit_percent: Decimal,
}

/// A replayed position.
#[derive(Debug, Clone)]
pub struct BacktestTrade {
    pub symbol: String,
    pub leverage: u32,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub peak_profit: Decimal,
    pub closed_percent: Decimal,
    /// Sum of closed share × profit at fill, in percent-of-margin points
    pub realized_profit: Decimal,
    pub fills: Vec<BacktestFill>,
}

impl BacktestTrade {
    pub fn is_closed(&self) -> bool {
        self.closed_percent >= dec!(100)
    }

    /// Reason of the fill that finished the position.
    pub fn exit_reason(&self) -> Option<&str> {
        if self.is_closed() {
            self.fills.last().map(|f| f.reason.as_str())
        } else {
            None
        }
    }
}

/// Backtest results summary.
#[derive(Debug, Clone)]
pub struct BacktestResults {
    /// Total number of replayed positions
    pub total_trades: usize,

    /// Positions fully closed within their trajectory
    pub closed_trades: usize,

    /// Positions with size left when the trajectory ended
    pub open_at_end: usize,

    /// Positions with positive realized profit
    pub winning_trades: usize,

    /// Positions with negative realized profit
    pub losing_trades: usize,

    pub win_rate: f64,

    /// Mean realized profit over positions with at least one fill
    pub avg_profit: f64,

    /// Sample standard deviation of realized profit
    pub profit_std_dev: f64,

    pub total_realized: Decimal,

    /// Fill count per exit reason
    pub exits_by_reason: BTreeMap<String, usize>,

    pub trades: Vec<BacktestTrade>,
}

impl std::fmt::Display for BacktestResults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n{:=^60}", " BACKTEST RESULTS ")?;
        writeln!(f)?;
        writeln!(f, "--- Positions ---")?;
        writeln!(f, "Total:       {} ({} closed, {} open at end)",
            self.total_trades, self.closed_trades, self.open_at_end)?;
        writeln!(f, "Winners:     {} ({:.1}%)", self.winning_trades, self.win_rate * 100.0)?;
        writeln!(f, "Losers:      {}", self.losing_trades)?;
        writeln!(f)?;
        writeln!(f, "--- Realized Profit ---")?;
        writeln!(f, "Total:       {:.2}", self.total_realized)?;
        writeln!(f, "Mean:        {:.2}", self.avg_profit)?;
        writeln!(f, "Std Dev:     {:.2}", self.profit_std_dev)?;
        writeln!(f)?;
        writeln!(f, "--- Exits by Reason ---")?;
        for (reason, count) in &self.exits_by_reason {
            writeln!(f, "{:<16} {}", reason, count)?;
        }
        writeln!(f, "{:=^60}", "")?;
        Ok(())
    }
}

/// Backtesting engine.
pub struct Backtester {
    config: BacktestConfig,
    evaluator: DecisionEvaluator,
}

impl Backtester {
    /// Create a new backtester.
    pub fn new(profile: Arc<StrategyProfile>, config: BacktestConfig) -> Result<Self> {
        let evaluator = DecisionEvaluator::new(profile, config.evaluator_config.clone())
            .context("Failed to build evaluator")?;
        Ok(Self { config, evaluator })
    }

    /// Replay every scenario and summarize.
    pub fn run(&self, scenarios: &[Scenario]) -> Result<BacktestResults> {
        info!(scenarios = scenarios.len(), "Starting backtest");

        let trades = scenarios
            .iter()
            .enumerate()
            .map(|(i, s)| {
                self.run_scenario(s)
                    .with_context(|| format!("Scenario {} ({}) failed", i, s.symbol))
            })
            .collect::<Result<Vec<_>>>()?;

        let results = Self::summarize(trades);
        info!(
            trades = results.total_trades,
            closed = results.closed_trades,
            realized = %results.total_realized,
            "Backtest complete"
        );
        Ok(results)
    }

    /// Replay one trajectory until it ends or the position is closed.
    pub fn run_scenario(&self, scenario: &Scenario) -> Result<BacktestTrade> {
        let opened_at = self.config.start_time;
        let mut state = scenario.open(self.evaluator.profile(), opened_at)?;
        let fee_cost = scenario
            .fee_cost_percent
            .unwrap_or_else(|| self.config.fees.fee_cost_percent(scenario.leverage));

        let mut fills = Vec::new();
        let mut realized = Decimal::ZERO;
        let mut exit_time = None;

        for tick in &scenario.ticks {
            let now = Scenario::tick_time(opened_at, tick);
            state.update_profit(tick.profit_percent, now);

            let decision = self.evaluator.evaluate(&mut state, &TickContext::new(now, fee_cost))?;
            let Some(reason) = decision.reason() else {
                continue;
            };

            let filled = state.record_fill(decision.close_percent(state.remaining_percent()))?;
            realized += filled * tick.profit_percent / dec!(100);
            debug!(
                symbol = %state.symbol,
                offset = tick.offset_secs,
                filled = %filled,
                reason = %reason,
                "Simulated fill"
            );
            fills.push(BacktestFill {
                at: now,
                kind: decision.kind(),
                reason: reason.as_str().to_string(),
                percent: filled,
                profit_percent: tick.profit_percent,
            });

            if state.is_closed() {
                exit_time = Some(now);
                break;
            }
        }

        Ok(BacktestTrade {
            symbol: state.symbol,
            leverage: state.leverage,
            entry_time: opened_at,
            exit_time,
            peak_profit: state.peak_profit_percent,
            closed_percent: state.closed_percent,
            realized_profit: realized,
            fills,
        })
    }

    fn summarize(trades: Vec<BacktestTrade>) -> BacktestResults {
        let closed_trades = trades.iter().filter(|t| t.is_closed()).count();
        let filled: Vec<&BacktestTrade> = trades.iter().filter(|t| !t.fills.is_empty()).collect();
        let winning_trades = filled.iter().filter(|t| t.realized_profit > Decimal::ZERO).count();
        let losing_trades = filled.iter().filter(|t| t.realized_profit < Decimal::ZERO).count();
        let win_rate = if filled.is_empty() {
            0.0
        } else {
            winning_trades as f64 / filled.len() as f64
        };

        let profits: Vec<f64> = filled
            .iter()
            .map(|t| t.realized_profit.to_f64().unwrap_or(0.0))
            .collect();
        let avg_profit = if profits.is_empty() { 0.0 } else { profits.iter().mean() };
        let profit_std_dev = if profits.len() < 2 { 0.0 } else { profits.iter().std_dev() };

        let mut exits_by_reason = BTreeMap::new();
        for fill in trades.iter().flat_map(|t| &t.fills) {
            *exits_by_reason.entry(fill.reason.clone()).or_insert(0) += 1;
        }

        BacktestResults {
            total_trades: trades.len(),
            closed_trades,
            open_at_end: trades.len() - closed_trades,
            winning_trades,
            losing_trades,
            win_rate,
            avg_profit,
            profit_std_dev,
            total_realized: trades.iter().map(|t| t.realized_profit).sum(),
            exits_by_reason,
            trades,
        }
    }
}
