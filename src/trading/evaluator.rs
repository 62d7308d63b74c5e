//! Exit decision engine.
//!
//! Rules are checked in a fixed priority order and the first match wins:
//! 1. Tier stop-loss
//! 2. Peak-drawdown protection
//! 3. Staged trailing stop
//! 4. Partial take-profit ladder
//! 5. Cycle lock-in
//! 6. Time limit
//!
//! Anything else is a hold.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info, warn};

use super::{EvaluatorConfig, TierResolver};
use crate::error::GuardResult;
use crate::models::{Decision, ExitReason, PositionState};
use crate::profile::StrategyProfile;

/// External inputs for one tick.
#[derive(Debug, Clone, Copy)]
pub struct TickContext {
    /// Tick timestamp from the clock
    pub now: DateTime<Utc>,

    /// Estimated round-trip fee cost in profit-percent terms
    pub fee_cost_percent: Decimal,
}

impl TickContext {
    pub fn new(now: DateTime<Utc>, fee_cost_percent: Decimal) -> Self {
        Self { now, fee_cost_percent }
    }
}

/// Distance of a position to each of its exits.
#[derive(Debug, Clone)]
pub struct PositionRisk {
    pub stop_loss_tier: String,
    pub stop_loss_percent: Decimal,
    /// Percentage points above the hard stop
    pub distance_to_stop: Decimal,
    pub trailing_stage: Option<String>,
    /// Live trailing floor computed from the current peak
    pub trailing_floor: Option<Decimal>,
    /// Profit at which peak-drawdown protection fires, if a peak exists
    pub peak_drawdown_floor: Option<Decimal>,
    /// Next unrealized take-profit rung and its trigger
    pub next_take_profit: Option<(String, Decimal)>,
    pub holding_minutes: i64,
}

/// Per-tick exit evaluator bound to one validated profile.
pub struct DecisionEvaluator {
    profile: Arc<StrategyProfile>,
    config: EvaluatorConfig,
}

impl DecisionEvaluator {
    /// Create an evaluator. Refuses invalid profiles and configs.
    pub fn new(profile: Arc<StrategyProfile>, config: EvaluatorConfig) -> GuardResult<Self> {
        profile.validate()?;
        config.validate()?;
        Ok(Self { profile, config })
    }

    pub fn profile(&self) -> &Arc<StrategyProfile> {
        &self.profile
    }

    pub fn config(&self) -> &EvaluatorConfig {
        &self.config
    }

    /// Track the peak for this tick, then decide.
    pub fn evaluate(&self, state: &mut PositionState, ctx: &TickContext) -> GuardResult<Decision> {
        if state.is_closed() {
            return Err(state.stale());
        }
        state.track_peak();

        let decision = self.decide(state, ctx)?;
        match &decision {
            Decision::Hold => debug!(
                position = %state.id,
                profit = %state.current_profit_percent,
                peak = %state.peak_profit_percent,
                "Hold"
            ),
            Decision::StopLoss { reason } => warn!(
                position = %state.id,
                symbol = %state.symbol,
                leverage = state.leverage,
                profit = %state.current_profit_percent,
                reason = %reason,
                "Stop loss triggered"
            ),
            other => info!(
                position = %state.id,
                symbol = %state.symbol,
                profit = %state.current_profit_percent,
                peak = %state.peak_profit_percent,
                decision = %other,
                "Exit rule triggered"
            ),
        }
        Ok(decision)
    }

    /// Pure rule chain over an immutable state.
    ///
    /// The peak used is `max(peak, current)`, so a state whose peak has not
    /// been tracked yet still sees this tick's high.
    pub fn decide(&self, state: &PositionState, ctx: &TickContext) -> GuardResult<Decision> {
        if state.is_closed() {
            return Err(state.stale());
        }
        let current = state.current_profit_percent;
        let peak = state.peak_profit_percent.max(current);
        let protected = self.profile.enable_code_level_protection;

        if protected {
            if let Some(decision) = self.check_stop_loss(state.leverage, current)? {
                return Ok(decision);
            }
        }
        if let Some(decision) = self.check_peak_drawdown(peak, current) {
            return Ok(decision);
        }
        if protected {
            if let Some(decision) = self.check_trailing_stop(peak, current) {
                return Ok(decision);
            }
        }
        if let Some(decision) = self.check_take_profit(current, state.closed_percent) {
            return Ok(decision);
        }
        if let Some(decision) = self.check_lock_in(current) {
            return Ok(decision);
        }
        if let Some(decision) = self.check_time_limit(state, peak, ctx) {
            return Ok(decision);
        }
        Ok(Decision::Hold)
    }

    fn check_stop_loss(&self, leverage: u32, current: Decimal) -> GuardResult<Option<Decision>> {
        let tier = TierResolver::stop_loss_tier(&self.profile, leverage)?;
        if current <= tier.stop_loss_percent {
            return Ok(Some(Decision::StopLoss {
                reason: ExitReason::StopLoss {
                    tier: tier.name.clone(),
                    threshold: tier.stop_loss_percent,
                },
            }));
        }
        Ok(None)
    }

    fn check_peak_drawdown(&self, peak: Decimal, current: Decimal) -> Option<Decision> {
        if peak <= Decimal::ZERO {
            return None;
        }
        let giveback = peak - current;
        // giveback / peak >= protection / 100, without the division
        if giveback * dec!(100) >= self.profile.peak_drawdown_protection * peak {
            return Some(Decision::FullClose {
                reason: ExitReason::PeakDrawdown {
                    peak,
                    giveback_pct: (giveback * dec!(100) / peak).round_dp(2),
                },
            });
        }
        None
    }

    fn check_trailing_stop(&self, peak: Decimal, current: Decimal) -> Option<Decision> {
        let stage = TierResolver::trailing_stage(&self.profile, peak)?;
        let floor = peak - stage.drawdown_percent;
        if current <= floor {
            return Some(Decision::FullClose {
                reason: ExitReason::TrailingStop {
                    stage: stage.name.clone(),
                    floor,
                },
            });
        }
        None
    }

    fn check_take_profit(&self, current: Decimal, closed: Decimal) -> Option<Decision> {
        for (stage, target) in self.profile.take_profit_targets() {
            if current < stage.trigger {
                break;
            }
            if closed < target {
                return Some(Decision::PartialClose {
                    percent: target - closed,
                    reason: ExitReason::TakeProfit {
                        stage: stage.name.clone(),
                        trigger: stage.trigger,
                    },
                });
            }
        }
        None
    }

    fn check_lock_in(&self, current: Decimal) -> Option<Decision> {
        let cfg = &self.config;
        if cfg.enable_lock_in && current > cfg.lock_in_min_profit && current < cfg.lock_in_max_profit {
            return Some(Decision::FullClose {
                reason: ExitReason::CycleLockIn,
            });
        }
        None
    }

    fn check_time_limit(
        &self,
        state: &PositionState,
        peak: Decimal,
        ctx: &TickContext,
    ) -> Option<Decision> {
        if !self.config.enable_time_limit
            || state.age(ctx.now) < self.config.max_holding()
            || state.current_profit_percent <= ctx.fee_cost_percent
        {
            return None;
        }
        // Once a trailing stage is active the trailing stop manages the exit.
        if TierResolver::trailing_stage(&self.profile, peak).is_some() {
            return None;
        }
        Some(Decision::FullClose {
            reason: ExitReason::TimeLimit,
        })
    }

    /// Distances to every exit for display.
    pub fn risk_snapshot(&self, state: &PositionState, now: DateTime<Utc>) -> GuardResult<PositionRisk> {
        let tier = TierResolver::stop_loss_tier(&self.profile, state.leverage)?;
        let current = state.current_profit_percent;
        let peak = state.peak_profit_percent.max(current);
        let stage = TierResolver::trailing_stage(&self.profile, peak);

        let peak_drawdown_floor = (peak > Decimal::ZERO)
            .then(|| peak - peak * self.profile.peak_drawdown_protection / dec!(100));

        let next_take_profit = self
            .profile
            .take_profit_targets()
            .find(|(_, target)| state.closed_percent < *target)
            .map(|(stage, _)| (stage.name.clone(), stage.trigger));

        Ok(PositionRisk {
            stop_loss_tier: tier.name.clone(),
            stop_loss_percent: tier.stop_loss_percent,
            distance_to_stop: current - tier.stop_loss_percent,
            trailing_stage: stage.map(|s| s.name.clone()),
            trailing_floor: stage.map(|s| peak - s.drawdown_percent),
            peak_drawdown_floor,
            next_take_profit,
            holding_minutes: state.age(now).num_minutes(),
        })
    }
}
