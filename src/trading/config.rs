//! Evaluator and sizing policy configuration.

use chrono::Duration;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{GuardError, GuardResult};

/// Policy constants for the exit rules that are not part of a profile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluatorConfig {
    /// Holding time after which a profitable position is closed (minutes)
    pub max_holding_minutes: i64,

    /// Lower bound of the lock-in band, exclusive (percent)
    pub lock_in_min_profit: Decimal,

    /// Upper bound of the lock-in band, exclusive (percent)
    pub lock_in_max_profit: Decimal,

    /// Bank small gains inside the lock-in band
    pub enable_lock_in: bool,

    /// Close profitable positions held past the time limit
    pub enable_time_limit: bool,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            max_holding_minutes: 30,
            lock_in_min_profit: dec!(2),
            lock_in_max_profit: dec!(4),
            enable_lock_in: true,
            enable_time_limit: true,
        }
    }
}

impl EvaluatorConfig {
    pub fn max_holding(&self) -> Duration {
        Duration::minutes(self.max_holding_minutes)
    }

    pub fn validate(&self) -> GuardResult<()> {
        if self.max_holding_minutes <= 0 {
            return Err(GuardError::config("max holding time must be positive"));
        }
        if self.lock_in_min_profit >= self.lock_in_max_profit {
            return Err(GuardError::config(format!(
                "lock-in band ({}, {}) is empty",
                self.lock_in_min_profit, self.lock_in_max_profit
            )));
        }
        Ok(())
    }
}

/// Thresholds used to classify a return series into a volatility regime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    /// Standard deviation of per-bar returns at or above which the market is
    /// treated as highly volatile (fraction, 0.02 = 2%)
    pub high_volatility_threshold: f64,

    /// Standard deviation at or below which the market is treated as quiet
    pub low_volatility_threshold: f64,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            high_volatility_threshold: 0.02,
            low_volatility_threshold: 0.005,
        }
    }
}

impl SizingConfig {
    pub fn validate(&self) -> GuardResult<()> {
        if !(self.low_volatility_threshold >= 0.0
            && self.low_volatility_threshold < self.high_volatility_threshold)
        {
            return Err(GuardError::config(format!(
                "volatility thresholds must satisfy 0 <= low < high (got {} / {})",
                self.low_volatility_threshold, self.high_volatility_threshold
            )));
        }
        Ok(())
    }
}
