//! Per-position state tracked between ticks.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use crate::error::{GuardError, GuardResult};
use crate::profile::StrategyProfile;

/// Live state of one open leveraged position.
///
/// Profit figures are unrealized P&L as a percentage of margin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionState {
    /// Position identifier
    pub id: String,

    /// Instrument symbol (e.g. "BTCUSDT")
    pub symbol: String,

    /// When the position was opened
    pub entry_timestamp: DateTime<Utc>,

    /// Leverage the position was opened with
    pub leverage: u32,

    /// Share of account equity committed, in percent
    pub size_percent: Decimal,

    /// Latest unrealized profit reported by the feed
    #[serde(default)]
    pub current_profit_percent: Decimal,

    /// Highest profit seen since entry, never decreases
    #[serde(default)]
    pub peak_profit_percent: Decimal,

    /// Share of the original size already closed, 0 to 100
    #[serde(default)]
    pub closed_percent: Decimal,

    /// Last time the state changed
    #[serde(default = "Utc::now")]
    pub last_updated: DateTime<Utc>,
}

impl PositionState {
    /// Open a position under `profile`, rejecting leverage or size outside
    /// the profile bounds.
    pub fn open(
        profile: &StrategyProfile,
        symbol: impl Into<String>,
        leverage: u32,
        size_percent: Decimal,
        opened_at: DateTime<Utc>,
    ) -> GuardResult<Self> {
        if leverage < profile.leverage_min || leverage > profile.leverage_max {
            return Err(GuardError::config(format!(
                "leverage {leverage}x outside profile bounds {}..={}",
                profile.leverage_min, profile.leverage_max
            )));
        }
        if size_percent < profile.position_size_min || size_percent > profile.position_size_max {
            return Err(GuardError::config(format!(
                "size {size_percent}% outside profile bounds {}..={}",
                profile.position_size_min, profile.position_size_max
            )));
        }
        Ok(Self::new(symbol, leverage, size_percent, opened_at))
    }

    /// Create a position without profile bound checks.
    pub fn new(
        symbol: impl Into<String>,
        leverage: u32,
        size_percent: Decimal,
        opened_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            symbol: symbol.into(),
            entry_timestamp: opened_at,
            leverage,
            size_percent,
            current_profit_percent: Decimal::ZERO,
            peak_profit_percent: Decimal::ZERO,
            closed_percent: Decimal::ZERO,
            last_updated: opened_at,
        }
    }

    /// Record the latest profit reading from the feed. Peak tracking is left
    /// to the evaluator.
    pub fn update_profit(&mut self, profit_percent: Decimal, at: DateTime<Utc>) {
        self.current_profit_percent = profit_percent;
        self.last_updated = at;
    }

    /// Raise the peak to the current profit if it is higher.
    pub fn track_peak(&mut self) {
        if self.current_profit_percent > self.peak_profit_percent {
            self.peak_profit_percent = self.current_profit_percent;
        }
    }

    /// Apply a confirmed fill of `percent` of the original size.
    ///
    /// Returns the percentage actually closed (fills past 100 are clamped).
    pub fn record_fill(&mut self, percent: Decimal) -> GuardResult<Decimal> {
        if self.is_closed() {
            return Err(self.stale());
        }
        if percent <= Decimal::ZERO {
            return Err(GuardError::config(format!("fill of {percent}% is not positive")));
        }
        let filled = percent.min(self.remaining_percent());
        self.closed_percent += filled;
        Ok(filled)
    }

    /// Share of the original size still open.
    pub fn remaining_percent(&self) -> Decimal {
        (dec!(100) - self.closed_percent).max(Decimal::ZERO)
    }

    /// A position is closed once the whole original size has been realized.
    pub fn is_closed(&self) -> bool {
        self.closed_percent >= dec!(100)
    }

    /// Time held as of `now`.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.entry_timestamp
    }

    /// Giveback from peak in percentage points.
    pub fn drawdown_from_peak(&self) -> Decimal {
        (self.peak_profit_percent - self.current_profit_percent).max(Decimal::ZERO)
    }

    pub(crate) fn stale(&self) -> GuardError {
        GuardError::StaleState {
            position_id: self.id.clone(),
            closed_percent: self.closed_percent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ultra_short;

    fn position() -> PositionState {
        PositionState::new("BTCUSDT", 10, dec!(20), Utc::now())
    }

    #[test]
    fn test_peak_only_rises() {
        let mut pos = position();
        let now = Utc::now();

        pos.update_profit(dec!(3.2), now);
        pos.track_peak();
        assert_eq!(pos.peak_profit_percent, dec!(3.2));

        pos.update_profit(dec!(1.1), now);
        pos.track_peak();
        assert_eq!(pos.peak_profit_percent, dec!(3.2));
        assert_eq!(pos.drawdown_from_peak(), dec!(2.1));
    }

    #[test]
    fn test_negative_profit_keeps_zero_peak() {
        let mut pos = position();
        pos.update_profit(dec!(-2), Utc::now());
        pos.track_peak();
        assert_eq!(pos.peak_profit_percent, Decimal::ZERO);
    }

    #[test]
    fn test_fills_accumulate_and_clamp() {
        let mut pos = position();
        assert_eq!(pos.record_fill(dec!(50)).unwrap(), dec!(50));
        assert_eq!(pos.remaining_percent(), dec!(50));
        assert!(!pos.is_closed());

        assert_eq!(pos.record_fill(dec!(80)).unwrap(), dec!(50));
        assert!(pos.is_closed());

        let err = pos.record_fill(dec!(10)).unwrap_err();
        assert!(matches!(err, GuardError::StaleState { .. }));
    }

    #[test]
    fn test_open_checks_profile_bounds() {
        let profile = ultra_short(10); // leverage 5..=8, size 18..=25
        let now = Utc::now();

        assert!(PositionState::open(&profile, "ETHUSDT", 8, dec!(20), now).is_ok());
        assert!(PositionState::open(&profile, "ETHUSDT", 9, dec!(20), now).is_err());
        assert!(PositionState::open(&profile, "ETHUSDT", 6, dec!(30), now).is_err());
    }

    #[test]
    fn test_age() {
        let opened = Utc::now() - Duration::minutes(31);
        let pos = PositionState::new("BTCUSDT", 10, dec!(20), opened);
        assert!(pos.age(Utc::now()) >= Duration::minutes(30));
    }
}
