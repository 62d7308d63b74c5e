//! Collaborator seams: quote feed, fee estimate, clock.

mod replay;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

pub use replay::{ReplayFeed, Scenario, ScenarioTick};

/// Source of the latest unrealized profit for a position.
#[async_trait]
pub trait PositionFeed: Send + Sync {
    /// Current profit in percent of margin, or `None` when no quote is
    /// available this tick.
    async fn profit_percent(&self, position_id: &str, symbol: &str) -> Result<Option<Decimal>>;
}

/// Estimates the round-trip fee cost of closing a position, expressed in
/// the same units as profit percent.
pub trait FeeEstimator: Send + Sync {
    fn fee_cost_percent(&self, leverage: u32) -> Decimal;

    /// Fee cost for one position. Defaults to the leverage-based estimate.
    fn position_fee_cost_percent(&self, _position_id: &str, leverage: u32) -> Decimal {
        self.fee_cost_percent(leverage)
    }
}

/// Flat taker fee applied on entry and exit.
#[derive(Debug, Clone, Copy)]
pub struct FlatFeeEstimator {
    /// Combined entry + exit fee rate on notional (0.0008 = 0.08%)
    pub round_trip_fee_rate: Decimal,
}

impl Default for FlatFeeEstimator {
    fn default() -> Self {
        Self {
            round_trip_fee_rate: dec!(0.0008), // 0.04% taker each way
        }
    }
}

impl FeeEstimator for FlatFeeEstimator {
    fn fee_cost_percent(&self, leverage: u32) -> Decimal {
        self.round_trip_fee_rate * Decimal::from(leverage) * dec!(100)
    }
}

/// Per-position fee costs layered over a fallback estimator.
pub struct FeeOverrides {
    base: Arc<dyn FeeEstimator>,
    overrides: HashMap<String, Decimal>,
}

impl FeeOverrides {
    pub fn new(base: Arc<dyn FeeEstimator>) -> Self {
        Self { base, overrides: HashMap::new() }
    }

    pub fn insert(&mut self, position_id: impl Into<String>, fee_cost_percent: Decimal) {
        self.overrides.insert(position_id.into(), fee_cost_percent);
    }

    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }
}

impl FeeEstimator for FeeOverrides {
    fn fee_cost_percent(&self, leverage: u32) -> Decimal {
        self.base.fee_cost_percent(leverage)
    }

    fn position_fee_cost_percent(&self, position_id: &str, leverage: u32) -> Decimal {
        self.overrides
            .get(position_id)
            .copied()
            .unwrap_or_else(|| self.base.position_fee_cost_percent(position_id, leverage))
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_fee_scales_with_leverage() {
        let fees = FlatFeeEstimator::default();
        assert_eq!(fees.fee_cost_percent(10), dec!(0.8));
        assert_eq!(fees.fee_cost_percent(1), dec!(0.08));
    }

    #[test]
    fn test_manual_clock() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance(Duration::minutes(30));
        assert_eq!(clock.now() - start, Duration::minutes(30));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn test_manual_clock_keeps_moving_after_poison() {
        let start = Utc::now();
        let clock = Arc::new(ManualClock::new(start));
        let poisoner = clock.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.now.lock().unwrap();
            panic!("poison the clock lock");
        })
        .join();
        assert!(clock.now.is_poisoned());

        clock.advance(Duration::seconds(10));
        assert_eq!(clock.now(), start + Duration::seconds(10));
        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn test_fee_overrides_fall_back_to_base() {
        let mut fees = FeeOverrides::new(Arc::new(FlatFeeEstimator::default()));
        fees.insert("pos-1", dec!(0.5));

        assert_eq!(fees.position_fee_cost_percent("pos-1", 10), dec!(0.5));
        assert_eq!(fees.position_fee_cost_percent("pos-2", 10), dec!(0.8));
        assert_eq!(fees.fee_cost_percent(10), dec!(0.8));
        assert_eq!(fees.len(), 1);
    }
}
