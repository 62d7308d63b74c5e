//! Scenario files and a feed that replays them tick by tick.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{FeeEstimator, FeeOverrides, PositionFeed};
use crate::error::GuardResult;
use crate::models::PositionState;
use crate::profile::StrategyProfile;

/// One observed profit reading, relative to entry.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScenarioTick {
    pub offset_secs: i64,
    pub profit_percent: Decimal,
}

/// A recorded or synthetic profit trajectory for one position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub symbol: String,
    pub leverage: u32,
    pub size_percent: Decimal,
    /// Overrides the fee estimator for this position
    #[serde(default)]
    pub fee_cost_percent: Option<Decimal>,
    pub ticks: Vec<ScenarioTick>,
}

impl Scenario {
    /// Load a JSON array of scenarios.
    pub fn load_all(path: impl AsRef<Path>) -> Result<Vec<Scenario>> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario file {}", path.display()))?;
        let mut scenarios: Vec<Scenario> = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse scenario file {}", path.display()))?;
        for s in &mut scenarios {
            s.ticks.sort_by_key(|t| t.offset_secs);
        }
        Ok(scenarios)
    }

    /// Open a position for this scenario within the profile bounds.
    pub fn open(&self, profile: &StrategyProfile, opened_at: DateTime<Utc>) -> GuardResult<PositionState> {
        PositionState::open(profile, self.symbol.clone(), self.leverage, self.size_percent, opened_at)
    }

    /// Timestamp of a tick given the entry time.
    pub fn tick_time(opened_at: DateTime<Utc>, tick: &ScenarioTick) -> DateTime<Utc> {
        opened_at + Duration::seconds(tick.offset_secs)
    }

    /// Duration covered by the trajectory.
    pub fn duration(&self) -> Duration {
        Duration::seconds(self.ticks.last().map_or(0, |t| t.offset_secs))
    }
}

/// Feed that hands out each position's readings in order, one per call.
#[derive(Default)]
pub struct ReplayFeed {
    queues: Mutex<HashMap<String, VecDeque<ScenarioTick>>>,
}

impl ReplayFeed {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue readings for a position.
    pub async fn insert(&self, position_id: impl Into<String>, ticks: Vec<ScenarioTick>) {
        self.queues
            .lock()
            .await
            .insert(position_id.into(), ticks.into_iter().collect());
    }

    /// Open one position per scenario and queue its readings.
    pub async fn from_scenarios(
        profile: &StrategyProfile,
        scenarios: &[Scenario],
        opened_at: DateTime<Utc>,
    ) -> GuardResult<(Self, Vec<PositionState>)> {
        let feed = Self::new();
        let mut positions = Vec::with_capacity(scenarios.len());
        for scenario in scenarios {
            let state = scenario.open(profile, opened_at)?;
            feed.insert(state.id.clone(), scenario.ticks.clone()).await;
            positions.push(state);
        }
        Ok((feed, positions))
    }

    /// Readings not yet handed out, across all positions.
    pub async fn remaining(&self) -> usize {
        self.queues.lock().await.values().map(VecDeque::len).sum()
    }
}

impl FeeOverrides {
    /// Carry each scenario's fee cost onto the position opened for it.
    /// `positions` must be in scenario order, as `ReplayFeed::from_scenarios` returns them.
    pub fn from_scenarios(
        base: Arc<dyn FeeEstimator>,
        scenarios: &[Scenario],
        positions: &[PositionState],
    ) -> Self {
        let mut fees = Self::new(base);
        for (scenario, state) in scenarios.iter().zip(positions) {
            if let Some(fee) = scenario.fee_cost_percent {
                fees.insert(state.id.clone(), fee);
            }
        }
        fees
    }
}

#[async_trait]
impl PositionFeed for ReplayFeed {
    async fn profit_percent(&self, position_id: &str, _symbol: &str) -> Result<Option<Decimal>> {
        let mut queues = self.queues.lock().await;
        Ok(queues
            .get_mut(position_id)
            .and_then(VecDeque::pop_front)
            .map(|tick| tick.profit_percent))
    }
}
