//! Monitor: the per-tick evaluation loop over every open position.
//!
//! Handles:
//! - Pulling the latest profit for each position from the feed
//! - Evaluating all positions concurrently, each under its own lock
//! - Dispatching non-hold decisions to the executor without blocking
//! - Persisting state and the decision journal for crash recovery

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{Mutex, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info, warn};

use crate::db::Database;
use crate::error::GuardError;
use crate::interfaces::{Clock, FeeEstimator, PositionFeed};
use crate::models::{Decision, PositionState};
use crate::trading::{DecisionEvaluator, TickContext};

/// Open positions keyed by id. Each entry's mutex is its single writer lock.
pub type PositionBook = Arc<RwLock<HashMap<String, Arc<Mutex<PositionState>>>>>;

/// Monitor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Tick cadence (seconds)
    pub tick_interval_secs: u64,

    /// Capacity of the decision channel
    pub channel_capacity: usize,

    /// Exit the loop once no positions remain
    pub stop_when_flat: bool,

    /// Exit the loop after this many ticks
    pub max_ticks: Option<u64>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: 10,
            channel_capacity: 256,
            stop_when_flat: false,
            max_ticks: None,
        }
    }
}

impl MonitorConfig {
    /// Create the bounded decision channel sized for this config.
    pub fn channel(&self) -> (mpsc::Sender<DecisionEnvelope>, mpsc::Receiver<DecisionEnvelope>) {
        mpsc::channel(self.channel_capacity.max(1))
    }
}

/// A decision handed to the executor, tagged with the state it was made on.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionEnvelope {
    pub position_id: String,
    pub symbol: String,
    pub decision: Decision,
    /// `closed_percent` at decision time; fills are refused if it moved
    pub closed_percent_at_decision: Decimal,
    pub profit_percent: Decimal,
    pub decided_at: DateTime<Utc>,
}

/// Running counters.
#[derive(Debug, Clone, Default)]
pub struct MonitorStats {
    pub ticks: u64,
    pub evaluations: u64,
    pub dispatched: u64,
    pub dropped: u64,
    pub skipped_no_quote: u64,
    pub stale_removed: u64,
    pub errors: u64,
}

impl fmt::Display for MonitorStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Monitor Statistics ===")?;
        writeln!(f, "Ticks:           {}", self.ticks)?;
        writeln!(f, "Evaluations:     {}", self.evaluations)?;
        writeln!(f, "Dispatched:      {} (Dropped: {})", self.dispatched, self.dropped)?;
        writeln!(f, "No quote:        {}", self.skipped_no_quote)?;
        writeln!(f, "Stale removed:   {}", self.stale_removed)?;
        writeln!(f, "Errors:          {}", self.errors)?;
        Ok(())
    }
}

/// Result of evaluating one position.
enum Outcome {
    NoQuote,
    Evaluated {
        snapshot: PositionState,
        decision: Decision,
    },
}

pub struct Monitor {
    evaluator: Arc<DecisionEvaluator>,
    feed: Arc<dyn PositionFeed>,
    fees: Arc<dyn FeeEstimator>,
    clock: Arc<dyn Clock>,
    sender: mpsc::Sender<DecisionEnvelope>,
    config: MonitorConfig,
    db: Option<Database>,

    book: PositionBook,
    stats: RwLock<MonitorStats>,

    // Shutdown signal
    shutdown: Arc<AtomicBool>,
}

impl Monitor {
    pub fn new(
        evaluator: Arc<DecisionEvaluator>,
        feed: Arc<dyn PositionFeed>,
        fees: Arc<dyn FeeEstimator>,
        clock: Arc<dyn Clock>,
        sender: mpsc::Sender<DecisionEnvelope>,
        config: MonitorConfig,
        db: Option<Database>,
    ) -> Self {
        Self {
            evaluator,
            feed,
            fees,
            clock,
            sender,
            config,
            db,
            book: Arc::new(RwLock::new(HashMap::new())),
            stats: RwLock::new(MonitorStats::default()),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Shared handle to the position book, for the executor.
    pub fn book(&self) -> PositionBook {
        self.book.clone()
    }

    /// Get shutdown signal for external control.
    pub fn shutdown_signal(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    pub async fn stats(&self) -> MonitorStats {
        self.stats.read().await.clone()
    }

    pub async fn position_count(&self) -> usize {
        self.book.read().await.len()
    }

    /// Start tracking a position.
    pub async fn add_position(&self, state: PositionState) -> Result<()> {
        if state.is_closed() {
            bail!("position {} is already closed", state.id);
        }
        if let Some(db) = &self.db {
            db.save_position(&state).await?;
        }
        info!(
            position = %state.id,
            symbol = %state.symbol,
            leverage = state.leverage,
            size = %state.size_percent,
            "Tracking position"
        );
        self.book
            .write()
            .await
            .insert(state.id.clone(), Arc::new(Mutex::new(state)));
        Ok(())
    }

    /// Load open positions from the database into the book.
    pub async fn restore(&self) -> Result<usize> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let positions = db.get_open_positions().await?;
        let count = positions.len();
        let mut book = self.book.write().await;
        for state in positions {
            book.insert(state.id.clone(), Arc::new(Mutex::new(state)));
        }
        info!(positions = count, "Restored open positions");
        Ok(count)
    }

    /// Main run loop.
    pub async fn run(&self) -> Result<MonitorStats> {
        info!(
            tick_interval = self.config.tick_interval_secs,
            positions = self.position_count().await,
            "Starting monitor loop"
        );

        let mut tick_interval = interval(Duration::from_secs(self.config.tick_interval_secs.max(1)));

        // Register shutdown handler
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            info!("Shutdown signal received");
            shutdown.store(true, Ordering::SeqCst);
        });

        let mut ticks = 0u64;
        while !self.shutdown.load(Ordering::SeqCst) {
            tick_interval.tick().await;

            if let Err(e) = self.tick().await {
                error!(error = %e, "Error in monitor tick");
            }
            ticks += 1;

            if self.config.stop_when_flat && self.position_count().await == 0 {
                info!("No open positions left");
                break;
            }
            if self.config.max_ticks.is_some_and(|max| ticks >= max) {
                info!(ticks, "Tick limit reached");
                break;
            }
        }

        let stats = self.stats().await;
        info!(
            ticks = stats.ticks,
            dispatched = stats.dispatched,
            "Monitor stopped"
        );
        Ok(stats)
    }

    /// Single iteration: evaluate every open position once.
    ///
    /// Returns the number of decisions dispatched.
    pub async fn tick(&self) -> Result<usize> {
        let positions: Vec<_> = self
            .book
            .read()
            .await
            .iter()
            .map(|(id, p)| (id.clone(), p.clone()))
            .collect();
        let now = self.clock.now();
        debug!(positions = positions.len(), "Monitor tick");

        let outcomes = join_all(
            positions
                .iter()
                .map(|(_, position)| self.evaluate_position(position, now)),
        )
        .await;

        let mut dispatched = 0;
        let mut stats = MonitorStats::default();
        let mut channel_closed = None;
        for ((id, _), outcome) in positions.iter().zip(outcomes) {
            match outcome {
                Ok(Outcome::NoQuote) => {
                    debug!(position = %id, "No quote this tick");
                    stats.skipped_no_quote += 1;
                }
                Ok(Outcome::Evaluated { snapshot, decision }) => {
                    stats.evaluations += 1;
                    if let Err(e) = self.persist(&snapshot, &decision, now).await {
                        error!(position = %id, error = %e, "Failed to persist position");
                        stats.errors += 1;
                    }
                    if decision.is_hold() {
                        continue;
                    }
                    match self.dispatch(&snapshot, decision, now) {
                        Ok(true) => {
                            dispatched += 1;
                            stats.dispatched += 1;
                        }
                        Ok(false) => stats.dropped += 1,
                        Err(e) => {
                            channel_closed = Some(e);
                            break;
                        }
                    }
                }
                Err(e) => match e.downcast_ref::<GuardError>() {
                    Some(GuardError::StaleState { .. }) => {
                        warn!(position = %id, error = %e, "Removing stale position");
                        self.book.write().await.remove(id);
                        stats.stale_removed += 1;
                    }
                    _ => {
                        error!(position = %id, error = %e, "Failed to evaluate position");
                        stats.errors += 1;
                    }
                },
            }
        }

        let mut total = self.stats.write().await;
        total.ticks += 1;
        total.evaluations += stats.evaluations;
        total.dispatched += stats.dispatched;
        total.dropped += stats.dropped;
        total.skipped_no_quote += stats.skipped_no_quote;
        total.stale_removed += stats.stale_removed;
        total.errors += stats.errors;
        drop(total);

        match channel_closed {
            Some(e) => Err(e),
            None => Ok(dispatched),
        }
    }

    async fn evaluate_position(
        &self,
        position: &Arc<Mutex<PositionState>>,
        now: DateTime<Utc>,
    ) -> Result<Outcome> {
        let (id, symbol) = {
            let state = position.lock().await;
            (state.id.clone(), state.symbol.clone())
        };
        let Some(profit) = self.feed.profit_percent(&id, &symbol).await? else {
            return Ok(Outcome::NoQuote);
        };

        let mut state = position.lock().await;
        if state.is_closed() {
            return Err(state.stale().into());
        }
        state.update_profit(profit, now);
        let ctx = TickContext::new(now, self.fees.position_fee_cost_percent(&state.id, state.leverage));
        let decision = self.evaluator.evaluate(&mut state, &ctx)?;

        Ok(Outcome::Evaluated {
            snapshot: state.clone(),
            decision,
        })
    }

    async fn persist(&self, snapshot: &PositionState, decision: &Decision, now: DateTime<Utc>) -> Result<()> {
        let Some(db) = &self.db else {
            return Ok(());
        };
        db.save_position(snapshot).await?;
        if !decision.is_hold() {
            db.record_decision(snapshot, decision, now).await?;
        }
        Ok(())
    }

    /// Hand a decision to the executor. Returns false if it was dropped.
    fn dispatch(&self, snapshot: &PositionState, decision: Decision, now: DateTime<Utc>) -> Result<bool> {
        let envelope = DecisionEnvelope {
            position_id: snapshot.id.clone(),
            symbol: snapshot.symbol.clone(),
            decision,
            closed_percent_at_decision: snapshot.closed_percent,
            profit_percent: snapshot.current_profit_percent,
            decided_at: now,
        };

        match self.sender.try_send(envelope) {
            Ok(()) => Ok(true),
            Err(TrySendError::Full(envelope)) => {
                warn!(
                    position = %envelope.position_id,
                    decision = %envelope.decision,
                    "Decision channel full, dropping decision"
                );
                Ok(false)
            }
            Err(TrySendError::Closed(_)) => {
                self.shutdown.store(true, Ordering::SeqCst);
                bail!("decision channel closed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::{FeeOverrides, FlatFeeEstimator, ManualClock, ReplayFeed, ScenarioTick};
    use crate::profile::ultra_short;
    use crate::trading::EvaluatorConfig;
    use rust_decimal_macros::dec;
    use tokio_test::{assert_err, assert_ok};

    fn ticks(values: &[Decimal]) -> Vec<ScenarioTick> {
        values
            .iter()
            .enumerate()
            .map(|(i, p)| ScenarioTick { offset_secs: (i as i64 + 1) * 10, profit_percent: *p })
            .collect()
    }

    fn monitor(
        feed: Arc<ReplayFeed>,
        capacity: usize,
    ) -> (Monitor, mpsc::Receiver<DecisionEnvelope>) {
        build_monitor(feed, capacity, Arc::new(FlatFeeEstimator::default()), None)
    }

    fn build_monitor(
        feed: Arc<ReplayFeed>,
        capacity: usize,
        fees: Arc<dyn FeeEstimator>,
        db: Option<Database>,
    ) -> (Monitor, mpsc::Receiver<DecisionEnvelope>) {
        let evaluator =
            DecisionEvaluator::new(Arc::new(ultra_short(20)), EvaluatorConfig::default()).unwrap();
        let config = MonitorConfig { channel_capacity: capacity, ..Default::default() };
        let (tx, rx) = config.channel();
        let monitor = Monitor::new(
            Arc::new(evaluator),
            feed,
            fees,
            Arc::new(ManualClock::new(Utc::now())),
            tx,
            config,
            db,
        );
        (monitor, rx)
    }

    #[tokio::test]
    async fn test_tick_dispatches_non_hold() {
        let feed = Arc::new(ReplayFeed::new());
        let (monitor, mut rx) = monitor(feed.clone(), 8);

        let holder = PositionState::new("BTCUSDT", 10, dec!(20), Utc::now());
        let locker = PositionState::new("ETHUSDT", 10, dec!(20), Utc::now());
        feed.insert(holder.id.clone(), ticks(&[dec!(1)])).await;
        feed.insert(locker.id.clone(), ticks(&[dec!(3)])).await;
        let locker_id = locker.id.clone();
        assert_ok!(monitor.add_position(holder).await);
        assert_ok!(monitor.add_position(locker).await);

        assert_eq!(monitor.tick().await.unwrap(), 1);
        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.position_id, locker_id);
        assert_eq!(envelope.profit_percent, dec!(3));
        assert_eq!(envelope.closed_percent_at_decision, Decimal::ZERO);
        assert!(rx.try_recv().is_err());

        let stats = monitor.stats().await;
        assert_eq!(stats.evaluations, 2);
        assert_eq!(stats.dispatched, 1);
    }

    #[tokio::test]
    async fn test_missing_quote_skips_position() {
        let feed = Arc::new(ReplayFeed::new());
        let (monitor, _rx) = monitor(feed, 8);
        assert_ok!(monitor.add_position(PositionState::new("BTCUSDT", 10, dec!(20), Utc::now())).await);

        assert_eq!(monitor.tick().await.unwrap(), 0);
        assert_eq!(monitor.stats().await.skipped_no_quote, 1);
    }

    #[tokio::test]
    async fn test_full_channel_drops_without_blocking() {
        let feed = Arc::new(ReplayFeed::new());
        let (monitor, _rx) = monitor(feed.clone(), 1);
        for _ in 0..3 {
            let state = PositionState::new("BTCUSDT", 10, dec!(20), Utc::now());
            feed.insert(state.id.clone(), ticks(&[dec!(3)])).await;
            monitor.add_position(state).await.unwrap();
        }

        assert_eq!(monitor.tick().await.unwrap(), 1);
        assert_eq!(monitor.stats().await.dropped, 2);
    }

    #[tokio::test]
    async fn test_closed_position_removed_as_stale() {
        let feed = Arc::new(ReplayFeed::new());
        let (monitor, _rx) = monitor(feed.clone(), 8);
        let state = PositionState::new("BTCUSDT", 10, dec!(20), Utc::now());
        let id = state.id.clone();
        feed.insert(id.clone(), ticks(&[dec!(1)])).await;
        monitor.add_position(state).await.unwrap();

        // Simulate a fill that closed the position between ticks.
        let entry = monitor.book().read().await.get(&id).cloned().unwrap();
        entry.lock().await.closed_percent = dec!(100);

        monitor.tick().await.unwrap();
        assert_eq!(monitor.position_count().await, 0);
        assert_eq!(monitor.stats().await.stale_removed, 1);
    }

    #[tokio::test]
    async fn test_closed_channel_is_error() {
        let feed = Arc::new(ReplayFeed::new());
        let (monitor, rx) = monitor(feed.clone(), 8);
        drop(rx);
        let state = PositionState::new("BTCUSDT", 10, dec!(20), Utc::now());
        feed.insert(state.id.clone(), ticks(&[dec!(3)])).await;
        monitor.add_position(state).await.unwrap();

        assert_err!(monitor.tick().await);
        assert!(monitor.shutdown_signal().load(Ordering::SeqCst));

        // The failing tick still counts toward the totals.
        let stats = monitor.stats().await;
        assert_eq!(stats.ticks, 1);
        assert_eq!(stats.evaluations, 1);
        assert_eq!(stats.dispatched, 0);
    }

    #[tokio::test]
    async fn test_restore_resumes_half_closed_position() {
        let db = Database::new("sqlite::memory:").await.unwrap();
        let mut state = PositionState::new("SOLUSDT", 10, dec!(20), Utc::now() - chrono::Duration::minutes(5));
        state.current_profit_percent = dec!(14);
        state.peak_profit_percent = dec!(18);
        state.closed_percent = dec!(50);
        let id = state.id.clone();
        db.save_position(&state).await.unwrap();

        let (monitor, _rx) =
            build_monitor(Arc::new(ReplayFeed::new()), 8, Arc::new(FlatFeeEstimator::default()), Some(db));
        assert_eq!(assert_ok!(monitor.restore().await), 1);
        assert_eq!(monitor.position_count().await, 1);

        let entry = monitor.book().read().await.get(&id).cloned().unwrap();
        let restored = entry.lock().await;
        assert_eq!(restored.peak_profit_percent, dec!(18));
        assert_eq!(restored.closed_percent, dec!(50));
    }

    #[tokio::test]
    async fn test_restore_without_database_is_noop() {
        let (monitor, _rx) = monitor(Arc::new(ReplayFeed::new()), 8);
        assert_eq!(monitor.restore().await.unwrap(), 0);
        assert_eq!(monitor.position_count().await, 0);
    }

    #[tokio::test]
    async fn test_position_fee_override_drives_time_limit() {
        let feed = Arc::new(ReplayFeed::new());
        let opened = Utc::now() - chrono::Duration::minutes(31);
        let cheap = PositionState::new("BTCUSDT", 10, dec!(20), opened);
        let default_fee = PositionState::new("ETHUSDT", 10, dec!(20), opened);
        feed.insert(cheap.id.clone(), ticks(&[dec!(0.6)])).await;
        feed.insert(default_fee.id.clone(), ticks(&[dec!(0.6)])).await;

        // 0.6% covers a 0.5% fee but not the flat 0.8% estimate at 10x.
        let mut fees = FeeOverrides::new(Arc::new(FlatFeeEstimator::default()));
        fees.insert(cheap.id.clone(), dec!(0.5));
        let cheap_id = cheap.id.clone();

        let (monitor, mut rx) = build_monitor(feed, 8, Arc::new(fees), None);
        assert_ok!(monitor.add_position(cheap).await);
        assert_ok!(monitor.add_position(default_fee).await);

        assert_eq!(monitor.tick().await.unwrap(), 1);
        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.position_id, cheap_id);
        assert_eq!(envelope.decision.reason().map(|r| r.as_str()), Some("time-limit"));
    }

    #[tokio::test]
    async fn test_add_closed_position_rejected() {
        let (monitor, _rx) = monitor(Arc::new(ReplayFeed::new()), 8);
        let mut state = PositionState::new("BTCUSDT", 10, dec!(20), Utc::now());
        state.closed_percent = dec!(100);
        assert_err!(monitor.add_position(state).await);
    }
}
