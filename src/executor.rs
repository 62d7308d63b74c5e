//! Paper execution: simulated fills for dispatched decisions.
//!
//! Fills are instant and complete. A decision is refused as stale when its
//! position has left the book or was filled after the decision was made.

use std::collections::BTreeMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::db::Database;
use crate::error::GuardError;
use crate::monitor::{DecisionEnvelope, PositionBook};

/// In-process executor that applies decisions to the shared book.
pub struct PaperExecutor {
    book: PositionBook,
    db: Option<Database>,
    stats: PaperStats,
}

impl PaperExecutor {
    pub fn new(book: PositionBook, db: Option<Database>) -> Self {
        Self {
            book,
            db,
            stats: PaperStats::new(Utc::now()),
        }
    }

    pub fn stats(&self) -> &PaperStats {
        &self.stats
    }

    /// Consume envelopes until the monitor drops its sender.
    pub async fn run(mut self, mut receiver: mpsc::Receiver<DecisionEnvelope>) -> Result<PaperStats> {
        info!("Paper executor started");
        while let Some(envelope) = receiver.recv().await {
            if let Err(e) = self.execute(envelope).await {
                error!(error = %e, "Paper fill failed");
            }
        }
        info!(
            fills = self.stats.fills,
            stale = self.stats.stale_discarded,
            "Paper executor stopped"
        );
        Ok(self.stats)
    }

    /// Apply one decision. Returns whether a fill happened.
    pub async fn execute(&mut self, envelope: DecisionEnvelope) -> Result<bool> {
        let position = self.book.read().await.get(&envelope.position_id).cloned();
        let Some(position) = position else {
            debug!(position = %envelope.position_id, "Position gone, discarding decision");
            self.stats.stale_discarded += 1;
            return Ok(false);
        };

        let mut state = position.lock().await;
        if state.closed_percent != envelope.closed_percent_at_decision {
            debug!(
                position = %envelope.position_id,
                decided_at = %envelope.closed_percent_at_decision,
                now = %state.closed_percent,
                "Position filled since decision, discarding"
            );
            self.stats.stale_discarded += 1;
            return Ok(false);
        }

        let requested = envelope.decision.close_percent(state.remaining_percent());
        if requested <= Decimal::ZERO {
            return Ok(false);
        }
        let filled = match state.record_fill(requested) {
            Ok(filled) => filled,
            Err(GuardError::StaleState { .. }) => {
                self.stats.stale_discarded += 1;
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        let closed = state.is_closed();
        let snapshot = state.clone();
        drop(state);

        let realized = filled * envelope.profit_percent / dec!(100);
        self.stats.fills += 1;
        self.stats.realized_profit += realized;
        if let Some(reason) = envelope.decision.reason() {
            *self.stats.by_reason.entry(reason.as_str().to_string()).or_insert(0) += 1;
        }

        info!(
            position = %snapshot.id,
            symbol = %snapshot.symbol,
            filled = %filled,
            closed = %snapshot.closed_percent,
            profit = %envelope.profit_percent,
            decision = %envelope.decision,
            "[PAPER] Filled"
        );

        if closed {
            self.book.write().await.remove(&snapshot.id);
            self.stats.closed_positions += 1;
            if let Some(db) = &self.db {
                db.close_position(&snapshot, envelope.decided_at).await?;
            }
        } else if let Some(db) = &self.db {
            db.save_position(&snapshot).await?;
        }

        Ok(true)
    }
}

/// Paper execution statistics.
#[derive(Debug, Clone)]
pub struct PaperStats {
    pub fills: usize,
    pub stale_discarded: usize,
    pub closed_positions: usize,
    /// Sum of closed share × profit at fill, in percent-of-margin points
    pub realized_profit: Decimal,
    pub by_reason: BTreeMap<String, usize>,
    pub running_since: DateTime<Utc>,
}

impl PaperStats {
    fn new(running_since: DateTime<Utc>) -> Self {
        Self {
            fills: 0,
            stale_discarded: 0,
            closed_positions: 0,
            realized_profit: Decimal::ZERO,
            by_reason: BTreeMap::new(),
            running_since,
        }
    }
}

impl std::fmt::Display for PaperStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "\n{:=^50}", " PAPER EXECUTION ")?;
        writeln!(f, "Running since: {}", self.running_since.format("%Y-%m-%d %H:%M"))?;
        writeln!(f)?;
        writeln!(f, "Fills:            {}", self.fills)?;
        writeln!(f, "Stale discarded:  {}", self.stale_discarded)?;
        writeln!(f, "Closed positions: {}", self.closed_positions)?;
        writeln!(f, "Realized profit:  {:.2}", self.realized_profit)?;
        if !self.by_reason.is_empty() {
            writeln!(f)?;
            writeln!(f, "--- Exits by reason ---")?;
            for (reason, count) in &self.by_reason {
                writeln!(f, "{:<16} {}", reason, count)?;
            }
        }
        writeln!(f, "{:=^50}", "")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Decision, ExitReason, PositionState};
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::{Mutex, RwLock};

    fn book_with(state: PositionState) -> PositionBook {
        let mut map = HashMap::new();
        map.insert(state.id.clone(), Arc::new(Mutex::new(state)));
        Arc::new(RwLock::new(map))
    }

    fn envelope(id: &str, decision: Decision, closed: Decimal) -> DecisionEnvelope {
        DecisionEnvelope {
            position_id: id.to_string(),
            symbol: "BTCUSDT".into(),
            decision,
            closed_percent_at_decision: closed,
            profit_percent: dec!(16),
            decided_at: Utc::now(),
        }
    }

    fn take_profit() -> Decision {
        Decision::PartialClose {
            percent: dec!(50),
            reason: ExitReason::TakeProfit { stage: "stage1".into(), trigger: dec!(15) },
        }
    }

    #[tokio::test]
    async fn test_partial_then_full_close() {
        let state = PositionState::new("BTCUSDT", 10, dec!(20), Utc::now());
        let id = state.id.clone();
        let book = book_with(state);
        let mut exec = PaperExecutor::new(book.clone(), None);

        assert!(exec.execute(envelope(&id, take_profit(), Decimal::ZERO)).await.unwrap());
        let full = Decision::FullClose { reason: ExitReason::CycleLockIn };
        assert!(exec.execute(envelope(&id, full, dec!(50))).await.unwrap());

        assert!(book.read().await.is_empty());
        assert_eq!(exec.stats().fills, 2);
        assert_eq!(exec.stats().closed_positions, 1);
        // 50% at +16 twice
        assert_eq!(exec.stats().realized_profit, dec!(16));
        assert_eq!(exec.stats().by_reason.get("take-profit"), Some(&1));
    }

    #[tokio::test]
    async fn test_duplicate_decision_discarded() {
        let state = PositionState::new("BTCUSDT", 10, dec!(20), Utc::now());
        let id = state.id.clone();
        let book = book_with(state);
        let mut exec = PaperExecutor::new(book.clone(), None);

        assert!(exec.execute(envelope(&id, take_profit(), Decimal::ZERO)).await.unwrap());
        // Same decision again, made before the first fill landed.
        assert!(!exec.execute(envelope(&id, take_profit(), Decimal::ZERO)).await.unwrap());

        let entry = book.read().await.get(&id).cloned().unwrap();
        assert_eq!(entry.lock().await.closed_percent, dec!(50));
        assert_eq!(exec.stats().stale_discarded, 1);
    }

    #[tokio::test]
    async fn test_unknown_position_discarded() {
        let book: PositionBook = Arc::new(RwLock::new(HashMap::new()));
        let mut exec = PaperExecutor::new(book, None);
        assert!(!exec.execute(envelope("missing", take_profit(), Decimal::ZERO)).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_drains_channel() {
        let state = PositionState::new("BTCUSDT", 10, dec!(20), Utc::now());
        let id = state.id.clone();
        let exec = PaperExecutor::new(book_with(state), None);
        let (tx, rx) = mpsc::channel(4);
        tx.send(envelope(&id, Decision::FullClose { reason: ExitReason::TimeLimit }, Decimal::ZERO))
            .await
            .unwrap();
        drop(tx);

        let stats = exec.run(rx).await.unwrap();
        assert_eq!(stats.closed_positions, 1);
        assert_eq!(stats.by_reason.get("time-limit"), Some(&1));
    }
}
