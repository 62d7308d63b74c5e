//! Database persistence for position state and the decision journal.
//!
//! Stores everything needed to resume monitoring after a restart:
//! - Open and closed positions with their peak and realized share
//! - Every dispatched decision, for audit and status reporting
//!
//! Decimals are stored as TEXT so thresholds survive the round trip exactly.

use std::str::FromStr;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};

use crate::models::{Decision, PositionState};

/// Database connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

/// Stored position record.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredPosition {
    pub id: String,
    pub symbol: String,
    pub leverage: i64,
    pub size_percent: String,
    pub entry_timestamp: String,
    pub current_profit_percent: String,
    pub peak_profit_percent: String,
    pub closed_percent: String,
    pub last_updated: String,
    pub closed_at: Option<String>,
}

impl TryFrom<StoredPosition> for PositionState {
    type Error = anyhow::Error;

    fn try_from(row: StoredPosition) -> Result<Self> {
        Ok(PositionState {
            leverage: u32::try_from(row.leverage)
                .with_context(|| format!("Invalid leverage for position {}", row.id))?,
            size_percent: parse_decimal(&row.size_percent, "size_percent")?,
            entry_timestamp: parse_timestamp(&row.entry_timestamp)?,
            current_profit_percent: parse_decimal(&row.current_profit_percent, "current_profit_percent")?,
            peak_profit_percent: parse_decimal(&row.peak_profit_percent, "peak_profit_percent")?,
            closed_percent: parse_decimal(&row.closed_percent, "closed_percent")?,
            last_updated: parse_timestamp(&row.last_updated)?,
            symbol: row.symbol,
            id: row.id,
        })
    }
}

/// Stored decision journal entry.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredDecision {
    pub id: i64,
    pub position_id: String,
    pub symbol: String,
    pub kind: String,
    pub reason: Option<String>,
    pub close_percent: String,
    pub profit_percent: String,
    pub peak_profit_percent: String,
    pub detail: String,
    pub decided_at: String,
}

fn parse_decimal(raw: &str, field: &str) -> Result<Decimal> {
    Decimal::from_str(raw).with_context(|| format!("Invalid decimal in {field}: {raw}"))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("Invalid timestamp: {raw}"))?
        .with_timezone(&Utc))
}

impl Database {
    /// Create a new database connection.
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to database")?;

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Run all database migrations.
    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS positions (
                id TEXT PRIMARY KEY,
                symbol TEXT NOT NULL,
                leverage INTEGER NOT NULL,
                size_percent TEXT NOT NULL,
                entry_timestamp TEXT NOT NULL,
                current_profit_percent TEXT NOT NULL DEFAULT '0',
                peak_profit_percent TEXT NOT NULL DEFAULT '0',
                closed_percent TEXT NOT NULL DEFAULT '0',
                last_updated TEXT NOT NULL,
                closed_at TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create positions table")?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS decisions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                position_id TEXT NOT NULL,
                symbol TEXT NOT NULL,
                kind TEXT NOT NULL,
                reason TEXT,
                close_percent TEXT NOT NULL,
                profit_percent TEXT NOT NULL,
                peak_profit_percent TEXT NOT NULL,
                detail TEXT NOT NULL,
                decided_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create decisions table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_positions_open ON positions(closed_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_decisions_position ON decisions(position_id)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ==================== Positions ====================

    /// Insert or update a position.
    pub async fn save_position(&self, state: &PositionState) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO positions (
                id, symbol, leverage, size_percent, entry_timestamp,
                current_profit_percent, peak_profit_percent, closed_percent, last_updated
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                current_profit_percent = excluded.current_profit_percent,
                peak_profit_percent = excluded.peak_profit_percent,
                closed_percent = excluded.closed_percent,
                last_updated = excluded.last_updated
            "#,
        )
        .bind(&state.id)
        .bind(&state.symbol)
        .bind(i64::from(state.leverage))
        .bind(state.size_percent.to_string())
        .bind(state.entry_timestamp.to_rfc3339())
        .bind(state.current_profit_percent.to_string())
        .bind(state.peak_profit_percent.to_string())
        .bind(state.closed_percent.to_string())
        .bind(state.last_updated.to_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to save position {}", state.id))?;

        Ok(())
    }

    /// Get all positions that have not been closed.
    pub async fn get_open_positions(&self) -> Result<Vec<PositionState>> {
        let rows = sqlx::query_as::<_, StoredPosition>(
            "SELECT * FROM positions WHERE closed_at IS NULL ORDER BY entry_timestamp",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to load open positions")?;

        rows.into_iter().map(PositionState::try_from).collect()
    }

    /// Mark a position as closed.
    pub async fn close_position(&self, state: &PositionState, closed_at: DateTime<Utc>) -> Result<()> {
        self.save_position(state).await?;
        sqlx::query("UPDATE positions SET closed_at = ? WHERE id = ?")
            .bind(closed_at.to_rfc3339())
            .bind(&state.id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("Failed to close position {}", state.id))?;
        Ok(())
    }

    /// Count of positions still open.
    pub async fn open_position_count(&self) -> Result<i64> {
        let (count,): (i64,) =
            sqlx::query_as("SELECT COUNT(*) FROM positions WHERE closed_at IS NULL")
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    // ==================== Decisions ====================

    /// Append a dispatched decision to the journal.
    pub async fn record_decision(
        &self,
        state: &PositionState,
        decision: &Decision,
        decided_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO decisions (
                position_id, symbol, kind, reason, close_percent,
                profit_percent, peak_profit_percent, detail, decided_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&state.id)
        .bind(&state.symbol)
        .bind(decision.kind())
        .bind(decision.reason().map(|r| r.as_str()))
        .bind(decision.close_percent(state.remaining_percent()).to_string())
        .bind(state.current_profit_percent.to_string())
        .bind(state.peak_profit_percent.to_string())
        .bind(decision.to_string())
        .bind(decided_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .context("Failed to record decision")?;

        Ok(())
    }

    /// Most recent decisions, newest first.
    pub async fn recent_decisions(&self, limit: i64) -> Result<Vec<StoredDecision>> {
        sqlx::query_as::<_, StoredDecision>(
            "SELECT * FROM decisions ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to load decisions")
    }

    /// Number of decisions per exit reason.
    pub async fn decision_counts(&self) -> Result<Vec<(String, i64)>> {
        sqlx::query_as(
            r#"
            SELECT COALESCE(reason, kind) AS label, COUNT(*) AS n
            FROM decisions
            GROUP BY label
            ORDER BY n DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to count decisions")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ExitReason;
    use rust_decimal_macros::dec;

    async fn memory_db() -> Database {
        Database::new("sqlite::memory:").await.unwrap()
    }

    #[tokio::test]
    async fn test_position_round_trip() {
        let db = memory_db().await;
        let mut state = PositionState::new("ETHUSDT", 12, dec!(21.5), Utc::now());
        state.current_profit_percent = dec!(7.25);
        state.peak_profit_percent = dec!(9.125);
        state.closed_percent = dec!(50);
        db.save_position(&state).await.unwrap();

        let loaded = db.get_open_positions().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, state.id);
        assert_eq!(loaded[0].leverage, 12);
        assert_eq!(loaded[0].peak_profit_percent, dec!(9.125));
        assert_eq!(loaded[0].closed_percent, dec!(50));
    }

    #[tokio::test]
    async fn test_closed_positions_not_loaded() {
        let db = memory_db().await;
        let state = PositionState::new("BTCUSDT", 10, dec!(20), Utc::now());
        db.save_position(&state).await.unwrap();
        db.close_position(&state, Utc::now()).await.unwrap();

        assert!(db.get_open_positions().await.unwrap().is_empty());
        assert_eq!(db.open_position_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_decision_journal() {
        let db = memory_db().await;
        let mut state = PositionState::new("BTCUSDT", 10, dec!(20), Utc::now());
        state.current_profit_percent = dec!(3);

        let lock_in = Decision::FullClose { reason: ExitReason::CycleLockIn };
        db.record_decision(&state, &lock_in, Utc::now()).await.unwrap();
        db.record_decision(&state, &lock_in, Utc::now()).await.unwrap();
        let tp = Decision::PartialClose {
            percent: dec!(50),
            reason: ExitReason::TakeProfit { stage: "stage1".into(), trigger: dec!(15) },
        };
        db.record_decision(&state, &tp, Utc::now()).await.unwrap();

        let recent = db.recent_decisions(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].kind, "partial-close");
        assert_eq!(recent[0].close_percent, "50");

        let counts = db.decision_counts().await.unwrap();
        assert_eq!(counts[0], ("cycle-lock-in".to_string(), 2));
        assert_eq!(counts[1], ("take-profit".to_string(), 1));
    }
}
