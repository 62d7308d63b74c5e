//! Errors raised by the decision engine.
//!
//! Application plumbing (CLI, database, monitor loop) uses `anyhow`; these are
//! the typed failures of the engine itself.

use rust_decimal::Decimal;
use thiserror::Error;

/// Engine error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    /// A profile or configuration violates its invariants, or a lookup fell
    /// outside every configured tier.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// A tick was evaluated against a position that is already fully closed.
    #[error("position {position_id} is already closed ({closed_percent}% realized)")]
    StaleState {
        position_id: String,
        closed_percent: Decimal,
    },
}

impl GuardError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

pub type GuardResult<T> = Result<T, GuardError>;
