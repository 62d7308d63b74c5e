//! Position risk guard for leveraged trading.
//!
//! Evaluates every open position once per tick against a validated strategy
//! profile and emits exactly one decision: hold, partial close, full close or
//! stop-loss.

pub mod backtest;
pub mod db;
pub mod error;
pub mod executor;
pub mod interfaces;
pub mod models;
pub mod monitor;
pub mod profile;
pub mod trading;

pub use error::{GuardError, GuardResult};
pub use models::{Decision, ExitReason, ExitUrgency, PositionState};
pub use profile::{ProfileProvider, StrategyProfile, StrategyStyle};
pub use trading::{DecisionEvaluator, EvaluatorConfig, TickContext};
