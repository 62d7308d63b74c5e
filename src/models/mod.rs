//! Data models for position state and evaluator decisions.

mod decision;
mod position;

pub use decision::{Decision, ExitReason, ExitUrgency};
pub use position::PositionState;
