//! Decisions emitted by the evaluator, one per position per tick.

use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Why a position is being reduced or closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ExitReason {
    /// Loss reached the leverage tier's hard stop.
    StopLoss { tier: String, threshold: Decimal },
    /// Giveback from peak reached the profile's protection ratio.
    PeakDrawdown { peak: Decimal, giveback_pct: Decimal },
    /// Profit fell to the live trailing floor of the active stage.
    TrailingStop { stage: String, floor: Decimal },
    /// A take-profit rung was reached.
    TakeProfit { stage: String, trigger: Decimal },
    /// Small gain banked within the decision cycle.
    CycleLockIn,
    /// Position held past the time limit while profitable after fees.
    TimeLimit,
}

impl ExitReason {
    /// Stable tag used in logs and persistence.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss { .. } => "stop-loss",
            ExitReason::PeakDrawdown { .. } => "peak-drawdown",
            ExitReason::TrailingStop { .. } => "trailing-stop",
            ExitReason::TakeProfit { .. } => "take-profit",
            ExitReason::CycleLockIn => "cycle-lock-in",
            ExitReason::TimeLimit => "time-limit",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitReason::StopLoss { tier, threshold } => {
                write!(f, "stop-loss ({tier} at {threshold}%)")
            }
            ExitReason::PeakDrawdown { peak, giveback_pct } => {
                write!(f, "peak-drawdown ({giveback_pct}% of {peak}% peak given back)")
            }
            ExitReason::TrailingStop { stage, floor } => {
                write!(f, "trailing-stop ({stage}, floor {floor}%)")
            }
            ExitReason::TakeProfit { stage, trigger } => {
                write!(f, "take-profit ({stage} at +{trigger}%)")
            }
            ExitReason::CycleLockIn => f.write_str("cycle-lock-in"),
            ExitReason::TimeLimit => f.write_str("time-limit"),
        }
    }
}

/// How urgently to act on a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExitUrgency {
    /// Exit immediately with a market order
    Immediate,
    /// Exit soon, a limit order is acceptable
    Normal,
    /// Nothing to do
    None,
}

/// Outcome of one evaluation tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Decision {
    Hold,
    /// Close `percent` of the original position size.
    PartialClose { percent: Decimal, reason: ExitReason },
    FullClose { reason: ExitReason },
    StopLoss { reason: ExitReason },
}

impl Decision {
    pub fn is_hold(&self) -> bool {
        matches!(self, Decision::Hold)
    }

    pub fn reason(&self) -> Option<&ExitReason> {
        match self {
            Decision::Hold => None,
            Decision::PartialClose { reason, .. }
            | Decision::FullClose { reason }
            | Decision::StopLoss { reason } => Some(reason),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Decision::Hold => "hold",
            Decision::PartialClose { .. } => "partial-close",
            Decision::FullClose { .. } => "full-close",
            Decision::StopLoss { .. } => "stop-loss",
        }
    }

    pub fn urgency(&self) -> ExitUrgency {
        match self {
            Decision::Hold => ExitUrgency::None,
            Decision::StopLoss { .. } => ExitUrgency::Immediate,
            Decision::PartialClose { .. } | Decision::FullClose { .. } => ExitUrgency::Normal,
        }
    }

    /// Percentage of the original size this decision closes, given what is
    /// still open.
    pub fn close_percent(&self, remaining: Decimal) -> Decimal {
        match self {
            Decision::Hold => Decimal::ZERO,
            Decision::PartialClose { percent, .. } => (*percent).min(remaining),
            Decision::FullClose { .. } | Decision::StopLoss { .. } => remaining,
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Hold => f.write_str("HOLD"),
            Decision::PartialClose { percent, reason } => {
                write!(f, "PARTIAL CLOSE {percent}% - {reason}")
            }
            Decision::FullClose { reason } => write!(f, "FULL CLOSE - {reason}"),
            Decision::StopLoss { reason } => write!(f, "STOP LOSS - {reason}"),
        }
    }
}
