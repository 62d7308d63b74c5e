//! Risk logic: tier resolution, exit evaluation, volatility sizing.

mod config;
mod evaluator;
mod tiers;
mod volatility;

pub use config::{EvaluatorConfig, SizingConfig};
pub use evaluator::{DecisionEvaluator, PositionRisk, TickContext};
pub use tiers::TierResolver;
pub use volatility::{SizingRecommendation, VolatilityAdjuster, VolatilityRegime};
