//! Entry sizing: volatility regime classification and profile-based
//! leverage / position size adjustment.

use std::fmt;
use std::str::FromStr;

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use tracing::debug;

use super::SizingConfig;
use crate::error::{GuardError, GuardResult};
use crate::profile::{SignalStrength, StrategyProfile};

/// Market volatility regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolatilityRegime {
    High,
    Normal,
    Low,
}

impl VolatilityRegime {
    /// Classify a series of fractional returns by its sample standard
    /// deviation. Fewer than two samples is treated as normal.
    pub fn classify(returns: &[f64], config: &SizingConfig) -> Self {
        if returns.len() < 2 {
            return Self::Normal;
        }
        let std_dev = returns.std_dev();
        if !std_dev.is_finite() {
            return Self::Normal;
        }

        if std_dev >= config.high_volatility_threshold {
            Self::High
        } else if std_dev <= config.low_volatility_threshold {
            Self::Low
        } else {
            Self::Normal
        }
    }
}

impl FromStr for VolatilityRegime {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(GuardError::config(format!("unknown volatility regime '{other}'"))),
        }
    }
}

impl fmt::Display for VolatilityRegime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        };
        f.write_str(s)
    }
}

/// Entry parameters after volatility adjustment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SizingRecommendation {
    pub leverage: u32,
    pub position_size_percent: Decimal,
}

/// Scales the profile's entry parameters by regime factors, clamped to the
/// profile bounds.
pub struct VolatilityAdjuster;

impl VolatilityAdjuster {
    /// Adjust the midpoint of the allowed leverage and size bands.
    pub fn adjust(profile: &StrategyProfile, regime: VolatilityRegime) -> GuardResult<SizingRecommendation> {
        Self::scale(
            profile,
            regime,
            profile.leverage_midpoint(),
            profile.position_size_midpoint(),
        )
    }

    /// Adjust the recommendation for a given signal strength.
    pub fn adjust_for_strength(
        profile: &StrategyProfile,
        strength: SignalStrength,
        regime: VolatilityRegime,
    ) -> GuardResult<SizingRecommendation> {
        let leverage = Decimal::from(profile.leverage_recommend.for_strength(strength));
        let size = profile.position_size_recommend.for_strength(strength).midpoint();
        Self::scale(profile, regime, leverage, size)
    }

    fn scale(
        profile: &StrategyProfile,
        regime: VolatilityRegime,
        base_leverage: Decimal,
        base_size: Decimal,
    ) -> GuardResult<SizingRecommendation> {
        if profile.leverage_min > profile.leverage_max
            || profile.position_size_min > profile.position_size_max
        {
            return Err(GuardError::config(format!(
                "profile '{}' has inverted sizing bounds",
                profile.name
            )));
        }
        let factors = profile.volatility_adjustment.factors(regime);

        let raw_leverage = (base_leverage * factors.leverage_factor)
            .round_dp_with_strategy(0, RoundingStrategy::ToZero)
            .to_u32()
            .unwrap_or(profile.leverage_max);
        let leverage = raw_leverage.clamp(profile.leverage_min, profile.leverage_max);

        let position_size_percent = (base_size * factors.position_factor)
            .round_dp(2)
            .clamp(profile.position_size_min, profile.position_size_max);

        debug!(
            profile = %profile.name,
            regime = %regime,
            leverage,
            size = %position_size_percent,
            "Sizing adjusted for volatility"
        );

        Ok(SizingRecommendation {
            leverage,
            position_size_percent,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ultra_short;
    use rust_decimal_macros::dec;

    #[test]
    fn test_high_volatility_shrinks_exposure() {
        let p = ultra_short(20);
        let normal = VolatilityAdjuster::adjust(&p, VolatilityRegime::Normal).unwrap();
        let high = VolatilityAdjuster::adjust(&p, VolatilityRegime::High).unwrap();

        // 10..=15 midpoint 12.5 -> 12, sizes 18..=25 midpoint 21.5
        assert_eq!(normal.leverage, 12);
        assert_eq!(normal.position_size_percent, dec!(21.5));

        // 12.5 * 0.7 = 8.75 -> clamped up to 10; 21.5 * 0.8 = 17.2 -> clamped to 18
        assert_eq!(high.leverage, 10);
        assert_eq!(high.position_size_percent, dec!(18));
    }

    #[test]
    fn test_low_volatility_clamped_to_max() {
        let p = ultra_short(20);
        let rec = VolatilityAdjuster::adjust_for_strength(&p, SignalStrength::Strong, VolatilityRegime::Low)
            .unwrap();
        assert!(rec.leverage <= p.leverage_max);
        assert!(rec.position_size_percent <= p.position_size_max);
    }

    #[test]
    fn test_inverted_bounds_rejected() {
        let mut p = ultra_short(20);
        p.leverage_min = p.leverage_max + 1;
        assert!(VolatilityAdjuster::adjust(&p, VolatilityRegime::Normal).is_err());
    }

    #[test]
    fn test_classify() {
        let cfg = SizingConfig::default();
        assert_eq!(VolatilityRegime::classify(&[], &cfg), VolatilityRegime::Normal);
        assert_eq!(VolatilityRegime::classify(&[0.001], &cfg), VolatilityRegime::Normal);
        assert_eq!(
            VolatilityRegime::classify(&[0.001, -0.001, 0.002, -0.002], &cfg),
            VolatilityRegime::Low
        );
        assert_eq!(
            VolatilityRegime::classify(&[0.05, -0.04, 0.06, -0.05], &cfg),
            VolatilityRegime::High
        );
        assert_eq!(
            VolatilityRegime::classify(&[0.01, -0.01, 0.012, -0.008], &cfg),
            VolatilityRegime::Normal
        );
    }

    #[test]
    fn test_sizing_thresholds_validated() {
        assert!(SizingConfig::default().validate().is_ok());
        let inverted = SizingConfig { high_volatility_threshold: 0.004, low_volatility_threshold: 0.01 };
        assert!(inverted.validate().is_err());
        let negative = SizingConfig { high_volatility_threshold: 0.02, low_volatility_threshold: -0.1 };
        assert!(negative.validate().is_err());
    }

    #[test]
    fn test_regime_from_str() {
        assert_eq!("HIGH".parse::<VolatilityRegime>().unwrap(), VolatilityRegime::High);
        assert!("wild".parse::<VolatilityRegime>().is_err());
    }

    #[test]
    fn test_huge_leverage_bounds_stay_in_range() {
        let mut p = ultra_short(20);
        p.leverage_min = 3_000_000_000;
        p.leverage_max = 4_000_000_000;
        p.leverage_recommend.normal = 3_000_000_000;
        p.leverage_recommend.good = 3_500_000_000;
        p.leverage_recommend.strong = 4_000_000_000;

        let normal = VolatilityAdjuster::adjust(&p, VolatilityRegime::Normal).unwrap();
        assert_eq!(normal.leverage, 3_500_000_000);

        // 4e9 * 1.1 exceeds u32 and clamps to the top of the band.
        let strong = VolatilityAdjuster::adjust_for_strength(&p, SignalStrength::Strong, VolatilityRegime::Low).unwrap();
        assert_eq!(strong.leverage, 4_000_000_000);
    }
}
