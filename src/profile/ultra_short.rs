//! Ultra-short profile: very short holding periods, fast in and out, tight
//! profit locking. Evaluated on a 5-minute decision cycle with code-level
//! protection checked every tick.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use super::{
    AdvisoryStopLoss, AdvisoryTrailingLevel, LeverageRecommend, PositionSizeRecommend, SizeRange,
    StopLossTier, StrategyProfile, TakeProfitStage, TrailingStage, VolatilityAdjustment,
    VolatilityFactors,
};

/// `ceil(value * num / den)` on integers, for `num <= den`.
fn scaled_ceil(value: u32, num: u32, den: u32) -> u32 {
    let scaled = (u64::from(value) * u64::from(num)).div_ceil(u64::from(den));
    u32::try_from(scaled).unwrap_or(value)
}

fn tier(name: &str, min: u32, max: Option<u32>, stop: Decimal) -> StopLossTier {
    let band = match max {
        Some(max) => format!("{min}-{max}x leverage"),
        None => format!("{min}x leverage and above"),
    };
    StopLossTier {
        name: name.to_string(),
        min_leverage: min,
        max_leverage: max,
        stop_loss_percent: stop,
        description: format!("{band}, stop out at {stop}%"),
    }
}

fn stage(index: usize, min: Decimal, max: Option<Decimal>, drawdown: Decimal) -> TrailingStage {
    let band = match max {
        Some(max) => format!("peak {min}-{max}%"),
        None => format!("peak {min}%+"),
    };
    TrailingStage {
        name: format!("stage{index}"),
        min_profit: min,
        max_profit: max,
        drawdown_percent: drawdown,
        description: format!("{band}, close after {drawdown}% giveback (floor {}%)", min - drawdown),
    }
}

fn take_profit(index: usize, trigger: Decimal, close_percent: Decimal) -> TakeProfitStage {
    TakeProfitStage {
        name: format!("stage{index}"),
        trigger,
        close_percent,
    }
}

/// Build the ultra-short profile for an account capped at `max_leverage`.
pub fn ultra_short(max_leverage: u32) -> StrategyProfile {
    let leverage_min = scaled_ceil(max_leverage, 1, 2).max(3);
    let leverage_max = scaled_ceil(max_leverage, 3, 4).max(5);

    StrategyProfile {
        name: "ultra-short".to_string(),
        description: "Very short cycle, fast entries and exits on a 5-minute cadence".to_string(),

        leverage_min,
        leverage_max,
        leverage_recommend: LeverageRecommend {
            normal: leverage_min,
            good: scaled_ceil(max_leverage, 5, 8).max(4),
            strong: leverage_max,
        },
        position_size_min: dec!(18),
        position_size_max: dec!(25),
        position_size_recommend: PositionSizeRecommend {
            normal: SizeRange { min: dec!(18), max: dec!(20) },
            good: SizeRange { min: dec!(20), max: dec!(23) },
            strong: SizeRange { min: dec!(23), max: dec!(25) },
        },
        volatility_adjustment: VolatilityAdjustment {
            high: VolatilityFactors { leverage_factor: dec!(0.7), position_factor: dec!(0.8) },
            normal: VolatilityFactors { leverage_factor: dec!(1.0), position_factor: dec!(1.0) },
            low: VolatilityFactors { leverage_factor: dec!(1.1), position_factor: dec!(1.0) },
        },

        advisory_stop_loss: AdvisoryStopLoss {
            low: dec!(-2.5),
            mid: dec!(-2),
            high: dec!(-1.5),
        },
        advisory_trailing: vec![
            AdvisoryTrailingLevel { trigger: dec!(4), stop_at: dec!(1.5) },
            AdvisoryTrailingLevel { trigger: dec!(8), stop_at: dec!(4) },
            AdvisoryTrailingLevel { trigger: dec!(15), stop_at: dec!(8) },
        ],
        entry_condition: "At least two timeframes agree, favouring the 1-5 minute charts".to_string(),
        risk_tolerance: "18-25% of equity per trade, fast in and out".to_string(),
        trading_style: "Ultra-short: 5-minute cycle, capture short swings, bank 2-4% gains \
                        within the cycle and close profitable positions after 30 minutes"
            .to_string(),

        take_profit_stages: vec![
            take_profit(1, dec!(15), dec!(50)),
            take_profit(2, dec!(25), dec!(50)),
            take_profit(3, dec!(35), dec!(100)),
        ],
        peak_drawdown_protection: dec!(20),
        enable_code_level_protection: true,
        // The low tier reaches down to the profile minimum so every allowed
        // leverage resolves to a tier.
        stop_loss_tiers: vec![
            tier("lowRisk", leverage_min.min(5), Some(7), dec!(-6)),
            tier("mediumRisk", 8, Some(12), dec!(-5)),
            tier("highRisk", 13, None, dec!(-4)),
        ],
        trailing_stages: vec![
            stage(1, dec!(4), Some(dec!(6)), dec!(1.5)),
            stage(2, dec!(6), Some(dec!(10)), dec!(2)),
            stage(3, dec!(10), Some(dec!(15)), dec!(2.5)),
            stage(4, dec!(15), Some(dec!(25)), dec!(3)),
            stage(5, dec!(25), None, dec!(5)),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leverage_bounds_follow_max_leverage() {
        let p = ultra_short(10);
        assert_eq!((p.leverage_min, p.leverage_max), (5, 8));
        assert_eq!(
            (p.leverage_recommend.normal, p.leverage_recommend.good, p.leverage_recommend.strong),
            (5, 7, 8)
        );

        let p = ultra_short(20);
        assert_eq!((p.leverage_min, p.leverage_max), (10, 15));
        assert_eq!(p.leverage_recommend.good, 13);
    }

    #[test]
    fn test_small_max_leverage_uses_floors() {
        let p = ultra_short(2);
        assert_eq!((p.leverage_min, p.leverage_max), (3, 5));
        assert_eq!(p.leverage_recommend.good, 4);
        // Low tier stretches down to cover 3x.
        assert_eq!(p.stop_loss_tiers[0].min_leverage, 3);
    }

    #[test]
    fn test_tier_table() {
        let p = ultra_short(20);
        let stops: Vec<_> = p
            .stop_loss_tiers
            .iter()
            .map(|t| (t.min_leverage, t.max_leverage, t.stop_loss_percent))
            .collect();
        assert_eq!(
            stops,
            vec![(5, Some(7), dec!(-6)), (8, Some(12), dec!(-5)), (13, None, dec!(-4))]
        );
    }

    #[test]
    fn test_trailing_floors() {
        let p = ultra_short(20);
        let floors: Vec<_> = p.trailing_stages.iter().map(|s| s.advisory_floor()).collect();
        assert_eq!(floors, vec![dec!(2.5), dec!(4), dec!(7.5), dec!(12), dec!(20)]);
    }

    #[test]
    fn test_huge_max_leverage_scales_without_saturating() {
        let p = ultra_short(u32::MAX);
        assert_eq!(p.leverage_min, 2_147_483_648);
        assert_eq!(p.leverage_max, 3_221_225_472);
        assert!(p.validate().is_ok());
    }
}
