//! Lookup of the stop-loss tier and trailing-stop stage that apply to a
//! position.

use rust_decimal::Decimal;

use crate::error::{GuardError, GuardResult};
use crate::profile::{StopLossTier, StrategyProfile, TrailingStage};

/// Resolves profile ranges for a given leverage or peak profit.
pub struct TierResolver;

impl TierResolver {
    /// Stop-loss tier whose leverage band contains `leverage`.
    ///
    /// A leverage outside every tier is a profile bug and is reported, never
    /// defaulted.
    pub fn stop_loss_tier(profile: &StrategyProfile, leverage: u32) -> GuardResult<&StopLossTier> {
        profile
            .stop_loss_tiers
            .iter()
            .find(|tier| tier.contains(leverage))
            .ok_or_else(|| {
                GuardError::config(format!(
                    "leverage {leverage}x is not covered by any stop-loss tier of profile '{}'",
                    profile.name
                ))
            })
    }

    /// Trailing stage whose `[min, max)` band contains `peak_profit`, or
    /// `None` while the peak is below the first stage.
    pub fn trailing_stage(profile: &StrategyProfile, peak_profit: Decimal) -> Option<&TrailingStage> {
        profile
            .trailing_stages
            .iter()
            .find(|stage| stage.contains(peak_profit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ultra_short;
    use rust_decimal_macros::dec;

    #[test]
    fn test_tier_boundaries() {
        let p = ultra_short(20);
        let name = |lev| TierResolver::stop_loss_tier(&p, lev).unwrap().name.clone();

        assert_eq!(name(5), "lowRisk");
        assert_eq!(name(7), "lowRisk");
        assert_eq!(name(8), "mediumRisk");
        assert_eq!(name(10), "mediumRisk");
        assert_eq!(name(12), "mediumRisk");
        assert_eq!(name(13), "highRisk");
        assert_eq!(name(125), "highRisk");
    }

    #[test]
    fn test_leverage_below_tiers_is_error() {
        let p = ultra_short(20);
        let err = TierResolver::stop_loss_tier(&p, 4).unwrap_err();
        assert!(matches!(err, GuardError::Config(_)));
    }

    #[test]
    fn test_stage_half_open_ranges() {
        let p = ultra_short(20);
        let stage = |peak| TierResolver::trailing_stage(&p, peak).map(|s| s.name.clone());

        assert_eq!(stage(dec!(3.99)), None);
        assert_eq!(stage(dec!(4)).as_deref(), Some("stage1"));
        assert_eq!(stage(dec!(5.99)).as_deref(), Some("stage1"));
        assert_eq!(stage(dec!(6)).as_deref(), Some("stage2"));
        assert_eq!(stage(dec!(12)).as_deref(), Some("stage3"));
        assert_eq!(stage(dec!(15)).as_deref(), Some("stage4"));
        assert_eq!(stage(dec!(25)).as_deref(), Some("stage5"));
        assert_eq!(stage(dec!(400)).as_deref(), Some("stage5"));
    }

    #[test]
    fn test_negative_peak_has_no_stage() {
        let p = ultra_short(20);
        assert!(TierResolver::trailing_stage(&p, dec!(-3)).is_none());
    }
}
