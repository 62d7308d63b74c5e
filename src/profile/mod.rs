//! Strategy profiles: validated threshold tables consumed by the engine.
//!
//! A profile is built once per strategy selection and shared read-only
//! (behind an `Arc`) by every position opened under it.

mod ultra_short;

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{GuardError, GuardResult};
use crate::trading::VolatilityRegime;

pub use ultra_short::ultra_short;

/// Signal strength used to pick a recommended leverage / size at entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalStrength {
    Normal,
    Good,
    Strong,
}

impl FromStr for SignalStrength {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "normal" => Ok(Self::Normal),
            "good" => Ok(Self::Good),
            "strong" => Ok(Self::Strong),
            other => Err(GuardError::config(format!("unknown signal strength '{other}'"))),
        }
    }
}

/// Recommended leverage per signal strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeverageRecommend {
    pub normal: u32,
    pub good: u32,
    pub strong: u32,
}

impl LeverageRecommend {
    pub fn for_strength(&self, strength: SignalStrength) -> u32 {
        match strength {
            SignalStrength::Normal => self.normal,
            SignalStrength::Good => self.good,
            SignalStrength::Strong => self.strong,
        }
    }
}

/// Inclusive percentage range of account equity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeRange {
    pub min: Decimal,
    pub max: Decimal,
}

impl SizeRange {
    pub fn midpoint(&self) -> Decimal {
        (self.min + self.max) / dec!(2)
    }
}

impl fmt::Display for SizeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}%", self.min, self.max)
    }
}

/// Recommended position size range per signal strength.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSizeRecommend {
    pub normal: SizeRange,
    pub good: SizeRange,
    pub strong: SizeRange,
}

impl PositionSizeRecommend {
    pub fn for_strength(&self, strength: SignalStrength) -> SizeRange {
        match strength {
            SignalStrength::Normal => self.normal,
            SignalStrength::Good => self.good,
            SignalStrength::Strong => self.strong,
        }
    }
}

/// Discretionary stop-loss guidance. Displayed, never enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvisoryStopLoss {
    pub low: Decimal,
    pub mid: Decimal,
    pub high: Decimal,
}

/// Discretionary trailing guidance: once profit reaches `trigger`, move the
/// stop to `stop_at`. Displayed, never enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvisoryTrailingLevel {
    pub trigger: Decimal,
    pub stop_at: Decimal,
}

/// One rung of the partial take-profit ladder.
///
/// `close_percent` is a share of the original position size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TakeProfitStage {
    pub name: String,
    pub trigger: Decimal,
    pub close_percent: Decimal,
}

/// Leverage/position-size multipliers for one volatility regime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolatilityFactors {
    pub leverage_factor: Decimal,
    pub position_factor: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolatilityAdjustment {
    pub high: VolatilityFactors,
    pub normal: VolatilityFactors,
    pub low: VolatilityFactors,
}

impl VolatilityAdjustment {
    pub fn factors(&self, regime: VolatilityRegime) -> VolatilityFactors {
        match regime {
            VolatilityRegime::High => self.high,
            VolatilityRegime::Normal => self.normal,
            VolatilityRegime::Low => self.low,
        }
    }
}

/// Leverage band mapped to a hard stop-loss.
///
/// The band is inclusive on both ends; `max_leverage: None` is unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopLossTier {
    pub name: String,
    pub min_leverage: u32,
    pub max_leverage: Option<u32>,
    pub stop_loss_percent: Decimal,
    #[serde(default)]
    pub description: String,
}

impl StopLossTier {
    pub fn contains(&self, leverage: u32) -> bool {
        leverage >= self.min_leverage && self.max_leverage.map_or(true, |max| leverage <= max)
    }
}

/// Peak-profit band `[min_profit, max_profit)` mapped to an allowed giveback.
///
/// `max_profit: None` is unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrailingStage {
    pub name: String,
    pub min_profit: Decimal,
    pub max_profit: Option<Decimal>,
    pub drawdown_percent: Decimal,
    #[serde(default)]
    pub description: String,
}

impl TrailingStage {
    pub fn contains(&self, peak_profit: Decimal) -> bool {
        peak_profit >= self.min_profit && self.max_profit.map_or(true, |max| peak_profit < max)
    }

    /// Nominal floor when the peak sits exactly at `min_profit`.
    pub fn advisory_floor(&self) -> Decimal {
        self.min_profit - self.drawdown_percent
    }
}

/// Complete strategy profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyProfile {
    pub name: String,
    #[serde(default)]
    pub description: String,

    // === Entry sizing ===
    pub leverage_min: u32,
    pub leverage_max: u32,
    pub leverage_recommend: LeverageRecommend,
    pub position_size_min: Decimal,
    pub position_size_max: Decimal,
    pub position_size_recommend: PositionSizeRecommend,
    pub volatility_adjustment: VolatilityAdjustment,

    // === Discretionary guidance ===
    pub advisory_stop_loss: AdvisoryStopLoss,
    #[serde(default)]
    pub advisory_trailing: Vec<AdvisoryTrailingLevel>,
    #[serde(default)]
    pub entry_condition: String,
    #[serde(default)]
    pub risk_tolerance: String,
    #[serde(default)]
    pub trading_style: String,

    // === Enforced exits ===
    pub take_profit_stages: Vec<TakeProfitStage>,
    /// Maximum giveback from peak, as a percentage of the peak.
    pub peak_drawdown_protection: Decimal,
    /// When false, tier stop-loss and staged trailing are left to the operator.
    pub enable_code_level_protection: bool,
    pub stop_loss_tiers: Vec<StopLossTier>,
    pub trailing_stages: Vec<TrailingStage>,
}

impl StrategyProfile {
    /// Check every structural invariant. Called at load time and again when
    /// an evaluator is built, never per tick.
    pub fn validate(&self) -> GuardResult<()> {
        let fail = |msg: String| Err(GuardError::Config(format!("profile '{}': {}", self.name, msg)));

        if self.leverage_min == 0 || self.leverage_min > self.leverage_max {
            return fail(format!(
                "leverage bounds {}..={} are not a valid range",
                self.leverage_min, self.leverage_max
            ));
        }
        if self.position_size_min <= Decimal::ZERO
            || self.position_size_max > dec!(100)
            || self.position_size_min > self.position_size_max
        {
            return fail(format!(
                "position size bounds {}..={} must satisfy 0 < min <= max <= 100",
                self.position_size_min, self.position_size_max
            ));
        }
        if self.peak_drawdown_protection <= Decimal::ZERO || self.peak_drawdown_protection > dec!(100) {
            return fail(format!(
                "peak drawdown protection {} must be in (0, 100]",
                self.peak_drawdown_protection
            ));
        }
        for (label, f) in [
            ("high", self.volatility_adjustment.high),
            ("normal", self.volatility_adjustment.normal),
            ("low", self.volatility_adjustment.low),
        ] {
            if f.leverage_factor <= Decimal::ZERO || f.position_factor <= Decimal::ZERO {
                return fail(format!("{label} volatility factors must be positive"));
            }
        }

        self.validate_tiers().or_else(fail)?;
        self.validate_trailing().or_else(fail)?;
        self.validate_take_profit().or_else(fail)?;
        Ok(())
    }

    fn validate_tiers(&self) -> Result<(), String> {
        let tiers = &self.stop_loss_tiers;
        let Some(first) = tiers.first() else {
            return Err("no stop-loss tiers defined".into());
        };
        if first.min_leverage > self.leverage_min {
            return Err(format!(
                "first tier '{}' starts at {}x but the profile allows {}x",
                first.name, first.min_leverage, self.leverage_min
            ));
        }

        for (i, tier) in tiers.iter().enumerate() {
            if tier.stop_loss_percent >= Decimal::ZERO {
                return Err(format!("tier '{}' stop-loss must be negative", tier.name));
            }
            let is_last = i + 1 == tiers.len();
            match (tier.max_leverage, is_last) {
                (None, true) => {}
                (None, false) => {
                    return Err(format!("only the last tier may be unbounded, '{}' is not last", tier.name))
                }
                (Some(_), true) => {
                    return Err(format!("last tier '{}' must be unbounded", tier.name))
                }
                (Some(max), false) => {
                    if max < tier.min_leverage {
                        return Err(format!("tier '{}' has max below min", tier.name));
                    }
                    let Some(expected_next) = max.checked_add(1) else {
                        return Err(format!(
                            "tier '{}' upper bound leaves no room for the next tier",
                            tier.name
                        ));
                    };
                    let next = &tiers[i + 1];
                    if next.min_leverage != expected_next {
                        return Err(format!(
                            "tiers '{}' and '{}' leave a gap or overlap ({}x then {}x)",
                            tier.name, next.name, max, next.min_leverage
                        ));
                    }
                    if next.stop_loss_percent <= tier.stop_loss_percent {
                        return Err(format!(
                            "tier '{}' must use a tighter stop than '{}'",
                            next.name, tier.name
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_trailing(&self) -> Result<(), String> {
        let stages = &self.trailing_stages;
        if stages.is_empty() {
            return Err("no trailing-stop stages defined".into());
        }
        for (i, stage) in stages.iter().enumerate() {
            if stage.drawdown_percent <= Decimal::ZERO {
                return Err(format!("stage '{}' drawdown must be positive", stage.name));
            }
            let is_last = i + 1 == stages.len();
            match (stage.max_profit, is_last) {
                (None, true) => {}
                (None, false) => {
                    return Err(format!("only the last stage may be unbounded, '{}' is not last", stage.name))
                }
                (Some(_), true) => {
                    return Err(format!("last stage '{}' must be unbounded", stage.name))
                }
                (Some(max), false) => {
                    if max <= stage.min_profit {
                        return Err(format!("stage '{}' has an empty range", stage.name));
                    }
                    let next = &stages[i + 1];
                    if next.min_profit != max {
                        return Err(format!(
                            "stages '{}' and '{}' are not contiguous ({} then {})",
                            stage.name, next.name, max, next.min_profit
                        ));
                    }
                    if next.drawdown_percent <= stage.drawdown_percent {
                        return Err(format!(
                            "stage '{}' drawdown must exceed '{}'",
                            next.name, stage.name
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn validate_take_profit(&self) -> Result<(), String> {
        let stages = &self.take_profit_stages;
        if stages.is_empty() {
            return Err("no take-profit stages defined".into());
        }
        for pair in stages.windows(2) {
            if pair[1].trigger <= pair[0].trigger {
                return Err(format!(
                    "take-profit '{}' trigger must exceed '{}'",
                    pair[1].name, pair[0].name
                ));
            }
        }
        for stage in stages {
            if stage.close_percent <= Decimal::ZERO || stage.close_percent > dec!(100) {
                return Err(format!("take-profit '{}' close percent must be in (0, 100]", stage.name));
            }
        }
        match self.take_profit_targets().last() {
            Some((_, target)) if target == dec!(100) => Ok(()),
            _ => Err("take-profit ladder never closes the whole position".into()),
        }
    }

    /// Ladder stages paired with the cumulative closed percentage each one
    /// brings the position to, capped at 100.
    pub fn take_profit_targets(&self) -> impl Iterator<Item = (&TakeProfitStage, Decimal)> {
        self.take_profit_stages.iter().scan(Decimal::ZERO, |cumulative, stage| {
            *cumulative = (*cumulative + stage.close_percent).min(dec!(100));
            Some((stage, *cumulative))
        })
    }

    /// Midpoint of the allowed leverage band.
    pub fn leverage_midpoint(&self) -> Decimal {
        (Decimal::from(self.leverage_min) + Decimal::from(self.leverage_max)) / dec!(2)
    }

    /// Midpoint of the allowed position size band.
    pub fn position_size_midpoint(&self) -> Decimal {
        (self.position_size_min + self.position_size_max) / dec!(2)
    }
}

/// Named strategy styles the provider knows how to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StrategyStyle {
    UltraShort,
}

impl StrategyStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyStyle::UltraShort => "ultra-short",
        }
    }
}

impl FromStr for StrategyStyle {
    type Err = GuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ultra-short" | "ultrashort" | "ultra_short" => Ok(Self::UltraShort),
            other => Err(GuardError::config(format!("unknown strategy style '{other}'"))),
        }
    }
}

/// Builds validated profiles from a style name or a JSON file.
pub struct ProfileProvider;

impl ProfileProvider {
    /// Build the profile for `style` scaled to `max_leverage`.
    pub fn load(style: StrategyStyle, max_leverage: u32) -> GuardResult<StrategyProfile> {
        let profile = match style {
            StrategyStyle::UltraShort => ultra_short(max_leverage),
        };
        profile.validate()?;
        Self::log_loaded(&profile);
        Ok(profile)
    }

    /// Load a custom profile serialized as JSON.
    pub fn from_file(path: impl AsRef<Path>) -> Result<StrategyProfile> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read profile file {}", path.display()))?;
        let profile: StrategyProfile = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse profile file {}", path.display()))?;
        profile.validate()?;
        Self::log_loaded(&profile);
        Ok(profile)
    }

    fn log_loaded(profile: &StrategyProfile) {
        info!(
            profile = %profile.name,
            leverage_min = profile.leverage_min,
            leverage_max = profile.leverage_max,
            tiers = profile.stop_loss_tiers.len(),
            trailing_stages = profile.trailing_stages.len(),
            "Strategy profile loaded"
        );
        if !profile.enable_code_level_protection {
            warn!(
                profile = %profile.name,
                "Code-level stop-loss and trailing stop are disabled for this profile"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> StrategyProfile {
        ultra_short(20)
    }

    #[test]
    fn test_shipped_profile_is_valid() {
        for max_leverage in [1, 5, 8, 10, 20, 50, 125] {
            let p = ultra_short(max_leverage);
            assert!(p.validate().is_ok(), "max leverage {max_leverage}: {:?}", p.validate());
        }
    }

    #[test]
    fn test_tier_gap_rejected() {
        let mut p = profile();
        p.stop_loss_tiers[1].min_leverage += 1;
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("gap or overlap"));
    }

    #[test]
    fn test_tier_bound_at_integer_limit_rejected() {
        let mut p = profile();
        p.stop_loss_tiers[1].max_leverage = Some(u32::MAX);
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("no room for the next tier"));
    }

    #[test]
    fn test_leverage_midpoint_of_huge_bounds() {
        let mut p = profile();
        p.leverage_min = 3_000_000_000;
        p.leverage_max = 4_000_000_000;
        assert_eq!(p.leverage_midpoint(), dec!(3500000000));
    }

    #[test]
    fn test_tier_overlap_rejected() {
        let mut p = profile();
        p.stop_loss_tiers[0].max_leverage = Some(9);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_tier_must_tighten_with_leverage() {
        let mut p = profile();
        p.stop_loss_tiers[2].stop_loss_percent = dec!(-7);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_bounded_last_tier_rejected() {
        let mut p = profile();
        p.stop_loss_tiers.last_mut().unwrap().max_leverage = Some(200);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_trailing_stages_must_be_contiguous() {
        let mut p = profile();
        p.trailing_stages[2].min_profit = dec!(11);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_trailing_drawdown_must_increase() {
        let mut p = profile();
        p.trailing_stages[3].drawdown_percent = dec!(2.5);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_take_profit_must_reach_full_close() {
        let mut p = profile();
        p.take_profit_stages.truncate(1);
        let err = p.validate().unwrap_err();
        assert!(err.to_string().contains("never closes"));
    }

    #[test]
    fn test_take_profit_targets_are_cumulative_and_capped() {
        let p = profile();
        let targets: Vec<Decimal> = p.take_profit_targets().map(|(_, t)| t).collect();
        assert_eq!(targets, vec![dec!(50), dec!(100), dec!(100)]);
    }

    #[test]
    fn test_inverted_leverage_bounds_rejected() {
        let mut p = profile();
        p.leverage_min = p.leverage_max + 1;
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_style_parsing() {
        assert_eq!("ultra-short".parse::<StrategyStyle>().unwrap(), StrategyStyle::UltraShort);
        assert_eq!("ULTRA_SHORT".parse::<StrategyStyle>().unwrap(), StrategyStyle::UltraShort);
        assert!("swing".parse::<StrategyStyle>().is_err());
    }

    #[test]
    fn test_profile_json_round_trip_stays_valid() {
        let p = profile();
        let json = serde_json::to_string(&p).unwrap();
        let back: StrategyProfile = serde_json::from_str(&json).unwrap();
        assert_eq!(back, p);
        assert!(back.validate().is_ok());
    }

    fn temp_profile_path() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("posguard-profile-{}.json", uuid::Uuid::new_v4()))
    }

    #[test]
    fn test_from_file_loads_validated_profile() {
        let p = profile();
        let path = temp_profile_path();
        std::fs::write(&path, serde_json::to_string_pretty(&p).unwrap()).unwrap();

        let loaded = ProfileProvider::from_file(&path);
        let _ = std::fs::remove_file(&path);
        assert_eq!(loaded.unwrap(), p);
    }

    #[test]
    fn test_from_file_rejects_gapped_tiers() {
        let mut p = profile();
        p.stop_loss_tiers[2].min_leverage += 2;
        let path = temp_profile_path();
        std::fs::write(&path, serde_json::to_string(&p).unwrap()).unwrap();

        let err = ProfileProvider::from_file(&path).unwrap_err();
        let _ = std::fs::remove_file(&path);
        assert!(format!("{err:#}").contains("gap or overlap"));
    }

    #[test]
    fn test_from_file_missing_file() {
        assert!(ProfileProvider::from_file(temp_profile_path()).is_err());
    }
}
