//! Engine configuration and platform constants.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// A referral commission tier. The highest tier whose `min_referrals`
/// threshold the referrer meets is selected automatically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommissionTier {
    /// Referral count required to qualify for this tier
    pub min_referrals: u32,

    /// Per-lot commission rate in account currency
    pub per_lot_rate: Decimal,

    /// Percentage of a referred user's first deposit (0 to 100)
    pub first_deposit_pct: Decimal,
}

/// Platform-wide engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum leverage a user may request; higher requests are clamped
    pub max_leverage: u32,

    /// Smallest lot size accepted for any order or mirrored copy
    pub min_lot: Decimal,

    /// Margin level (percent) at or below which stop-out liquidation fires
    pub stop_out_level: Decimal,

    /// Margin level (percent) at or below which a margin call is sent
    pub margin_call_level: Decimal,

    /// Minimum seconds between margin-call notifications per account
    pub margin_call_cooldown_secs: i64,

    /// Seconds between position-monitor scan cycles
    pub monitor_interval_secs: u64,

    /// Referral commission schedule, ascending by `min_referrals`
    pub referral_tiers: Vec<CommissionTier>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_leverage: 500,
            min_lot: dec!(0.01),
            stop_out_level: dec!(50),
            margin_call_level: dec!(100),
            margin_call_cooldown_secs: 60,
            monitor_interval_secs: 2,
            referral_tiers: vec![
                CommissionTier {
                    min_referrals: 0,
                    per_lot_rate: dec!(0.50),
                    first_deposit_pct: dec!(5),
                },
                CommissionTier {
                    min_referrals: 10,
                    per_lot_rate: dec!(1.00),
                    first_deposit_pct: dec!(7),
                },
                CommissionTier {
                    min_referrals: 50,
                    per_lot_rate: dec!(2.00),
                    first_deposit_pct: dec!(10),
                },
            ],
        }
    }
}

impl EngineConfig {
    /// Resolve the effective referral tier for a given referral count.
    /// `None` when no tier qualifies (or none are configured).
    pub fn tier_for(&self, referral_count: u32) -> Option<&CommissionTier> {
        self.referral_tiers
            .iter()
            .filter(|t| referral_count >= t.min_referrals)
            .max_by_key(|t| t.min_referrals)
    }
}
