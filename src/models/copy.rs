//! Copy-trading models: master profiles, follower links, mirrored-pair maps.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::PositionStatus;

/// How a follower's lot size is derived from the master's.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode", content = "value")]
pub enum SizingMode {
    /// Always trade this exact lot size
    FixedLot(Decimal),
    /// Scale the master's lot by a constant factor
    Multiplier(Decimal),
    /// Scale by follower equity relative to master equity
    BalanceRatio,
}

/// How a master charges followers on closed mirrored trades.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "model", content = "value")]
pub enum CommissionModel {
    /// Percentage (0 to 100) of positive follower PnL; nothing on a loss
    ProfitShare(Decimal),
    /// Flat rate per follower lot regardless of PnL sign
    PerLot(Decimal),
    /// Billed out-of-band, excluded from per-trade processing
    Subscription,
}

/// Running status of a master-follower subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Active,
    Paused,
    Stopped,
}

/// A master trader's copy-trading profile. Only approved masters are
/// mirrored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterProfile {
    pub account_id: Uuid,
    pub approved: bool,
    pub commission_model: CommissionModel,

    /// Lifetime mirrored-trade count across all followers
    pub copied_count: u64,
    /// Lifetime commission earned from followers
    pub earned_commission: Decimal,

    pub created_at: DateTime<Utc>,
}

impl MasterProfile {
    pub fn new(account_id: Uuid, commission_model: CommissionModel) -> Self {
        Self {
            account_id,
            approved: false,
            commission_model,
            copied_count: 0,
            earned_commission: Decimal::ZERO,
            created_at: Utc::now(),
        }
    }
}

/// Durable master-follower subscription, owned by the follower.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyLink {
    pub id: Uuid,
    pub master_id: Uuid,
    pub follower_id: Uuid,

    pub mode: SizingMode,

    /// Daily loss cap as a percentage of follower equity (0 to 100)
    pub max_daily_loss_pct: Decimal,
    /// Drawdown cap from the link's peak equity (0 to 100)
    pub max_drawdown_pct: Decimal,
    /// Largest lot any single mirrored order may reach
    pub max_lot: Decimal,

    pub status: LinkStatus,
    pub pause_reason: Option<String>,

    // Accumulated stats
    pub copied_count: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub total_pnl: Decimal,
    pub total_commission_paid: Decimal,

    /// Loss realized today; resets when the calendar day rolls over
    pub daily_loss: Decimal,
    pub daily_anchor: NaiveDate,

    /// Highest follower equity seen, anchor for drawdown evaluation
    pub peak_equity: Decimal,

    pub created_at: DateTime<Utc>,
}

impl CopyLink {
    pub fn new(master_id: Uuid, follower_id: Uuid, mode: SizingMode) -> Self {
        Self {
            id: Uuid::new_v4(),
            master_id,
            follower_id,
            mode,
            max_daily_loss_pct: Decimal::new(10, 0),
            max_drawdown_pct: Decimal::new(30, 0),
            max_lot: Decimal::new(10, 0),
            status: LinkStatus::Active,
            pause_reason: None,
            copied_count: 0,
            success_count: 0,
            failure_count: 0,
            total_pnl: Decimal::ZERO,
            total_commission_paid: Decimal::ZERO,
            daily_loss: Decimal::ZERO,
            daily_anchor: Utc::now().date_naive(),
            peak_equity: Decimal::ZERO,
            created_at: Utc::now(),
        }
    }

    /// Reset the daily-loss counter when the calendar day has rolled over.
    pub fn roll_daily_anchor(&mut self, today: NaiveDate) {
        if today != self.daily_anchor {
            self.daily_anchor = today;
            self.daily_loss = Decimal::ZERO;
        }
    }
}

/// One mirrored position pair, created atomically with the follower position
/// and closed atomically with it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyMap {
    pub id: Uuid,
    pub link_id: Uuid,
    pub master_id: Uuid,
    pub follower_id: Uuid,
    pub master_position_id: Uuid,
    pub follower_position_id: Uuid,

    // Sizing snapshot at mirror time
    pub master_lot: Decimal,
    pub follower_lot: Decimal,
    pub mode: SizingMode,
    pub entry_price: Decimal,

    /// Mirrors the follower position's lifecycle
    pub status: PositionStatus,

    pub commission: Decimal,
    pub commission_paid: bool,

    /// Milliseconds between master execution and follower fill
    pub execution_delay_ms: i64,

    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}
