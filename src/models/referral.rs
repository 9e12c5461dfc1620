//! Referral (introducing-broker) models and the commission log.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Durable referrer-referred relationship.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReferralRelationship {
    pub id: Uuid,
    pub referrer_id: Uuid,
    pub referred_id: Uuid,

    pub active: bool,
    /// Frozen relationships earn nothing until unfrozen
    pub frozen: bool,

    /// The one-time first-deposit commission fires at most once
    pub first_deposit_processed: bool,

    pub created_at: DateTime<Utc>,
}

impl ReferralRelationship {
    pub fn new(referrer_id: Uuid, referred_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            referrer_id,
            referred_id,
            active: true,
            frozen: false,
            first_deposit_processed: false,
            created_at: Utc::now(),
        }
    }

    pub fn is_earning(&self) -> bool {
        self.active && !self.frozen
    }
}

/// What triggered a commission event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommissionKind {
    /// Referral per-lot commission on a referred user's closed trade
    Trade,
    /// One-time percentage of a referred user's first deposit
    FirstDeposit,
    /// Manually granted by an administrator
    Manual,
    /// Copy-trade commission from follower to master
    CopyTrade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommissionStatus {
    Credited,
    Cancelled,
    Reversed,
}

/// Append-only commission event record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommissionLog {
    pub id: Uuid,
    /// Account credited with the commission
    pub beneficiary_id: Uuid,
    /// User whose activity generated it
    pub source_user_id: Uuid,

    pub kind: CommissionKind,

    /// Position, deposit ledger entry or map that sourced the event
    pub reference: Option<Uuid>,

    /// Rate applied (per-lot rate, profit-share or deposit percentage)
    pub rate: Decimal,
    pub amount: Decimal,

    pub status: CommissionStatus,
    pub created_at: DateTime<Utc>,
}
