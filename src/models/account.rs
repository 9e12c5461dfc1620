//! Trading account balance and the append-only ledger.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A trading account. `balance` is cash not currently reserved as margin and
/// is mutated exclusively by the engine, always paired with a ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
}

impl Account {
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            balance: Decimal::ZERO,
            created_at: Utc::now(),
        }
    }
}

/// What caused a balance mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryType {
    Deposit,
    OrderOpen,
    OrderCancelRefund,
    PositionClose,
    CopyCommissionDebit,
    CopyCommissionCredit,
    ReferralCommission,
}

/// Immutable audit record for one balance mutation. Never updated after
/// creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub account_id: Uuid,
    pub entry_type: LedgerEntryType,

    /// Signed amount applied to the balance
    pub amount: Decimal,

    pub balance_before: Decimal,
    pub balance_after: Decimal,

    /// Position, map or relationship that caused this entry
    pub reference: Option<Uuid>,

    pub created_at: DateTime<Utc>,
}
