//! Charge resolution: effective spread/commission/fee schedule per order.
//!
//! Matching scope records are merged in ascending priority
//! (global, segment, symbol, user); a more specific non-zero field overwrites
//! a less specific one and zero fields never override.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::instruments::{self, Segment};

/// Where a charge record applies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "scope", content = "key")]
pub enum ChargeScope {
    Global,
    Segment(Segment),
    Symbol(String),
    User(Uuid),
}

impl ChargeScope {
    /// Merge precedence, ascending.
    fn priority(&self) -> u8 {
        match self {
            ChargeScope::Global => 0,
            ChargeScope::Segment(_) => 1,
            ChargeScope::Symbol(_) => 2,
            ChargeScope::User(_) => 3,
        }
    }
}

/// One configured charge record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeRecord {
    pub scope: ChargeScope,
    pub spread_pips: Decimal,
    pub commission_per_lot: Decimal,
    /// Fee as a fraction of margin (0 to 1)
    pub fee_percentage: Decimal,
    pub min_fee: Decimal,
    pub max_fee: Decimal,
}

impl ChargeRecord {
    pub fn global() -> Self {
        Self {
            scope: ChargeScope::Global,
            spread_pips: Decimal::ZERO,
            commission_per_lot: Decimal::ZERO,
            fee_percentage: Decimal::ZERO,
            min_fee: Decimal::ZERO,
            max_fee: Decimal::ZERO,
        }
    }
}

/// Effective merged schedule for one (symbol, user) pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChargeSchedule {
    pub spread_pips: Decimal,
    pub commission_per_lot: Decimal,
    pub fee_percentage: Decimal,
    pub min_fee: Decimal,
    pub max_fee: Decimal,
}

impl ChargeSchedule {
    fn absorb(&mut self, record: &ChargeRecord) {
        if !record.spread_pips.is_zero() {
            self.spread_pips = record.spread_pips;
        }
        if !record.commission_per_lot.is_zero() {
            self.commission_per_lot = record.commission_per_lot;
        }
        if !record.fee_percentage.is_zero() {
            self.fee_percentage = record.fee_percentage;
        }
        if !record.min_fee.is_zero() {
            self.min_fee = record.min_fee;
        }
        if !record.max_fee.is_zero() {
            self.max_fee = record.max_fee;
        }
    }
}

/// Resolves the effective charge schedule from configured scope records.
/// Safe to call concurrently; never fails for an unrecognized symbol.
#[derive(Default)]
pub struct ChargeResolver {
    records: RwLock<Vec<ChargeRecord>>,
}

impl ChargeResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, record: ChargeRecord) {
        let mut records = self.records.write().await;
        if let Some(existing) = records.iter_mut().find(|r| r.scope == record.scope) {
            *existing = record;
        } else {
            records.push(record);
        }
    }

    /// Effective schedule for a symbol and user. Unknown symbols classify as
    /// forex via the static segment table.
    pub async fn resolve(&self, symbol: &str, user_id: Uuid) -> ChargeSchedule {
        let segment = instruments::classify(symbol);
        let symbol = symbol.to_uppercase();

        let records = self.records.read().await;
        let mut matching: Vec<&ChargeRecord> = records
            .iter()
            .filter(|r| match &r.scope {
                ChargeScope::Global => true,
                ChargeScope::Segment(s) => *s == segment,
                ChargeScope::Symbol(s) => s.eq_ignore_ascii_case(&symbol),
                ChargeScope::User(u) => *u == user_id,
            })
            .collect();
        matching.sort_by_key(|r| r.scope.priority());

        let mut schedule = ChargeSchedule::default();
        for record in matching {
            schedule.absorb(record);
        }
        schedule
    }

    /// Snapshot of every configured record, used by admin tooling.
    pub async fn records(&self) -> Vec<ChargeRecord> {
        self.records.read().await.clone()
    }
}
