//! Position model: one leveraged exposure and its lifecycle.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::instruments;

/// Direction of a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

/// How the order enters the market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderKind {
    /// Filled immediately at the quoted price
    Market,
    /// Buy at or below target, sell at or above target
    Limit,
    /// Buy at or above target, sell at or below target
    Stop,
}

/// Position lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionStatus {
    Pending,
    Open,
    Closed,
    Cancelled,
}

/// Why a position was closed. Exactly one applies per closed position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Manual,
    StopLoss,
    TakeProfit,
    StopOut,
    MasterClosed,
    Admin,
}

/// One leveraged exposure owned by an account.
///
/// `margin` is non-null only while status is `pending` or `open`;
/// `profit` is authoritative only once status is `closed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,

    /// Owning trading account
    pub account_id: Uuid,

    pub symbol: String,
    pub side: Side,

    /// Lot size, two-decimal precision
    pub lots: Decimal,

    /// Effective leverage after clamping to the platform maximum
    pub leverage: u32,

    pub order_kind: OrderKind,

    /// Fill price for open positions; requested target while pending
    pub entry_price: Decimal,

    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,

    /// Funds reserved against leverage; cleared on close/cancel
    pub margin: Option<Decimal>,

    /// Charges levied at open
    pub fee: Decimal,
    pub commission: Decimal,
    pub spread_cost: Decimal,

    pub status: PositionStatus,
    pub close_price: Option<Decimal>,
    pub close_reason: Option<CloseReason>,
    pub profit: Option<Decimal>,

    /// True when this position was opened by the mirror engine
    pub mirrored: bool,
    /// Originating master position for mirrored positions
    pub master_position_id: Option<Uuid>,

    pub opened_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    /// Unrealized PnL at the given reference price.
    pub fn floating_pnl(&self, current_price: Decimal) -> Decimal {
        let contract = instruments::contract_size(&self.symbol);
        let delta = match self.side {
            Side::Buy => current_price - self.entry_price,
            Side::Sell => self.entry_price - current_price,
        };
        (delta * self.lots * contract).round_dp(2)
    }

    /// Whether the pending trigger rule fires against a live quote.
    ///
    /// Limit-buy fires when ask reaches the target from above, stop-buy when
    /// ask reaches it from below; sells mirror against the bid.
    pub fn pending_triggered(&self, bid: Decimal, ask: Decimal) -> bool {
        match (self.order_kind, self.side) {
            (OrderKind::Limit, Side::Buy) => ask <= self.entry_price,
            (OrderKind::Limit, Side::Sell) => bid >= self.entry_price,
            (OrderKind::Stop, Side::Buy) => ask >= self.entry_price,
            (OrderKind::Stop, Side::Sell) => bid <= self.entry_price,
            (OrderKind::Market, _) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample(side: Side, kind: OrderKind, entry: Decimal) -> Position {
        Position {
            id: Uuid::new_v4(),
            account_id: Uuid::new_v4(),
            symbol: "EURUSD".to_string(),
            side,
            lots: dec!(1),
            leverage: 100,
            order_kind: kind,
            entry_price: entry,
            stop_loss: None,
            take_profit: None,
            margin: Some(dec!(1100)),
            fee: Decimal::ZERO,
            commission: Decimal::ZERO,
            spread_cost: Decimal::ZERO,
            status: PositionStatus::Open,
            close_price: None,
            close_reason: None,
            profit: None,
            mirrored: false,
            master_position_id: None,
            opened_at: Utc::now(),
            activated_at: None,
            closed_at: None,
        }
    }

    #[test]
    fn test_floating_pnl_long() {
        let pos = sample(Side::Buy, OrderKind::Market, dec!(1.1000));
        // 0.0010 * 1 lot * 100000 = 100
        assert_eq!(pos.floating_pnl(dec!(1.1010)), dec!(100.00));
        assert_eq!(pos.floating_pnl(dec!(1.0990)), dec!(-100.00));
    }

    #[test]
    fn test_floating_pnl_short() {
        let pos = sample(Side::Sell, OrderKind::Market, dec!(1.1000));
        assert_eq!(pos.floating_pnl(dec!(1.0990)), dec!(100.00));
        assert_eq!(pos.floating_pnl(dec!(1.1010)), dec!(-100.00));
    }

    #[test]
    fn test_pending_triggers() {
        let mut pos = sample(Side::Buy, OrderKind::Limit, dec!(1.1000));
        pos.status = PositionStatus::Pending;
        // Limit-buy fires when ask falls to target
        assert!(pos.pending_triggered(dec!(1.0995), dec!(1.1000)));
        assert!(!pos.pending_triggered(dec!(1.1001), dec!(1.1006)));

        let mut stop_sell = sample(Side::Sell, OrderKind::Stop, dec!(1.0950));
        stop_sell.status = PositionStatus::Pending;
        // Stop-sell fires when bid falls to target
        assert!(stop_sell.pending_triggered(dec!(1.0950), dec!(1.0955)));
        assert!(!stop_sell.pending_triggered(dec!(1.0960), dec!(1.0965)));
    }
}
