//! Order execution: market and pending orders, modify, cancel, and the
//! shared close primitive.
//!
//! Every balance-affecting path holds the account lock across its
//! read-modify-write and pairs the mutation with a ledger entry. A failed
//! validation never debits funds.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::instruments;
use crate::models::{
    CloseReason, LedgerEntryType, OrderKind, Position, PositionStatus, Side,
};

use super::Engine;

/// A proposed market or pending order.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub account_id: Uuid,
    pub symbol: String,
    pub side: Side,
    pub lots: Decimal,
    pub leverage: u32,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

/// Pre-trade charge breakdown, returned to callers so they can render it
/// without re-deriving the math.
#[derive(Debug, Clone, Serialize)]
pub struct ChargeBreakdown {
    pub execution_price: Decimal,
    pub margin: Decimal,
    pub fee: Decimal,
    pub commission: Decimal,
    pub spread_cost: Decimal,
}

impl ChargeBreakdown {
    pub fn total_required(&self) -> Decimal {
        self.margin + self.fee + self.commission + self.spread_cost
    }
}

impl Engine {
    /// Charge math shared by market orders, pending orders and mirroring.
    ///
    /// Pending orders reserve margin and fee only; spread and commission are
    /// levied at market execution (the platform absorbs them for pendings,
    /// including at activation).
    pub async fn compute_charges(
        &self,
        account_id: Uuid,
        symbol: &str,
        lots: Decimal,
        leverage: u32,
        price: Decimal,
        trading_costs: bool,
    ) -> ChargeBreakdown {
        let schedule = self.charges().resolve(symbol, account_id).await;
        let contract = instruments::contract_size(symbol);

        let margin = (price * contract * lots / Decimal::from(leverage)).round_dp(2);

        let mut fee = (margin * schedule.fee_percentage).round_dp(2);
        if !schedule.min_fee.is_zero() && fee < schedule.min_fee {
            fee = schedule.min_fee;
        }
        if !schedule.max_fee.is_zero() && fee > schedule.max_fee {
            fee = schedule.max_fee;
        }

        let (commission, spread_cost) = if trading_costs {
            let commission = (schedule.commission_per_lot * lots).round_dp(2);
            let spread_cost = (schedule.spread_pips
                * instruments::pip_size(symbol)
                * contract
                * lots)
                .round_dp(2);
            (commission, spread_cost)
        } else {
            (Decimal::ZERO, Decimal::ZERO)
        };

        ChargeBreakdown {
            execution_price: price,
            margin,
            fee,
            commission,
            spread_cost,
        }
    }

    /// Pre-trade estimate for the query surface. Market estimates quote the
    /// live price; pending estimates use the caller's target price.
    pub async fn estimate_order(
        &self,
        account_id: Uuid,
        symbol: &str,
        side: Side,
        lots: Decimal,
        leverage: u32,
        target_price: Option<Decimal>,
    ) -> Result<ChargeBreakdown> {
        let leverage = self.clamp_leverage(leverage);
        self.validate_lots(lots)?;

        let (price, trading_costs) = match target_price {
            Some(target) => (target, false),
            None => {
                let tick = self
                    .prices()
                    .get(symbol)
                    .await
                    .ok_or_else(|| EngineError::InstrumentUnavailable(symbol.to_string()))?;
                let price = match side {
                    Side::Buy => tick.ask,
                    Side::Sell => tick.bid,
                };
                (price, true)
            }
        };

        Ok(self
            .compute_charges(account_id, symbol, lots, leverage, price, trading_costs)
            .await)
    }

    /// Execute a market order at the counterparty-quoted price.
    pub async fn place_market_order(&self, request: OrderRequest) -> Result<Position> {
        let position = self.open_order(&request, OrderKind::Market, None, false, None).await?;

        // Fan out to followers when the owner is an approved master.
        self.mirror_master_execution(&position).await;
        Ok(position)
    }

    /// Place a limit or stop order. Margin and fee are computed against the
    /// requested price and reserved immediately.
    pub async fn place_pending_order(
        &self,
        request: OrderRequest,
        kind: OrderKind,
        target_price: Decimal,
    ) -> Result<Position> {
        if kind == OrderKind::Market {
            return Err(EngineError::Validation(
                "pending orders must be limit or stop".to_string(),
            ));
        }
        if target_price <= Decimal::ZERO {
            return Err(EngineError::Validation(format!(
                "target price must be positive, got {target_price}"
            )));
        }
        self.open_order(&request, kind, Some(target_price), false, None)
            .await
    }

    /// Shared open path for market, pending and mirrored orders.
    pub(crate) async fn open_order(
        &self,
        request: &OrderRequest,
        kind: OrderKind,
        target_price: Option<Decimal>,
        mirrored: bool,
        master_position_id: Option<Uuid>,
    ) -> Result<Position> {
        self.validate_lots(request.lots)?;
        let leverage = self.clamp_leverage(request.leverage);

        let (entry_price, status, trading_costs) = match target_price {
            Some(target) => (target, PositionStatus::Pending, false),
            None => {
                let tick = self
                    .prices()
                    .get(&request.symbol)
                    .await
                    .ok_or_else(|| EngineError::InstrumentUnavailable(request.symbol.clone()))?;
                let price = match request.side {
                    Side::Buy => tick.ask,
                    Side::Sell => tick.bid,
                };
                (price, PositionStatus::Open, true)
            }
        };

        validate_stop_levels(request.side, entry_price, request.stop_loss, request.take_profit)?;

        let breakdown = self
            .compute_charges(
                request.account_id,
                &request.symbol,
                request.lots,
                leverage,
                entry_price,
                trading_costs,
            )
            .await;
        let total = breakdown.total_required();

        let position_id = Uuid::new_v4();

        // Balance read-modify-write serialized per account.
        let lock = self.store().account_lock(request.account_id).await;
        let guard = lock.lock().await;

        let balance = self.store().balance(request.account_id).await?;
        if balance < total {
            return Err(EngineError::InsufficientFunds {
                required: total,
                available: balance,
            });
        }

        let entry = self
            .store()
            .apply_ledger(
                request.account_id,
                LedgerEntryType::OrderOpen,
                -total,
                Some(position_id),
            )
            .await?;

        let position = Position {
            id: position_id,
            account_id: request.account_id,
            symbol: request.symbol.to_uppercase(),
            side: request.side,
            lots: request.lots,
            leverage,
            order_kind: kind,
            entry_price,
            stop_loss: request.stop_loss,
            take_profit: request.take_profit,
            margin: Some(breakdown.margin),
            fee: breakdown.fee,
            commission: breakdown.commission,
            spread_cost: breakdown.spread_cost,
            status,
            close_price: None,
            close_reason: None,
            profit: None,
            mirrored,
            master_position_id,
            opened_at: Utc::now(),
            activated_at: None,
            closed_at: None,
        };
        self.store().insert_position(position.clone()).await;
        drop(guard);

        info!(
            position = %position.id,
            account = %position.account_id,
            symbol = %position.symbol,
            side = position.side.as_str(),
            lots = %position.lots,
            status = ?position.status,
            total_charged = %total,
            "Order placed"
        );

        self.publish(EngineEvent::OrderExecuted {
            account_id: position.account_id,
            position: position.clone(),
            ledger: entry,
        });

        Ok(position)
    }

    /// Change SL/TP on an open position, re-validated against the current
    /// reference price. No funds move.
    pub async fn modify_position(
        &self,
        account_id: Uuid,
        position_id: Uuid,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) -> Result<Position> {
        let position = self.store().position(position_id).await?;
        if position.account_id != account_id {
            return Err(EngineError::NotFound(format!("position {position_id}")));
        }
        if position.status != PositionStatus::Open {
            return Err(EngineError::NotFound(format!(
                "position {position_id} is not open"
            )));
        }

        let tick = self
            .prices()
            .get(&position.symbol)
            .await
            .ok_or_else(|| EngineError::InstrumentUnavailable(position.symbol.clone()))?;
        let reference = match position.side {
            Side::Buy => tick.bid,
            Side::Sell => tick.ask,
        };
        validate_stop_levels(position.side, reference, stop_loss, take_profit)?;

        let updated = self
            .store()
            .update_position(position_id, |p| {
                p.stop_loss = stop_loss;
                p.take_profit = take_profit;
            })
            .await?;

        self.publish(EngineEvent::TradeModified {
            account_id,
            position: updated.clone(),
        });

        // A master's SL/TP change follows its mirrors (administrative
        // override, no re-validation against follower entries).
        if !updated.mirrored {
            self.propagate_sl_tp(position_id, stop_loss, take_profit).await;
        }

        Ok(updated)
    }

    /// Cancel a pending order and refund the reserved margin and fee.
    pub async fn cancel_pending(&self, account_id: Uuid, position_id: Uuid) -> Result<Position> {
        let position = self.store().position(position_id).await?;
        if position.account_id != account_id {
            return Err(EngineError::NotFound(format!("position {position_id}")));
        }

        let refund = position.margin.unwrap_or(Decimal::ZERO) + position.fee;

        let lock = self.store().account_lock(account_id).await;
        let guard = lock.lock().await;

        let cancelled = self
            .store()
            .transition_position(position_id, PositionStatus::Pending, |p| {
                p.status = PositionStatus::Cancelled;
                p.margin = None;
                p.closed_at = Some(Utc::now());
            })
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("position {position_id} is not pending"))
            })?;

        let entry = self
            .store()
            .apply_ledger(
                account_id,
                LedgerEntryType::OrderCancelRefund,
                refund,
                Some(position_id),
            )
            .await?;
        drop(guard);

        info!(position = %position_id, account = %account_id, refund = %refund, "Pending order cancelled");

        self.publish(EngineEvent::OrderCancelled {
            account_id,
            position: cancelled.clone(),
            ledger: entry,
        });

        Ok(cancelled)
    }

    /// Manually close one of the caller's open positions at market.
    pub async fn close_market(&self, account_id: Uuid, position_id: Uuid) -> Result<Position> {
        let position = self.store().position(position_id).await?;
        if position.account_id != account_id {
            return Err(EngineError::NotFound(format!("position {position_id}")));
        }
        if position.status == PositionStatus::Closed {
            // Idempotent: a second close returns the terminal state untouched.
            return Ok(position);
        }
        if position.status != PositionStatus::Open {
            return Err(EngineError::NotFound(format!(
                "position {position_id} is not open"
            )));
        }

        let tick = self
            .prices()
            .get(&position.symbol)
            .await
            .ok_or_else(|| EngineError::InstrumentUnavailable(position.symbol.clone()))?;
        let price = match position.side {
            Side::Buy => tick.bid,
            Side::Sell => tick.ask,
        };

        match self.close_position(position_id, price, CloseReason::Manual).await? {
            Some(closed) => Ok(closed),
            // Lost the close race after the status check; the terminal state
            // stands.
            None => self.store().position(position_id).await,
        }
    }

    /// Administrative close at market price, bypassing ownership checks.
    pub async fn close_admin(&self, position_id: Uuid) -> Result<Option<Position>> {
        let position = self.store().position(position_id).await?;
        let tick = self
            .prices()
            .get(&position.symbol)
            .await
            .ok_or_else(|| EngineError::InstrumentUnavailable(position.symbol.clone()))?;
        let price = match position.side {
            Side::Buy => tick.bid,
            Side::Sell => tick.ask,
        };
        self.close_position(position_id, price, CloseReason::Admin).await
    }

    /// Close a position at an explicit price and cascade to its mirrors.
    ///
    /// Returns `Ok(None)` when the position was already closed (idempotent).
    pub async fn close_position(
        &self,
        position_id: Uuid,
        close_price: Decimal,
        reason: CloseReason,
    ) -> Result<Option<Position>> {
        let closed = match self.settle_close(position_id, close_price, reason).await? {
            Some(closed) => closed,
            None => return Ok(None),
        };

        // Only a master position (not itself a mirror) drives a cascade.
        if !closed.mirrored {
            self.cascade_close(&closed).await;
        }
        Ok(Some(closed))
    }

    /// The shared close primitive: CAS to `closed`, credit margin plus PnL,
    /// ledger the settlement, notify, then settle commissions. Never
    /// cascades; callers wanting the mirror cascade use [`close_position`].
    pub(crate) async fn settle_close(
        &self,
        position_id: Uuid,
        close_price: Decimal,
        reason: CloseReason,
    ) -> Result<Option<Position>> {
        let snapshot = self.store().position(position_id).await?;
        let account_id = snapshot.account_id;

        let lock = self.store().account_lock(account_id).await;
        let guard = lock.lock().await;

        let now = Utc::now();
        let mut margin_released = Decimal::ZERO;
        let closed = self
            .store()
            .transition_position(position_id, PositionStatus::Open, |p| {
                let pnl = p.floating_pnl(close_price);
                margin_released = p.margin.take().unwrap_or(Decimal::ZERO);
                p.status = PositionStatus::Closed;
                p.close_price = Some(close_price);
                p.close_reason = Some(reason);
                p.profit = Some(pnl);
                p.closed_at = Some(now);
            })
            .await?;

        let Some(closed) = closed else {
            return Ok(None);
        };

        let credit = margin_released + closed.profit.unwrap_or(Decimal::ZERO);
        let entry = self
            .store()
            .apply_ledger(
                account_id,
                LedgerEntryType::PositionClose,
                credit,
                Some(position_id),
            )
            .await?;
        drop(guard);

        info!(
            position = %position_id,
            account = %account_id,
            reason = ?reason,
            close_price = %close_price,
            profit = %closed.profit.unwrap_or(dec!(0)),
            "Position closed"
        );

        self.publish(EngineEvent::TradeClosed {
            account_id,
            position: closed.clone(),
            ledger: entry,
        });

        // Commission settlement runs after the close has committed; it takes
        // its own account locks.
        self.settle_copy_commission(&closed).await;
        self.settle_referral_commission(&closed).await;
        if closed.mirrored {
            self.finalize_mirror_close(&closed).await;
        }

        Ok(Some(closed))
    }

    pub(crate) fn clamp_leverage(&self, requested: u32) -> u32 {
        requested.clamp(1, self.config().max_leverage)
    }

    fn validate_lots(&self, lots: Decimal) -> Result<()> {
        if lots < self.config().min_lot {
            return Err(EngineError::Validation(format!(
                "lot size {lots} is below the minimum {}",
                self.config().min_lot
            )));
        }
        Ok(())
    }
}

/// SL must sit strictly on the losing side and TP strictly on the winning
/// side of the reference price.
fn validate_stop_levels(
    side: Side,
    reference: Decimal,
    stop_loss: Option<Decimal>,
    take_profit: Option<Decimal>,
) -> Result<()> {
    if let Some(sl) = stop_loss {
        let valid = match side {
            Side::Buy => sl < reference,
            Side::Sell => sl > reference,
        };
        if !valid {
            return Err(EngineError::InvalidStopLevel(format!(
                "stop loss {sl} on the wrong side of {reference} for a {} position",
                side.as_str()
            )));
        }
    }
    if let Some(tp) = take_profit {
        let valid = match side {
            Side::Buy => tp > reference,
            Side::Sell => tp < reference,
        };
        if !valid {
            return Err(EngineError::InvalidStopLevel(format!(
                "take profit {tp} on the wrong side of {reference} for a {} position",
                side.as_str()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::{engine, funded_account, symbol_charges, tick};
    use crate::models::LedgerEntryType;

    fn request(account_id: Uuid, side: Side, lots: Decimal) -> OrderRequest {
        OrderRequest {
            account_id,
            symbol: "EURUSD".to_string(),
            side,
            lots,
            leverage: 100,
            stop_loss: None,
            take_profit: None,
        }
    }

    #[tokio::test]
    async fn test_market_order_charge_breakdown() {
        let engine = engine().await;
        let account = funded_account(&engine, dec!(2000)).await;
        tick(&engine, "EURUSD", dec!(1.10000), dec!(1.10010)).await;
        symbol_charges(&engine, "EURUSD", dec!(1.5), dec!(2)).await;

        let position = engine
            .place_market_order(request(account, Side::Buy, dec!(1)))
            .await
            .unwrap();

        // 1.10010 * 100000 / 100 = 1100.10
        assert_eq!(position.margin, Some(dec!(1100.10)));
        // 1.5 pips * 0.0001 * 100000 = 15.00
        assert_eq!(position.spread_cost, dec!(15.00));
        assert_eq!(position.commission, dec!(2.00));
        assert_eq!(position.status, PositionStatus::Open);

        // Margin conservation: balance dropped by exactly the total
        let balance = engine.store().balance(account).await.unwrap();
        assert_eq!(balance, dec!(2000) - dec!(1117.10));
    }

    #[tokio::test]
    async fn test_market_order_requires_price() {
        let engine = engine().await;
        let account = funded_account(&engine, dec!(2000)).await;

        let err = engine
            .place_market_order(request(account, Side::Buy, dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InstrumentUnavailable(_)));
    }

    #[tokio::test]
    async fn test_insufficient_funds_debits_nothing() {
        let engine = engine().await;
        let account = funded_account(&engine, dec!(100)).await;
        tick(&engine, "EURUSD", dec!(1.10000), dec!(1.10010)).await;

        let err = engine
            .place_market_order(request(account, Side::Buy, dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InsufficientFunds { .. }));

        assert_eq!(engine.store().balance(account).await.unwrap(), dec!(100));
        // Only the deposit entry exists
        assert_eq!(engine.store().ledger_for(account).await.len(), 1);
    }

    #[tokio::test]
    async fn test_stop_level_directionality() {
        let engine = engine().await;
        let account = funded_account(&engine, dec!(5000)).await;
        tick(&engine, "EURUSD", dec!(1.10000), dec!(1.10010)).await;

        // Long: SL at or above entry is rejected
        let mut bad_sl = request(account, Side::Buy, dec!(1));
        bad_sl.stop_loss = Some(dec!(1.10010));
        let err = engine.place_market_order(bad_sl).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidStopLevel(_)));

        // Long: TP at or below entry is rejected
        let mut bad_tp = request(account, Side::Buy, dec!(1));
        bad_tp.take_profit = Some(dec!(1.09000));
        let err = engine.place_market_order(bad_tp).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidStopLevel(_)));

        // Rejections never debited
        assert_eq!(engine.store().balance(account).await.unwrap(), dec!(5000));

        // Short: symmetric rule accepts SL above / TP below
        let mut good_short = request(account, Side::Sell, dec!(1));
        good_short.stop_loss = Some(dec!(1.10500));
        good_short.take_profit = Some(dec!(1.09500));
        assert!(engine.place_market_order(good_short).await.is_ok());
    }

    #[tokio::test]
    async fn test_pending_order_reserves_without_trading_costs() {
        let engine = engine().await;
        let account = funded_account(&engine, dec!(2000)).await;
        symbol_charges(&engine, "EURUSD", dec!(1.5), dec!(2)).await;

        let position = engine
            .place_pending_order(
                request(account, Side::Buy, dec!(1)),
                OrderKind::Limit,
                dec!(1.09000),
            )
            .await
            .unwrap();

        assert_eq!(position.status, PositionStatus::Pending);
        assert_eq!(engine.pending_positions().await.len(), 1);
        // 1.09 * 100000 / 100 = 1090, no spread/commission until activation
        assert_eq!(position.margin, Some(dec!(1090.00)));
        assert_eq!(position.commission, Decimal::ZERO);
        assert_eq!(position.spread_cost, Decimal::ZERO);

        let balance = engine.store().balance(account).await.unwrap();
        assert_eq!(balance, dec!(910.00));
    }

    #[tokio::test]
    async fn test_cancel_pending_refunds_reservation() {
        let engine = engine().await;
        let account = funded_account(&engine, dec!(2000)).await;

        let position = engine
            .place_pending_order(
                request(account, Side::Buy, dec!(1)),
                OrderKind::Limit,
                dec!(1.09000),
            )
            .await
            .unwrap();

        let cancelled = engine.cancel_pending(account, position.id).await.unwrap();
        assert_eq!(cancelled.status, PositionStatus::Cancelled);
        assert!(cancelled.margin.is_none());
        assert_eq!(engine.store().balance(account).await.unwrap(), dec!(2000));

        // Cancelling again is NotFound: the position is no longer pending
        let err = engine.cancel_pending(account, position.id).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_cancel_rejects_foreign_position() {
        let engine = engine().await;
        let owner = funded_account(&engine, dec!(2000)).await;
        let stranger = funded_account(&engine, dec!(2000)).await;

        let position = engine
            .place_pending_order(
                request(owner, Side::Buy, dec!(1)),
                OrderKind::Limit,
                dec!(1.09000),
            )
            .await
            .unwrap();

        let err = engine.cancel_pending(stranger, position.id).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_with_single_credit() {
        let engine = engine().await;
        let account = funded_account(&engine, dec!(2000)).await;
        tick(&engine, "EURUSD", dec!(1.10000), dec!(1.10010)).await;

        let position = engine
            .place_market_order(request(account, Side::Buy, dec!(1)))
            .await
            .unwrap();

        tick(&engine, "EURUSD", dec!(1.10100), dec!(1.10110)).await;

        let first = engine.close_market(account, position.id).await.unwrap();
        assert_eq!(first.status, PositionStatus::Closed);
        // (1.10100 - 1.10010) * 100000 = 90
        assert_eq!(first.profit, Some(dec!(90.00)));

        let balance_after_first = engine.store().balance(account).await.unwrap();

        let second = engine.close_market(account, position.id).await.unwrap();
        assert_eq!(second.status, PositionStatus::Closed);
        assert_eq!(second.profit, first.profit);
        assert_eq!(
            engine.store().balance(account).await.unwrap(),
            balance_after_first
        );

        let credits = engine
            .store()
            .ledger_for(account)
            .await
            .into_iter()
            .filter(|e| e.entry_type == LedgerEntryType::PositionClose)
            .count();
        assert_eq!(credits, 1);
    }

    #[tokio::test]
    async fn test_close_market_rejects_non_open_position() {
        let engine = engine().await;
        let account = funded_account(&engine, dec!(2000)).await;
        tick(&engine, "EURUSD", dec!(1.10000), dec!(1.10010)).await;

        let pending = engine
            .place_pending_order(
                request(account, Side::Buy, dec!(1)),
                OrderKind::Limit,
                dec!(1.09000),
            )
            .await
            .unwrap();

        // A pending position cannot be market-closed
        let err = engine.close_market(account, pending.id).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));

        let unchanged = engine.store().position(pending.id).await.unwrap();
        assert_eq!(unchanged.status, PositionStatus::Pending);
        assert_eq!(engine.store().balance(account).await.unwrap(), dec!(910.00));

        // Same for a cancelled one
        engine.cancel_pending(account, pending.id).await.unwrap();
        let err = engine.close_market(account, pending.id).await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_admin_close_bypasses_ownership() {
        let engine = engine().await;
        let account = funded_account(&engine, dec!(2000)).await;
        tick(&engine, "EURUSD", dec!(1.10000), dec!(1.10010)).await;

        let position = engine
            .place_market_order(request(account, Side::Buy, dec!(1)))
            .await
            .unwrap();

        let closed = engine.close_admin(position.id).await.unwrap().unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert_eq!(closed.close_reason, Some(CloseReason::Admin));

        // A second admin close is a no-op
        assert!(engine.close_admin(position.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_modify_validates_against_current_price() {
        let engine = engine().await;
        let account = funded_account(&engine, dec!(2000)).await;
        tick(&engine, "EURUSD", dec!(1.10000), dec!(1.10010)).await;

        let position = engine
            .place_market_order(request(account, Side::Buy, dec!(1)))
            .await
            .unwrap();

        let err = engine
            .modify_position(account, position.id, Some(dec!(1.20000)), None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidStopLevel(_)));

        let updated = engine
            .modify_position(account, position.id, Some(dec!(1.09000)), Some(dec!(1.12000)))
            .await
            .unwrap();
        assert_eq!(updated.stop_loss, Some(dec!(1.09000)));
        assert_eq!(updated.take_profit, Some(dec!(1.12000)));
    }

    #[tokio::test]
    async fn test_fee_clamped_to_schedule_bounds() {
        use crate::charges::{ChargeRecord, ChargeScope};

        let engine = engine().await;
        let account = funded_account(&engine, dec!(2000)).await;
        tick(&engine, "EURUSD", dec!(1.10000), dec!(1.10010)).await;

        let schedule = |fee_percentage| ChargeRecord {
            scope: ChargeScope::Symbol("EURUSD".to_string()),
            spread_pips: Decimal::ZERO,
            commission_per_lot: Decimal::ZERO,
            fee_percentage,
            min_fee: dec!(5),
            max_fee: dec!(10),
        };

        // 1100.10 * 0.001 = 1.10, lifted to the 5.00 floor
        engine.charges().upsert(schedule(dec!(0.001))).await;
        let breakdown = engine
            .estimate_order(account, "EURUSD", Side::Buy, dec!(1), 100, None)
            .await
            .unwrap();
        assert_eq!(breakdown.fee, dec!(5));

        // 1100.10 * 0.05 = 55.01, capped at the 10.00 ceiling
        engine.charges().upsert(schedule(dec!(0.05))).await;
        let breakdown = engine
            .estimate_order(account, "EURUSD", Side::Buy, dec!(1), 100, None)
            .await
            .unwrap();
        assert_eq!(breakdown.fee, dec!(10));
    }

    #[tokio::test]
    async fn test_leverage_clamped_to_platform_maximum() {
        let engine = engine().await;
        let account = funded_account(&engine, dec!(100000)).await;
        tick(&engine, "EURUSD", dec!(1.10000), dec!(1.10010)).await;

        let mut req = request(account, Side::Buy, dec!(1));
        req.leverage = 100000;
        let position = engine.place_market_order(req).await.unwrap();
        assert_eq!(position.leverage, 500);
    }
}
