//! Copy-trade mirror engine: follower sizing, risk caps, cascade close and
//! SL/TP propagation.
//!
//! Follower failures are recorded on the link and never abort processing of
//! other followers or surface to the master.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::events::EngineEvent;
use crate::models::{
    CloseReason, CopyLink, CopyMap, LinkStatus, MasterProfile, Position, PositionStatus,
    SizingMode,
};

use super::{Engine, OrderRequest};

impl Engine {
    /// Mirror a freshly executed master position onto every active follower.
    /// No-op unless the owner has an approved master profile.
    pub(crate) async fn mirror_master_execution(&self, master_position: &Position) {
        if master_position.mirrored {
            return;
        }
        let Some(profile) = self.store().master(master_position.account_id).await else {
            return;
        };
        if !profile.approved {
            return;
        }

        let master_equity = match self.equity(profile.account_id).await {
            Ok(equity) => equity,
            Err(e) => {
                warn!(master = %profile.account_id, error = %e, "Master equity unavailable, skipping mirror");
                return;
            }
        };

        let links = self.store().links_for_master(profile.account_id).await;
        let mut copied = 0u64;

        for link in links {
            if link.status != LinkStatus::Active {
                continue;
            }
            match self
                .mirror_to_follower(&link, &profile, master_position, master_equity)
                .await
            {
                Ok(true) => copied += 1,
                Ok(false) => {}
                Err(e) => {
                    // Recorded per follower; the master's trade is unaffected.
                    warn!(link = %link.id, follower = %link.follower_id, error = %e, "Copy failed");
                    let _ = self
                        .store()
                        .update_link(link.id, |l| l.failure_count += 1)
                        .await;
                }
            }
        }

        if copied > 0 {
            let _ = self
                .store()
                .update_master(profile.account_id, |p| p.copied_count += copied)
                .await;
        }
    }

    /// Mirror one master position to one follower. `Ok(false)` means the
    /// copy was skipped or rejected (risk cap, tiny lot, no funds) and the
    /// outcome recorded; `Err` is an unexpected fault.
    async fn mirror_to_follower(
        &self,
        link: &CopyLink,
        profile: &MasterProfile,
        master_position: &Position,
        master_equity: Decimal,
    ) -> Result<bool> {
        let today = Utc::now().date_naive();
        let link = self
            .store()
            .update_link(link.id, |l| l.roll_daily_anchor(today))
            .await?;

        let follower_equity = self.equity(link.follower_id).await?;

        // Risk caps pause the link unilaterally.
        if let Some(reason) = breached_cap(&link, follower_equity) {
            warn!(link = %link.id, follower = %link.follower_id, reason = %reason, "Risk cap breached, pausing link");
            self.pause_link(link.id, &reason).await?;
            return Ok(false);
        }

        // Track the peak for future drawdown checks.
        self.store()
            .update_link(link.id, |l| {
                if follower_equity > l.peak_equity {
                    l.peak_equity = follower_equity;
                }
            })
            .await?;

        let lots = follower_lots(
            &link.mode,
            master_position.lots,
            follower_equity,
            master_equity,
        )
        .min(link.max_lot)
        .round_dp(2);

        if lots < self.config().min_lot {
            self.store()
                .update_link(link.id, |l| {
                    l.copied_count += 1;
                    l.failure_count += 1;
                })
                .await?;
            info!(link = %link.id, lots = %lots, "Copy rejected, lot below minimum");
            return Ok(false);
        }

        let request = OrderRequest {
            account_id: link.follower_id,
            symbol: master_position.symbol.clone(),
            side: master_position.side,
            lots,
            leverage: master_position.leverage,
            stop_loss: master_position.stop_loss,
            take_profit: master_position.take_profit,
        };

        let follower_position = match self
            .open_order(&request, master_position.order_kind, None, true, Some(master_position.id))
            .await
        {
            Ok(position) => position,
            Err(EngineError::InsufficientFunds { required, available }) => {
                self.store()
                    .update_link(link.id, |l| {
                        l.copied_count += 1;
                        l.failure_count += 1;
                    })
                    .await?;
                info!(
                    link = %link.id,
                    follower = %link.follower_id,
                    required = %required,
                    available = %available,
                    "Copy rejected, insufficient follower funds"
                );
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        let delay_ms = (Utc::now() - master_position.opened_at)
            .num_milliseconds()
            .max(0);

        let map = CopyMap {
            id: Uuid::new_v4(),
            link_id: link.id,
            master_id: link.master_id,
            follower_id: link.follower_id,
            master_position_id: master_position.id,
            follower_position_id: follower_position.id,
            master_lot: master_position.lots,
            follower_lot: lots,
            mode: link.mode,
            entry_price: follower_position.entry_price,
            status: follower_position.status,
            commission: Decimal::ZERO,
            commission_paid: false,
            execution_delay_ms: delay_ms,
            created_at: Utc::now(),
            closed_at: None,
        };
        self.store().insert_map(map).await;

        self.store()
            .update_link(link.id, |l| {
                l.copied_count += 1;
                l.success_count += 1;
            })
            .await?;

        info!(
            link = %link.id,
            master = %profile.account_id,
            follower = %link.follower_id,
            lots = %lots,
            delay_ms,
            "Trade copied"
        );

        self.publish(EngineEvent::TradeCopied {
            master_id: link.master_id,
            follower_id: link.follower_id,
            position: follower_position,
        });

        Ok(true)
    }

    /// Cascade a master close onto every open mirrored follower position,
    /// settling each at the master's close price.
    pub(crate) async fn cascade_close(&self, master_position: &Position) {
        let Some(close_price) = master_position.close_price else {
            return;
        };

        let followers = self.store().mirrored_positions_of(master_position.id).await;
        for follower_position in followers {
            match self
                .settle_close(follower_position.id, close_price, CloseReason::MasterClosed)
                .await
            {
                Ok(_) => {}
                Err(e) => {
                    warn!(position = %follower_position.id, error = %e, "Cascade close failed")
                }
            }
        }
    }

    /// Bring map status and link PnL stats in line with a closed mirrored
    /// position. Runs from the shared close primitive, so cascades and
    /// follower-side SL/TP closes are covered alike.
    pub(crate) async fn finalize_mirror_close(&self, follower_position: &Position) {
        let Some(map) = self
            .store()
            .map_for_follower_position(follower_position.id)
            .await
        else {
            return;
        };

        let profit = follower_position.profit.unwrap_or(Decimal::ZERO);
        let _ = self
            .store()
            .update_map(map.id, |m| {
                m.status = PositionStatus::Closed;
                m.closed_at = follower_position.closed_at;
            })
            .await;
        let _ = self
            .store()
            .update_link(map.link_id, |l| {
                l.total_pnl += profit;
                if profit < Decimal::ZERO {
                    l.daily_loss += -profit;
                }
            })
            .await;
    }

    /// Push a master's new SL/TP onto every open mirrored position without
    /// re-validating against the follower's own entry price.
    pub(crate) async fn propagate_sl_tp(
        &self,
        master_position_id: Uuid,
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
    ) {
        let mirrors = self.store().mirrored_positions_of(master_position_id).await;
        for mirror in mirrors {
            match self
                .store()
                .update_position(mirror.id, |p| {
                    p.stop_loss = stop_loss;
                    p.take_profit = take_profit;
                })
                .await
            {
                Ok(updated) => {
                    self.publish(EngineEvent::TradeModified {
                        account_id: updated.account_id,
                        position: updated,
                    });
                }
                Err(e) => warn!(position = %mirror.id, error = %e, "SL/TP propagation failed"),
            }
        }
    }
}

/// Follower lot size before the max-lot clamp and rounding.
fn follower_lots(
    mode: &SizingMode,
    master_lots: Decimal,
    follower_equity: Decimal,
    master_equity: Decimal,
) -> Decimal {
    match mode {
        SizingMode::FixedLot(lots) => *lots,
        SizingMode::Multiplier(factor) => master_lots * factor,
        SizingMode::BalanceRatio => {
            if master_equity > Decimal::ZERO {
                follower_equity / master_equity * master_lots
            } else {
                Decimal::ZERO
            }
        }
    }
}

/// First risk cap the link currently violates, if any.
fn breached_cap(link: &CopyLink, follower_equity: Decimal) -> Option<String> {
    if link.max_daily_loss_pct > Decimal::ZERO
        && link.daily_loss > Decimal::ZERO
        && follower_equity > Decimal::ZERO
    {
        let loss_pct = link.daily_loss / (follower_equity + link.daily_loss) * dec!(100);
        if loss_pct >= link.max_daily_loss_pct {
            return Some(format!("daily loss {}% reached cap", loss_pct.round_dp(2)));
        }
    }
    if link.max_drawdown_pct > Decimal::ZERO && link.peak_equity > Decimal::ZERO {
        let drawdown_pct =
            (link.peak_equity - follower_equity).max(Decimal::ZERO) / link.peak_equity * dec!(100);
        if drawdown_pct >= link.max_drawdown_pct {
            return Some(format!(
                "drawdown {}% reached cap",
                drawdown_pct.round_dp(2)
            ));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_support::{engine, funded_account, tick};
    use crate::models::{CommissionModel, Side};

    async fn approved_master(engine: &Engine, balance: Decimal) -> Uuid {
        let master = funded_account(engine, balance).await;
        engine
            .register_master(master, CommissionModel::PerLot(dec!(1)))
            .await
            .unwrap();
        engine.approve_master(master).await.unwrap();
        master
    }

    fn market(account_id: Uuid, lots: Decimal) -> OrderRequest {
        OrderRequest {
            account_id,
            symbol: "EURUSD".to_string(),
            side: Side::Buy,
            lots,
            leverage: 100,
            stop_loss: None,
            take_profit: None,
        }
    }

    #[tokio::test]
    async fn test_multiplier_sizing_and_rounding() {
        let engine = engine().await;
        tick(&engine, "EURUSD", dec!(1.10000), dec!(1.10010)).await;

        let master = approved_master(&engine, dec!(10000)).await;
        let follower = funded_account(&engine, dec!(5000)).await;
        let link = engine
            .create_link(master, follower, SizingMode::Multiplier(dec!(0.5)))
            .await
            .unwrap();

        engine.place_market_order(market(master, dec!(1))).await.unwrap();

        let follower_open = engine.store().open_positions_for(follower).await;
        assert_eq!(follower_open.len(), 1);
        assert_eq!(follower_open[0].lots, dec!(0.50));
        assert!(follower_open[0].mirrored);

        let link = engine.store().link(link.id).await.unwrap();
        assert_eq!(link.success_count, 1);
        assert_eq!(link.failure_count, 0);
    }

    #[tokio::test]
    async fn test_balance_ratio_sizing_scales_by_equity() {
        let engine = engine().await;
        tick(&engine, "EURUSD", dec!(1.10000), dec!(1.10010)).await;

        let master = approved_master(&engine, dec!(10000)).await;
        let follower = funded_account(&engine, dec!(5000)).await;
        engine
            .create_link(master, follower, SizingMode::BalanceRatio)
            .await
            .unwrap();

        engine.place_market_order(market(master, dec!(1))).await.unwrap();

        // Master equity after the open is 9990.00 (10 of floating spread
        // loss), so 5000 / 9990 * 1 rounds to 0.50
        let follower_open = engine.store().open_positions_for(follower).await;
        assert_eq!(follower_open.len(), 1);
        assert_eq!(follower_open[0].lots, dec!(0.50));
    }

    #[tokio::test]
    async fn test_tiny_lot_is_failed_copy_not_error() {
        let engine = engine().await;
        tick(&engine, "EURUSD", dec!(1.10000), dec!(1.10010)).await;

        let master = approved_master(&engine, dec!(10000)).await;
        let follower = funded_account(&engine, dec!(5000)).await;
        let link = engine
            .create_link(master, follower, SizingMode::Multiplier(dec!(0.001)))
            .await
            .unwrap();

        // 0.01 * 0.001 rounds below the 0.01 minimum
        engine
            .place_market_order(market(master, dec!(0.01)))
            .await
            .unwrap();

        assert!(engine.store().open_positions_for(follower).await.is_empty());
        let link = engine.store().link(link.id).await.unwrap();
        assert_eq!(link.failure_count, 1);
        assert_eq!(link.status, LinkStatus::Active);
    }

    #[tokio::test]
    async fn test_insufficient_follower_funds_recorded() {
        let engine = engine().await;
        tick(&engine, "EURUSD", dec!(1.10000), dec!(1.10010)).await;

        let master = approved_master(&engine, dec!(10000)).await;
        let follower = funded_account(&engine, dec!(50)).await;
        let link = engine
            .create_link(master, follower, SizingMode::FixedLot(dec!(1)))
            .await
            .unwrap();

        let master_position = engine
            .place_market_order(market(master, dec!(1)))
            .await
            .unwrap();
        assert_eq!(master_position.status, PositionStatus::Open);

        let link = engine.store().link(link.id).await.unwrap();
        assert_eq!(link.failure_count, 1);
        assert_eq!(engine.store().balance(follower).await.unwrap(), dec!(50));
    }

    #[tokio::test]
    async fn test_unapproved_master_is_not_mirrored() {
        let engine = engine().await;
        tick(&engine, "EURUSD", dec!(1.10000), dec!(1.10010)).await;

        let master = funded_account(&engine, dec!(10000)).await;
        engine
            .register_master(master, CommissionModel::Subscription)
            .await
            .unwrap();
        let follower = funded_account(&engine, dec!(5000)).await;
        engine
            .create_link(master, follower, SizingMode::FixedLot(dec!(0.1)))
            .await
            .unwrap();

        engine.place_market_order(market(master, dec!(1))).await.unwrap();
        assert!(engine.store().open_positions_for(follower).await.is_empty());
    }

    #[tokio::test]
    async fn test_cascade_closes_followers_at_master_price() {
        let engine = engine().await;
        tick(&engine, "EURUSD", dec!(1.10000), dec!(1.10010)).await;

        let master = approved_master(&engine, dec!(10000)).await;
        let follower_a = funded_account(&engine, dec!(5000)).await;
        let follower_b = funded_account(&engine, dec!(5000)).await;
        engine
            .create_link(master, follower_a, SizingMode::Multiplier(dec!(0.5)))
            .await
            .unwrap();
        engine
            .create_link(master, follower_b, SizingMode::FixedLot(dec!(0.2)))
            .await
            .unwrap();

        let master_position = engine
            .place_market_order(market(master, dec!(1)))
            .await
            .unwrap();

        // Market moves, then the master closes manually at bid 1.10200
        tick(&engine, "EURUSD", dec!(1.10200), dec!(1.10210)).await;
        engine.close_market(master, master_position.id).await.unwrap();

        for follower in [follower_a, follower_b] {
            assert!(engine.store().open_positions_for(follower).await.is_empty());
        }

        let closed = engine
            .store()
            .positions_with_status(PositionStatus::Closed)
            .await;
        let follower_closes: Vec<_> = closed.iter().filter(|p| p.mirrored).collect();
        assert_eq!(follower_closes.len(), 2);
        for position in follower_closes {
            // Settled at the master's close price, not a fresh market read
            assert_eq!(position.close_price, Some(dec!(1.10200)));
            assert_eq!(position.close_reason, Some(CloseReason::MasterClosed));
        }
    }

    #[tokio::test]
    async fn test_sl_tp_propagates_to_mirrors() {
        let engine = engine().await;
        tick(&engine, "EURUSD", dec!(1.10000), dec!(1.10010)).await;

        let master = approved_master(&engine, dec!(10000)).await;
        let follower = funded_account(&engine, dec!(5000)).await;
        engine
            .create_link(master, follower, SizingMode::Multiplier(dec!(0.5)))
            .await
            .unwrap();

        let master_position = engine
            .place_market_order(market(master, dec!(1)))
            .await
            .unwrap();

        engine
            .modify_position(master, master_position.id, Some(dec!(1.09000)), Some(dec!(1.12000)))
            .await
            .unwrap();

        let mirror = &engine.store().open_positions_for(follower).await[0];
        assert_eq!(mirror.stop_loss, Some(dec!(1.09000)));
        assert_eq!(mirror.take_profit, Some(dec!(1.12000)));
    }

    #[tokio::test]
    async fn test_daily_loss_resets_on_new_day() {
        let engine = engine().await;
        tick(&engine, "EURUSD", dec!(1.10000), dec!(1.10010)).await;

        let master = approved_master(&engine, dec!(10000)).await;
        let follower = funded_account(&engine, dec!(5000)).await;
        let link = engine
            .create_link(master, follower, SizingMode::FixedLot(dec!(0.1)))
            .await
            .unwrap();

        // Losses booked yesterday must not count against today's cap
        engine
            .store()
            .update_link(link.id, |l| {
                l.daily_loss = dec!(2000);
                l.daily_anchor = Utc::now().date_naive() - chrono::Days::new(1);
            })
            .await
            .unwrap();

        engine.place_market_order(market(master, dec!(1))).await.unwrap();

        let link = engine.store().link(link.id).await.unwrap();
        assert_eq!(link.status, LinkStatus::Active);
        assert_eq!(link.daily_loss, Decimal::ZERO);
        assert_eq!(engine.store().open_positions_for(follower).await.len(), 1);
    }

    #[tokio::test]
    async fn test_daily_loss_cap_pauses_link() {
        let engine = engine().await;
        tick(&engine, "EURUSD", dec!(1.10000), dec!(1.10010)).await;

        let master = approved_master(&engine, dec!(10000)).await;
        let follower = funded_account(&engine, dec!(5000)).await;
        let link = engine
            .create_link(master, follower, SizingMode::FixedLot(dec!(0.1)))
            .await
            .unwrap();

        // Simulate heavy losses already booked today
        engine
            .store()
            .update_link(link.id, |l| l.daily_loss = dec!(2000))
            .await
            .unwrap();

        engine.place_market_order(market(master, dec!(1))).await.unwrap();

        let link = engine.store().link(link.id).await.unwrap();
        assert_eq!(link.status, LinkStatus::Paused);
        assert!(link.pause_reason.is_some());
        assert!(engine.store().open_positions_for(follower).await.is_empty());
    }
}
