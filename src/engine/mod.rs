//! The trading engine: execution, monitoring, mirroring and commissions.
//!
//! `Engine` is the single logical owner of balances and position state. The
//! price cache and charge resolver are injected and shared by reference;
//! nothing in here reaches for global mutable state.

mod commission;
mod execution;
mod mirror;
mod monitor;

pub use execution::{ChargeBreakdown, OrderRequest};
pub use monitor::PositionMonitor;

use std::sync::Arc;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::info;
use uuid::Uuid;

use crate::charges::ChargeResolver;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{EngineEvent, Outbox};
use crate::models::{
    Account, CommissionModel, CopyLink, LedgerEntry, LedgerEntryType, LinkStatus, MasterProfile,
    Position, PositionStatus, ReferralRelationship, Side, SizingMode,
};
use crate::pricing::{PriceCache, PriceTick};
use crate::store::Store;

/// Per-account risk snapshot used by the monitor and the query surface.
#[derive(Debug, Clone)]
pub struct AccountRisk {
    pub balance: Decimal,
    pub floating_pnl: Decimal,
    pub equity: Decimal,
    pub margin_reserved: Decimal,
    /// None when no margin is reserved (treated as safe)
    pub margin_level: Option<Decimal>,
    /// True when every open position had a live quote this computation
    pub fully_priced: bool,
}

pub struct Engine {
    config: EngineConfig,
    store: Arc<Store>,
    prices: Arc<PriceCache>,
    charges: Arc<ChargeResolver>,
    outbox: Outbox,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<Store>,
        prices: Arc<PriceCache>,
        charges: Arc<ChargeResolver>,
        outbox: Outbox,
    ) -> Self {
        Self {
            config,
            store,
            prices,
            charges,
            outbox,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn prices(&self) -> &Arc<PriceCache> {
        &self.prices
    }

    pub fn charges(&self) -> &Arc<ChargeResolver> {
        &self.charges
    }

    // ==================== Accounts ====================

    /// Create a trading account with a zero balance.
    pub async fn open_account(&self) -> Account {
        let account = Account::new(Uuid::new_v4());
        self.store.insert_account(account.clone()).await;
        info!(account = %account.id, "Account opened");
        account
    }

    /// Credit a deposit. Fires the one-time referral first-deposit commission
    /// when the depositor was referred and it has not fired before.
    pub async fn deposit(&self, account_id: Uuid, amount: Decimal) -> Result<LedgerEntry> {
        if amount <= Decimal::ZERO {
            return Err(EngineError::Validation(format!(
                "deposit amount must be positive, got {amount}"
            )));
        }

        let lock = self.store.account_lock(account_id).await;
        let guard = lock.lock().await;
        let entry = self
            .store
            .apply_ledger(account_id, LedgerEntryType::Deposit, amount.round_dp(2), None)
            .await?;
        drop(guard);

        self.process_first_deposit(account_id, amount, entry.id).await;
        Ok(entry)
    }

    // ==================== Queries ====================

    pub async fn quote(&self, symbol: &str) -> Option<PriceTick> {
        self.prices.get(symbol).await
    }

    pub async fn open_positions(&self, account_id: Uuid) -> Vec<Position> {
        self.store.open_positions_for(account_id).await
    }

    pub async fn pending_positions(&self) -> Vec<Position> {
        self.store
            .positions_with_status(PositionStatus::Pending)
            .await
    }

    /// Floating PnL, equity and margin level for one account. Positions
    /// without a live quote contribute no PnL and clear `fully_priced`.
    pub async fn account_risk(&self, account_id: Uuid) -> Result<AccountRisk> {
        let balance = self.store.balance(account_id).await?;
        let positions = self.store.open_positions_for(account_id).await;
        self.risk_for(balance, &positions).await
    }

    /// Risk computed over a pre-fetched position batch, letting the monitor
    /// load each account's positions once per cycle.
    pub(crate) async fn risk_for(
        &self,
        balance: Decimal,
        positions: &[Position],
    ) -> Result<AccountRisk> {
        let mut floating = Decimal::ZERO;
        let mut margin = Decimal::ZERO;
        let mut fully_priced = true;

        for position in positions {
            margin += position.margin.unwrap_or(Decimal::ZERO);
            match self.prices.get(&position.symbol).await {
                Some(tick) => {
                    let reference = match position.side {
                        Side::Buy => tick.bid,
                        Side::Sell => tick.ask,
                    };
                    floating += position.floating_pnl(reference);
                }
                None => fully_priced = false,
            }
        }

        // Balance holds free cash only (margin was debited at open), so the
        // account's true worth adds the reserved margin back before PnL.
        let equity = balance + margin + floating;
        let margin_level = if margin > Decimal::ZERO {
            Some((equity / margin * dec!(100)).round_dp(2))
        } else {
            None
        };

        Ok(AccountRisk {
            balance,
            floating_pnl: floating,
            equity,
            margin_reserved: margin,
            margin_level,
            fully_priced,
        })
    }

    /// Equity = balance + reserved margin + floating PnL.
    pub async fn equity(&self, account_id: Uuid) -> Result<Decimal> {
        Ok(self.account_risk(account_id).await?.equity)
    }

    // ==================== Copy-trade administration ====================

    /// Register a copy-trade master profile (starts unapproved).
    pub async fn register_master(
        &self,
        account_id: Uuid,
        commission_model: CommissionModel,
    ) -> Result<MasterProfile> {
        self.store.account(account_id).await?;
        let profile = MasterProfile::new(account_id, commission_model);
        self.store.insert_master(profile.clone()).await;
        Ok(profile)
    }

    pub async fn approve_master(&self, account_id: Uuid) -> Result<MasterProfile> {
        self.store
            .update_master(account_id, |p| p.approved = true)
            .await
    }

    /// Subscribe a follower to a master.
    pub async fn create_link(
        &self,
        master_id: Uuid,
        follower_id: Uuid,
        mode: SizingMode,
    ) -> Result<CopyLink> {
        if master_id == follower_id {
            return Err(EngineError::Validation(
                "cannot follow your own account".to_string(),
            ));
        }
        self.store.account(follower_id).await?;
        self.store
            .master(master_id)
            .await
            .ok_or_else(|| EngineError::NotFound(format!("master profile {master_id}")))?;

        let link = CopyLink::new(master_id, follower_id, mode);
        self.store.insert_link(link.clone()).await;
        info!(link = %link.id, master = %master_id, follower = %follower_id, "Copy link created");
        Ok(link)
    }

    pub async fn pause_link(&self, link_id: Uuid, reason: &str) -> Result<CopyLink> {
        self.store
            .update_link(link_id, |l| {
                l.status = LinkStatus::Paused;
                l.pause_reason = Some(reason.to_string());
            })
            .await
    }

    pub async fn resume_link(&self, link_id: Uuid) -> Result<CopyLink> {
        self.store
            .update_link(link_id, |l| {
                l.status = LinkStatus::Active;
                l.pause_reason = None;
            })
            .await
    }

    // ==================== Referral administration ====================

    /// Record that `referred` was introduced by `referrer`.
    pub async fn add_referral(
        &self,
        referrer_id: Uuid,
        referred_id: Uuid,
    ) -> Result<ReferralRelationship> {
        if referrer_id == referred_id {
            return Err(EngineError::Validation(
                "cannot refer your own account".to_string(),
            ));
        }
        if self.store.referral_for_user(referred_id).await.is_some() {
            return Err(EngineError::Validation(format!(
                "user {referred_id} already has a referrer"
            )));
        }
        let relationship = ReferralRelationship::new(referrer_id, referred_id);
        self.store.insert_referral(relationship.clone()).await;
        Ok(relationship)
    }

    pub(crate) fn publish(&self, event: EngineEvent) {
        self.outbox.publish(event);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::charges::{ChargeRecord, ChargeScope};
    use crate::events::{LogSink, Outbox};

    /// Engine wired with in-memory collaborators for tests.
    pub async fn engine() -> Arc<Engine> {
        let store = Arc::new(Store::new());
        let prices = Arc::new(PriceCache::new());
        let charges = Arc::new(ChargeResolver::new());
        let outbox = Outbox::spawn(Box::new(LogSink));
        Arc::new(Engine::new(
            EngineConfig::default(),
            store,
            prices,
            charges,
            outbox,
        ))
    }

    /// Funded account helper.
    pub async fn funded_account(engine: &Engine, amount: Decimal) -> Uuid {
        let account = engine.open_account().await;
        engine.deposit(account.id, amount).await.unwrap();
        account.id
    }

    /// Push one tick into the cache.
    pub async fn tick(engine: &Engine, symbol: &str, bid: Decimal, ask: Decimal) {
        engine
            .prices()
            .update(PriceTick {
                symbol: symbol.to_string(),
                bid,
                ask,
                timestamp: chrono::Utc::now(),
            })
            .await;
    }

    /// Install a symbol-scope charge record.
    pub async fn symbol_charges(
        engine: &Engine,
        symbol: &str,
        spread_pips: Decimal,
        commission_per_lot: Decimal,
    ) {
        engine
            .charges()
            .upsert(ChargeRecord {
                scope: ChargeScope::Symbol(symbol.to_string()),
                spread_pips,
                commission_per_lot,
                fee_percentage: Decimal::ZERO,
                min_fee: Decimal::ZERO,
                max_fee: Decimal::ZERO,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_deposit_requires_positive_amount() {
        let engine = test_support::engine().await;
        let account = engine.open_account().await;

        let err = engine.deposit(account.id, dec!(-5)).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert_eq!(engine.store().balance(account.id).await.unwrap(), dec!(0));
    }

    #[tokio::test]
    async fn test_account_risk_without_positions_is_safe() {
        let engine = test_support::engine().await;
        let account = test_support::funded_account(&engine, dec!(500)).await;

        let risk = engine.account_risk(account).await.unwrap();
        assert_eq!(risk.equity, dec!(500));
        assert!(risk.margin_level.is_none());
        assert!(risk.fully_priced);
    }

    #[tokio::test]
    async fn test_quote_surfaces_cached_tick() {
        let engine = test_support::engine().await;
        assert!(engine.quote("EURUSD").await.is_none());

        test_support::tick(&engine, "EURUSD", dec!(1.1000), dec!(1.1001)).await;
        let quote = engine.quote("eurusd").await.unwrap();
        assert_eq!(quote.ask, dec!(1.1001));
    }

    #[tokio::test]
    async fn test_pause_and_resume_link() {
        let engine = test_support::engine().await;
        let master = test_support::funded_account(&engine, dec!(1000)).await;
        let follower = test_support::funded_account(&engine, dec!(1000)).await;
        engine
            .register_master(master, CommissionModel::Subscription)
            .await
            .unwrap();
        let link = engine
            .create_link(master, follower, SizingMode::BalanceRatio)
            .await
            .unwrap();

        let paused = engine.pause_link(link.id, "manual pause").await.unwrap();
        assert_eq!(paused.status, LinkStatus::Paused);
        assert_eq!(paused.pause_reason.as_deref(), Some("manual pause"));

        let resumed = engine.resume_link(link.id).await.unwrap();
        assert_eq!(resumed.status, LinkStatus::Active);
        assert!(resumed.pause_reason.is_none());
    }

    #[tokio::test]
    async fn test_self_links_rejected() {
        let engine = test_support::engine().await;
        let account = test_support::funded_account(&engine, dec!(1000)).await;
        engine
            .register_master(account, CommissionModel::Subscription)
            .await
            .unwrap();

        let err = engine
            .create_link(account, account, SizingMode::BalanceRatio)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let err = engine.add_referral(account, account).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }
}
