//! Commission engines: copy-trade commission to masters and referral
//! (introducing-broker) commission to partners.
//!
//! Both run after a close has committed and take their own account locks;
//! a commission failure is logged, never rolled back into the close.

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{info, warn};
use uuid::Uuid;

use crate::events::EngineEvent;
use crate::models::{
    CommissionKind, CommissionLog, CommissionModel, CommissionStatus, LedgerEntryType, Position,
};

use super::Engine;

impl Engine {
    /// Charge the follower and credit the master for a closed mirrored
    /// position. No-op for non-mirrored positions or subscription masters.
    pub(crate) async fn settle_copy_commission(&self, follower_position: &Position) {
        if !follower_position.mirrored {
            return;
        }
        let Some(map) = self
            .store()
            .map_for_follower_position(follower_position.id)
            .await
        else {
            return;
        };
        let Some(profile) = self.store().master(map.master_id).await else {
            return;
        };

        let profit = follower_position.profit.unwrap_or(Decimal::ZERO);
        let (rate, amount) = match profile.commission_model {
            CommissionModel::ProfitShare(pct) => {
                // A losing follower trade pays nothing
                (pct, (profit.max(Decimal::ZERO) * pct / dec!(100)).round_dp(2))
            }
            CommissionModel::PerLot(per_lot) => {
                (per_lot, (per_lot * follower_position.lots).round_dp(2))
            }
            // Billed out-of-band
            CommissionModel::Subscription => return,
        };

        if amount <= Decimal::ZERO {
            return;
        }

        let follower_lock = self.store().account_lock(map.follower_id).await;
        let guard = follower_lock.lock().await;
        let debit = self
            .store()
            .apply_ledger(
                map.follower_id,
                LedgerEntryType::CopyCommissionDebit,
                -amount,
                Some(map.id),
            )
            .await;
        drop(guard);
        if let Err(e) = debit {
            warn!(map = %map.id, error = %e, "Copy commission debit failed");
            return;
        }

        let master_lock = self.store().account_lock(map.master_id).await;
        let guard = master_lock.lock().await;
        let credit = self
            .store()
            .apply_ledger(
                map.master_id,
                LedgerEntryType::CopyCommissionCredit,
                amount,
                Some(map.id),
            )
            .await;
        drop(guard);
        if let Err(e) = credit {
            warn!(map = %map.id, error = %e, "Copy commission credit failed");
            return;
        }

        self.store()
            .push_commission_log(CommissionLog {
                id: Uuid::new_v4(),
                beneficiary_id: map.master_id,
                source_user_id: map.follower_id,
                kind: CommissionKind::CopyTrade,
                reference: Some(follower_position.id),
                rate,
                amount,
                status: CommissionStatus::Credited,
                created_at: Utc::now(),
            })
            .await;

        let _ = self
            .store()
            .update_map(map.id, |m| {
                m.commission = amount;
                m.commission_paid = true;
            })
            .await;
        let _ = self
            .store()
            .update_link(map.link_id, |l| l.total_commission_paid += amount)
            .await;
        let _ = self
            .store()
            .update_master(map.master_id, |p| p.earned_commission += amount)
            .await;

        info!(
            master = %map.master_id,
            follower = %map.follower_id,
            amount = %amount,
            "Copy commission settled"
        );

        self.publish(EngineEvent::CommissionCredited {
            beneficiary_id: map.master_id,
            source_user_id: map.follower_id,
            amount,
            reference: Some(follower_position.id),
        });
    }

    /// Credit the owning user's referrer per lot traded on any closed
    /// position. No-op without an active, non-frozen relationship.
    pub(crate) async fn settle_referral_commission(&self, position: &Position) {
        let Some(relationship) = self.store().referral_for_user(position.account_id).await else {
            return;
        };
        if !relationship.is_earning() {
            return;
        }

        let count = self.store().referral_count(relationship.referrer_id).await;
        let Some(tier) = self.config().tier_for(count) else {
            return;
        };
        let amount = (tier.per_lot_rate * position.lots).round_dp(2);
        if amount <= Decimal::ZERO {
            return;
        }

        let lock = self.store().account_lock(relationship.referrer_id).await;
        let guard = lock.lock().await;
        let credit = self
            .store()
            .apply_ledger(
                relationship.referrer_id,
                LedgerEntryType::ReferralCommission,
                amount,
                Some(position.id),
            )
            .await;
        drop(guard);
        if let Err(e) = credit {
            warn!(referral = %relationship.id, error = %e, "Referral commission credit failed");
            return;
        }

        self.store()
            .push_commission_log(CommissionLog {
                id: Uuid::new_v4(),
                beneficiary_id: relationship.referrer_id,
                source_user_id: position.account_id,
                kind: CommissionKind::Trade,
                reference: Some(position.id),
                rate: tier.per_lot_rate,
                amount,
                status: CommissionStatus::Credited,
                created_at: Utc::now(),
            })
            .await;

        info!(
            referrer = %relationship.referrer_id,
            referred = %position.account_id,
            amount = %amount,
            "Referral commission credited"
        );

        self.publish(EngineEvent::CommissionCredited {
            beneficiary_id: relationship.referrer_id,
            source_user_id: position.account_id,
            amount,
            reference: Some(position.id),
        });
    }

    /// One-time percentage commission on a referred user's first deposit,
    /// gated by the relationship's processed flag.
    pub(crate) async fn process_first_deposit(
        &self,
        account_id: Uuid,
        deposit_amount: Decimal,
        deposit_ref: Uuid,
    ) {
        let Some(relationship) = self.store().referral_for_user(account_id).await else {
            return;
        };
        if !relationship.is_earning() || relationship.first_deposit_processed {
            return;
        }

        let count = self.store().referral_count(relationship.referrer_id).await;
        let Some(tier) = self.config().tier_for(count) else {
            return;
        };
        let amount = (deposit_amount * tier.first_deposit_pct / dec!(100)).round_dp(2);

        // Flag flips even for a zero-rate tier: the first deposit is spent
        if let Err(e) = self
            .store()
            .update_referral(relationship.id, |r| r.first_deposit_processed = true)
            .await
        {
            warn!(referral = %relationship.id, error = %e, "First-deposit flag update failed");
            return;
        }
        if amount <= Decimal::ZERO {
            return;
        }

        let lock = self.store().account_lock(relationship.referrer_id).await;
        let guard = lock.lock().await;
        let credit = self
            .store()
            .apply_ledger(
                relationship.referrer_id,
                LedgerEntryType::ReferralCommission,
                amount,
                Some(deposit_ref),
            )
            .await;
        drop(guard);
        if let Err(e) = credit {
            warn!(referral = %relationship.id, error = %e, "First-deposit commission failed");
            return;
        }

        self.store()
            .push_commission_log(CommissionLog {
                id: Uuid::new_v4(),
                beneficiary_id: relationship.referrer_id,
                source_user_id: account_id,
                kind: CommissionKind::FirstDeposit,
                reference: Some(deposit_ref),
                rate: tier.first_deposit_pct,
                amount,
                status: CommissionStatus::Credited,
                created_at: Utc::now(),
            })
            .await;

        info!(
            referrer = %relationship.referrer_id,
            referred = %account_id,
            amount = %amount,
            "First-deposit commission credited"
        );

        self.publish(EngineEvent::CommissionCredited {
            beneficiary_id: relationship.referrer_id,
            source_user_id: account_id,
            amount,
            reference: Some(deposit_ref),
        });
    }
}
