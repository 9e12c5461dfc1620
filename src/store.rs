//! In-memory document store for engine state.
//!
//! Each collection is independent and keyed by id; cross-references are by
//! id only. Balance mutations go through [`Store::apply_ledger`] so every
//! change is paired with an immutable ledger entry, and callers serialize
//! order-affecting work per account via [`Store::account_lock`].

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{
    Account, CommissionLog, CopyLink, CopyMap, LedgerEntry, LedgerEntryType, MasterProfile,
    Position, PositionStatus, ReferralRelationship,
};

#[derive(Default)]
pub struct Store {
    accounts: RwLock<HashMap<Uuid, Account>>,
    ledger: RwLock<Vec<LedgerEntry>>,
    positions: RwLock<HashMap<Uuid, Position>>,
    links: RwLock<HashMap<Uuid, CopyLink>>,
    maps: RwLock<HashMap<Uuid, CopyMap>>,
    masters: RwLock<HashMap<Uuid, MasterProfile>>,
    referrals: RwLock<HashMap<Uuid, ReferralRelationship>>,
    commission_logs: RwLock<Vec<CommissionLog>>,

    account_locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    // ==================== Accounts & ledger ====================

    /// Per-account mutex serializing read-modify-write of the balance.
    pub async fn account_lock(&self, account_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.account_locks.lock().await;
        locks
            .entry(account_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub async fn insert_account(&self, account: Account) {
        self.accounts.write().await.insert(account.id, account);
    }

    pub async fn account(&self, id: Uuid) -> Result<Account> {
        self.accounts
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("account {id}")))
    }

    pub async fn balance(&self, id: Uuid) -> Result<Decimal> {
        Ok(self.account(id).await?.balance)
    }

    /// Mutate a balance and append the paired ledger entry in one step.
    /// Caller must hold the account lock for order-affecting paths.
    pub async fn apply_ledger(
        &self,
        account_id: Uuid,
        entry_type: LedgerEntryType,
        amount: Decimal,
        reference: Option<Uuid>,
    ) -> Result<LedgerEntry> {
        let mut accounts = self.accounts.write().await;
        let account = accounts
            .get_mut(&account_id)
            .ok_or_else(|| EngineError::NotFound(format!("account {account_id}")))?;

        let balance_before = account.balance;
        account.balance = (account.balance + amount).round_dp(2);

        let entry = LedgerEntry {
            id: Uuid::new_v4(),
            account_id,
            entry_type,
            amount,
            balance_before,
            balance_after: account.balance,
            reference,
            created_at: Utc::now(),
        };
        drop(accounts);

        self.ledger.write().await.push(entry.clone());
        Ok(entry)
    }

    pub async fn ledger_for(&self, account_id: Uuid) -> Vec<LedgerEntry> {
        self.ledger
            .read()
            .await
            .iter()
            .filter(|e| e.account_id == account_id)
            .cloned()
            .collect()
    }

    // ==================== Positions ====================

    pub async fn insert_position(&self, position: Position) {
        self.positions.write().await.insert(position.id, position);
    }

    pub async fn position(&self, id: Uuid) -> Result<Position> {
        self.positions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("position {id}")))
    }

    /// Compare-and-set on status: applies `mutate` and returns the updated
    /// position only if the position is still in `expected` status. Makes
    /// double-close and double-activation idempotent without a global lock.
    pub async fn transition_position<F>(
        &self,
        id: Uuid,
        expected: PositionStatus,
        mutate: F,
    ) -> Result<Option<Position>>
    where
        F: FnOnce(&mut Position),
    {
        let mut positions = self.positions.write().await;
        let position = positions
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("position {id}")))?;

        if position.status != expected {
            return Ok(None);
        }
        mutate(position);
        Ok(Some(position.clone()))
    }

    /// Non-transitioning field update on a live position (SL/TP changes).
    pub async fn update_position<F>(&self, id: Uuid, mutate: F) -> Result<Position>
    where
        F: FnOnce(&mut Position),
    {
        let mut positions = self.positions.write().await;
        let position = positions
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("position {id}")))?;
        mutate(position);
        Ok(position.clone())
    }

    pub async fn positions_with_status(&self, status: PositionStatus) -> Vec<Position> {
        self.positions
            .read()
            .await
            .values()
            .filter(|p| p.status == status)
            .cloned()
            .collect()
    }

    pub async fn open_positions_for(&self, account_id: Uuid) -> Vec<Position> {
        self.positions
            .read()
            .await
            .values()
            .filter(|p| p.account_id == account_id && p.status == PositionStatus::Open)
            .cloned()
            .collect()
    }

    /// Open mirrored positions that reference the given master position.
    pub async fn mirrored_positions_of(&self, master_position_id: Uuid) -> Vec<Position> {
        self.positions
            .read()
            .await
            .values()
            .filter(|p| {
                p.mirrored
                    && p.master_position_id == Some(master_position_id)
                    && p.status == PositionStatus::Open
            })
            .cloned()
            .collect()
    }

    // ==================== Copy links & maps ====================

    pub async fn insert_link(&self, link: CopyLink) {
        self.links.write().await.insert(link.id, link);
    }

    pub async fn link(&self, id: Uuid) -> Result<CopyLink> {
        self.links
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("copy link {id}")))
    }

    pub async fn links_for_master(&self, master_id: Uuid) -> Vec<CopyLink> {
        self.links
            .read()
            .await
            .values()
            .filter(|l| l.master_id == master_id)
            .cloned()
            .collect()
    }

    pub async fn update_link<F>(&self, id: Uuid, mutate: F) -> Result<CopyLink>
    where
        F: FnOnce(&mut CopyLink),
    {
        let mut links = self.links.write().await;
        let link = links
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("copy link {id}")))?;
        mutate(link);
        Ok(link.clone())
    }

    pub async fn insert_map(&self, map: CopyMap) {
        self.maps.write().await.insert(map.id, map);
    }

    pub async fn map_for_follower_position(&self, follower_position_id: Uuid) -> Option<CopyMap> {
        self.maps
            .read()
            .await
            .values()
            .find(|m| m.follower_position_id == follower_position_id)
            .cloned()
    }

    pub async fn update_map<F>(&self, id: Uuid, mutate: F) -> Result<CopyMap>
    where
        F: FnOnce(&mut CopyMap),
    {
        let mut maps = self.maps.write().await;
        let map = maps
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("copy map {id}")))?;
        mutate(map);
        Ok(map.clone())
    }

    // ==================== Master profiles ====================

    pub async fn insert_master(&self, profile: MasterProfile) {
        self.masters
            .write()
            .await
            .insert(profile.account_id, profile);
    }

    pub async fn master(&self, account_id: Uuid) -> Option<MasterProfile> {
        self.masters.read().await.get(&account_id).cloned()
    }

    pub async fn update_master<F>(&self, account_id: Uuid, mutate: F) -> Result<MasterProfile>
    where
        F: FnOnce(&mut MasterProfile),
    {
        let mut masters = self.masters.write().await;
        let profile = masters
            .get_mut(&account_id)
            .ok_or_else(|| EngineError::NotFound(format!("master profile {account_id}")))?;
        mutate(profile);
        Ok(profile.clone())
    }

    // ==================== Referrals & commission logs ====================

    pub async fn insert_referral(&self, relationship: ReferralRelationship) {
        self.referrals
            .write()
            .await
            .insert(relationship.id, relationship);
    }

    pub async fn referral_for_user(&self, referred_id: Uuid) -> Option<ReferralRelationship> {
        self.referrals
            .read()
            .await
            .values()
            .find(|r| r.referred_id == referred_id)
            .cloned()
    }

    pub async fn referral_count(&self, referrer_id: Uuid) -> u32 {
        self.referrals
            .read()
            .await
            .values()
            .filter(|r| r.referrer_id == referrer_id)
            .count() as u32
    }

    pub async fn update_referral<F>(&self, id: Uuid, mutate: F) -> Result<ReferralRelationship>
    where
        F: FnOnce(&mut ReferralRelationship),
    {
        let mut referrals = self.referrals.write().await;
        let relationship = referrals
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(format!("referral {id}")))?;
        mutate(relationship);
        Ok(relationship.clone())
    }

    pub async fn push_commission_log(&self, log: CommissionLog) {
        self.commission_logs.write().await.push(log);
    }

    pub async fn commission_logs_for(&self, beneficiary_id: Uuid) -> Vec<CommissionLog> {
        self.commission_logs
            .read()
            .await
            .iter()
            .filter(|l| l.beneficiary_id == beneficiary_id)
            .cloned()
            .collect()
    }
}
