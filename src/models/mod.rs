//! Domain models: positions, accounts, copy-trade links, referrals.

mod account;
mod copy;
mod position;
mod referral;

pub use account::{Account, LedgerEntry, LedgerEntryType};
pub use copy::{CommissionModel, CopyLink, CopyMap, LinkStatus, MasterProfile, SizingMode};
pub use position::{CloseReason, OrderKind, Position, PositionStatus, Side};
pub use referral::{CommissionKind, CommissionLog, CommissionStatus, ReferralRelationship};
