// 4.0: audit rows. every value movement produces a ledger entry, every referral
// payout a reward entry. rows are append-only; withdraw requests and lock records
// only change their status/remaining fields.

use crate::money::Amount;
use crate::types::{
    AssetKind, BalanceField, EntryId, EventRef, FeeId, LockId, RewardId, Timestamp, TradeId,
    UserId, WithdrawId,
};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Deposit,
    Withdraw,
    WithdrawRefund,
    ExchangeOut,
    ExchangeIn,
    TransferOut,
    TransferIn,
    // locked pool -> spendable primary during a trade
    TradeUnlock,
    // reward tokens sold in a trade
    TradeSell,
    Lock,
    Release,
    Reward,
}

/// Running-total bucket a reward counts toward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardCategory {
    Recommend,
    Area,
    Tier,
    Location,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardReason {
    DepositReferral,
    TradeReferral,
    Area,
    Tier,
    Location,
}

impl RewardReason {
    pub fn category(&self) -> RewardCategory {
        match self {
            RewardReason::DepositReferral | RewardReason::TradeReferral => RewardCategory::Recommend,
            RewardReason::Area => RewardCategory::Area,
            RewardReason::Tier => RewardCategory::Tier,
            RewardReason::Location => RewardCategory::Location,
        }
    }
}

impl fmt::Display for RewardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RewardReason::DepositReferral => "deposit_referral",
            RewardReason::TradeReferral => "trade_referral",
            RewardReason::Area => "area",
            RewardReason::Tier => "tier",
            RewardReason::Location => "location",
        };
        f.write_str(s)
    }
}

/// A staged movement. Becomes a [`LedgerEntry`] when the unit of work commits
/// and the resulting balance is known.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Posting {
    pub user: UserId,
    pub field: BalanceField,
    pub amount: Amount,
    pub kind: EntryKind,
    pub category: Option<RewardCategory>,
    pub event: Option<EventRef>,
}

impl Posting {
    pub fn new(user: UserId, field: BalanceField, amount: Amount, kind: EntryKind) -> Self {
        Self {
            user,
            field,
            amount,
            kind,
            category: None,
            event: None,
        }
    }

    pub fn with_event(mut self, event: Option<&EventRef>) -> Self {
        self.event = event.cloned();
        self
    }

    pub fn with_category(mut self, category: RewardCategory) -> Self {
        self.category = Some(category);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub user: UserId,
    pub field: BalanceField,
    pub amount: Amount,
    pub balance_after: Amount,
    pub kind: EntryKind,
    pub category: Option<RewardCategory>,
    pub event: Option<EventRef>,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RewardEntry {
    pub id: RewardId,
    pub beneficiary: UserId,
    pub amount: Amount,
    pub asset: AssetKind,
    // 1 = direct referrer
    pub level: u32,
    pub source_user: UserId,
    pub event: EventRef,
    pub reason: RewardReason,
    pub entry_id: EntryId,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawStatus {
    Pending,
    Doing,
    Success,
    Failed,
}

impl WithdrawStatus {
    pub fn can_transition_to(&self, next: WithdrawStatus) -> bool {
        matches!(
            (self, next),
            (WithdrawStatus::Pending, WithdrawStatus::Doing)
                | (WithdrawStatus::Doing, WithdrawStatus::Success)
                | (WithdrawStatus::Pending, WithdrawStatus::Failed)
                | (WithdrawStatus::Doing, WithdrawStatus::Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WithdrawStatus::Success | WithdrawStatus::Failed)
    }
}

impl fmt::Display for WithdrawStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WithdrawStatus::Pending => "pending",
            WithdrawStatus::Doing => "doing",
            WithdrawStatus::Success => "success",
            WithdrawStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WithdrawRequest {
    pub id: WithdrawId,
    pub user: UserId,
    pub asset: AssetKind,
    pub amount: Amount,
    pub net_amount: Amount,
    pub fee: Amount,
    pub status: WithdrawStatus,
    pub request_ref: EventRef,
    pub entry_id: EntryId,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: TradeId,
    pub user: UserId,
    pub amount_a: Amount,
    pub net_a: Amount,
    pub amount_b: Amount,
    // payable to the user off-ledger
    pub net_b: Amount,
    pub amount_aux: Amount,
    pub event: EventRef,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeKind {
    Fee,
    Burn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeeSource {
    Exchange,
    Withdraw,
    Trade,
}

/// Value retained by the platform (or destroyed) instead of being credited to a user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeeRecord {
    pub id: FeeId,
    pub user: UserId,
    pub asset: AssetKind,
    pub amount: Amount,
    pub kind: FeeKind,
    pub source: FeeSource,
    pub event: Option<EventRef>,
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    Active,
    Released,
}

/// One deposit into the locked pool. Consumed oldest-first by releases and trades.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub id: LockId,
    pub user: UserId,
    pub amount: Amount,
    pub remaining: Amount,
    pub status: LockStatus,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl LockRecord {
    /// Takes up to `wanted` from this record, returns how much was taken.
    pub fn consume(&mut self, wanted: Amount, now: Timestamp) -> Amount {
        let taken = if wanted < self.remaining { wanted } else { self.remaining };
        self.remaining = self.remaining.saturating_sub_floor(taken);
        if self.remaining.is_zero() {
            self.status = LockStatus::Released;
        }
        self.updated_at = now;
        taken
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn withdraw_status_machine() {
        assert!(WithdrawStatus::Pending.can_transition_to(WithdrawStatus::Doing));
        assert!(WithdrawStatus::Doing.can_transition_to(WithdrawStatus::Success));
        assert!(WithdrawStatus::Pending.can_transition_to(WithdrawStatus::Failed));
        assert!(!WithdrawStatus::Pending.can_transition_to(WithdrawStatus::Success));
        assert!(!WithdrawStatus::Success.can_transition_to(WithdrawStatus::Failed));
        assert!(WithdrawStatus::Failed.is_terminal());
    }

    #[test]
    fn reward_reasons_map_to_totals() {
        assert_eq!(RewardReason::DepositReferral.category(), RewardCategory::Recommend);
        assert_eq!(RewardReason::TradeReferral.category(), RewardCategory::Recommend);
        assert_eq!(RewardReason::Location.category(), RewardCategory::Location);
    }

    #[test]
    fn lock_record_partial_then_full() {
        let mut record = LockRecord {
            id: LockId(1),
            user: UserId(1),
            amount: Amount::from_units(10),
            remaining: Amount::from_units(10),
            status: LockStatus::Active,
            created_at: Timestamp::from_millis(0),
            updated_at: Timestamp::from_millis(0),
        };

        let taken = record.consume(Amount::from_units(4), Timestamp::from_millis(1));
        assert_eq!(taken, Amount::from_units(4));
        assert_eq!(record.status, LockStatus::Active);

        let taken = record.consume(Amount::from_units(50), Timestamp::from_millis(2));
        assert_eq!(taken, Amount::from_units(6));
        assert_eq!(record.status, LockStatus::Released);
        assert!(record.remaining.is_zero());
    }
}
