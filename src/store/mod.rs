//! Persistence contracts.
//!
//! Every collaborator is an async trait. A [`Storage`] hands out transactions;
//! a transaction implements all collaborator traits, stages writes and makes
//! them visible at once on [`LedgerTx::commit`]. Dropping a transaction without
//! committing discards everything it staged and releases its row locks.

pub mod memory;

use crate::balance::Balance;
use crate::money::Amount;
use crate::records::{
    FeeRecord, LedgerEntry, LockRecord, Posting, RewardEntry, RewardReason, TradeRecord,
    WithdrawRequest, WithdrawStatus,
};
use crate::referral::codec::ReferralChain;
use crate::types::{
    BalanceField, EntryId, EventRef, IdempotencyKey, SlotId, Timestamp, UserId, WithdrawId,
};
use crate::user::{EarningSlot, NewUser, ReferralLink, User};
use async_trait::async_trait;
use thiserror::Error;

pub use memory::{MemoryStorage, MemoryTx};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("{field} of user {user} would go negative")]
    NegativeBalance { user: UserId, field: BalanceField },
    #[error("idempotency key already used: {0}")]
    EventConflict(String),
    #[error("address already registered: {0}")]
    DuplicateAddress(String),
    #[error("balance row for user {0} already exists")]
    DuplicateBalance(UserId),
    #[error("timed out waiting for the row lock of user {0}")]
    LockTimeout(UserId),
    #[error("{what} {id} not found")]
    NotFound { what: &'static str, id: u64 },
    #[error("earning slot {0} has no capacity left")]
    SlotExhausted(SlotId),
    #[error("withdraw {id} cannot move from {from} to {to}")]
    StaleWithdraw {
        id: u64,
        from: WithdrawStatus,
        to: WithdrawStatus,
    },
    #[error("referral chain of user {user} changed under this transaction")]
    StaleChain { user: UserId },
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Sequences the store hands out. Gaps are allowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdKind {
    Entry,
    Reward,
    Withdraw,
    Trade,
    Lock,
    Fee,
}

/// What became durable in one commit, in posting order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitReport {
    pub entries: Vec<LedgerEntry>,
    pub rewards: Vec<RewardEntry>,
}

impl CommitReport {
    pub fn entry(&self, id: EntryId) -> Option<&LedgerEntry> {
        self.entries.iter().find(|e| e.id == id)
    }
}

#[async_trait]
pub trait UserDirectory: Send + Sync {
    async fn user(&self, id: UserId) -> StoreResult<Option<User>>;
    async fn user_by_address(&self, address: &str) -> StoreResult<Option<User>>;
    async fn create_user(&mut self, new_user: NewUser) -> StoreResult<User>;
}

#[async_trait]
pub trait ReferralLinkStore: Send + Sync {
    async fn link(&self, user: UserId) -> StoreResult<Option<ReferralLink>>;
    async fn create_link(&mut self, link: ReferralLink) -> StoreResult<()>;

    /// Commit re-checks that the committed chain still equals `expected`, that
    /// the new chain extends its referrer's chain, and that every committed
    /// direct recruit of `user` was moved in the same transaction.
    async fn update_chain(
        &mut self,
        user: UserId,
        expected: ReferralChain,
        chain: ReferralChain,
    ) -> StoreResult<()>;
    async fn adjust_recruits(&mut self, user: UserId, delta: i64) -> StoreResult<()>;

    /// Links whose chain equals `chain` exactly (direct recruits of its owner).
    async fn links_with_chain(&self, chain: &ReferralChain) -> StoreResult<Vec<ReferralLink>>;

    /// Links whose chain lies under `code` on segment boundaries.
    async fn links_within(&self, code: &ReferralChain) -> StoreResult<Vec<ReferralLink>>;
}

#[async_trait]
pub trait BalanceStore: Send + Sync {
    async fn create_balance(&mut self, balance: Balance) -> StoreResult<()>;

    /// Committed row plus whatever this transaction has staged. No lock.
    async fn balance(&self, user: UserId) -> StoreResult<Option<Balance>>;

    /// Takes the user's row lock (held until commit or rollback) and then reads.
    async fn balance_for_update(&mut self, user: UserId) -> StoreResult<Option<Balance>>;

    async fn create_lock_record(&mut self, record: LockRecord) -> StoreResult<()>;

    /// Active records, oldest first.
    async fn active_lock_records(&self, user: UserId) -> StoreResult<Vec<LockRecord>>;

    async fn update_lock_record(&mut self, record: LockRecord) -> StoreResult<()>;
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    fn next_id(&self, kind: IdKind) -> u64;

    fn now(&self) -> Timestamp;

    /// Stages one movement and returns the id its ledger entry will carry.
    async fn post(&mut self, posting: Posting) -> StoreResult<EntryId>;

    async fn record_reward(&mut self, reward: RewardEntry) -> StoreResult<()>;
    async fn record_fee(&mut self, fee: FeeRecord) -> StoreResult<()>;
    async fn record_trade(&mut self, trade: TradeRecord) -> StoreResult<()>;

    async fn adjust_team_volume(&mut self, user: UserId, delta: Amount) -> StoreResult<()>;

    /// True when the key is committed or staged by this transaction.
    async fn key_used(&self, key: &IdempotencyKey) -> StoreResult<bool>;

    /// Stages the key. Commit fails with [`StoreError::EventConflict`] if another
    /// transaction committed it first.
    async fn claim_key(&mut self, key: IdempotencyKey) -> StoreResult<()>;

    async fn entries_for_user(&self, user: UserId) -> StoreResult<Vec<LedgerEntry>>;
    async fn entries_for_event(&self, event: &EventRef) -> StoreResult<Vec<LedgerEntry>>;
    async fn rewards_for_user(&self, user: UserId) -> StoreResult<Vec<RewardEntry>>;
    async fn rewards_for_event(
        &self,
        event: &EventRef,
        reason: RewardReason,
    ) -> StoreResult<Vec<RewardEntry>>;
    async fn fees_for_event(&self, event: &EventRef) -> StoreResult<Vec<FeeRecord>>;
    async fn trade_for_event(&self, event: &EventRef) -> StoreResult<Option<TradeRecord>>;
}

#[async_trait]
pub trait WithdrawRequestStore: Send + Sync {
    async fn create_withdraw(&mut self, request: WithdrawRequest) -> StoreResult<()>;
    async fn withdraw(&self, id: WithdrawId) -> StoreResult<Option<WithdrawRequest>>;
    async fn withdraw_by_ref(&self, request_ref: &EventRef) -> StoreResult<Option<WithdrawRequest>>;

    /// Commit re-checks that the committed status still equals `from`.
    async fn update_withdraw_status(
        &mut self,
        id: WithdrawId,
        from: WithdrawStatus,
        to: WithdrawStatus,
    ) -> StoreResult<()>;

    async fn withdraws_for_user(
        &self,
        user: UserId,
        status: Option<WithdrawStatus>,
    ) -> StoreResult<Vec<WithdrawRequest>>;
}

#[async_trait]
pub trait EarningSlotStore: Send + Sync {
    async fn running_slot(&self, user: UserId) -> StoreResult<Option<EarningSlot>>;

    /// Stages capacity use; commit fails with [`StoreError::SlotExhausted`] when
    /// the slot cannot absorb it any more.
    async fn consume_slot(&mut self, slot: SlotId, amount: Amount) -> StoreResult<()>;
}

/// Everything a unit of work can touch.
#[async_trait]
pub trait LedgerTx:
    UserDirectory
    + ReferralLinkStore
    + BalanceStore
    + LedgerStore
    + WithdrawRequestStore
    + EarningSlotStore
    + Send
    + Sync
    + Sized
{
    async fn commit(self) -> StoreResult<CommitReport>;
    async fn rollback(self);
}

#[async_trait]
pub trait Storage: Send + Sync {
    type Tx: LedgerTx + 'static;

    async fn begin(&self) -> StoreResult<Self::Tx>;
}
