//! In-memory storage.
//!
//! Committed state sits behind one `tokio::sync::RwLock`. Transactions stage
//! their writes locally and apply them under the write lock at commit, after
//! validating every posting against the latest committed balances. Row locks are
//! per-user async mutexes whose owned guards live inside the transaction.

use super::{
    BalanceStore, CommitReport, EarningSlotStore, IdKind, LedgerStore, LedgerTx,
    ReferralLinkStore, Storage, StoreError, StoreResult, UserDirectory, WithdrawRequestStore,
};
use crate::balance::Balance;
use crate::money::Amount;
use crate::records::{
    FeeRecord, LedgerEntry, LockRecord, LockStatus, Posting, RewardEntry, RewardReason,
    TradeRecord, WithdrawRequest, WithdrawStatus,
};
use crate::config::ServiceConfig;
use crate::referral::codec::ReferralChain;
use crate::referral::direct_referrer;
use crate::types::{
    EntryId, EventRef, IdempotencyKey, LockId, SlotId, Timestamp, UserId, WithdrawId,
};
use crate::user::{EarningSlot, NewUser, ReferralLink, SlotStatus, User};
use async_trait::async_trait;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::debug;

const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_millis(2_000);

/// Full committed state. Cloned out by [`MemoryStorage::snapshot`] for audits.
#[derive(Debug, Clone, Default)]
pub struct LedgerSnapshot {
    pub users: BTreeMap<UserId, User>,
    pub addresses: HashMap<String, UserId>,
    pub links: BTreeMap<UserId, ReferralLink>,
    pub balances: BTreeMap<UserId, Balance>,
    pub entries: Vec<LedgerEntry>,
    pub rewards: Vec<RewardEntry>,
    pub fees: Vec<FeeRecord>,
    pub trades: Vec<TradeRecord>,
    pub withdraws: BTreeMap<WithdrawId, WithdrawRequest>,
    pub lock_records: BTreeMap<LockId, LockRecord>,
    pub slots: BTreeMap<SlotId, EarningSlot>,
    pub keys: HashSet<IdempotencyKey>,
}

#[derive(Debug, Default)]
struct Sequences {
    user: AtomicU64,
    entry: AtomicU64,
    reward: AtomicU64,
    withdraw: AtomicU64,
    trade: AtomicU64,
    lock: AtomicU64,
    fee: AtomicU64,
    slot: AtomicU64,
}

impl Sequences {
    fn next(counter: &AtomicU64) -> u64 {
        counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn for_kind(&self, kind: IdKind) -> u64 {
        let counter = match kind {
            IdKind::Entry => &self.entry,
            IdKind::Reward => &self.reward,
            IdKind::Withdraw => &self.withdraw,
            IdKind::Trade => &self.trade,
            IdKind::Lock => &self.lock,
            IdKind::Fee => &self.fee,
        };
        Self::next(counter)
    }
}

type RowLock = Arc<Mutex<()>>;

#[derive(Debug, Clone)]
pub struct MemoryStorage {
    state: Arc<RwLock<LedgerSnapshot>>,
    row_locks: Arc<Mutex<HashMap<UserId, RowLock>>>,
    sequences: Arc<Sequences>,
    lock_timeout: Duration,
    fail_next_commit: Arc<AtomicBool>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

impl MemoryStorage {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            state: Arc::new(RwLock::new(LedgerSnapshot::default())),
            row_locks: Arc::new(Mutex::new(HashMap::new())),
            sequences: Arc::new(Sequences::default()),
            lock_timeout,
            fail_next_commit: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Store whose row-lock wait follows `config.lock_timeout_ms`.
    pub fn from_config(config: &ServiceConfig) -> Self {
        Self::new(config.lock_timeout())
    }

    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    pub async fn snapshot(&self) -> LedgerSnapshot {
        self.state.read().await.clone()
    }

    /// Makes the next commit fail as if the backend went away.
    pub fn fail_next_commit(&self) {
        self.fail_next_commit.store(true, Ordering::SeqCst);
    }

    /// Inserts a user with a given chain directly, skipping invite checks.
    /// Fixture and migration helper.
    pub async fn seed_user(&self, address: &str, chain: ReferralChain) -> UserId {
        let id = UserId(Sequences::next(&self.sequences.user));
        let now = Timestamp::now();
        let mut state = self.state.write().await;

        let direct = chain.ancestors().into_iter().next().and_then(|a| a.ok());
        if let Some(link) = direct.and_then(|referrer| state.links.get_mut(&referrer)) {
            link.direct_recruits += 1;
        }

        state.users.insert(
            id,
            User {
                id,
                address: address.to_string(),
                credential_hash: String::new(),
                created_at: now,
            },
        );
        state.addresses.insert(address.to_string(), id);
        state.links.insert(id, ReferralLink::new(id, chain, now));
        state.balances.insert(id, Balance::new(id, now));
        id
    }

    /// Registers a running earning slot, the way the external scheduler would.
    pub async fn seed_slot(&self, user: UserId, current_max: Amount) -> SlotId {
        let id = SlotId(Sequences::next(&self.sequences.slot));
        let mut state = self.state.write().await;
        state.slots.insert(
            id,
            EarningSlot {
                id,
                user,
                status: SlotStatus::Running,
                current_max,
                current_max_new: Amount::ZERO,
            },
        );
        id
    }

    pub async fn stop_slot(&self, slot: SlotId) {
        let mut state = self.state.write().await;
        if let Some(slot) = state.slots.get_mut(&slot) {
            slot.status = SlotStatus::Stopped;
        }
    }

    async fn row_lock(&self, user: UserId) -> RowLock {
        let mut table = self.row_locks.lock().await;
        table.entry(user).or_default().clone()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    type Tx = MemoryTx;

    async fn begin(&self) -> StoreResult<MemoryTx> {
        Ok(MemoryTx {
            storage: self.clone(),
            started_at: Timestamp::now(),
            guards: HashMap::new(),
            staged: Staged::default(),
        })
    }
}

#[derive(Debug, Default)]
struct Staged {
    users: Vec<User>,
    links: Vec<ReferralLink>,
    // user -> (chain read before the move, chain after it)
    chains: HashMap<UserId, (ReferralChain, ReferralChain)>,
    recruits: HashMap<UserId, i64>,
    balances: Vec<Balance>,
    postings: Vec<(EntryId, Posting)>,
    rewards: Vec<RewardEntry>,
    fees: Vec<FeeRecord>,
    trades: Vec<TradeRecord>,
    withdraws: Vec<WithdrawRequest>,
    withdraw_moves: Vec<(WithdrawId, WithdrawStatus, WithdrawStatus)>,
    new_locks: Vec<LockRecord>,
    lock_updates: BTreeMap<LockId, LockRecord>,
    slot_use: BTreeMap<SlotId, Amount>,
    team_volume: BTreeMap<UserId, Amount>,
    keys: Vec<IdempotencyKey>,
}

/// One unit of work against [`MemoryStorage`].
pub struct MemoryTx {
    storage: MemoryStorage,
    started_at: Timestamp,
    guards: HashMap<UserId, OwnedMutexGuard<()>>,
    staged: Staged,
}

impl MemoryTx {
    pub fn holds_lock(&self, user: UserId) -> bool {
        self.guards.contains_key(&user)
    }

    fn project_link(&self, state: &LedgerSnapshot, user: UserId) -> Option<ReferralLink> {
        let mut link = self
            .staged
            .links
            .iter()
            .find(|l| l.user == user)
            .cloned()
            .or_else(|| state.links.get(&user).cloned())?;
        if let Some((_, chain)) = self.staged.chains.get(&user) {
            link.chain = chain.clone();
        }
        if let Some(delta) = self.staged.recruits.get(&user) {
            link.direct_recruits = shift_count(link.direct_recruits, *delta);
        }
        Some(link)
    }

    fn project_links(&self, state: &LedgerSnapshot) -> Vec<ReferralLink> {
        let mut ids: Vec<UserId> = state.links.keys().copied().collect();
        ids.extend(self.staged.links.iter().map(|l| l.user));
        ids.sort();
        ids.dedup();
        ids.into_iter()
            .filter_map(|id| self.project_link(state, id))
            .collect()
    }

    fn project_balance(&self, state: &LedgerSnapshot, user: UserId) -> StoreResult<Option<Balance>> {
        let base = self
            .staged
            .balances
            .iter()
            .find(|b| b.user == user)
            .cloned()
            .or_else(|| state.balances.get(&user).cloned());
        let mut balance = match base {
            Some(balance) => balance,
            None => return Ok(None),
        };

        for (_, posting) in self.staged.postings.iter().filter(|(_, p)| p.user == user) {
            balance
                .apply(posting, self.started_at)
                .map_err(|_| StoreError::NegativeBalance {
                    user,
                    field: posting.field,
                })?;
        }
        if let Some(delta) = self.staged.team_volume.get(&user) {
            balance.adjust_team_volume(*delta, self.started_at);
        }
        Ok(Some(balance))
    }
}

fn shift_count(count: u64, delta: i64) -> u64 {
    if delta < 0 {
        count.saturating_sub(delta.unsigned_abs())
    } else {
        count.saturating_add(delta as u64)
    }
}

#[async_trait]
impl UserDirectory for MemoryTx {
    async fn user(&self, id: UserId) -> StoreResult<Option<User>> {
        if let Some(user) = self.staged.users.iter().find(|u| u.id == id) {
            return Ok(Some(user.clone()));
        }
        let state = self.storage.state.read().await;
        Ok(state.users.get(&id).cloned())
    }

    async fn user_by_address(&self, address: &str) -> StoreResult<Option<User>> {
        if let Some(user) = self.staged.users.iter().find(|u| u.address == address) {
            return Ok(Some(user.clone()));
        }
        let state = self.storage.state.read().await;
        Ok(state
            .addresses
            .get(address)
            .and_then(|id| state.users.get(id))
            .cloned())
    }

    async fn create_user(&mut self, new_user: NewUser) -> StoreResult<User> {
        if self.user_by_address(&new_user.address).await?.is_some() {
            return Err(StoreError::DuplicateAddress(new_user.address));
        }
        let user = User {
            id: UserId(Sequences::next(&self.storage.sequences.user)),
            address: new_user.address,
            credential_hash: new_user.credential_hash,
            created_at: self.started_at,
        };
        self.staged.users.push(user.clone());
        Ok(user)
    }
}

#[async_trait]
impl ReferralLinkStore for MemoryTx {
    async fn link(&self, user: UserId) -> StoreResult<Option<ReferralLink>> {
        let state = self.storage.state.read().await;
        Ok(self.project_link(&state, user))
    }

    async fn create_link(&mut self, link: ReferralLink) -> StoreResult<()> {
        self.staged.links.push(link);
        Ok(())
    }

    async fn update_chain(
        &mut self,
        user: UserId,
        expected: ReferralChain,
        chain: ReferralChain,
    ) -> StoreResult<()> {
        if let Some(staged) = self.staged.chains.get_mut(&user) {
            staged.1 = chain;
        } else {
            self.staged.chains.insert(user, (expected, chain));
        }
        Ok(())
    }

    async fn adjust_recruits(&mut self, user: UserId, delta: i64) -> StoreResult<()> {
        *self.staged.recruits.entry(user).or_insert(0) += delta;
        Ok(())
    }

    async fn links_with_chain(&self, chain: &ReferralChain) -> StoreResult<Vec<ReferralLink>> {
        let state = self.storage.state.read().await;
        Ok(self
            .project_links(&state)
            .into_iter()
            .filter(|l| &l.chain == chain)
            .collect())
    }

    async fn links_within(&self, code: &ReferralChain) -> StoreResult<Vec<ReferralLink>> {
        let state = self.storage.state.read().await;
        Ok(self
            .project_links(&state)
            .into_iter()
            .filter(|l| l.chain.is_within(code))
            .collect())
    }
}

#[async_trait]
impl BalanceStore for MemoryTx {
    async fn create_balance(&mut self, balance: Balance) -> StoreResult<()> {
        if self.balance(balance.user).await?.is_some() {
            return Err(StoreError::DuplicateBalance(balance.user));
        }
        self.staged.balances.push(balance);
        Ok(())
    }

    async fn balance(&self, user: UserId) -> StoreResult<Option<Balance>> {
        let state = self.storage.state.read().await;
        self.project_balance(&state, user)
    }

    async fn balance_for_update(&mut self, user: UserId) -> StoreResult<Option<Balance>> {
        if !self.guards.contains_key(&user) {
            let row = self.storage.row_lock(user).await;
            let guard = tokio::time::timeout(self.storage.lock_timeout, row.lock_owned())
                .await
                .map_err(|_| StoreError::LockTimeout(user))?;
            debug!(user = %user, "row lock acquired");
            self.guards.insert(user, guard);
        }
        self.balance(user).await
    }

    async fn create_lock_record(&mut self, record: LockRecord) -> StoreResult<()> {
        self.staged.new_locks.push(record);
        Ok(())
    }

    async fn active_lock_records(&self, user: UserId) -> StoreResult<Vec<LockRecord>> {
        let state = self.storage.state.read().await;
        let mut records: Vec<LockRecord> = state
            .lock_records
            .values()
            .filter(|r| r.user == user)
            .cloned()
            .chain(self.staged.new_locks.iter().filter(|r| r.user == user).cloned())
            .map(|r| self.staged.lock_updates.get(&r.id).cloned().unwrap_or(r))
            .filter(|r| r.status == LockStatus::Active)
            .collect();
        records.sort_by_key(|r| r.id);
        Ok(records)
    }

    async fn update_lock_record(&mut self, record: LockRecord) -> StoreResult<()> {
        if let Some(staged) = self.staged.new_locks.iter_mut().find(|r| r.id == record.id) {
            *staged = record;
        } else {
            self.staged.lock_updates.insert(record.id, record);
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryTx {
    fn next_id(&self, kind: IdKind) -> u64 {
        self.storage.sequences.for_kind(kind)
    }

    fn now(&self) -> Timestamp {
        self.started_at
    }

    async fn post(&mut self, posting: Posting) -> StoreResult<EntryId> {
        let id = EntryId(self.next_id(IdKind::Entry));
        self.staged.postings.push((id, posting));
        Ok(id)
    }

    async fn record_reward(&mut self, reward: RewardEntry) -> StoreResult<()> {
        self.staged.rewards.push(reward);
        Ok(())
    }

    async fn record_fee(&mut self, fee: FeeRecord) -> StoreResult<()> {
        self.staged.fees.push(fee);
        Ok(())
    }

    async fn record_trade(&mut self, trade: TradeRecord) -> StoreResult<()> {
        self.staged.trades.push(trade);
        Ok(())
    }

    async fn adjust_team_volume(&mut self, user: UserId, delta: Amount) -> StoreResult<()> {
        let slot = self.staged.team_volume.entry(user).or_insert(Amount::ZERO);
        *slot = slot.saturating_add(delta);
        Ok(())
    }

    async fn key_used(&self, key: &IdempotencyKey) -> StoreResult<bool> {
        if self.staged.keys.contains(key) {
            return Ok(true);
        }
        let state = self.storage.state.read().await;
        Ok(state.keys.contains(key))
    }

    async fn claim_key(&mut self, key: IdempotencyKey) -> StoreResult<()> {
        self.staged.keys.push(key);
        Ok(())
    }

    async fn entries_for_user(&self, user: UserId) -> StoreResult<Vec<LedgerEntry>> {
        let state = self.storage.state.read().await;
        Ok(state.entries.iter().filter(|e| e.user == user).cloned().collect())
    }

    async fn entries_for_event(&self, event: &EventRef) -> StoreResult<Vec<LedgerEntry>> {
        let state = self.storage.state.read().await;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.event.as_ref() == Some(event))
            .cloned()
            .collect())
    }

    async fn rewards_for_user(&self, user: UserId) -> StoreResult<Vec<RewardEntry>> {
        let state = self.storage.state.read().await;
        Ok(state
            .rewards
            .iter()
            .filter(|r| r.beneficiary == user)
            .cloned()
            .collect())
    }

    async fn rewards_for_event(
        &self,
        event: &EventRef,
        reason: RewardReason,
    ) -> StoreResult<Vec<RewardEntry>> {
        let state = self.storage.state.read().await;
        Ok(state
            .rewards
            .iter()
            .filter(|r| &r.event == event && r.reason == reason)
            .cloned()
            .collect())
    }

    async fn fees_for_event(&self, event: &EventRef) -> StoreResult<Vec<FeeRecord>> {
        let state = self.storage.state.read().await;
        Ok(state
            .fees
            .iter()
            .filter(|f| f.event.as_ref() == Some(event))
            .cloned()
            .collect())
    }

    async fn trade_for_event(&self, event: &EventRef) -> StoreResult<Option<TradeRecord>> {
        let state = self.storage.state.read().await;
        Ok(state.trades.iter().find(|t| &t.event == event).cloned())
    }
}

#[async_trait]
impl WithdrawRequestStore for MemoryTx {
    async fn create_withdraw(&mut self, request: WithdrawRequest) -> StoreResult<()> {
        self.staged.withdraws.push(request);
        Ok(())
    }

    async fn withdraw(&self, id: WithdrawId) -> StoreResult<Option<WithdrawRequest>> {
        let state = self.storage.state.read().await;
        let mut request = match self
            .staged
            .withdraws
            .iter()
            .find(|w| w.id == id)
            .cloned()
            .or_else(|| state.withdraws.get(&id).cloned())
        {
            Some(request) => request,
            None => return Ok(None),
        };
        for (_, _, to) in self.staged.withdraw_moves.iter().filter(|(w, _, _)| *w == id) {
            request.status = *to;
        }
        Ok(Some(request))
    }

    async fn withdraw_by_ref(&self, request_ref: &EventRef) -> StoreResult<Option<WithdrawRequest>> {
        if let Some(request) = self.staged.withdraws.iter().find(|w| &w.request_ref == request_ref) {
            return Ok(Some(request.clone()));
        }
        let state = self.storage.state.read().await;
        Ok(state
            .withdraws
            .values()
            .find(|w| &w.request_ref == request_ref)
            .cloned())
    }

    async fn update_withdraw_status(
        &mut self,
        id: WithdrawId,
        from: WithdrawStatus,
        to: WithdrawStatus,
    ) -> StoreResult<()> {
        self.staged.withdraw_moves.push((id, from, to));
        Ok(())
    }

    async fn withdraws_for_user(
        &self,
        user: UserId,
        status: Option<WithdrawStatus>,
    ) -> StoreResult<Vec<WithdrawRequest>> {
        let state = self.storage.state.read().await;
        Ok(state
            .withdraws
            .values()
            .filter(|w| w.user == user)
            .filter(|w| status.map_or(true, |s| w.status == s))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl EarningSlotStore for MemoryTx {
    async fn running_slot(&self, user: UserId) -> StoreResult<Option<EarningSlot>> {
        let state = self.storage.state.read().await;
        let mut slot = match state
            .slots
            .values()
            .find(|s| s.user == user && s.is_running())
            .cloned()
        {
            Some(slot) => slot,
            None => return Ok(None),
        };
        if let Some(used) = self.staged.slot_use.get(&slot.id) {
            slot.current_max_new = slot.current_max_new.saturating_add(*used);
        }
        Ok(Some(slot))
    }

    async fn consume_slot(&mut self, slot: SlotId, amount: Amount) -> StoreResult<()> {
        let used = self.staged.slot_use.entry(slot).or_insert(Amount::ZERO);
        *used = used.saturating_add(amount);
        Ok(())
    }
}

#[async_trait]
impl LedgerTx for MemoryTx {
    async fn commit(mut self) -> StoreResult<CommitReport> {
        if self.storage.fail_next_commit.swap(false, Ordering::SeqCst) {
            return Err(StoreError::Unavailable("commit rejected by backend".to_string()));
        }

        let staged = std::mem::take(&mut self.staged);
        let report = {
            let mut state = self.storage.state.write().await;
            apply_staged(&mut state, staged, self.started_at)?
        };
        // row locks release here, after the new state is visible
        drop(self);
        Ok(report)
    }

    async fn rollback(self) {
        debug!(
            postings = self.staged.postings.len(),
            locks = self.guards.len(),
            "transaction rolled back"
        );
    }
}

/// Validates the staged writes against committed state and applies them.
/// Nothing is written unless every check passes.
fn apply_staged(
    state: &mut LedgerSnapshot,
    staged: Staged,
    now: Timestamp,
) -> StoreResult<CommitReport> {
    let mut seen_keys = HashSet::new();
    for key in &staged.keys {
        if state.keys.contains(key) || !seen_keys.insert(key.clone()) {
            return Err(StoreError::EventConflict(key.to_string()));
        }
    }

    let mut seen_addresses = HashSet::new();
    for user in &staged.users {
        if state.addresses.contains_key(&user.address) || !seen_addresses.insert(&user.address) {
            return Err(StoreError::DuplicateAddress(user.address.clone()));
        }
    }

    let mut balances: BTreeMap<UserId, Balance> = BTreeMap::new();
    for balance in &staged.balances {
        if state.balances.contains_key(&balance.user) || balances.contains_key(&balance.user) {
            return Err(StoreError::DuplicateBalance(balance.user));
        }
        balances.insert(balance.user, balance.clone());
    }

    let mut entries = Vec::with_capacity(staged.postings.len());
    for (id, posting) in &staged.postings {
        let balance = match balances.entry(posting.user) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                let committed = state
                    .balances
                    .get(&posting.user)
                    .cloned()
                    .ok_or(StoreError::NotFound {
                        what: "balance",
                        id: posting.user.0,
                    })?;
                slot.insert(committed)
            }
        };
        let balance_after = balance
            .apply(posting, now)
            .map_err(|_| StoreError::NegativeBalance {
                user: posting.user,
                field: posting.field,
            })?;
        entries.push(LedgerEntry {
            id: *id,
            user: posting.user,
            field: posting.field,
            amount: posting.amount,
            balance_after,
            kind: posting.kind,
            category: posting.category,
            event: posting.event.clone(),
            created_at: now,
        });
    }

    for (user, delta) in &staged.team_volume {
        let balance = match balances.entry(*user) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => match state.balances.get(user) {
                Some(committed) => slot.insert(committed.clone()),
                None => continue,
            },
        };
        balance.adjust_team_volume(*delta, now);
    }

    let mut slots = Vec::new();
    for (id, amount) in &staged.slot_use {
        let mut slot = state.slots.get(id).cloned().ok_or(StoreError::NotFound {
            what: "earning slot",
            id: id.0,
        })?;
        if !slot.is_running() || !slot.can_absorb(*amount) {
            return Err(StoreError::SlotExhausted(*id));
        }
        slot.current_max_new = slot.current_max_new.saturating_add(*amount);
        slots.push(slot);
    }

    let mut withdraws: BTreeMap<WithdrawId, WithdrawRequest> = BTreeMap::new();
    for request in &staged.withdraws {
        withdraws.insert(request.id, request.clone());
    }
    for (id, from, to) in &staged.withdraw_moves {
        let request = match withdraws.entry(*id) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => {
                let committed = state.withdraws.get(id).cloned().ok_or(StoreError::NotFound {
                    what: "withdraw",
                    id: id.0,
                })?;
                slot.insert(committed)
            }
        };
        if request.status != *from {
            return Err(StoreError::StaleWithdraw {
                id: id.0,
                from: request.status,
                to: *to,
            });
        }
        request.status = *to;
        request.updated_at = now;
    }

    for (user, (expected, _)) in &staged.chains {
        if let Some(committed) = state.links.get(user) {
            if &committed.chain != expected {
                return Err(StoreError::StaleChain { user: *user });
            }
        }
    }

    let mut links: BTreeMap<UserId, ReferralLink> = BTreeMap::new();
    for link in &staged.links {
        links.insert(link.user, link.clone());
    }
    let touched: HashSet<UserId> = staged
        .chains
        .keys()
        .chain(staged.recruits.keys())
        .copied()
        .collect();
    for user in touched {
        let link = match links.entry(user) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => match state.links.get(&user) {
                Some(committed) => slot.insert(committed.clone()),
                None => {
                    return Err(StoreError::NotFound {
                        what: "referral link",
                        id: user.0,
                    })
                }
            },
        };
        if let Some((_, chain)) = staged.chains.get(&user) {
            link.chain = chain.clone();
        }
        if let Some(delta) = staged.recruits.get(&user) {
            link.direct_recruits = shift_count(link.direct_recruits, *delta);
        }
        link.updated_at = now;
    }
    check_tree(state, &staged, &links)?;

    // every check passed, publish
    for user in staged.users {
        state.addresses.insert(user.address.clone(), user.id);
        state.users.insert(user.id, user);
    }
    state.links.extend(links);
    state.balances.extend(balances);
    state.entries.extend(entries.iter().cloned());
    state.rewards.extend(staged.rewards.iter().cloned());
    state.fees.extend(staged.fees);
    state.trades.extend(staged.trades);
    state.withdraws.extend(withdraws);
    for record in staged.new_locks {
        state.lock_records.insert(record.id, record);
    }
    state.lock_records.extend(staged.lock_updates);
    for slot in slots {
        state.slots.insert(slot.id, slot);
    }
    state.keys.extend(staged.keys);

    Ok(CommitReport {
        entries,
        rewards: staged.rewards,
    })
}

/// Every written chain must extend its referrer's chain as it will stand after
/// this commit, and no committed recruit of a moved user may stay behind.
fn check_tree(
    state: &LedgerSnapshot,
    staged: &Staged,
    links: &BTreeMap<UserId, ReferralLink>,
) -> StoreResult<()> {
    let chain_after = |user: UserId| {
        links
            .get(&user)
            .or_else(|| state.links.get(&user))
            .map(|link| &link.chain)
    };

    let written = staged
        .links
        .iter()
        .map(|link| link.user)
        .chain(staged.chains.keys().copied());
    for user in written {
        let chain = match chain_after(user) {
            Some(chain) => chain,
            None => continue,
        };
        let referrer = match direct_referrer(chain) {
            Some(referrer) => referrer,
            None => continue,
        };
        if let Some(parent) = chain_after(referrer) {
            if &parent.extend(referrer) != chain {
                return Err(StoreError::StaleChain { user });
            }
        }
    }

    for (moved, (before, after)) in &staged.chains {
        if before == after {
            continue;
        }
        let left_behind = state.links.values().any(|link| {
            !staged.chains.contains_key(&link.user) && direct_referrer(&link.chain) == Some(*moved)
        });
        if left_behind {
            return Err(StoreError::StaleChain { user: *moved });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::EntryKind;
    use crate::types::BalanceField;

    fn credit(user: UserId, units: i64) -> Posting {
        Posting::new(user, BalanceField::Primary, Amount::from_units(units), EntryKind::Deposit)
    }

    #[tokio::test]
    async fn staged_writes_are_invisible_until_commit() {
        let storage = MemoryStorage::default();
        let user = storage.seed_user("0xa", ReferralChain::root()).await;

        let mut tx = storage.begin().await.unwrap();
        tx.post(credit(user, 5)).await.unwrap();
        assert_eq!(tx.balance(user).await.unwrap().unwrap().primary, Amount::from_units(5));
        assert_eq!(storage.snapshot().await.balances[&user].primary, Amount::ZERO);

        let report = tx.commit().await.unwrap();
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.entries[0].balance_after, Amount::from_units(5));
        assert_eq!(storage.snapshot().await.balances[&user].primary, Amount::from_units(5));
    }

    #[tokio::test]
    async fn overdraft_fails_whole_commit() {
        let storage = MemoryStorage::default();
        let a = storage.seed_user("0xa", ReferralChain::root()).await;
        let b = storage.seed_user("0xb", ReferralChain::root()).await;

        let mut tx = storage.begin().await.unwrap();
        tx.post(credit(b, 1)).await.unwrap();
        tx.staged.postings.push((
            EntryId(99),
            Posting::new(a, BalanceField::Primary, Amount::from_units(1).negate(), EntryKind::TransferOut),
        ));
        let err = tx.commit().await.unwrap_err();

        assert!(matches!(err, StoreError::NegativeBalance { .. }));
        let snapshot = storage.snapshot().await;
        assert!(snapshot.entries.is_empty());
        assert_eq!(snapshot.balances[&b].primary, Amount::ZERO);
    }

    #[tokio::test]
    async fn duplicate_key_loses_at_commit() {
        let storage = MemoryStorage::default();
        let key = IdempotencyKey::new(crate::types::KeyScope::Deposit, &EventRef::new("e1"));

        let mut first = storage.begin().await.unwrap();
        let mut second = storage.begin().await.unwrap();
        first.claim_key(key.clone()).await.unwrap();
        second.claim_key(key.clone()).await.unwrap();

        first.commit().await.unwrap();
        assert!(matches!(second.commit().await, Err(StoreError::EventConflict(_))));
    }

    #[tokio::test]
    async fn row_lock_times_out() {
        let storage = MemoryStorage::new(Duration::from_millis(20));
        let user = storage.seed_user("0xa", ReferralChain::root()).await;

        let mut holder = storage.begin().await.unwrap();
        holder.balance_for_update(user).await.unwrap();
        assert!(holder.holds_lock(user));

        let mut waiter = storage.begin().await.unwrap();
        let err = waiter.balance_for_update(user).await.unwrap_err();
        assert_eq!(err, StoreError::LockTimeout(user));

        holder.rollback().await;
        assert!(waiter.balance_for_update(user).await.is_ok());
    }

    #[tokio::test]
    async fn injected_failure_discards_everything() {
        let storage = MemoryStorage::default();
        let user = storage.seed_user("0xa", ReferralChain::root()).await;
        storage.fail_next_commit();

        let mut tx = storage.begin().await.unwrap();
        tx.post(credit(user, 5)).await.unwrap();
        assert!(matches!(tx.commit().await, Err(StoreError::Unavailable(_))));
        assert!(storage.snapshot().await.entries.is_empty());
    }

    #[tokio::test]
    async fn crossed_referrer_moves_cannot_both_commit() {
        let storage = MemoryStorage::default();
        let root = storage.seed_user("0xroot", ReferralChain::root()).await;
        let top = ReferralChain::root().extend(root);
        let x = storage.seed_user("0xx", top.clone()).await;
        let y = storage.seed_user("0xy", top.clone()).await;

        let mut x_under_y = storage.begin().await.unwrap();
        let mut y_under_x = storage.begin().await.unwrap();
        x_under_y.update_chain(x, top.clone(), top.extend(y)).await.unwrap();
        y_under_x.update_chain(y, top.clone(), top.extend(x)).await.unwrap();

        y_under_x.commit().await.unwrap();
        assert_eq!(x_under_y.commit().await.unwrap_err(), StoreError::StaleChain { user: x });

        let snapshot = storage.snapshot().await;
        assert_eq!(snapshot.links[&x].chain, top);
        assert_eq!(snapshot.links[&y].chain, top.extend(x));
    }

    #[tokio::test]
    async fn move_from_a_stale_read_is_refused() {
        let storage = MemoryStorage::default();
        let root = storage.seed_user("0xroot", ReferralChain::root()).await;
        let x = storage.seed_user("0xx", ReferralChain::root().extend(root)).await;

        let mut tx = storage.begin().await.unwrap();
        tx.update_chain(x, ReferralChain::root(), ReferralChain::root().extend(root))
            .await
            .unwrap();
        assert_eq!(tx.commit().await.unwrap_err(), StoreError::StaleChain { user: x });
    }

    // root <- x <- m, plus t under root as the new referrer of x
    async fn moving_subtree() -> (MemoryStorage, UserId, UserId, UserId, ReferralChain) {
        let storage = MemoryStorage::default();
        let root = storage.seed_user("0xroot", ReferralChain::root()).await;
        let top = ReferralChain::root().extend(root);
        let x = storage.seed_user("0xx", top.clone()).await;
        let m = storage.seed_user("0xm", top.extend(x)).await;
        let t = storage.seed_user("0xt", top.clone()).await;
        (storage, x, m, t, top)
    }

    async fn stage_move(tx: &mut MemoryTx, x: UserId, m: UserId, t: UserId, top: &ReferralChain) {
        tx.update_chain(m, top.extend(x), top.extend(t).extend(x)).await.unwrap();
        tx.update_chain(x, top.clone(), top.extend(t)).await.unwrap();
    }

    #[tokio::test]
    async fn recruit_committed_under_a_moving_member_blocks_the_move() {
        let (storage, x, m, t, top) = moving_subtree().await;

        let mut mover = storage.begin().await.unwrap();
        stage_move(&mut mover, x, m, t, &top).await;

        let mut joiner = storage.begin().await.unwrap();
        let n = UserId(50);
        joiner
            .create_link(ReferralLink::new(n, top.extend(x).extend(m), Timestamp::now()))
            .await
            .unwrap();
        joiner.commit().await.unwrap();

        assert_eq!(mover.commit().await.unwrap_err(), StoreError::StaleChain { user: m });
        let snapshot = storage.snapshot().await;
        assert_eq!(snapshot.links[&m].chain, top.extend(x));
        assert_eq!(snapshot.links[&n].chain, top.extend(x).extend(m));
    }

    #[tokio::test]
    async fn recruit_under_an_already_moved_member_is_refused() {
        let (storage, x, m, t, top) = moving_subtree().await;

        let mut joiner = storage.begin().await.unwrap();
        let n = UserId(50);
        joiner
            .create_link(ReferralLink::new(n, top.extend(x).extend(m), Timestamp::now()))
            .await
            .unwrap();

        let mut mover = storage.begin().await.unwrap();
        stage_move(&mut mover, x, m, t, &top).await;
        mover.commit().await.unwrap();

        assert_eq!(joiner.commit().await.unwrap_err(), StoreError::StaleChain { user: n });
        assert!(!storage.snapshot().await.links.contains_key(&n));
    }

    #[test]
    fn lock_timeout_comes_from_the_service_config() {
        let storage = MemoryStorage::from_config(&ServiceConfig::testing());
        assert_eq!(storage.lock_timeout(), Duration::from_millis(200));
        assert_eq!(
            MemoryStorage::from_config(&ServiceConfig::production()).lock_timeout(),
            ServiceConfig::production().lock_timeout()
        );
    }

    #[tokio::test]
    async fn seeded_chain_counts_recruits() {
        let storage = MemoryStorage::default();
        let root = storage.seed_user("0xroot", ReferralChain::root()).await;
        storage
            .seed_user("0xa", ReferralChain::root().extend(root))
            .await;

        let snapshot = storage.snapshot().await;
        assert_eq!(snapshot.links[&root].direct_recruits, 1);
    }
}
