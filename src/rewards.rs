// 5.0 rewards.rs: referral payouts and team volume bookkeeping.
// one distribution = one (reason, event) pair. each credited ancestor gets one
// reward entry plus one ledger entry; a replayed pair credits nothing.

use crate::money::Amount;
use crate::records::{EntryKind, Posting, RewardEntry, RewardReason};
use crate::referral::Ancestor;
use crate::store::{BalanceStore, IdKind, LedgerStore, StoreResult};
use crate::types::{AssetKind, EventRef, IdempotencyKey, KeyScope, RewardId, UserId};
use tracing::{debug, warn};

/// Inputs of one distribution.
#[derive(Debug, Clone, Copy)]
pub struct RewardRequest<'a> {
    pub source_user: UserId,
    pub ancestors: &'a [Ancestor],
    pub base: Amount,
    // percent per level, index 0 = level 1
    pub rates: &'a [u32],
    pub reason: RewardReason,
    pub event: &'a EventRef,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Distribution {
    pub rewards: Vec<RewardEntry>,
    pub replayed: bool,
}

impl Distribution {
    pub fn total(&self) -> Amount {
        self.rewards.iter().map(|r| r.amount).sum()
    }
}

/// `base × rate / 100`, truncating.
pub fn level_amount(base: Amount, rate: u32) -> Amount {
    base.percent(rate)
}

#[derive(Debug, Clone, Copy)]
pub struct RewardDistributor {
    asset: AssetKind,
}

impl RewardDistributor {
    pub fn new(asset: AssetKind) -> Self {
        Self { asset }
    }

    pub fn asset(&self) -> AssetKind {
        self.asset
    }

    pub async fn distribute<T>(&self, tx: &mut T, request: RewardRequest<'_>) -> StoreResult<Distribution>
    where
        T: LedgerStore + BalanceStore + ?Sized,
    {
        let key = IdempotencyKey::new(KeyScope::Reward(request.reason), request.event);
        if tx.key_used(&key).await? {
            debug!(key = %key, "reward distribution already applied");
            return Ok(Distribution {
                rewards: tx.rewards_for_event(request.event, request.reason).await?,
                replayed: true,
            });
        }
        tx.claim_key(key).await?;

        let mut rewards = Vec::new();
        for ancestor in request.ancestors {
            let index = (ancestor.level as usize).checked_sub(1);
            let rate = match index.and_then(|i| request.rates.get(i)) {
                Some(rate) => *rate,
                None => break,
            };
            let amount = level_amount(request.base, rate);
            if amount.is_zero() {
                continue;
            }
            if tx.balance(ancestor.user).await?.is_none() {
                warn!(
                    ancestor = %ancestor.user,
                    depth = ancestor.level,
                    event = %request.event,
                    "ancestor has no balance row, reward skipped"
                );
                continue;
            }

            let posting = Posting::new(ancestor.user, self.asset.spendable_field(), amount, EntryKind::Reward)
                .with_category(request.reason.category())
                .with_event(Some(request.event));
            let entry_id = tx.post(posting).await?;

            let reward = RewardEntry {
                id: RewardId(tx.next_id(IdKind::Reward)),
                beneficiary: ancestor.user,
                amount,
                asset: self.asset,
                level: ancestor.level,
                source_user: request.source_user,
                event: request.event.clone(),
                reason: request.reason,
                entry_id,
                created_at: tx.now(),
            };
            tx.record_reward(reward.clone()).await?;
            rewards.push(reward);
        }

        Ok(Distribution {
            rewards,
            replayed: false,
        })
    }

    pub async fn raise_team_volume<T>(&self, tx: &mut T, ancestors: &[Ancestor], amount: Amount) -> StoreResult<()>
    where
        T: LedgerStore + ?Sized,
    {
        for ancestor in ancestors {
            tx.adjust_team_volume(ancestor.user, amount).await?;
        }
        Ok(())
    }

    /// Lowering floors at zero when applied.
    pub async fn lower_team_volume<T>(&self, tx: &mut T, ancestors: &[Ancestor], amount: Amount) -> StoreResult<()>
    where
        T: LedgerStore + ?Sized,
    {
        for ancestor in ancestors {
            tx.adjust_team_volume(ancestor.user, amount.negate()).await?;
        }
        Ok(())
    }

    pub async fn shift_team_volume<T>(
        &self,
        tx: &mut T,
        from: &[Ancestor],
        to: &[Ancestor],
        amount: Amount,
    ) -> StoreResult<()>
    where
        T: LedgerStore + ?Sized,
    {
        self.lower_team_volume(tx, from, amount).await?;
        self.raise_team_volume(tx, to, amount).await
    }
}
