//! Deposits and the referral rewards they trigger.

use super::core::Ledger;
use super::results::{DepositReceipt, LedgerResult, Outcome, RejectReason};
use crate::coordinator::RequestContext;
use crate::money::Amount;
use crate::records::{EntryKind, Posting, RewardReason};
use crate::rewards::RewardRequest;
use crate::settings::ConfigProvider;
use crate::store::{BalanceStore, LedgerStore, ReferralLinkStore, Storage, StoreError};
use crate::types::{AssetKind, EventRef, IdempotencyKey, KeyScope, UserId};
use tracing::{debug, info};

impl<S: Storage, C: ConfigProvider> Ledger<S, C> {
    /// Credits an external deposit. `event` identifies the deposit upstream;
    /// sending it again returns the first result with `replayed` set.
    pub async fn deposit(
        &self,
        ctx: &RequestContext,
        user: UserId,
        amount: Amount,
        asset: AssetKind,
        event: &EventRef,
    ) -> LedgerResult<Outcome<DepositReceipt>> {
        ctx.run(self.deposit_inner(ctx, user, amount, asset, event)).await
    }

    async fn deposit_inner(
        &self,
        ctx: &RequestContext,
        user: UserId,
        amount: Amount,
        asset: AssetKind,
        event: &EventRef,
    ) -> LedgerResult<Outcome<DepositReceipt>> {
        let settings = self.load_settings().await?;
        let mut uow = self.begin(ctx).await?;

        if !amount.is_positive() {
            return uow.reject(RejectReason::InvalidAmount).await;
        }

        let key = IdempotencyKey::new(KeyScope::Deposit, event);
        if uow.key_used(&key).await? {
            let entry = uow
                .entries_for_event(event)
                .await?
                .into_iter()
                .find(|e| e.kind == EntryKind::Deposit)
                .ok_or(StoreError::NotFound {
                    what: "deposit entry",
                    id: user.0,
                })?;
            if entry.user != user || entry.amount != amount || entry.field != asset.spendable_field() {
                return uow.reject(RejectReason::RequestRefReused).await;
            }
            let rewards = uow.rewards_for_event(event, RewardReason::DepositReferral).await?;
            uow.rollback().await;
            debug!(event = %event, "deposit replayed");
            return Ok(Outcome::Completed(DepositReceipt {
                entry,
                rewards,
                replayed: true,
            }));
        }

        let link = match uow.link(user).await? {
            Some(link) => link,
            None => return uow.reject(RejectReason::UnknownUser).await,
        };
        if uow.balance(user).await?.is_none() {
            return uow.reject(RejectReason::UnknownUser).await;
        }

        uow.claim_key(key).await?;
        let entry_id = uow
            .post(Posting::new(user, asset.spendable_field(), amount, EntryKind::Deposit).with_event(Some(event)))
            .await?;

        let ancestors = self.ancestors_of(&link);
        if asset == self.config.team_volume_asset {
            self.distributor
                .raise_team_volume(&mut *uow, &ancestors, amount)
                .await?;
        }
        let distribution = self
            .distributor
            .distribute(
                &mut *uow,
                RewardRequest {
                    source_user: user,
                    ancestors: &ancestors,
                    base: amount,
                    rates: &settings.deposit_reward_rates,
                    reason: RewardReason::DepositReferral,
                    event,
                },
            )
            .await?;

        let report = uow.commit().await?;
        let entry = report
            .entry(entry_id)
            .cloned()
            .ok_or(StoreError::NotFound {
                what: "ledger entry",
                id: entry_id.0,
            })?;

        info!(
            user = %user,
            asset = %asset,
            amount = %amount,
            rewards = distribution.rewards.len(),
            reward_total = %distribution.total(),
            "deposit credited"
        );
        Ok(Outcome::Completed(DepositReceipt {
            entry,
            rewards: distribution.rewards,
            replayed: false,
        }))
    }
}
