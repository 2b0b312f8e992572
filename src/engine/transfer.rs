//! Peer transfers.

use super::core::Ledger;
use super::results::{LedgerResult, Outcome, RejectReason, TransferReceipt};
use crate::coordinator::RequestContext;
use crate::money::Amount;
use crate::records::{EntryKind, Posting};
use crate::settings::ConfigProvider;
use crate::store::{BalanceStore, LedgerStore, ReferralLinkStore, Storage, StoreError, UserDirectory};
use crate::types::{AssetKind, UserId};
use tracing::info;

impl<S: Storage, C: ConfigProvider> Ledger<S, C> {
    pub async fn transfer(
        &self,
        ctx: &RequestContext,
        from: UserId,
        to: UserId,
        amount: Amount,
        asset: AssetKind,
    ) -> LedgerResult<Outcome<TransferReceipt>> {
        ctx.run(self.transfer_inner(ctx, from, Some(to), amount, asset)).await
    }

    /// Same as [`Ledger::transfer`] with the recipient named by wallet address.
    pub async fn transfer_to_address(
        &self,
        ctx: &RequestContext,
        from: UserId,
        address: &str,
        amount: Amount,
        asset: AssetKind,
    ) -> LedgerResult<Outcome<TransferReceipt>> {
        ctx.run(async {
            let recipient = self.user_by_address(address.trim()).await?.map(|u| u.id);
            self.transfer_inner(ctx, from, recipient, amount, asset).await
        })
        .await
    }

    async fn transfer_inner(
        &self,
        ctx: &RequestContext,
        from: UserId,
        to: Option<UserId>,
        amount: Amount,
        asset: AssetKind,
    ) -> LedgerResult<Outcome<TransferReceipt>> {
        let mut uow = self.begin(ctx).await?;

        let to = match to {
            Some(to) => to,
            None => return uow.reject(RejectReason::UnknownUser).await,
        };
        if from == to {
            return uow.reject(RejectReason::SelfTransfer).await;
        }
        if !amount.is_positive() {
            return uow.reject(RejectReason::InvalidAmount).await;
        }
        let minimum = self.config.dust.for_asset(asset);
        if amount < minimum {
            return uow.reject(RejectReason::BelowDust { minimum }).await;
        }
        if uow.user(to).await?.is_none() || uow.balance(to).await?.is_none() {
            return uow.reject(RejectReason::UnknownUser).await;
        }

        let field = asset.spendable_field();
        let sender = match uow.balance_for_update(from).await? {
            Some(balance) => balance,
            None => return uow.reject(RejectReason::UnknownUser).await,
        };
        let available = sender.get(field);
        if available < amount {
            return uow
                .reject(RejectReason::InsufficientBalance {
                    field,
                    available,
                    requested: amount,
                })
                .await;
        }

        let debit_id = uow
            .post(Posting::new(from, field, amount.negate(), EntryKind::TransferOut))
            .await?;
        let credit_id = uow
            .post(Posting::new(to, field, amount, EntryKind::TransferIn))
            .await?;

        if asset == self.config.team_volume_asset {
            let from_ancestors = match uow.link(from).await? {
                Some(link) => self.ancestors_of(&link),
                None => Vec::new(),
            };
            let to_ancestors = match uow.link(to).await? {
                Some(link) => self.ancestors_of(&link),
                None => Vec::new(),
            };
            self.distributor
                .shift_team_volume(&mut *uow, &from_ancestors, &to_ancestors, amount)
                .await?;
        }

        let report = uow.commit().await?;
        let missing = |id: u64| StoreError::NotFound {
            what: "ledger entry",
            id,
        };
        let debit = report.entry(debit_id).cloned().ok_or_else(|| missing(debit_id.0))?;
        let credit = report.entry(credit_id).cloned().ok_or_else(|| missing(credit_id.0))?;

        info!(from = %from, to = %to, asset = %asset, amount = %amount, "transfer settled");
        Ok(Outcome::Completed(TransferReceipt { debit, credit }))
    }
}
