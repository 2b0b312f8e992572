//! Withdrawals and their processing states.
//!
//! A withdraw debits immediately and leaves a `pending` request for the payout
//! workflow. The workflow moves it to `doing`, then `success`; a `failed` request
//! gets its full amount refunded.

use super::core::Ledger;
use super::results::{LedgerResult, Outcome, RejectReason, WithdrawReceipt, WithdrawUpdate};
use crate::coordinator::RequestContext;
use crate::money::Amount;
use crate::records::{
    EntryKind, FeeKind, FeeRecord, FeeSource, Posting, WithdrawRequest, WithdrawStatus,
};
use crate::settings::ConfigProvider;
use crate::store::{
    BalanceStore, IdKind, LedgerStore, Storage, StoreError, WithdrawRequestStore,
};
use crate::types::{AssetKind, EventRef, FeeId, IdempotencyKey, KeyScope, UserId, WithdrawId};
use tracing::{debug, info, warn};

impl<S: Storage, C: ConfigProvider> Ledger<S, C> {
    pub async fn withdraw(
        &self,
        ctx: &RequestContext,
        user: UserId,
        amount: Amount,
        asset: AssetKind,
        request_ref: &EventRef,
    ) -> LedgerResult<Outcome<WithdrawReceipt>> {
        ctx.run(self.withdraw_inner(ctx, user, amount, asset, request_ref)).await
    }

    async fn withdraw_inner(
        &self,
        ctx: &RequestContext,
        user: UserId,
        amount: Amount,
        asset: AssetKind,
        request_ref: &EventRef,
    ) -> LedgerResult<Outcome<WithdrawReceipt>> {
        let settings = self.load_settings().await?;
        let mut uow = self.begin(ctx).await?;

        let key = IdempotencyKey::new(KeyScope::Withdraw, request_ref);
        if uow.key_used(&key).await? {
            if let Some(request) = uow.withdraw_by_ref(request_ref).await? {
                if request.user != user || request.amount != amount || request.asset != asset {
                    return uow.reject(RejectReason::RequestRefReused).await;
                }
                uow.rollback().await;
                debug!(request_ref = %request_ref, "withdraw replayed");
                return Ok(Outcome::Completed(WithdrawReceipt {
                    request,
                    entry: None,
                    replayed: true,
                }));
            }
        }

        let limits = match settings.withdraw_limits(asset) {
            Some(limits) => limits,
            None => return uow.reject(RejectReason::UnsupportedAsset).await,
        };
        if !settings.withdraw_open {
            return uow.reject(RejectReason::WithdrawalsDisabled).await;
        }
        if !amount.is_positive() {
            return uow.reject(RejectReason::InvalidAmount).await;
        }
        if amount > limits.max {
            return uow
                .reject(RejectReason::AboveMaximum { maximum: limits.max })
                .await;
        }
        if amount < limits.min {
            return uow
                .reject(RejectReason::BelowMinimum { minimum: limits.min })
                .await;
        }

        let field = asset.spendable_field();
        let balance = match uow.balance_for_update(user).await? {
            Some(balance) => balance,
            None => return uow.reject(RejectReason::UnknownUser).await,
        };
        let available = balance.get(field);
        if available < amount {
            return uow
                .reject(RejectReason::InsufficientBalance {
                    field,
                    available,
                    requested: amount,
                })
                .await;
        }

        let fee = amount.percent(settings.withdraw_fee_rate);
        let net_amount = amount.saturating_sub_floor(fee);

        uow.claim_key(key).await?;
        let entry_id = uow
            .post(Posting::new(user, field, amount.negate(), EntryKind::Withdraw).with_event(Some(request_ref)))
            .await?;
        let now = uow.now();
        let request = WithdrawRequest {
            id: WithdrawId(uow.next_id(IdKind::Withdraw)),
            user,
            asset,
            amount,
            net_amount,
            fee,
            status: WithdrawStatus::Pending,
            request_ref: request_ref.clone(),
            entry_id,
            created_at: now,
            updated_at: now,
        };
        uow.create_withdraw(request.clone()).await?;

        let report = uow.commit().await?;

        info!(
            user = %user,
            asset = %asset,
            amount = %amount,
            fee = %fee,
            withdraw = request.id.0,
            "withdraw requested"
        );
        Ok(Outcome::Completed(WithdrawReceipt {
            request,
            entry: report.entry(entry_id).cloned(),
            replayed: false,
        }))
    }

    pub async fn mark_withdraw_doing(
        &self,
        ctx: &RequestContext,
        id: WithdrawId,
    ) -> LedgerResult<Outcome<WithdrawUpdate>> {
        ctx.run(self.move_withdraw(ctx, id, WithdrawStatus::Doing)).await
    }

    /// Payout confirmed. The fee becomes platform revenue.
    pub async fn mark_withdraw_success(
        &self,
        ctx: &RequestContext,
        id: WithdrawId,
    ) -> LedgerResult<Outcome<WithdrawUpdate>> {
        ctx.run(self.move_withdraw(ctx, id, WithdrawStatus::Success)).await
    }

    /// Payout failed. The whole amount goes back to the user.
    pub async fn fail_withdraw(
        &self,
        ctx: &RequestContext,
        id: WithdrawId,
    ) -> LedgerResult<Outcome<WithdrawUpdate>> {
        ctx.run(self.move_withdraw(ctx, id, WithdrawStatus::Failed)).await
    }

    async fn move_withdraw(
        &self,
        ctx: &RequestContext,
        id: WithdrawId,
        to: WithdrawStatus,
    ) -> LedgerResult<Outcome<WithdrawUpdate>> {
        let mut uow = self.begin(ctx).await?;

        let owner = match uow.withdraw(id).await? {
            Some(request) => request.user,
            None => return uow.reject(RejectReason::UnknownWithdraw).await,
        };
        // the owner's row lock serializes processors of the same request
        uow.balance_for_update(owner).await?;
        let mut request = uow.withdraw(id).await?.ok_or(StoreError::NotFound {
            what: "withdraw",
            id: id.0,
        })?;

        let from = request.status;
        if !from.can_transition_to(to) {
            return uow
                .reject(RejectReason::InvalidStatusTransition { from, to })
                .await;
        }
        uow.update_withdraw_status(id, from, to).await?;

        let mut refund_id = None;
        match to {
            WithdrawStatus::Success if request.fee.is_positive() => {
                let fee = FeeRecord {
                    id: FeeId(uow.next_id(IdKind::Fee)),
                    user: request.user,
                    asset: request.asset,
                    amount: request.fee,
                    kind: FeeKind::Fee,
                    source: FeeSource::Withdraw,
                    event: Some(request.request_ref.clone()),
                    created_at: uow.now(),
                };
                uow.record_fee(fee).await?;
            }
            WithdrawStatus::Failed => {
                let posting = Posting::new(
                    request.user,
                    request.asset.spendable_field(),
                    request.amount,
                    EntryKind::WithdrawRefund,
                )
                .with_event(Some(&request.request_ref));
                refund_id = Some(uow.post(posting).await?);
            }
            _ => {}
        }

        let now = uow.now();
        let report = uow.commit().await?;
        request.status = to;
        request.updated_at = now;

        if to == WithdrawStatus::Failed {
            warn!(withdraw = id.0, user = %request.user, amount = %request.amount, "withdraw failed, refunded");
        } else {
            info!(withdraw = id.0, status = %to, "withdraw status updated");
        }
        Ok(Outcome::Completed(WithdrawUpdate {
            request,
            refund: refund_id.and_then(|entry| report.entry(entry).cloned()),
        }))
    }
}
