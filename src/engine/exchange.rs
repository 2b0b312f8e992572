//! Reward token to primary conversion, bounded by the user's earning slot.

use super::core::Ledger;
use super::results::{ExchangeReceipt, LedgerResult, Outcome, RejectReason};
use crate::coordinator::RequestContext;
use crate::money::Amount;
use crate::records::{EntryKind, FeeKind, FeeRecord, FeeSource, Posting};
use crate::settings::{ConfigProvider, ConfigSnapshot};
use crate::store::{BalanceStore, EarningSlotStore, IdKind, LedgerStore, Storage, StoreError};
use crate::types::{AssetKind, FeeId, UserId};
use tracing::info;

/// `amount / price_base × price`, dividing first. `None` on overflow.
pub(super) fn convert(amount: Amount, settings: &ConfigSnapshot) -> Option<Amount> {
    amount
        .raw()
        .checked_div(settings.price_base)?
        .checked_mul(settings.price)
        .map(Amount::from_raw)
}

impl<S: Storage, C: ConfigProvider> Ledger<S, C> {
    pub async fn exchange(
        &self,
        ctx: &RequestContext,
        user: UserId,
        amount: Amount,
        from: AssetKind,
        to: AssetKind,
    ) -> LedgerResult<Outcome<ExchangeReceipt>> {
        ctx.run(self.exchange_inner(ctx, user, amount, from, to)).await
    }

    async fn exchange_inner(
        &self,
        ctx: &RequestContext,
        user: UserId,
        amount: Amount,
        from: AssetKind,
        to: AssetKind,
    ) -> LedgerResult<Outcome<ExchangeReceipt>> {
        let settings = self.load_settings().await?;
        let mut uow = self.begin(ctx).await?;

        if (from, to) != (AssetKind::RewardToken, AssetKind::Primary) {
            return uow.reject(RejectReason::UnsupportedAsset).await;
        }
        if !amount.is_positive() {
            return uow.reject(RejectReason::InvalidAmount).await;
        }
        let minimum = self.config.dust.exchange_min;
        if amount < minimum {
            return uow.reject(RejectReason::BelowMinimum { minimum }).await;
        }

        let from_field = from.spendable_field();
        let balance = match uow.balance_for_update(user).await? {
            Some(balance) => balance,
            None => return uow.reject(RejectReason::UnknownUser).await,
        };
        let available = balance.get(from_field);
        if available < amount {
            return uow
                .reject(RejectReason::InsufficientBalance {
                    field: from_field,
                    available,
                    requested: amount,
                })
                .await;
        }

        let converted = match convert(amount, &settings) {
            Some(converted) if converted.is_positive() => converted,
            Some(_) => return uow.reject(RejectReason::NonPositiveConversion).await,
            None => return uow.reject(RejectReason::InvalidAmount).await,
        };
        let fee = converted.permille(settings.exchange_rate);
        let credited = converted.saturating_sub_floor(fee);

        let slot = match uow.running_slot(user).await? {
            Some(slot) => slot,
            None => return uow.reject(RejectReason::NoActiveSlot).await,
        };
        if !slot.can_absorb(converted) {
            return uow
                .reject(RejectReason::SlotCapacityExceeded {
                    capacity: slot.remaining(),
                    requested: converted,
                })
                .await;
        }

        let debit_id = uow
            .post(Posting::new(user, from_field, amount.negate(), EntryKind::ExchangeOut))
            .await?;
        let credit_id = uow
            .post(Posting::new(user, to.spendable_field(), credited, EntryKind::ExchangeIn))
            .await?;
        uow.consume_slot(slot.id, converted).await?;
        if fee.is_positive() {
            let record = FeeRecord {
                id: FeeId(uow.next_id(IdKind::Fee)),
                user,
                asset: to,
                amount: fee,
                kind: FeeKind::Fee,
                source: FeeSource::Exchange,
                event: None,
                created_at: uow.now(),
            };
            uow.record_fee(record).await?;
        }

        let report = uow.commit().await?;
        let missing = |id: u64| StoreError::NotFound {
            what: "ledger entry",
            id,
        };
        let debit = report.entry(debit_id).cloned().ok_or_else(|| missing(debit_id.0))?;
        let credit = report.entry(credit_id).cloned().ok_or_else(|| missing(credit_id.0))?;

        info!(
            user = %user,
            amount = %amount,
            converted = %converted,
            fee = %fee,
            slot = slot.id.0,
            "exchange settled"
        );
        Ok(Outcome::Completed(ExchangeReceipt {
            debit,
            credit,
            converted,
            fee,
        }))
    }
}
