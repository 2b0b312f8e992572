//! Locked pool: parking primary balance and releasing it oldest-first.

use super::core::Ledger;
use super::results::{LedgerResult, LockReceipt, Outcome, RejectReason, ReleaseReceipt};
use crate::coordinator::RequestContext;
use crate::money::Amount;
use crate::records::{EntryKind, LockRecord, LockStatus, Posting};
use crate::settings::ConfigProvider;
use crate::store::{BalanceStore, IdKind, LedgerStore, StoreResult, Storage};
use crate::types::{BalanceField, LockId, UserId};
use tracing::info;

/// Takes `amount` out of the user's active lock records, oldest first.
/// Returns the records touched, after consumption.
pub(super) async fn consume_lock_records<T>(
    tx: &mut T,
    user: UserId,
    amount: Amount,
) -> StoreResult<Vec<LockRecord>>
where
    T: BalanceStore + LedgerStore + ?Sized,
{
    let now = tx.now();
    let mut left = amount;
    let mut touched = Vec::new();
    for mut record in tx.active_lock_records(user).await? {
        if !left.is_positive() {
            break;
        }
        let taken = record.consume(left, now);
        left = left.saturating_sub_floor(taken);
        tx.update_lock_record(record.clone()).await?;
        touched.push(record);
    }
    Ok(touched)
}

impl<S: Storage, C: ConfigProvider> Ledger<S, C> {
    /// Moves `amount` of spendable primary into the locked pool.
    pub async fn lock(
        &self,
        ctx: &RequestContext,
        user: UserId,
        amount: Amount,
    ) -> LedgerResult<Outcome<LockReceipt>> {
        ctx.run(self.lock_inner(ctx, user, amount)).await
    }

    async fn lock_inner(
        &self,
        ctx: &RequestContext,
        user: UserId,
        amount: Amount,
    ) -> LedgerResult<Outcome<LockReceipt>> {
        let mut uow = self.begin(ctx).await?;

        if !amount.is_positive() {
            return uow.reject(RejectReason::InvalidAmount).await;
        }
        let balance = match uow.balance_for_update(user).await? {
            Some(balance) => balance,
            None => return uow.reject(RejectReason::UnknownUser).await,
        };
        if balance.primary < amount {
            return uow
                .reject(RejectReason::InsufficientBalance {
                    field: BalanceField::Primary,
                    available: balance.primary,
                    requested: amount,
                })
                .await;
        }

        let out_id = uow
            .post(Posting::new(user, BalanceField::Primary, amount.negate(), EntryKind::Lock))
            .await?;
        let in_id = uow
            .post(Posting::new(user, BalanceField::Locked, amount, EntryKind::Lock))
            .await?;
        let now = uow.now();
        let record = LockRecord {
            id: LockId(uow.next_id(IdKind::Lock)),
            user,
            amount,
            remaining: amount,
            status: LockStatus::Active,
            created_at: now,
            updated_at: now,
        };
        uow.create_lock_record(record.clone()).await?;

        let report = uow.commit().await?;
        let entries = [out_id, in_id]
            .iter()
            .filter_map(|id| report.entry(*id).cloned())
            .collect();

        info!(user = %user, amount = %amount, lock = record.id.0, "balance locked");
        Ok(Outcome::Completed(LockReceipt { record, entries }))
    }

    /// Returns `amount` from the locked pool to spendable primary.
    pub async fn release_locked(
        &self,
        ctx: &RequestContext,
        user: UserId,
        amount: Amount,
    ) -> LedgerResult<Outcome<ReleaseReceipt>> {
        ctx.run(self.release_inner(ctx, user, amount)).await
    }

    async fn release_inner(
        &self,
        ctx: &RequestContext,
        user: UserId,
        amount: Amount,
    ) -> LedgerResult<Outcome<ReleaseReceipt>> {
        let mut uow = self.begin(ctx).await?;

        if !amount.is_positive() {
            return uow.reject(RejectReason::InvalidAmount).await;
        }
        let balance = match uow.balance_for_update(user).await? {
            Some(balance) => balance,
            None => return uow.reject(RejectReason::UnknownUser).await,
        };
        if balance.locked < amount {
            return uow
                .reject(RejectReason::InsufficientBalance {
                    field: BalanceField::Locked,
                    available: balance.locked,
                    requested: amount,
                })
                .await;
        }

        let released = consume_lock_records(&mut *uow, user, amount).await?;
        let out_id = uow
            .post(Posting::new(user, BalanceField::Locked, amount.negate(), EntryKind::Release))
            .await?;
        let in_id = uow
            .post(Posting::new(user, BalanceField::Primary, amount, EntryKind::Release))
            .await?;

        let report = uow.commit().await?;
        let entries = [out_id, in_id]
            .iter()
            .filter_map(|id| report.entry(*id).cloned())
            .collect();

        info!(user = %user, amount = %amount, records = released.len(), "locked balance released");
        Ok(Outcome::Completed(ReleaseReceipt { released, entries }))
    }
}
