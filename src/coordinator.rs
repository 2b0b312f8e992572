//! Units of work.
//!
//! A [`UnitOfWork`] owns one store transaction for the length of one operation.
//! Components receive `&mut UnitOfWork` and never the [`Coordinator`], so a unit
//! of work cannot open another one. Dropping it without `commit` rolls back.

use crate::engine::{LedgerError, LedgerResult, Outcome, RejectReason, Rejection};
use crate::store::{CommitReport, LedgerTx, Storage};
use std::future::Future;
use std::ops::{Deref, DerefMut};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Deadline carried by one inbound request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    deadline: Instant,
}

impl RequestContext {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            deadline: Instant::now() + timeout,
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self { deadline }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    /// Drives `operation` until it finishes or the deadline fires. On expiry the
    /// future is dropped, which drops its unit of work.
    pub async fn run<T, F>(&self, operation: F) -> LedgerResult<T>
    where
        F: Future<Output = LedgerResult<T>>,
    {
        match tokio::time::timeout_at(self.deadline, operation).await {
            Ok(result) => result,
            Err(_) => {
                debug!("deadline reached, operation cancelled");
                Err(LedgerError::Cancelled)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Coordinator<S: Storage> {
    storage: S,
}

impl<S: Storage> Coordinator<S> {
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub async fn begin(&self, ctx: &RequestContext) -> LedgerResult<UnitOfWork<S::Tx>> {
        if ctx.is_expired() {
            return Err(LedgerError::Cancelled);
        }
        let tx = self.storage.begin().await?;
        Ok(UnitOfWork {
            tx,
            deadline: ctx.deadline(),
        })
    }
}

pub struct UnitOfWork<T: LedgerTx> {
    tx: T,
    deadline: Instant,
}

impl<T: LedgerTx> UnitOfWork<T> {
    /// Publishes every staged write, or none of them.
    pub async fn commit(self) -> LedgerResult<CommitReport> {
        if Instant::now() >= self.deadline {
            self.tx.rollback().await;
            return Err(LedgerError::Cancelled);
        }
        Ok(self.tx.commit().await?)
    }

    pub async fn rollback(self) {
        self.tx.rollback().await;
    }

    /// Rolls back and turns `reason` into a rejected outcome.
    pub async fn reject<R>(self, reason: RejectReason) -> LedgerResult<Outcome<R>> {
        self.tx.rollback().await;
        let rejection = Rejection::new(reason);
        debug!(reason = ?rejection.reason, message = %rejection.message, "operation rejected");
        Ok(Outcome::Rejected(rejection))
    }
}

impl<T: LedgerTx> Deref for UnitOfWork<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.tx
    }
}

impl<T: LedgerTx> DerefMut for UnitOfWork<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.tx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::money::Amount;
    use crate::records::{EntryKind, Posting};
    use crate::referral::codec::ReferralChain;
    use crate::store::{LedgerStore, MemoryStorage};
    use crate::types::BalanceField;

    #[tokio::test]
    async fn drop_discards_staged_writes() {
        let storage = MemoryStorage::default();
        let user = storage.seed_user("0xa", ReferralChain::root()).await;
        let coordinator = Coordinator::new(storage.clone());
        let ctx = RequestContext::with_timeout(Duration::from_secs(5));

        {
            let mut uow = coordinator.begin(&ctx).await.unwrap();
            uow.post(Posting::new(user, BalanceField::Primary, Amount::from_units(1), EntryKind::Deposit))
                .await
                .unwrap();
        }

        assert!(storage.snapshot().await.entries.is_empty());
    }

    #[tokio::test]
    async fn expired_context_cannot_begin() {
        let coordinator = Coordinator::new(MemoryStorage::default());
        let ctx = RequestContext::with_timeout(Duration::ZERO);
        assert!(matches!(coordinator.begin(&ctx).await, Err(LedgerError::Cancelled)));
    }

    #[tokio::test]
    async fn commit_after_deadline_rolls_back() {
        let storage = MemoryStorage::default();
        let user = storage.seed_user("0xa", ReferralChain::root()).await;
        let coordinator = Coordinator::new(storage.clone());
        let ctx = RequestContext::with_timeout(Duration::from_millis(30));

        let mut uow = coordinator.begin(&ctx).await.unwrap();
        uow.post(Posting::new(user, BalanceField::Primary, Amount::from_units(1), EntryKind::Deposit))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert!(matches!(uow.commit().await, Err(LedgerError::Cancelled)));
        assert!(storage.snapshot().await.entries.is_empty());
    }

    #[tokio::test]
    async fn run_cancels_slow_operations() {
        let ctx = RequestContext::with_timeout(Duration::from_millis(10));
        let result: LedgerResult<()> = ctx
            .run(async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(LedgerError::Cancelled)));
    }
}
