// 8.0 engine/core.rs: the ledger. holds the coordinator, the runtime settings
// provider and the static service config. operations live in sibling files.

use super::results::{LedgerError, LedgerResult};
use crate::balance::Balance;
use crate::config::{ConfigError, ServiceConfig};
use crate::coordinator::{Coordinator, RequestContext, UnitOfWork};
use crate::records::{LedgerEntry, RewardEntry, WithdrawRequest, WithdrawStatus};
use crate::referral::codec::InviteCode;
use crate::referral::resolver::{self, TeamSummary};
use crate::referral::{ancestors_up_to, Ancestor};
use crate::rewards::RewardDistributor;
use crate::settings::{ConfigProvider, ConfigSnapshot};
use crate::store::{LedgerStore, ReferralLinkStore, Storage, UserDirectory, WithdrawRequestStore, BalanceStore};
use crate::types::UserId;
use crate::user::{ReferralLink, User};
use tracing::error;

/** 8.1: main ledger struct. state lives in the store, not here */
#[derive(Debug)]
pub struct Ledger<S: Storage, C: ConfigProvider> {
    pub(super) coordinator: Coordinator<S>,
    pub(super) settings: C,
    pub(super) config: ServiceConfig,
    pub(super) distributor: RewardDistributor,
}

impl<S: Storage, C: ConfigProvider> Ledger<S, C> {
    /// The caller builds `storage`, so the row-lock wait is whatever it was
    /// built with. [`MemoryStorage::from_config`](crate::store::MemoryStorage::from_config)
    /// takes it from the same `config`.
    pub fn new(storage: S, settings: C, config: ServiceConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let distributor = RewardDistributor::new(config.reward_asset);
        Ok(Self {
            coordinator: Coordinator::new(storage),
            settings,
            config,
            distributor,
        })
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn storage(&self) -> &S {
        self.coordinator.storage()
    }

    /// Context with the configured default deadline.
    pub fn context(&self) -> RequestContext {
        RequestContext::with_timeout(self.config.default_deadline())
    }

    /// One snapshot per operation.
    pub(super) async fn load_settings(&self) -> LedgerResult<ConfigSnapshot> {
        ConfigSnapshot::load(&self.settings).await.map_err(|err| {
            error!(error = %err, "could not load runtime settings");
            LedgerError::Config(err)
        })
    }

    pub(super) async fn begin(&self, ctx: &RequestContext) -> LedgerResult<UnitOfWork<S::Tx>> {
        self.coordinator.begin(ctx).await
    }

    pub(super) fn ancestors_of(&self, link: &ReferralLink) -> Vec<Ancestor> {
        ancestors_up_to(&link.chain, self.config.max_reward_depth)
    }

    // 8.9: read-only queries. each opens a unit of work and drops it.

    pub async fn user(&self, id: UserId) -> LedgerResult<Option<User>> {
        let uow = self.begin(&self.context()).await?;
        Ok(uow.user(id).await?)
    }

    pub async fn user_by_address(&self, address: &str) -> LedgerResult<Option<User>> {
        let uow = self.begin(&self.context()).await?;
        Ok(uow.user_by_address(address).await?)
    }

    pub async fn balance(&self, user: UserId) -> LedgerResult<Option<Balance>> {
        let uow = self.begin(&self.context()).await?;
        Ok(uow.balance(user).await?)
    }

    pub async fn referral_link(&self, user: UserId) -> LedgerResult<Option<ReferralLink>> {
        let uow = self.begin(&self.context()).await?;
        Ok(uow.link(user).await?)
    }

    pub async fn invite_code(&self, user: UserId) -> LedgerResult<Option<InviteCode>> {
        let uow = self.begin(&self.context()).await?;
        Ok(uow.link(user).await?.map(|_| InviteCode::for_user(user)))
    }

    pub async fn team_summary(&self, user: UserId) -> LedgerResult<Option<TeamSummary>> {
        let uow = self.begin(&self.context()).await?;
        Ok(resolver::team_summary(&*uow, user).await?)
    }

    pub async fn direct_recruits(&self, user: UserId) -> LedgerResult<Vec<UserId>> {
        let uow = self.begin(&self.context()).await?;
        Ok(resolver::direct_recruits(&*uow, user).await?)
    }

    pub async fn team_members(&self, user: UserId) -> LedgerResult<Vec<UserId>> {
        let uow = self.begin(&self.context()).await?;
        Ok(resolver::team_members(&*uow, user).await?)
    }

    pub async fn entries(&self, user: UserId) -> LedgerResult<Vec<LedgerEntry>> {
        let uow = self.begin(&self.context()).await?;
        Ok(uow.entries_for_user(user).await?)
    }

    pub async fn rewards(&self, user: UserId) -> LedgerResult<Vec<RewardEntry>> {
        let uow = self.begin(&self.context()).await?;
        Ok(uow.rewards_for_user(user).await?)
    }

    pub async fn withdraws(
        &self,
        user: UserId,
        status: Option<WithdrawStatus>,
    ) -> LedgerResult<Vec<WithdrawRequest>> {
        let uow = self.begin(&self.context()).await?;
        Ok(uow.withdraws_for_user(user, status).await?)
    }
}
