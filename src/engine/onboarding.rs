//! Onboarding and the referrer correction flow.

use super::core::Ledger;
use super::results::{ClaimReceipt, LedgerResult, OnboardReceipt, Outcome, RejectReason};
use crate::balance::Balance;
use crate::coordinator::RequestContext;
use crate::referral::codec::{InviteCode, ReferralChain};
use crate::referral::direct_referrer;
use crate::settings::ConfigProvider;
use crate::store::{BalanceStore, LedgerStore, ReferralLinkStore, Storage, UserDirectory};
use crate::types::UserId;
use crate::user::{NewUser, ReferralLink};
use tracing::info;

impl<S: Storage, C: ConfigProvider> Ledger<S, C> {
    /// Registers `address` under the owner of `invite`. A known address gets its
    /// existing user back.
    pub async fn onboard(
        &self,
        ctx: &RequestContext,
        address: &str,
        invite: &InviteCode,
    ) -> LedgerResult<Outcome<OnboardReceipt>> {
        ctx.run(self.onboard_inner(ctx, address.trim(), invite)).await
    }

    async fn onboard_inner(
        &self,
        ctx: &RequestContext,
        address: &str,
        invite: &InviteCode,
    ) -> LedgerResult<Outcome<OnboardReceipt>> {
        let mut uow = self.begin(ctx).await?;

        if address.is_empty() {
            return uow.reject(RejectReason::InvalidAddress).await;
        }

        if let Some(user) = uow.user_by_address(address).await? {
            let chain = uow
                .link(user.id)
                .await?
                .map(|l| l.chain)
                .unwrap_or_else(ReferralChain::root);
            uow.rollback().await;
            return Ok(Outcome::Completed(OnboardReceipt {
                invite_code: InviteCode::for_user(user.id),
                user,
                chain,
                existing: true,
            }));
        }

        let (chain, referrer) = if invite.as_str() == self.config.root_invite_code {
            (ReferralChain::root(), None)
        } else {
            let referrer = match invite.decode() {
                Ok(id) => id,
                Err(_) => return uow.reject(RejectReason::InvalidReferralCode).await,
            };
            let link = match uow.link(referrer).await? {
                Some(link) => link,
                None => return uow.reject(RejectReason::InvalidReferralCode).await,
            };
            let active = uow
                .balance(referrer)
                .await?
                .map_or(false, |b| b.has_deposited());
            if !active {
                return uow.reject(RejectReason::ReferrerNotActive).await;
            }
            (link.chain.extend(referrer), Some(referrer))
        };

        let now = uow.now();
        let user = uow
            .create_user(NewUser {
                address: address.to_string(),
                credential_hash: String::new(),
            })
            .await?;
        uow.create_balance(Balance::new(user.id, now)).await?;
        uow.create_link(ReferralLink::new(user.id, chain.clone(), now)).await?;
        if let Some(referrer) = referrer {
            uow.adjust_recruits(referrer, 1).await?;
        }
        uow.commit().await?;

        info!(user = %user.id, chain = %chain, "user onboarded");
        Ok(Outcome::Completed(OnboardReceipt {
            invite_code: InviteCode::for_user(user.id),
            user,
            chain,
            existing: false,
        }))
    }

    /// Moves a user who has never deposited under a different referrer. The
    /// user's own downline moves along with them.
    pub async fn claim_referrer(
        &self,
        ctx: &RequestContext,
        user: UserId,
        invite: &InviteCode,
    ) -> LedgerResult<Outcome<ClaimReceipt>> {
        ctx.run(self.claim_referrer_inner(ctx, user, invite)).await
    }

    async fn claim_referrer_inner(
        &self,
        ctx: &RequestContext,
        user: UserId,
        invite: &InviteCode,
    ) -> LedgerResult<Outcome<ClaimReceipt>> {
        let mut uow = self.begin(ctx).await?;

        let link = match uow.link(user).await? {
            Some(link) => link,
            None => return uow.reject(RejectReason::UnknownUser).await,
        };
        if link.is_root() {
            return uow.reject(RejectReason::ReferrerLocked).await;
        }

        // serialize with anything else debiting this user
        let balance = match uow.balance_for_update(user).await? {
            Some(balance) => balance,
            None => return uow.reject(RejectReason::UnknownUser).await,
        };
        if balance.has_deposited() {
            return uow.reject(RejectReason::ReferrerLocked).await;
        }

        let candidate = match invite.decode() {
            Ok(id) => id,
            Err(_) => return uow.reject(RejectReason::InvalidReferralCode).await,
        };
        let previous = direct_referrer(&link.chain);

        if candidate == user || Some(candidate) == previous {
            uow.rollback().await;
            return Ok(Outcome::Completed(ClaimReceipt {
                user,
                previous,
                referrer: previous,
                chain: link.chain,
                changed: false,
                moved_members: 0,
            }));
        }

        let candidate_link = match uow.link(candidate).await? {
            Some(link) => link,
            None => return uow.reject(RejectReason::InvalidReferralCode).await,
        };

        let old_code = link.chain.extend(user);
        if candidate_link.chain.is_within(&old_code) {
            return uow.reject(RejectReason::ReferralCycle).await;
        }

        let new_chain = candidate_link.chain.extend(candidate);
        let new_code = new_chain.extend(user);

        // commit refuses these moves if the tree changed since the reads above
        let members = uow.links_within(&old_code).await?;
        for member in &members {
            if let Some(rebased) = member.chain.rebase(&old_code, &new_code) {
                uow.update_chain(member.user, member.chain.clone(), rebased).await?;
            }
        }
        uow.update_chain(user, link.chain.clone(), new_chain.clone()).await?;
        if let Some(previous) = previous {
            uow.adjust_recruits(previous, -1).await?;
        }
        uow.adjust_recruits(candidate, 1).await?;
        uow.commit().await?;

        info!(
            user = %user,
            referrer = %candidate,
            moved = members.len(),
            "referrer changed"
        );
        Ok(Outcome::Completed(ClaimReceipt {
            user,
            previous,
            referrer: Some(candidate),
            chain: new_chain,
            changed: true,
            moved_members: members.len(),
        }))
    }
}
