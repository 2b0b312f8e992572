// 3.3 resolver.rs: ancestor walks and team queries.
// ancestors come back nearest first with an explicit level, so a skipped
// corrupt segment never shifts the levels of the ones above it.

use super::codec::ReferralChain;
use crate::money::Amount;
use crate::store::{BalanceStore, ReferralLinkStore, StoreResult};
use crate::types::UserId;
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ancestor {
    // 1 = direct referrer
    pub level: u32,
    pub user: UserId,
}

pub fn ancestors_up_to(chain: &ReferralChain, depth: usize) -> Vec<Ancestor> {
    let mut out = Vec::new();
    for (index, segment) in chain.ancestors().into_iter().take(depth).enumerate() {
        let level = index as u32 + 1;
        match segment {
            Ok(user) => out.push(Ancestor { level, user }),
            Err(err) => warn!(depth = level, error = %err, "skipping corrupt referral segment"),
        }
    }
    out
}

pub fn direct_referrer(chain: &ReferralChain) -> Option<UserId> {
    chain.ancestors().into_iter().next().and_then(|segment| segment.ok())
}

/// Users whose direct referrer is `user`.
pub async fn direct_recruits<T>(store: &T, user: UserId) -> StoreResult<Vec<UserId>>
where
    T: ReferralLinkStore + ?Sized,
{
    let link = match store.link(user).await? {
        Some(link) => link,
        None => return Ok(Vec::new()),
    };
    let code = link.chain.extend(user);
    Ok(store
        .links_with_chain(&code)
        .await?
        .into_iter()
        .map(|l| l.user)
        .collect())
}

/// Everyone below `user`, any depth.
pub async fn team_members<T>(store: &T, user: UserId) -> StoreResult<Vec<UserId>>
where
    T: ReferralLinkStore + ?Sized,
{
    let link = match store.link(user).await? {
        Some(link) => link,
        None => return Ok(Vec::new()),
    };
    let code = link.chain.extend(user);
    Ok(store
        .links_within(&code)
        .await?
        .into_iter()
        .map(|l| l.user)
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamSummary {
    pub user: UserId,
    pub direct: usize,
    pub direct_active: usize,
    pub team: usize,
    pub team_active: usize,
    pub team_volume: Amount,
}

/// Counts plus the "active" variants, where active means the member has
/// deposited at least once.
pub async fn team_summary<T>(store: &T, user: UserId) -> StoreResult<Option<TeamSummary>>
where
    T: ReferralLinkStore + BalanceStore + ?Sized,
{
    let link = match store.link(user).await? {
        Some(link) => link,
        None => return Ok(None),
    };
    let code = link.chain.extend(user);
    let team = store.links_within(&code).await?;

    let mut summary = TeamSummary {
        user,
        direct: 0,
        direct_active: 0,
        team: team.len(),
        team_active: 0,
        team_volume: store
            .balance(user)
            .await?
            .map(|b| b.team_volume)
            .unwrap_or(Amount::ZERO),
    };

    for member in &team {
        let active = store
            .balance(member.user)
            .await?
            .map_or(false, |b| b.has_deposited());
        let direct = member.chain == code;
        if direct {
            summary.direct += 1;
        }
        if active {
            summary.team_active += 1;
            if direct {
                summary.direct_active += 1;
            }
        }
    }

    Ok(Some(summary))
}
