//! Trade against the locked pool.
//!
//! Leg A releases locked primary into spendable primary net of fee and burn.
//! Leg B sells reward tokens; its net is owed to the user off-ledger and only
//! recorded on the trade. The aux amount is the base for trade referral rewards.

use super::core::Ledger;
use super::locking::consume_lock_records;
use super::results::{LedgerResult, Outcome, RejectReason, TradeReceipt};
use crate::coordinator::RequestContext;
use crate::money::Amount;
use crate::records::{EntryKind, FeeKind, FeeRecord, FeeSource, Posting, RewardReason, TradeRecord};
use crate::rewards::RewardRequest;
use crate::settings::ConfigProvider;
use crate::store::{BalanceStore, IdKind, LedgerStore, ReferralLinkStore, Storage, StoreError};
use crate::types::{AssetKind, BalanceField, EventRef, FeeId, IdempotencyKey, KeyScope, TradeId, UserId};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// One leg after fees: `unit = gross / 100`, `fee = unit × fee_rate`,
/// `burn = unit × burn_rate`, `net = gross − fee − burn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeSplit {
    pub gross: Amount,
    pub net: Amount,
    pub fee: Amount,
    pub burn: Amount,
}

pub fn trade_split(gross: Amount, fee_rate: u32, burn_rate: u32) -> TradeSplit {
    let unit = gross.raw() / 100;
    let fee = Amount::from_raw(unit.saturating_mul(fee_rate as i64));
    let burn = Amount::from_raw(unit.saturating_mul(burn_rate as i64));
    let net = gross.saturating_sub_floor(fee).saturating_sub_floor(burn);
    TradeSplit { gross, net, fee, burn }
}

impl<S: Storage, C: ConfigProvider> Ledger<S, C> {
    pub async fn trade_lock(
        &self,
        ctx: &RequestContext,
        user: UserId,
        amount_a: Amount,
        amount_b: Amount,
        amount_aux: Amount,
        event: &EventRef,
    ) -> LedgerResult<Outcome<TradeReceipt>> {
        ctx.run(self.trade_inner(ctx, user, amount_a, amount_b, amount_aux, event))
            .await
    }

    async fn trade_inner(
        &self,
        ctx: &RequestContext,
        user: UserId,
        amount_a: Amount,
        amount_b: Amount,
        amount_aux: Amount,
        event: &EventRef,
    ) -> LedgerResult<Outcome<TradeReceipt>> {
        let settings = self.load_settings().await?;
        let mut uow = self.begin(ctx).await?;

        if amount_a.is_negative()
            || amount_b.is_negative()
            || amount_aux.is_negative()
            || (amount_a.is_zero() && amount_b.is_zero())
        {
            return uow.reject(RejectReason::InvalidAmount).await;
        }

        let key = IdempotencyKey::new(KeyScope::Trade, event);
        if uow.key_used(&key).await? {
            if let Some(trade) = uow.trade_for_event(event).await? {
                let same_request = trade.user == user
                    && trade.amount_a == amount_a
                    && trade.amount_b == amount_b
                    && trade.amount_aux == amount_aux;
                if !same_request {
                    return uow.reject(RejectReason::RequestRefReused).await;
                }
                let entries = uow
                    .entries_for_event(event)
                    .await?
                    .into_iter()
                    .filter(|e| e.user == user && e.kind != EntryKind::Reward)
                    .collect();
                let rewards = uow.rewards_for_event(event, RewardReason::TradeReferral).await?;
                uow.rollback().await;
                debug!(event = %event, "trade replayed");
                return Ok(Outcome::Completed(TradeReceipt {
                    trade,
                    entries,
                    rewards,
                    replayed: true,
                }));
            }
        }

        let link = match uow.link(user).await? {
            Some(link) => link,
            None => return uow.reject(RejectReason::UnknownUser).await,
        };
        let balance = match uow.balance_for_update(user).await? {
            Some(balance) => balance,
            None => return uow.reject(RejectReason::UnknownUser).await,
        };
        if balance.locked < amount_a {
            return uow
                .reject(RejectReason::InsufficientBalance {
                    field: BalanceField::Locked,
                    available: balance.locked,
                    requested: amount_a,
                })
                .await;
        }
        if balance.reward_token < amount_b {
            return uow
                .reject(RejectReason::InsufficientBalance {
                    field: BalanceField::RewardToken,
                    available: balance.reward_token,
                    requested: amount_b,
                })
                .await;
        }

        let leg_a = trade_split(amount_a, settings.trade_fee_rate, settings.trade_burn_rate);
        let leg_b = trade_split(amount_b, settings.trade_fee_rate, settings.trade_burn_rate);

        uow.claim_key(key).await?;
        let mut entry_ids = Vec::new();
        if amount_a.is_positive() {
            consume_lock_records(&mut *uow, user, amount_a).await?;
            entry_ids.push(
                uow.post(
                    Posting::new(user, BalanceField::Locked, amount_a.negate(), EntryKind::TradeUnlock)
                        .with_event(Some(event)),
                )
                .await?,
            );
            if leg_a.net.is_positive() {
                entry_ids.push(
                    uow.post(
                        Posting::new(user, BalanceField::Primary, leg_a.net, EntryKind::TradeUnlock)
                            .with_event(Some(event)),
                    )
                    .await?,
                );
            }
        }
        if amount_b.is_positive() {
            entry_ids.push(
                uow.post(
                    Posting::new(user, BalanceField::RewardToken, amount_b.negate(), EntryKind::TradeSell)
                        .with_event(Some(event)),
                )
                .await?,
            );
        }

        let now = uow.now();
        let retained = [
            (AssetKind::Primary, FeeKind::Fee, leg_a.fee),
            (AssetKind::Primary, FeeKind::Burn, leg_a.burn),
            (AssetKind::RewardToken, FeeKind::Fee, leg_b.fee),
            (AssetKind::RewardToken, FeeKind::Burn, leg_b.burn),
        ];
        for (asset, kind, amount) in retained {
            if !amount.is_positive() {
                continue;
            }
            let record = FeeRecord {
                id: FeeId(uow.next_id(IdKind::Fee)),
                user,
                asset,
                amount,
                kind,
                source: FeeSource::Trade,
                event: Some(event.clone()),
                created_at: now,
            };
            uow.record_fee(record).await?;
        }

        let trade = TradeRecord {
            id: TradeId(uow.next_id(IdKind::Trade)),
            user,
            amount_a,
            net_a: leg_a.net,
            amount_b,
            net_b: leg_b.net,
            amount_aux,
            event: event.clone(),
            created_at: now,
        };
        uow.record_trade(trade.clone()).await?;

        let ancestors = self.ancestors_of(&link);
        let distribution = self
            .distributor
            .distribute(
                &mut *uow,
                RewardRequest {
                    source_user: user,
                    ancestors: &ancestors,
                    base: amount_aux,
                    rates: &settings.trade_reward_rates,
                    reason: RewardReason::TradeReferral,
                    event,
                },
            )
            .await?;

        let report = uow.commit().await?;
        let entries = entry_ids
            .iter()
            .map(|id| {
                report.entry(*id).cloned().ok_or(StoreError::NotFound {
                    what: "ledger entry",
                    id: id.0,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            user = %user,
            amount_a = %amount_a,
            net_a = %leg_a.net,
            amount_b = %amount_b,
            net_b = %leg_b.net,
            rewards = distribution.rewards.len(),
            "trade settled"
        );
        Ok(Outcome::Completed(TradeReceipt {
            trade,
            entries,
            rewards: distribution.rewards,
            replayed: false,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_divides_by_hundred_first() {
        // 199 / 100 = 1 unit, fee 5, burn 5, net 189
        let split = trade_split(Amount::from_raw(199), 5, 5);
        assert_eq!(split.fee, Amount::from_raw(5));
        assert_eq!(split.burn, Amount::from_raw(5));
        assert_eq!(split.net, Amount::from_raw(189));
    }

    #[test]
    fn split_is_conservative() {
        let gross = Amount::from_units(250);
        let split = trade_split(gross, 7, 3);
        assert_eq!(split.net.raw() + split.fee.raw() + split.burn.raw(), gross.raw());
        assert_eq!(split.net, Amount::from_units(225));
    }

    #[test]
    fn zero_rates_keep_everything() {
        let split = trade_split(Amount::from_units(3), 0, 0);
        assert_eq!(split.net, Amount::from_units(3));
    }
}
