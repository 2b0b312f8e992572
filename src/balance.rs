//! Per-user balance aggregate.
//!
//! A balance row holds the spendable assets, the locked primary pool and the
//! running totals. It only changes through [`Balance::apply`], which takes one
//! posting and refuses anything that would leave a field negative.

use crate::money::Amount;
use crate::records::{EntryKind, Posting, RewardCategory};
use crate::types::{BalanceField, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub user: UserId,
    pub primary: Amount,
    pub secondary: Amount,
    pub reward_token: Amount,
    pub locked: Amount,
    pub recommend_total: Amount,
    pub area_total: Amount,
    pub tier_total: Amount,
    pub location_total: Amount,
    pub total_deposited: Amount,
    pub total_withdrawn: Amount,
    // primary value moved into this user's downline
    pub team_volume: Amount,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BalanceError {
    #[error("insufficient {field}: available {available}, requested {requested}")]
    Insufficient {
        field: BalanceField,
        available: Amount,
        requested: Amount,
    },
    #[error("{what} would go negative")]
    NegativeTotal { what: &'static str },
    #[error("amount overflow")]
    Overflow,
}

impl Balance {
    pub fn new(user: UserId, timestamp: Timestamp) -> Self {
        Self {
            user,
            primary: Amount::ZERO,
            secondary: Amount::ZERO,
            reward_token: Amount::ZERO,
            locked: Amount::ZERO,
            recommend_total: Amount::ZERO,
            area_total: Amount::ZERO,
            tier_total: Amount::ZERO,
            location_total: Amount::ZERO,
            total_deposited: Amount::ZERO,
            total_withdrawn: Amount::ZERO,
            team_volume: Amount::ZERO,
            created_at: timestamp,
            updated_at: timestamp,
        }
    }

    pub fn get(&self, field: BalanceField) -> Amount {
        match field {
            BalanceField::Primary => self.primary,
            BalanceField::Secondary => self.secondary,
            BalanceField::RewardToken => self.reward_token,
            BalanceField::Locked => self.locked,
        }
    }

    fn slot(&mut self, field: BalanceField) -> &mut Amount {
        match field {
            BalanceField::Primary => &mut self.primary,
            BalanceField::Secondary => &mut self.secondary,
            BalanceField::RewardToken => &mut self.reward_token,
            BalanceField::Locked => &mut self.locked,
        }
    }

    pub fn total(&self, category: RewardCategory) -> Amount {
        match category {
            RewardCategory::Recommend => self.recommend_total,
            RewardCategory::Area => self.area_total,
            RewardCategory::Tier => self.tier_total,
            RewardCategory::Location => self.location_total,
        }
    }

    pub fn has_deposited(&self) -> bool {
        self.total_deposited.is_positive()
    }

    /// Applies one posting and returns the resulting value of the targeted field.
    /// On error the balance is left untouched.
    pub fn apply(&mut self, posting: &Posting, now: Timestamp) -> Result<Amount, BalanceError> {
        let mut next = self.clone();

        let current = next.get(posting.field);
        let after = current.checked_add(posting.amount).ok_or(BalanceError::Overflow)?;
        if after.is_negative() {
            return Err(BalanceError::Insufficient {
                field: posting.field,
                available: current,
                requested: posting.amount.negate(),
            });
        }
        *next.slot(posting.field) = after;

        match posting.kind {
            EntryKind::Deposit => {
                next.total_deposited = bump(next.total_deposited, posting.amount, "total_deposited")?;
            }
            EntryKind::Withdraw => {
                next.total_withdrawn =
                    bump(next.total_withdrawn, posting.amount.negate(), "total_withdrawn")?;
            }
            EntryKind::WithdrawRefund => {
                next.total_withdrawn =
                    bump(next.total_withdrawn, posting.amount.negate(), "total_withdrawn")?;
            }
            EntryKind::Reward => {
                if let Some(category) = posting.category {
                    let total = next.total(category);
                    let bumped = bump(total, posting.amount, "reward total")?;
                    match category {
                        RewardCategory::Recommend => next.recommend_total = bumped,
                        RewardCategory::Area => next.area_total = bumped,
                        RewardCategory::Tier => next.tier_total = bumped,
                        RewardCategory::Location => next.location_total = bumped,
                    }
                }
            }
            _ => {}
        }

        next.updated_at = now;
        *self = next;
        Ok(after)
    }

    /// Team volume is a statistic, lowering it floors at zero.
    pub fn adjust_team_volume(&mut self, delta: Amount, now: Timestamp) {
        self.team_volume = if delta.is_negative() {
            self.team_volume.saturating_sub_floor(delta.negate())
        } else {
            self.team_volume.saturating_add(delta)
        };
        self.updated_at = now;
    }
}

fn bump(total: Amount, delta: Amount, what: &'static str) -> Result<Amount, BalanceError> {
    let next = total.checked_add(delta).ok_or(BalanceError::Overflow)?;
    if next.is_negative() {
        return Err(BalanceError::NegativeTotal { what });
    }
    Ok(next)
}
