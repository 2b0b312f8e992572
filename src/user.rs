// 2.0 user.rs: directory rows. a user, its referral link, and the earning slots
// an external scheduler manages for it.

use crate::money::Amount;
use crate::referral::codec::ReferralChain;
use crate::types::{SlotId, Timestamp, UserId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub address: String,
    pub credential_hash: String,
    pub created_at: Timestamp,
}

/// Staged insert; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUser {
    pub address: String,
    pub credential_hash: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferralLink {
    pub user: UserId,
    pub chain: ReferralChain,
    pub direct_recruits: u64,
    pub updated_at: Timestamp,
}

impl ReferralLink {
    pub fn new(user: UserId, chain: ReferralChain, now: Timestamp) -> Self {
        Self {
            user,
            chain,
            direct_recruits: 0,
            updated_at: now,
        }
    }

    pub fn is_root(&self) -> bool {
        self.chain.is_root()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Running,
    Stopped,
}

/// An earning position. Exchanges draw against its remaining capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EarningSlot {
    pub id: SlotId,
    pub user: UserId,
    pub status: SlotStatus,
    pub current_max: Amount,
    pub current_max_new: Amount,
}

impl EarningSlot {
    pub fn is_running(&self) -> bool {
        self.status == SlotStatus::Running
    }

    pub fn remaining(&self) -> Amount {
        self.current_max.saturating_sub_floor(self.current_max_new)
    }

    pub fn can_absorb(&self, amount: Amount) -> bool {
        match self.current_max_new.checked_add(amount) {
            Some(used) => used <= self.current_max,
            None => false,
        }
    }
}
