// 1.0: all the primitives live here. ids, asset kinds, balance fields, timestamps,
// event references. each id is a newtype so the compiler catches mixups.

use crate::records::RewardReason;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct UserId(pub u64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RewardId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WithdrawId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TradeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LockId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FeeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotId(pub u64);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// 1.2: asset kinds held per user. primary and secondary are settlement assets,
// reward token is the platform token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    Primary,
    Secondary,
    RewardToken,
}

impl AssetKind {
    pub fn symbol(&self) -> &'static str {
        match self {
            AssetKind::Primary => "USDT",
            AssetKind::Secondary => "USDT2",
            AssetKind::RewardToken => "DHB",
        }
    }

    pub fn spendable_field(&self) -> BalanceField {
        match self {
            AssetKind::Primary => BalanceField::Primary,
            AssetKind::Secondary => BalanceField::Secondary,
            AssetKind::RewardToken => BalanceField::RewardToken,
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

// 1.3: one value-carrying field of a balance row. every ledger entry targets exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceField {
    Primary,
    Secondary,
    RewardToken,
    // primary parked in the locked pool
    Locked,
}

impl BalanceField {
    pub fn asset(&self) -> AssetKind {
        match self {
            BalanceField::Primary | BalanceField::Locked => AssetKind::Primary,
            BalanceField::Secondary => AssetKind::Secondary,
            BalanceField::RewardToken => AssetKind::RewardToken,
        }
    }
}

impl fmt::Display for BalanceField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BalanceField::Locked => write!(f, "locked {}", AssetKind::Primary),
            other => write!(f, "{}", other.asset()),
        }
    }
}

// 1.4: reference to the external action that triggered an operation
// (chain tx hash, request id). doubles as the idempotency handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventRef(String);

impl EventRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyScope {
    Deposit,
    Withdraw,
    Trade,
    Reward(RewardReason),
}

/// One event may drive several effects (a deposit and its rewards), so the key
/// is scoped by what it guards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub scope: KeyScope,
    pub event: EventRef,
}

impl IdempotencyKey {
    pub fn new(scope: KeyScope, event: &EventRef) -> Self {
        Self {
            scope,
            event: event.clone(),
        }
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.scope, self.event)
    }
}

// 1.5: millisecond timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp_millis())
    }

    pub fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locked_field_maps_to_primary() {
        assert_eq!(BalanceField::Locked.asset(), AssetKind::Primary);
        assert_eq!(AssetKind::RewardToken.spendable_field(), BalanceField::RewardToken);
    }

    #[test]
    fn idempotency_keys_are_scoped() {
        let event = EventRef::new("0xabc");
        let deposit = IdempotencyKey::new(KeyScope::Deposit, &event);
        let reward = IdempotencyKey::new(KeyScope::Reward(RewardReason::DepositReferral), &event);
        assert_ne!(deposit, reward);
    }

    #[test]
    fn timestamp_now_is_positive() {
        assert!(Timestamp::now().as_millis() > 0);
    }
}
