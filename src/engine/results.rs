// 8.0.2: result types and errors for ledger operations.

use crate::config::ConfigError;
use crate::money::Amount;
use crate::records::{LedgerEntry, LockRecord, RewardEntry, TradeRecord, WithdrawRequest, WithdrawStatus};
use crate::referral::codec::{InviteCode, ReferralChain};
use crate::store::StoreError;
use crate::types::{BalanceField, UserId};
use crate::user::User;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Why an operation was refused. Nothing was written when one of these comes back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    InvalidAmount,
    InvalidAddress,
    BelowDust { minimum: Amount },
    BelowMinimum { minimum: Amount },
    AboveMaximum { maximum: Amount },
    InsufficientBalance {
        field: BalanceField,
        available: Amount,
        requested: Amount,
    },
    SelfTransfer,
    UnsupportedAsset,
    WithdrawalsDisabled,
    UnknownUser,
    InvalidReferralCode,
    ReferrerNotActive,
    ReferrerLocked,
    ReferralCycle,
    NoActiveSlot,
    SlotCapacityExceeded { capacity: Amount, requested: Amount },
    NonPositiveConversion,
    InvalidStatusTransition {
        from: WithdrawStatus,
        to: WithdrawStatus,
    },
    UnknownWithdraw,
    RequestRefReused,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::InvalidAmount => write!(f, "amount must be positive"),
            RejectReason::InvalidAddress => write!(f, "address is empty"),
            RejectReason::BelowDust { minimum } => write!(f, "amount below dust threshold: {}", minimum),
            RejectReason::BelowMinimum { minimum } => write!(f, "min amount: {}", minimum),
            RejectReason::AboveMaximum { maximum } => write!(f, "max amount: {}", maximum),
            RejectReason::InsufficientBalance {
                field,
                available,
                requested,
            } => write!(
                f,
                "insufficient {}: available {}, requested {}",
                field, available, requested
            ),
            RejectReason::SelfTransfer => write!(f, "cannot transfer to self"),
            RejectReason::UnsupportedAsset => write!(f, "asset not supported for this operation"),
            RejectReason::WithdrawalsDisabled => write!(f, "withdrawals are closed"),
            RejectReason::UnknownUser => write!(f, "user not found"),
            RejectReason::InvalidReferralCode => write!(f, "invalid referral code"),
            RejectReason::ReferrerNotActive => write!(f, "referrer has never deposited"),
            RejectReason::ReferrerLocked => write!(f, "referrer can no longer be changed"),
            RejectReason::ReferralCycle => write!(f, "new referrer is inside the user's own team"),
            RejectReason::NoActiveSlot => write!(f, "no running earning slot"),
            RejectReason::SlotCapacityExceeded { capacity, requested } => write!(
                f,
                "earning slot capacity {} cannot absorb {}",
                capacity, requested
            ),
            RejectReason::NonPositiveConversion => write!(f, "converted amount is not positive"),
            RejectReason::InvalidStatusTransition { from, to } => {
                write!(f, "withdraw cannot move from {} to {}", from, to)
            }
            RejectReason::UnknownWithdraw => write!(f, "withdraw request not found"),
            RejectReason::RequestRefReused => {
                write!(f, "request reference already used by a different request")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: RejectReason,
    pub message: String,
}

impl Rejection {
    pub fn new(reason: RejectReason) -> Self {
        let message = reason.to_string();
        Self { reason, message }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for Rejection {}

/// Business-level result. Infrastructure failures travel as [`LedgerError`].
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Completed(T),
    Rejected(Rejection),
}

impl<T> Outcome<T> {
    pub fn rejected(reason: RejectReason) -> Self {
        Outcome::Rejected(Rejection::new(reason))
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, Outcome::Completed(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Outcome::Rejected(_))
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Outcome::Completed(value) => Some(value),
            Outcome::Rejected(_) => None,
        }
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Outcome::Completed(_) => None,
            Outcome::Rejected(rejection) => Some(rejection),
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Outcome<U> {
        match self {
            Outcome::Completed(value) => Outcome::Completed(f(value)),
            Outcome::Rejected(rejection) => Outcome::Rejected(rejection),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    #[error("Persistence failure: {0}")]
    Persistence(StoreError),

    #[error("Concurrency conflict: {reason}")]
    ConcurrencyConflict { reason: String },

    #[error("Operation cancelled before commit")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl LedgerError {
    /// The caller may retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::ConcurrencyConflict { .. })
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::LockTimeout(_)
            | StoreError::EventConflict(_)
            | StoreError::DuplicateAddress(_)
            | StoreError::SlotExhausted(_)
            | StoreError::StaleWithdraw { .. }
            | StoreError::StaleChain { .. } => LedgerError::ConcurrencyConflict {
                reason: err.to_string(),
            },
            other => LedgerError::Persistence(other),
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

#[derive(Debug, Clone, PartialEq)]
pub struct OnboardReceipt {
    pub user: User,
    pub chain: ReferralChain,
    pub invite_code: InviteCode,
    // address was already registered, nothing written
    pub existing: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClaimReceipt {
    pub user: UserId,
    pub previous: Option<UserId>,
    pub referrer: Option<UserId>,
    pub chain: ReferralChain,
    pub changed: bool,
    // downline links whose chains were rebased
    pub moved_members: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DepositReceipt {
    pub entry: LedgerEntry,
    pub rewards: Vec<RewardEntry>,
    pub replayed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WithdrawReceipt {
    pub request: WithdrawRequest,
    pub entry: Option<LedgerEntry>,
    pub replayed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WithdrawUpdate {
    pub request: WithdrawRequest,
    pub refund: Option<LedgerEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeReceipt {
    pub debit: LedgerEntry,
    pub credit: LedgerEntry,
    pub converted: Amount,
    pub fee: Amount,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferReceipt {
    pub debit: LedgerEntry,
    pub credit: LedgerEntry,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TradeReceipt {
    pub trade: TradeRecord,
    pub entries: Vec<LedgerEntry>,
    pub rewards: Vec<RewardEntry>,
    pub replayed: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LockReceipt {
    pub record: LockRecord,
    pub entries: Vec<LedgerEntry>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseReceipt {
    // records touched, after consumption
    pub released: Vec<LockRecord>,
    pub entries: Vec<LedgerEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn above_maximum_names_the_bound() {
        let rejection = Rejection::new(RejectReason::AboveMaximum {
            maximum: Amount::from_units(1000),
        });
        assert_eq!(rejection.message, "max amount: 1000.00000");
    }

    #[test]
    fn lock_timeouts_are_retryable() {
        let err: LedgerError = StoreError::LockTimeout(UserId(3)).into();
        assert!(err.is_retryable());

        let err: LedgerError = StoreError::StaleChain { user: UserId(3) }.into();
        assert!(err.is_retryable());

        let err: LedgerError = StoreError::Unavailable("down".into()).into();
        assert!(!err.is_retryable());
        assert!(matches!(err, LedgerError::Persistence(_)));
    }

    #[test]
    fn exhausted_slot_names_the_slot() {
        let err: LedgerError = StoreError::SlotExhausted(crate::types::SlotId(4)).into();
        assert!(err.is_retryable());
        assert_eq!(
            err.to_string(),
            "Concurrency conflict: earning slot 4 has no capacity left"
        );
    }

    #[test]
    fn outcome_helpers() {
        let done: Outcome<u8> = Outcome::Completed(1);
        assert_eq!(done.clone().map(|v| v + 1).completed(), Some(2));
        let no: Outcome<u8> = Outcome::rejected(RejectReason::SelfTransfer);
        assert!(no.is_rejected());
        assert_eq!(no.rejection().map(|r| r.reason.clone()), Some(RejectReason::SelfTransfer));
    }
}
