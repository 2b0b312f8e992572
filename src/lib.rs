// referral-ledger: multi-asset balance ledger with multi-level referral rewards.
// balance-first architecture: every credit and debit is a posting, committed
// atomically with its rewards, fees and idempotency key.
//
// file map (search X.0 for structs, X.1+ for logic):
//   1.x  types.rs: primitives: UserId, AssetKind, BalanceField, EventRef, keys
//   1.1  money.rs: fixed-point Amount, percent and per-mille math
//   2.x  user.rs: users, referral links, earning slots
//   3.x  referral/: chain codec, invite codes, ancestor and team resolution
//   4.x  records.rs: postings, ledger entries, rewards, withdraws, trades, fees, locks
//   4.1  balance.rs: per-user balance row and posting application
//   5.x  rewards.rs: level-rate reward distribution and team volume
//   6.x  store/: storage traits, transactions, in-memory backend
//   6.1  coordinator.rs: request deadlines and units of work
//   7.x  config.rs: static service config, env presets
//   7.1  settings.rs: runtime key/value settings snapshot
//   8.x  engine/: ledger operations: onboarding, deposit, withdraw, exchange,
//        transfer, locking, trade

// domain modules
pub mod balance;
pub mod money;
pub mod records;
pub mod referral;
pub mod rewards;
pub mod types;
pub mod user;

// persistence and orchestration
pub mod coordinator;
pub mod engine;
pub mod store;

// configuration
pub mod config;
pub mod settings;

// re exports for convenience
pub use balance::{Balance, BalanceError};
pub use config::{ConfigError, DustConfig, Environment, ServiceConfig};
pub use coordinator::{Coordinator, RequestContext, UnitOfWork};
pub use engine::*;
pub use money::{Amount, AMOUNT_DECIMALS, AMOUNT_SCALE};
pub use records::*;
pub use referral::{Ancestor, ChainError, InviteCode, ReferralChain, TeamSummary};
pub use rewards::{Distribution, RewardDistributor};
pub use settings::{ConfigProvider, ConfigSnapshot, MemoryConfigProvider, WithdrawLimits};
pub use store::{MemoryStorage, Storage, StoreError};
pub use types::*;
pub use user::{EarningSlot, ReferralLink, SlotStatus, User};
