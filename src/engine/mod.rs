// 8.0: balance ledger. every public operation loads one settings snapshot,
// runs one unit of work under the caller's deadline, and returns an Outcome.
// rejections write nothing; hard failures come back as LedgerError.

mod core;
mod deposit;
mod exchange;
mod locking;
mod onboarding;
mod results;
mod trade;
mod transfer;
mod withdraw;

pub use self::core::Ledger;
pub use results::{
    ClaimReceipt, DepositReceipt, ExchangeReceipt, LedgerError, LedgerResult, LockReceipt,
    OnboardReceipt, Outcome, RejectReason, Rejection, ReleaseReceipt, TradeReceipt,
    TransferReceipt, WithdrawReceipt, WithdrawUpdate,
};
pub use trade::{trade_split, TradeSplit};
