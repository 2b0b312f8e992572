// 3.0: referral tree. codec owns the chain format, resolver walks it.

pub mod codec;
pub mod resolver;

pub use codec::{encode_segment, ChainError, InviteCode, ReferralChain};
pub use resolver::{ancestors_up_to, direct_referrer, Ancestor, TeamSummary};
