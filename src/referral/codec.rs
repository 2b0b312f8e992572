// 3.1 codec.rs: referral chain encoding. a chain is the concatenation of its
// ancestors' segments, root first, nearest last. "D1D2" = root 1, then 2.

use crate::types::UserId;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const SEGMENT_DELIMITER: char = 'D';

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    #[error("corrupt segment {segment:?} at position {position} in chain {chain:?}")]
    CorruptSegment {
        chain: String,
        segment: String,
        position: usize,
    },
    #[error("invalid invite code {0:?}")]
    InvalidInviteCode(String),
}

/// `"D" + id`.
pub fn encode_segment(user: UserId) -> String {
    format!("{}{}", SEGMENT_DELIMITER, user.0)
}

/// Ancestor path of one user. Only the codec reads or builds the string form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReferralChain(String);

impl ReferralChain {
    pub fn root() -> Self {
        Self(String::new())
    }

    /// Wraps a stored value as-is. Corrupt values surface when decoded.
    pub fn from_stored(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Chain of someone whose direct referrer is `parent` and whose referrer's
    /// own chain is `self`.
    pub fn extend(&self, parent: UserId) -> Self {
        let mut next = String::with_capacity(self.0.len() + 8);
        next.push_str(&self.0);
        next.push_str(&encode_segment(parent));
        Self(next)
    }

    /// Every segment in stored order (root first), each parsed independently.
    pub fn segments(&self) -> Vec<Result<UserId, ChainError>> {
        if self.0.is_empty() {
            return Vec::new();
        }

        let mut out = Vec::new();
        for (position, piece) in self.0.split(SEGMENT_DELIMITER).enumerate() {
            if position == 0 {
                // text before the first delimiter: empty when well formed
                if !piece.is_empty() {
                    out.push(Err(self.corrupt(piece, position)));
                }
                continue;
            }
            out.push(parse_id(piece).ok_or_else(|| self.corrupt(piece, position)));
        }
        out
    }

    /// Strict decode, root first. Fails on the first corrupt segment.
    pub fn decode(&self) -> Result<Vec<UserId>, ChainError> {
        self.segments().into_iter().collect()
    }

    /// Nearest ancestor first. Corrupt segments stay in place as errors so
    /// callers keep level numbering.
    pub fn ancestors(&self) -> Vec<Result<UserId, ChainError>> {
        let mut segments = self.segments();
        segments.reverse();
        segments
    }

    pub fn depth(&self) -> usize {
        self.segments().len()
    }

    /// Whether a user holding this chain sits under the owner of `code`, where
    /// `code` is the owner's chain extended with the owner's id. Matches on
    /// segment boundaries only, so `D1` does not cover `D12`.
    pub fn is_within(&self, code: &ReferralChain) -> bool {
        if code.is_root() {
            return false;
        }
        match self.0.strip_prefix(code.as_str()) {
            Some(rest) => rest.is_empty() || rest.starts_with(SEGMENT_DELIMITER),
            None => false,
        }
    }

    /// Swaps the leading `from` code for `to`. `None` when this chain is not
    /// under `from`.
    pub fn rebase(&self, from: &ReferralChain, to: &ReferralChain) -> Option<ReferralChain> {
        if !self.is_within(from) {
            return None;
        }
        let rest = &self.0[from.0.len()..];
        Some(Self(format!("{}{}", to.0, rest)))
    }

    fn corrupt(&self, piece: &str, position: usize) -> ChainError {
        ChainError::CorruptSegment {
            chain: self.0.clone(),
            segment: piece.to_string(),
            position,
        }
    }
}

impl fmt::Display for ReferralChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn parse_id(piece: &str) -> Option<UserId> {
    if piece.is_empty() || !piece.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    match piece.parse::<u64>() {
        Ok(0) | Err(_) => None,
        Ok(id) => Some(UserId(id)),
    }
}

// 3.2: shareable invite code, standard base64 of the owner's segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InviteCode(String);

impl InviteCode {
    pub fn for_user(user: UserId) -> Self {
        Self(STANDARD.encode(encode_segment(user)))
    }

    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn decode(&self) -> Result<UserId, ChainError> {
        let invalid = || ChainError::InvalidInviteCode(self.0.clone());

        let bytes = STANDARD.decode(self.0.trim()).map_err(|_| invalid())?;
        let text = String::from_utf8(bytes).map_err(|_| invalid())?;
        let digits = text.strip_prefix(SEGMENT_DELIMITER).ok_or_else(invalid)?;
        parse_id(digits).ok_or_else(invalid)
    }
}

impl fmt::Display for InviteCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_and_decode() {
        let chain = ReferralChain::root().extend(UserId(1)).extend(UserId(2));
        assert_eq!(chain.as_str(), "D1D2");
        assert_eq!(chain.decode().unwrap(), vec![UserId(1), UserId(2)]);
        assert_eq!(chain.depth(), 2);
    }

    #[test]
    fn ancestors_are_nearest_first() {
        let chain = ReferralChain::from_stored("D1D2D3");
        let ancestors: Vec<UserId> = chain.ancestors().into_iter().map(|a| a.unwrap()).collect();
        assert_eq!(ancestors, vec![UserId(3), UserId(2), UserId(1)]);
    }

    #[test]
    fn empty_chain_has_no_ancestors() {
        assert!(ReferralChain::root().ancestors().is_empty());
        assert!(ReferralChain::root().decode().unwrap().is_empty());
    }

    #[test]
    fn corrupt_segments_are_reported_in_place() {
        let chain = ReferralChain::from_stored("D1DxD0D4");
        let segments = chain.segments();
        assert_eq!(segments.len(), 4);
        assert!(segments[0].is_ok());
        assert!(segments[1].is_err());
        assert!(segments[2].is_err());
        assert_eq!(segments[3], Ok(UserId(4)));
        assert!(chain.decode().is_err());
    }

    #[test]
    fn missing_leading_delimiter_is_corrupt() {
        let chain = ReferralChain::from_stored("1D2");
        let segments = chain.segments();
        assert!(segments[0].is_err());
        assert_eq!(segments[1], Ok(UserId(2)));
    }

    #[test]
    fn double_delimiter_is_corrupt() {
        let chain = ReferralChain::from_stored("D1DD2");
        assert_eq!(chain.segments().iter().filter(|s| s.is_err()).count(), 1);
    }

    #[test]
    fn team_match_respects_segment_boundaries() {
        let code = ReferralChain::from_stored("D1");
        assert!(ReferralChain::from_stored("D1").is_within(&code));
        assert!(ReferralChain::from_stored("D1D5").is_within(&code));
        assert!(!ReferralChain::from_stored("D12").is_within(&code));
        assert!(!ReferralChain::from_stored("D12D5").is_within(&code));
        assert!(!ReferralChain::root().is_within(&code));
    }

    #[test]
    fn rebase_moves_a_subtree() {
        let from = ReferralChain::from_stored("D1D4");
        let to = ReferralChain::from_stored("D2D4");
        let member = ReferralChain::from_stored("D1D4D9");
        assert_eq!(member.rebase(&from, &to), Some(ReferralChain::from_stored("D2D4D9")));
        assert_eq!(ReferralChain::from_stored("D1D45").rebase(&from, &to), None);
    }

    #[test]
    fn invite_code_round_trip() {
        let code = InviteCode::for_user(UserId(42));
        assert_eq!(code.as_str(), "RDQy");
        assert_eq!(code.decode().unwrap(), UserId(42));
    }

    #[test]
    fn invite_code_rejects_garbage() {
        assert!(InviteCode::new("not base64!").decode().is_err());
        // "D1D2" is a chain, not a single segment
        assert!(InviteCode::new(STANDARD.encode("D1D2")).decode().is_err());
        assert!(InviteCode::new(STANDARD.encode("D0")).decode().is_err());
    }
}
