//! Property-based tests for the referral codec, ancestor resolution and
//! fixed-point math.

use proptest::prelude::*;
use referral_ledger::referral::ancestors_up_to;
use referral_ledger::rewards::level_amount;
use referral_ledger::*;

fn id_strategy() -> impl Strategy<Value = UserId> {
    (1u64..10_000_000u64).prop_map(UserId)
}

fn path_strategy() -> impl Strategy<Value = Vec<UserId>> {
    proptest::collection::vec(id_strategy(), 0..40)
}

fn build(path: &[UserId]) -> ReferralChain {
    path.iter().fold(ReferralChain::root(), |chain, id| chain.extend(*id))
}

proptest! {
    /// Building a chain and decoding it gives back the same path.
    #[test]
    fn chain_decodes_to_its_path(path in path_strategy()) {
        let chain = build(&path);
        prop_assert_eq!(chain.decode().unwrap(), path.clone());
        prop_assert_eq!(chain.depth(), path.len());
        prop_assert_eq!(chain.is_root(), path.is_empty());
    }

    /// Ancestors come back nearest first with consecutive levels.
    #[test]
    fn ancestors_are_nearest_first(path in path_strategy(), depth in 0usize..50) {
        let chain = build(&path);
        let ancestors = ancestors_up_to(&chain, depth);
        prop_assert_eq!(ancestors.len(), path.len().min(depth));
        for (index, ancestor) in ancestors.iter().enumerate() {
            prop_assert_eq!(ancestor.level as usize, index + 1);
            prop_assert_eq!(ancestor.user, path[path.len() - 1 - index]);
        }
    }

    /// A descendant's chain is within every ancestor's team code.
    #[test]
    fn descendants_are_within_team_code(path in proptest::collection::vec(id_strategy(), 1..20), split in 0usize..20) {
        let cut = split % path.len();
        let code = build(&path[..=cut]);
        prop_assert!(build(&path).is_within(&code));
    }

    /// Sibling ids sharing a digit prefix never match each other's team.
    #[test]
    fn team_match_respects_boundaries(parent in id_strategy(), suffix in 0u64..10) {
        let short = ReferralChain::root().extend(parent);
        let longer = ReferralChain::root().extend(UserId(parent.0 * 10 + suffix));
        prop_assert!(!longer.is_within(&short));
    }

    /// Rebasing swaps exactly the leading code.
    #[test]
    fn rebase_keeps_the_tail(
        head in proptest::collection::vec(id_strategy(), 1..10),
        tail in proptest::collection::vec(id_strategy(), 0..10),
        other in proptest::collection::vec(id_strategy(), 1..10),
    ) {
        let full: Vec<UserId> = head.iter().chain(tail.iter()).copied().collect();
        let moved = build(&full).rebase(&build(&head), &build(&other)).unwrap();
        let expected: Vec<UserId> = other.iter().chain(tail.iter()).copied().collect();
        prop_assert_eq!(moved.decode().unwrap(), expected);
    }

    #[test]
    fn invite_code_round_trip(id in id_strategy()) {
        prop_assert_eq!(InviteCode::for_user(id).decode().unwrap(), id);
    }

    /// A level reward never exceeds its share of the base.
    #[test]
    fn level_amount_is_floored_share(raw in 0i64..1_000_000_000_000i64, rate in 0u32..=100) {
        let base = Amount::from_raw(raw);
        let reward = level_amount(base, rate);
        prop_assert!(!reward.is_negative());
        prop_assert!(reward <= base);
        prop_assert_eq!(reward.raw(), raw * rate as i64 / 100);
    }

    /// Trade legs split without creating or losing value.
    #[test]
    fn trade_split_conserves(raw in 0i64..1_000_000_000_000i64, fee in 0u32..=50, burn in 0u32..=50) {
        let split = trade_split(Amount::from_raw(raw), fee, burn);
        prop_assert_eq!(split.net.raw() + split.fee.raw() + split.burn.raw(), raw);
        prop_assert!(!split.net.is_negative());
    }
}
