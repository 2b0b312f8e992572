//! Concurrency tests.
//!
//! Operations race on a multi-threaded runtime. Debits of one user serialize on
//! that user's row lock; credits never wait; deadlines and lock timeouts come
//! back as errors rather than partial writes.

mod common;

use common::*;
use referral_ledger::referral::direct_referrer;
use referral_ledger::store::{BalanceStore, LedgerTx};
use referral_ledger::*;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_trades_cannot_overspend_locked_balance() {
    let ledger = Arc::new(ledger());
    let chain = seed_chain(&ledger).await;
    deposit(&ledger, chain.c, AssetKind::Primary, units(100), "dep-1").await;
    expect_completed(ledger.lock(&ledger.context(), chain.c, units(100)).await.unwrap());

    let mut handles = Vec::new();
    for n in 0..2 {
        let ledger = Arc::clone(&ledger);
        let user = chain.c;
        handles.push(tokio::spawn(async move {
            let ctx = ledger.context();
            ledger
                .trade_lock(&ctx, user, units(60), Amount::ZERO, units(60), &event(&format!("trade-{}", n)))
                .await
        }));
    }

    let mut settled = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap().unwrap() {
            Outcome::Completed(_) => settled += 1,
            Outcome::Rejected(rejection) => {
                assert!(matches!(
                    rejection.reason,
                    RejectReason::InsufficientBalance { field: BalanceField::Locked, .. }
                ));
                rejected += 1;
            }
        }
    }
    assert_eq!(settled, 1);
    assert_eq!(rejected, 1);

    let c = balance(&ledger, chain.c).await;
    assert_eq!(c.locked, units(40));
    assert_eq!(ledger.storage().snapshot().await.trades.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_withdraws_stop_at_the_balance() {
    let ledger = Arc::new(ledger());
    let chain = seed_chain(&ledger).await;
    deposit(&ledger, chain.c, AssetKind::Primary, units(1_000), "dep-1").await;

    let mut handles = Vec::new();
    for n in 0..5 {
        let ledger = Arc::clone(&ledger);
        let user = chain.c;
        handles.push(tokio::spawn(async move {
            let ctx = ledger.context();
            ledger
                .withdraw(&ctx, user, units(300), AssetKind::Primary, &event(&format!("wd-{}", n)))
                .await
        }));
    }

    let mut accepted = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().is_completed() {
            accepted += 1;
        }
    }
    assert_eq!(accepted, 3);
    assert_eq!(balance(&ledger, chain.c).await.primary, units(100));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_deposits_all_land() {
    let ledger = Arc::new(ledger());
    let chain = seed_chain(&ledger).await;

    let mut handles = Vec::new();
    for n in 0..20 {
        let ledger = Arc::clone(&ledger);
        let user = chain.c;
        handles.push(tokio::spawn(async move {
            let ctx = ledger.context();
            ledger
                .deposit(&ctx, user, units(10), AssetKind::Primary, &event(&format!("dep-{}", n)))
                .await
        }));
    }
    for handle in handles {
        assert!(handle.await.unwrap().unwrap().is_completed());
    }

    assert_eq!(balance(&ledger, chain.c).await.primary, units(200));
    assert_eq!(balance(&ledger, chain.b).await.primary, units(20));
    assert_eq!(balance(&ledger, chain.a).await.primary, units(10));
    assert_eq!(balance(&ledger, chain.root).await.team_volume, units(200));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn duplicate_delivery_credits_once() {
    let ledger = Arc::new(ledger());
    let chain = seed_chain(&ledger).await;

    let mut handles = Vec::new();
    for _ in 0..4 {
        let ledger = Arc::clone(&ledger);
        let user = chain.c;
        handles.push(tokio::spawn(async move {
            let ctx = ledger.context();
            ledger
                .deposit(&ctx, user, units(10), AssetKind::Primary, &event("dep-same"))
                .await
        }));
    }

    let mut fresh = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(Outcome::Completed(receipt)) if !receipt.replayed => fresh += 1,
            Ok(_) => {}
            // a loser of the commit race sees the key as a conflict
            Err(err) => assert!(err.is_retryable(), "unexpected error: {}", err),
        }
    }
    assert_eq!(fresh, 1);
    assert_eq!(balance(&ledger, chain.c).await.primary, units(10));
    assert_eq!(balance(&ledger, chain.b).await.primary, units(1));
}

#[tokio::test]
async fn expired_deadline_cancels_without_writing() {
    let ledger = ledger();
    let chain = seed_chain(&ledger).await;

    let ctx = RequestContext::with_timeout(Duration::ZERO);
    let err = ledger
        .deposit(&ctx, chain.c, units(10), AssetKind::Primary, &event("dep-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::Cancelled));
    assert_eq!(balance(&ledger, chain.c).await.primary, Amount::ZERO);
    assert!(ledger.storage().snapshot().await.keys.is_empty());
}

#[tokio::test]
async fn held_row_lock_times_out_as_conflict() {
    let ledger = ledger();
    let chain = seed_chain(&ledger).await;
    deposit(&ledger, chain.c, AssetKind::Primary, units(100), "dep-1").await;

    let mut holder = ledger.storage().begin().await.unwrap();
    holder.balance_for_update(chain.c).await.unwrap();

    let err = ledger
        .withdraw(&ledger.context(), chain.c, units(50), AssetKind::Primary, &event("wd-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, LedgerError::ConcurrencyConflict { .. }));
    assert!(err.is_retryable());

    holder.rollback().await;
    let retry = ledger
        .withdraw(&ledger.context(), chain.c, units(50), AssetKind::Primary, &event("wd-1"))
        .await
        .unwrap();
    assert!(retry.is_completed());
    assert_eq!(balance(&ledger, chain.c).await.primary, units(50));
}

#[tokio::test]
async fn credits_do_not_wait_for_row_locks() {
    let ledger = ledger();
    let chain = seed_chain(&ledger).await;

    let mut holder = ledger.storage().begin().await.unwrap();
    holder.balance_for_update(chain.b).await.unwrap();

    // c's deposit credits b as a reward while b's row is held
    let receipt = deposit(&ledger, chain.c, AssetKind::Primary, units(10), "dep-1").await;
    assert_eq!(receipt.rewards.len(), 2);

    holder.rollback().await;
    assert_eq!(balance(&ledger, chain.b).await.primary, units(1));
}

/// Every chain must be its referrer's chain plus the referrer's segment.
async fn assert_tree_consistent(ledger: &TestLedger) {
    let links = ledger.storage().snapshot().await.links;
    for link in links.values() {
        if let Some(referrer) = direct_referrer(&link.chain) {
            let parent = &links[&referrer];
            assert_eq!(
                parent.chain.extend(referrer),
                link.chain,
                "user {} is off its referrer's chain",
                link.user
            );
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn crossed_referrer_claims_never_form_a_cycle() {
    for _ in 0..200 {
        let ledger = Arc::new(ledger());
        let storage = ledger.storage();
        let root = storage.seed_user("0xroot", ReferralChain::root()).await;
        let top = ReferralChain::root().extend(root);
        let x = storage.seed_user("0xx", top.clone()).await;
        let y = storage.seed_user("0xy", top.clone()).await;

        let mut handles = Vec::new();
        for (user, target) in [(x, y), (y, x)] {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                let ctx = ledger.context();
                ledger
                    .claim_referrer(&ctx, user, &InviteCode::for_user(target))
                    .await
            }));
        }

        let mut moved = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(Outcome::Completed(receipt)) => {
                    assert!(receipt.changed);
                    moved += 1;
                }
                Ok(Outcome::Rejected(rejection)) => {
                    assert_eq!(rejection.reason, RejectReason::ReferralCycle)
                }
                Err(err) => assert!(err.is_retryable(), "unexpected error: {}", err),
            }
        }
        assert_eq!(moved, 1);

        let x_link = ledger.referral_link(x).await.unwrap().unwrap();
        let y_link = ledger.referral_link(y).await.unwrap().unwrap();
        let x_under_y = direct_referrer(&x_link.chain) == Some(y);
        let y_under_x = direct_referrer(&y_link.chain) == Some(x);
        assert!(x_under_y != y_under_x, "x {} y {}", x_link.chain, y_link.chain);
        assert_tree_consistent(&ledger).await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn onboarding_under_a_moving_subtree_stays_on_the_chain() {
    for _ in 0..100 {
        let ledger = Arc::new(ledger());
        let storage = ledger.storage();
        let root = storage.seed_user("0xroot", ReferralChain::root()).await;
        let top = ReferralChain::root().extend(root);
        let x = storage.seed_user("0xx", top.clone()).await;
        let m = storage.seed_user("0xm", top.extend(x)).await;
        let t = storage.seed_user("0xt", top.clone()).await;
        deposit(&ledger, m, AssetKind::Primary, units(10), "dep-m").await;

        let claim = {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move {
                let ctx = ledger.context();
                ledger.claim_referrer(&ctx, x, &InviteCode::for_user(t)).await
            })
        };
        let join = {
            let ledger = Arc::clone(&ledger);
            tokio::spawn(async move {
                let ctx = ledger.context();
                ledger.onboard(&ctx, "0xn", &InviteCode::for_user(m)).await
            })
        };

        if let Err(err) = claim.await.unwrap() {
            assert!(err.is_retryable(), "unexpected error: {}", err);
        }
        match join.await.unwrap() {
            Ok(outcome) => {
                let n = expect_completed(outcome).user.id;
                assert!(ledger.team_members(x).await.unwrap().contains(&n));
            }
            Err(err) => assert!(err.is_retryable(), "unexpected error: {}", err),
        }
        assert_tree_consistent(&ledger).await;
    }
}
