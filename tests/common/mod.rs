//! Shared fixtures for the integration suites.

#![allow(dead_code)]

use referral_ledger::*;

pub type TestLedger = Ledger<MemoryStorage, MemoryConfigProvider>;

pub fn units(n: i64) -> Amount {
    Amount::from_units(n)
}

pub fn event(name: &str) -> EventRef {
    EventRef::new(name)
}

/// Ledger over a fresh store with the standard runtime settings.
pub fn ledger() -> TestLedger {
    ledger_with(MemoryConfigProvider::standard())
}

pub fn ledger_with(settings: MemoryConfigProvider) -> TestLedger {
    let config = ServiceConfig::testing();
    let storage = MemoryStorage::from_config(&config);
    match Ledger::new(storage, settings, config) {
        Ok(ledger) => ledger,
        Err(err) => panic!("testing config must validate: {}", err),
    }
}

/// root <- a <- b <- c, seeded directly into the store.
pub struct Chain {
    pub root: UserId,
    pub a: UserId,
    pub b: UserId,
    pub c: UserId,
}

pub async fn seed_chain(ledger: &TestLedger) -> Chain {
    let storage = ledger.storage();
    let root = storage.seed_user("0xroot", ReferralChain::root()).await;
    let a_chain = ReferralChain::root().extend(root);
    let a = storage.seed_user("0xa", a_chain.clone()).await;
    let b_chain = a_chain.extend(a);
    let b = storage.seed_user("0xb", b_chain.clone()).await;
    let c = storage.seed_user("0xc", b_chain.extend(b)).await;
    Chain { root, a, b, c }
}

pub fn expect_completed<T>(outcome: Outcome<T>) -> T {
    match outcome {
        Outcome::Completed(value) => value,
        Outcome::Rejected(rejection) => panic!("unexpected rejection: {}", rejection),
    }
}

pub fn expect_rejected<T: std::fmt::Debug>(outcome: Outcome<T>) -> Rejection {
    match outcome {
        Outcome::Rejected(rejection) => rejection,
        Outcome::Completed(value) => panic!("expected a rejection, got {:?}", value),
    }
}

pub async fn deposit(ledger: &TestLedger, user: UserId, asset: AssetKind, amount: Amount, name: &str) -> DepositReceipt {
    let ctx = ledger.context();
    let outcome = ledger
        .deposit(&ctx, user, amount, asset, &event(name))
        .await
        .unwrap();
    expect_completed(outcome)
}

pub async fn balance(ledger: &TestLedger, user: UserId) -> Balance {
    ledger.balance(user).await.unwrap().unwrap()
}
