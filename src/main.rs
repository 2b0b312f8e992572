//! Referral Ledger Simulation.
//!
//! Walks the ledger through onboarding a referral chain, deposit rewards,
//! withdraw limits and processing, exchange against an earning slot, and two
//! trades racing for the same locked balance.

use referral_ledger::*;
use std::error::Error;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

type SimLedger = Ledger<MemoryStorage, MemoryConfigProvider>;
type SimResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

#[tokio::main]
async fn main() -> SimResult<()> {
    init_logging();

    println!("Referral Ledger Simulation");
    println!("In-Memory Store, Three-Level Chain, Full Lifecycle\n");

    let ledger = Arc::new(build_ledger()?);
    let chain = scenario_1_onboarding(&ledger).await?;
    scenario_2_deposit_rewards(&ledger, &chain).await?;
    scenario_3_withdraw_limits(&ledger, &chain).await?;
    scenario_4_exchange(&ledger, &chain).await?;
    scenario_5_concurrent_trades(&ledger, &chain).await?;

    println!("\nAll simulations completed successfully.");
    Ok(())
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "referral_ledger=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn build_ledger() -> SimResult<SimLedger> {
    let config = Environment::Development.config();
    let storage = MemoryStorage::from_config(&config);
    Ok(Ledger::new(storage, MemoryConfigProvider::standard(), config)?)
}

fn completed<T>(outcome: Outcome<T>) -> SimResult<T> {
    match outcome {
        Outcome::Completed(value) => Ok(value),
        Outcome::Rejected(rejection) => Err(Box::new(rejection)),
    }
}

struct Chain {
    root: UserId,
    alice: UserId,
    bob: UserId,
    carol: UserId,
}

/// Root, then Alice under root, Bob under Alice, Carol under Bob. Each
/// referrer deposits before the next user signs up with their code.
async fn scenario_1_onboarding(ledger: &SimLedger) -> SimResult<Chain> {
    println!("Scenario 1: Onboarding a Referral Chain\n");

    let ctx = ledger.context();
    let root_code = InviteCode::new(ledger.config().root_invite_code.clone());
    let root = completed(ledger.onboard(&ctx, "0xroot", &root_code).await?)?;
    let mut ids = vec![root.user.id];
    let mut code = root.invite_code.clone();
    println!("  root signs up with {}, invite code {}", root_code, code);

    for (name, address) in [("alice", "0xa11ce"), ("bob", "0xb0b"), ("carol", "0xca201")] {
        let sponsor = ids[ids.len() - 1];
        completed(
            ledger
                .deposit(
                    &ctx,
                    sponsor,
                    Amount::from_units(1),
                    AssetKind::Primary,
                    &EventRef::new(format!("activate-{}", sponsor)),
                )
                .await?,
        )?;
        let receipt = completed(ledger.onboard(&ctx, address, &code).await?)?;
        println!("  {} joins with code {}, chain {}", name, code, receipt.chain);
        code = receipt.invite_code;
        ids.push(receipt.user.id);
    }

    let again = completed(ledger.onboard(&ctx, "0xb0b", &code).await?)?;
    println!("  bob signs up again: existing = {}", again.existing);

    if let Some(summary) = ledger.team_summary(ids[0]).await? {
        println!("  root team: {} direct, {} total\n", summary.direct, summary.team);
    }

    Ok(Chain {
        root: ids[0],
        alice: ids[1],
        bob: ids[2],
        carol: ids[3],
    })
}

/// A deposit pays each ancestor its level rate.
async fn scenario_2_deposit_rewards(ledger: &SimLedger, chain: &Chain) -> SimResult<()> {
    println!("Scenario 2: Deposit Referral Rewards\n");

    let ctx = ledger.context();
    let event = EventRef::new("chain-tx-0001");
    let receipt = completed(
        ledger
            .deposit(&ctx, chain.carol, Amount::from_units(10_000), AssetKind::Primary, &event)
            .await?,
    )?;
    println!("  carol deposits 10000, {} rewards paid", receipt.rewards.len());
    for reward in &receipt.rewards {
        println!("    level {}: user {} earns {}", reward.level, reward.beneficiary, reward.amount);
    }

    let replay = completed(
        ledger
            .deposit(&ctx, chain.carol, Amount::from_units(10_000), AssetKind::Primary, &event)
            .await?,
    )?;
    println!("  same event delivered twice: replayed = {}", replay.replayed);

    for (name, id) in [("bob", chain.bob), ("alice", chain.alice), ("root", chain.root)] {
        if let Some(balance) = ledger.balance(id).await? {
            println!(
                "  {} primary {}, team volume {}",
                name, balance.primary, balance.team_volume
            );
        }
    }
    println!();
    Ok(())
}

/// Limits, then the payout workflow for one success and one failure.
async fn scenario_3_withdraw_limits(ledger: &SimLedger, chain: &Chain) -> SimResult<()> {
    println!("Scenario 3: Withdraw Limits and Processing\n");

    let ctx = ledger.context();
    let too_big = ledger
        .withdraw(
            &ctx,
            chain.carol,
            Amount::from_units(1_001),
            AssetKind::Primary,
            &EventRef::new("wd-0001"),
        )
        .await?;
    if let Some(rejection) = too_big.rejection() {
        println!("  withdraw 1001 rejected: {}", rejection);
    }

    let paid = completed(
        ledger
            .withdraw(
                &ctx,
                chain.carol,
                Amount::from_units(1_000),
                AssetKind::Primary,
                &EventRef::new("wd-0002"),
            )
            .await?,
    )?;
    println!(
        "  withdraw 1000 accepted: fee {}, net {}, status {}",
        paid.request.fee, paid.request.net_amount, paid.request.status
    );
    completed(ledger.mark_withdraw_doing(&ctx, paid.request.id).await?)?;
    let done = completed(ledger.mark_withdraw_success(&ctx, paid.request.id).await?)?;
    println!("  payout confirmed: status {}", done.request.status);

    let bounced = completed(
        ledger
            .withdraw(
                &ctx,
                chain.carol,
                Amount::from_units(500),
                AssetKind::Primary,
                &EventRef::new("wd-0003"),
            )
            .await?,
    )?;
    let failed = completed(ledger.fail_withdraw(&ctx, bounced.request.id).await?)?;
    if let Some(refund) = failed.refund {
        println!("  payout failed: refunded {}, balance after {}\n", refund.amount, refund.balance_after);
    }
    Ok(())
}

/// Reward tokens convert into primary up to the earning slot's capacity.
async fn scenario_4_exchange(ledger: &SimLedger, chain: &Chain) -> SimResult<()> {
    println!("Scenario 4: Exchange Against an Earning Slot\n");

    let ctx = ledger.context();
    completed(
        ledger
            .deposit(
                &ctx,
                chain.bob,
                Amount::from_units(1_000),
                AssetKind::RewardToken,
                &EventRef::new("chain-tx-0002"),
            )
            .await?,
    )?;

    let no_slot = ledger
        .exchange(&ctx, chain.bob, Amount::from_units(100), AssetKind::RewardToken, AssetKind::Primary)
        .await?;
    if let Some(rejection) = no_slot.rejection() {
        println!("  exchange without a slot: {}", rejection);
    }

    ledger.storage().seed_slot(chain.bob, Amount::from_units(150)).await;
    let receipt = completed(
        ledger
            .exchange(&ctx, chain.bob, Amount::from_units(100), AssetKind::RewardToken, AssetKind::Primary)
            .await?,
    )?;
    println!(
        "  exchanged 100: converted {}, fee {}, credited {}",
        receipt.converted, receipt.fee, receipt.credit.amount
    );

    let over = ledger
        .exchange(&ctx, chain.bob, Amount::from_units(100), AssetKind::RewardToken, AssetKind::Primary)
        .await?;
    if let Some(rejection) = over.rejection() {
        println!("  second exchange over slot capacity: {}\n", rejection);
    }
    Ok(())
}

/// Two trades spend the same locked balance at once. The row lock lets one win.
async fn scenario_5_concurrent_trades(ledger: &Arc<SimLedger>, chain: &Chain) -> SimResult<()> {
    println!("Scenario 5: Concurrent Trades on One Locked Balance\n");

    let ctx = ledger.context();
    completed(ledger.lock(&ctx, chain.alice, Amount::from_units(100)).await?)?;
    println!("  alice locks 100");

    let mut handles = Vec::new();
    for n in 0..2 {
        let ledger = Arc::clone(ledger);
        let user = chain.alice;
        handles.push(tokio::spawn(async move {
            let ctx = ledger.context();
            ledger
                .trade_lock(
                    &ctx,
                    user,
                    Amount::from_units(80),
                    Amount::ZERO,
                    Amount::from_units(80),
                    &EventRef::new(format!("trade-{}", n)),
                )
                .await
        }));
    }

    let mut settled = 0;
    for handle in handles {
        match handle.await?? {
            Outcome::Completed(receipt) => {
                settled += 1;
                println!(
                    "  trade {} settled: net {}, {} rewards",
                    receipt.trade.event, receipt.trade.net_a, receipt.rewards.len()
                );
            }
            Outcome::Rejected(rejection) => println!("  trade rejected: {}", rejection),
        }
    }
    println!("  {} of 2 trades settled", settled);

    if let Some(balance) = ledger.balance(chain.alice).await? {
        println!("  alice locked {}, primary {}", balance.locked, balance.primary);
    }
    Ok(())
}
