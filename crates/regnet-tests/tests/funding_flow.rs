//! Depositing on-chain funds into Lightning wallets.

mod common;

use std::sync::Arc;

use anyhow::Result;
use common::{ALICE_PUBKEY, lnd_network, mined, orchestrator, script_bitcoind, script_lnd};
use regnet_core::Error;
use regnet_nodes::testing::FakeTransport;
use serde_json::json;

/// An empty wallet at height 0 needs a single 50 BTC block to cover 250k sats.
#[tokio::test(start_paused = true)]
async fn test_deposit_from_empty_backend_mines_one_block() -> Result<()> {
    let fake = Arc::new(FakeTransport::new());
    script_bitcoind(&fake, 0, 0.0, 100);
    script_lnd(&fake, 8081, ALICE_PUBKEY, 250_000);

    let network = lnd_network(1);
    let orchestrator = orchestrator(&fake);
    let balance = orchestrator.deposit_funds(&network, "alice", 250_000).await?;

    assert_eq!(mined(&fake), vec![1, 6]);
    assert_eq!(fake.rpc_calls("sendtoaddress"), vec![json!(["bcrt1qlightning", 0.0025])]);
    assert!(balance.confirmed.parse::<u64>()? >= 250_000);

    let cached = orchestrator
        .store()
        .get(network.id, "alice")
        .await
        .and_then(|s| s.wallet_balance);
    assert_eq!(cached, Some(balance));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_deposit_with_funded_backend_only_confirms() -> Result<()> {
    let fake = Arc::new(FakeTransport::new());
    script_bitcoind(&fake, 300, 25.0, 200);
    script_lnd(&fake, 8081, ALICE_PUBKEY, 100_000);

    let network = lnd_network(1);
    orchestrator(&fake).deposit_funds(&network, "alice", 100_000).await?;

    assert_eq!(mined(&fake), vec![6]);
    assert!(fake.rpc_calls("listtransactions").is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_deposit_waits_for_settle_delay() -> Result<()> {
    let fake = Arc::new(FakeTransport::new());
    script_bitcoind(&fake, 300, 25.0, 200);
    script_lnd(&fake, 8081, ALICE_PUBKEY, 100_000);

    let network = lnd_network(1);
    let started = tokio::time::Instant::now();
    orchestrator(&fake).deposit_funds(&network, "alice", 100_000).await?;
    assert!(started.elapsed() >= std::time::Duration::from_secs(1));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failed_send_after_mining_is_reported() -> Result<()> {
    let fake = Arc::new(FakeTransport::new());
    script_bitcoind(&fake, 0, 0.0, 100);
    script_lnd(&fake, 8081, ALICE_PUBKEY, 0);
    fake.on_rpc("sendtoaddress", |_| {
        Err(Error::Http {
            status: 500,
            message: "Insufficient funds".into(),
        })
    });

    let network = lnd_network(1);
    let err = orchestrator(&fake)
        .deposit_funds(&network, "alice", 250_000)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InsufficientFundsRecoveryFailed(_)));
    assert!(err.to_string().contains("Insufficient funds"));
    // the workflow stops before confirming
    assert_eq!(mined(&fake), vec![1]);
    Ok(())
}
