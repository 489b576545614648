//! Scripted nodes shared by the workflow tests.

#![allow(dead_code)]

use std::sync::Arc;

use regnet_core::topology::{NetworkConfig, create_network};
use regnet_core::{Config, Network, Status};
use regnet_nodes::testing::FakeTransport;
use regnet_nodes::transport::Method;
use regnet_orchestrator::Orchestrator;
use serde_json::{Value, json};

pub const ALICE_PUBKEY: &str = "02a1";
pub const BOB_PUBKEY: &str = "02b0";

/// A started network with one backend and `lnd_nodes` LND nodes.
pub fn lnd_network(lnd_nodes: usize) -> Network {
    create_network(&NetworkConfig {
        id: 1,
        name: "workflows".into(),
        path: "/tmp/regnet-tests/networks/1".into(),
        bitcoind_nodes: 1,
        lnd_nodes,
        clightning_nodes: 0,
        eclair_nodes: 0,
        status: Status::Started,
    })
    .expect("network")
}

pub fn orchestrator(fake: &Arc<FakeTransport>) -> Arc<Orchestrator> {
    Arc::new(Orchestrator::new(
        fake.clone(),
        &Config::with_data_dir("/tmp/regnet-tests"),
    ))
}

/// bitcoind at `height` holding `balance` BTC whose most confirmed output
/// has `confirmations`.
pub fn script_bitcoind(fake: &FakeTransport, height: u64, balance: f64, confirmations: i64) {
    fake.on_rpc("getblockchaininfo", move |_| {
        Ok(json!({"chain": "regtest", "blocks": height, "headers": height}))
    });
    fake.on_rpc("getbalance", move |_| Ok(json!(balance)));
    fake.on_rpc("listtransactions", move |_| {
        Ok(json!([{"txid": "coinbase", "category": "generate", "confirmations": confirmations}]))
    });
    fake.on_rpc("getnewaddress", |_| Ok(json!("bcrt1qminer")));
    fake.on_rpc("generatetoaddress", |params| {
        let blocks = params[0].as_u64().and_then(|b| usize::try_from(b).ok()).unwrap_or(0);
        Ok(json!(vec!["blockhash"; blocks]))
    });
    fake.on_rpc("sendtoaddress", |_| Ok(json!("fundingtx")));
    fake.on_rpc("addnode", |_| Ok(Value::Null));
}

/// Block counts of every `generatetoaddress` call, oldest first.
pub fn mined(fake: &FakeTransport) -> Vec<u64> {
    fake.rpc_calls("generatetoaddress")
        .iter()
        .map(|params| params[0].as_u64().unwrap_or(0))
        .collect()
}

/// An LND node on `port` with no channels, no peers and `confirmed` sats on chain.
pub fn script_lnd(fake: &FakeTransport, port: u16, pubkey: &'static str, confirmed: u64) {
    fake.on_port(port, Method::Get, "/v1/getinfo", move |_| {
        Ok(json!({
            "identity_pubkey": pubkey,
            "alias": pubkey,
            "synced_to_chain": true,
            "block_height": 101,
            "uris": [format!("{pubkey}@127.0.0.1:9735")],
        }))
    });
    fake.on_port(port, Method::Get, "/v1/balance/blockchain", move |_| {
        Ok(json!({"confirmed_balance": confirmed.to_string(), "unconfirmed_balance": "0"}))
    });
    fake.on_port(port, Method::Get, "/v1/newaddress", |_| {
        Ok(json!({"address": "bcrt1qlightning"}))
    });
    fake.on_port(port, Method::Get, "/v1/channels", |_| Ok(json!({"channels": []})));
    fake.on_port(port, Method::Get, "/v1/channels/pending", |_| Ok(json!({})));
    fake.on_port(port, Method::Get, "/v1/peers", |_| Ok(json!({"peers": []})));
}

/// Report `channels` as the open channels of the LND node on `port`.
pub fn script_lnd_channels(fake: &FakeTransport, port: u16, channels: Value) {
    fake.on_port(port, Method::Get, "/v1/channels", move |_| {
        Ok(json!({"channels": channels.clone()}))
    });
}

/// Number of requests of `method path` sent to `port`.
pub fn count_on(fake: &FakeTransport, port: u16, method: Method, path: &str) -> usize {
    fake.calls()
        .iter()
        .filter(|r| r.port() == Some(port) && r.method == method && r.path() == path)
        .count()
}
