//! Network registry, persistence and port checks.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use regnet_core::topology::PortProbe;
use regnet_core::{Config, LightningImplementation, PortRole, Status};
use regnet_nodes::testing::FakeTransport;
use regnet_nodes::transport::Method;
use regnet_orchestrator::{NetworkManager, NetworkSpec};
use serde_json::json;
use tempfile::TempDir;

struct TakenPorts(HashSet<u16>);

#[async_trait]
impl PortProbe for TakenPorts {
    async fn is_available(&self, port: u16) -> bool {
        !self.0.contains(&port)
    }
}

#[test]
fn test_network_survives_restart() -> Result<()> {
    let dir = TempDir::new()?;
    let id = {
        let mut manager = NetworkManager::new(Config::with_data_dir(dir.path()))?;
        let id = manager.create_network(&NetworkSpec::new("persisted"))?.id;
        manager.add_lightning_node(id, LightningImplementation::Eclair, None)?;
        manager.set_status(id, Status::Started)?;
        id
    };

    let manager = NetworkManager::new(Config::with_data_dir(dir.path()))?;
    let network = manager.network(id)?;
    assert_eq!(network.name, "persisted");
    assert_eq!(network.status, Status::Started);
    let names: Vec<&str> = network.node_names().collect();
    assert_eq!(names, vec!["backend1", "alice", "bob", "carol", "dave"]);

    let dave = network.lightning_node("dave")?;
    assert_eq!(dave.implementation, LightningImplementation::Eclair);
    assert_eq!(dave.ports.get(PortRole::Rest), Some(8284));
    network.validate_backends()?;
    Ok(())
}

#[test]
fn test_corrupt_descriptor_is_skipped() -> Result<()> {
    let dir = TempDir::new()?;
    let mut manager = NetworkManager::new(Config::with_data_dir(dir.path()))?;
    manager.create_network(&NetworkSpec::new("good"))?;
    std::fs::write(dir.path().join("networks").join("7.json"), "{ not json")?;

    let reloaded = NetworkManager::new(Config::with_data_dir(dir.path()))?;
    assert_eq!(reloaded.networks().count(), 1);
    Ok(())
}

#[tokio::test]
async fn test_taken_ports_are_reassigned_and_saved() -> Result<()> {
    let dir = TempDir::new()?;
    let mut manager = NetworkManager::new(Config::with_data_dir(dir.path()))?;
    let id = manager
        .create_network(&NetworkSpec {
            name: "ports".into(),
            bitcoind: 2,
            lnd: 2,
            clightning: 0,
            eclair: 0,
        })?
        .id;

    let probe = TakenPorts([18443, 8082].into_iter().collect());
    assert!(manager.check_ports(id, &probe).await?);

    let reloaded = NetworkManager::new(Config::with_data_dir(dir.path()))?;
    let network = reloaded.network(id)?;
    assert_eq!(network.bitcoin_node("backend1")?.ports.get(PortRole::Rpc), Some(18444));
    assert_eq!(network.bitcoin_node("backend2")?.ports.get(PortRole::Rpc), Some(18445));
    assert_eq!(network.lightning_node("alice")?.ports.get(PortRole::Rest), Some(8081));
    assert_eq!(network.lightning_node("bob")?.ports.get(PortRole::Rest), Some(8083));
    Ok(())
}

#[tokio::test]
async fn test_started_nodes_keep_their_ports() -> Result<()> {
    let dir = TempDir::new()?;
    let mut manager = NetworkManager::new(Config::with_data_dir(dir.path()))?;
    let id = manager.create_network(&NetworkSpec::new("running"))?.id;
    manager.set_status(id, Status::Started)?;

    let probe = TakenPorts([8081, 18443].into_iter().collect());
    assert!(!manager.check_ports(id, &probe).await?);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_wait_for_network_connects_backends() -> Result<()> {
    let dir = TempDir::new()?;
    let mut manager = NetworkManager::new(Config::with_data_dir(dir.path()))?;
    let network = manager
        .create_network(&NetworkSpec {
            name: "waiting".into(),
            bitcoind: 2,
            lnd: 1,
            clightning: 0,
            eclair: 0,
        })?
        .clone();

    let fake = Arc::new(FakeTransport::new());
    common::script_bitcoind(&fake, 0, 0.0, 0);
    common::script_lnd(&fake, 8081, common::ALICE_PUBKEY, 0);

    common::orchestrator(&fake).wait_for_network(&network).await?;

    assert_eq!(fake.rpc_calls("addnode"), vec![json!(["backend1", "add"])]);
    assert_eq!(common::count_on(&fake, 8081, Method::Get, "/v1/getinfo"), 1);
    Ok(())
}
