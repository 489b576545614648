//! Cache of the latest polled Lightning node state.

use std::collections::{BTreeMap, HashMap};

use regnet_core::{Channel, LightningNodeState, NodeInfo, WalletBalances};
use tokio::sync::RwLock;

/// Per-node state keyed by network id, then node name.
///
/// Every network names its nodes from `alice` onwards, so names are only
/// unique within one network. Writers overwrite whatever was there. Nothing
/// here is authoritative; the nodes are re-polled whenever fresh data is
/// needed.
#[derive(Debug, Default)]
pub struct LightningStore {
    networks: RwLock<HashMap<u32, HashMap<String, LightningNodeState>>>,
}

impl LightningStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// State of one node.
    pub async fn get(&self, network_id: u32, name: &str) -> Option<LightningNodeState> {
        self.networks
            .read()
            .await
            .get(&network_id)
            .and_then(|nodes| nodes.get(name))
            .cloned()
    }

    /// Cached info of one node.
    pub async fn info(&self, network_id: u32, name: &str) -> Option<NodeInfo> {
        self.get(network_id, name).await.and_then(|s| s.info)
    }

    async fn update(&self, network_id: u32, name: &str, f: impl FnOnce(&mut LightningNodeState)) {
        let mut networks = self.networks.write().await;
        let state = networks
            .entry(network_id)
            .or_default()
            .entry(name.to_string())
            .or_default();
        f(state);
    }

    /// Replace the cached info of a node.
    pub async fn set_info(&self, network_id: u32, name: &str, info: NodeInfo) {
        self.update(network_id, name, |s| s.info = Some(info)).await;
    }

    /// Replace the cached on-chain balances of a node.
    pub async fn set_wallet_balance(&self, network_id: u32, name: &str, balance: WalletBalances) {
        self.update(network_id, name, |s| s.wallet_balance = Some(balance))
            .await;
    }

    /// Replace the cached channels of a node.
    pub async fn set_channels(&self, network_id: u32, name: &str, channels: Vec<Channel>) {
        self.update(network_id, name, |s| s.channels = Some(channels))
            .await;
    }

    /// Forget a node.
    pub async fn remove_node(&self, network_id: u32, name: &str) -> Option<LightningNodeState> {
        let mut networks = self.networks.write().await;
        let nodes = networks.get_mut(&network_id)?;
        let removed = nodes.remove(name);
        if nodes.is_empty() {
            networks.remove(&network_id);
        }
        removed
    }

    /// Forget every node of a network.
    pub async fn remove_network(&self, network_id: u32) {
        self.networks.write().await.remove(&network_id);
    }

    /// Copy of the state of every node in a network, ordered by name.
    pub async fn snapshot(&self, network_id: u32) -> BTreeMap<String, LightningNodeState> {
        self.networks
            .read()
            .await
            .get(&network_id)
            .map(|nodes| {
                nodes
                    .iter()
                    .map(|(name, state)| (name.clone(), state.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(pubkey: &str) -> NodeInfo {
        NodeInfo {
            pubkey: pubkey.into(),
            alias: String::new(),
            synced_to_chain: true,
            block_height: 0,
            num_pending_channels: 0,
            num_active_channels: 0,
            num_inactive_channels: 0,
            rpc_url: format!("{pubkey}@host:9735"),
        }
    }

    #[tokio::test]
    async fn test_fields_are_written_independently() {
        let store = LightningStore::new();
        assert!(store.get(1, "alice").await.is_none());

        store.set_info(1, "alice", info("02a")).await;
        store
            .set_wallet_balance(1, "alice", WalletBalances::from_sats(5, 0))
            .await;
        let state = store.get(1, "alice").await.unwrap();
        assert_eq!(state.info.unwrap().pubkey, "02a");
        assert_eq!(state.wallet_balance.unwrap().total, "5");
        assert!(state.channels.is_none());

        store.set_info(1, "alice", info("02b")).await;
        assert_eq!(store.info(1, "alice").await.unwrap().pubkey, "02b");
    }

    #[tokio::test]
    async fn test_remove_and_snapshot() {
        let store = LightningStore::new();
        store.set_channels(1, "bob", vec![]).await;
        store.set_info(1, "alice", info("02a")).await;
        let names: Vec<String> = store.snapshot(1).await.into_keys().collect();
        assert_eq!(names, vec!["alice", "bob"]);

        assert!(store.remove_node(1, "alice").await.is_some());
        assert!(store.remove_node(1, "alice").await.is_none());
        assert_eq!(store.snapshot(1).await.len(), 1);
    }

    #[tokio::test]
    async fn test_networks_with_the_same_node_names_are_separate() {
        let store = LightningStore::new();
        store.set_info(1, "alice", info("02first")).await;
        store.set_info(2, "alice", info("02second")).await;

        assert_eq!(store.info(1, "alice").await.unwrap().pubkey, "02first");
        assert_eq!(store.info(2, "alice").await.unwrap().pubkey, "02second");

        store.remove_network(1).await;
        assert!(store.snapshot(1).await.is_empty());
        assert_eq!(store.snapshot(2).await.len(), 1);
        assert!(store.remove_node(1, "alice").await.is_none());
    }
}
