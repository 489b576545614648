//! Multi-step Lightning workflows.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use futures::future::try_join_all;
use regnet_core::constants::BLOCKS_TIL_CONFIRMED;
use regnet_core::graph::{Chart, Position, init_chart, update_chart_from_nodes};
use regnet_core::units::sats_to_btc;
use regnet_core::{
    BitcoinNode, Channel, ChannelPoint, Config, LightningImplementation, LightningNode, Network,
    NodeInfo, PayReceipt, Result, Status, WalletBalances,
};
use regnet_nodes::{BitcoindService, HttpTransport, LightningFactory, LightningService};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::{debug, info, warn};

use crate::{BlocksMined, LightningStore, MineEvents, NetworkManager};

/// Runs workflows against the nodes of a network.
///
/// Steps within one workflow run strictly in order. Separate workflows are
/// not serialized against each other, and a failed step ends its workflow
/// with that step's error.
pub struct Orchestrator {
    bitcoind: BitcoindService,
    lightning: LightningFactory,
    store: Arc<LightningStore>,
    events: MineEvents,
    charts: Mutex<HashMap<u32, Chart>>,
    wait_interval: Duration,
    wait_timeout: Duration,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("wait_interval", &self.wait_interval)
            .field("wait_timeout", &self.wait_timeout)
            .finish_non_exhaustive()
    }
}

fn started(network: &Network) -> impl Iterator<Item = &LightningNode> {
    network
        .nodes
        .lightning
        .iter()
        .filter(|n| n.status == Status::Started)
}

impl Orchestrator {
    /// Create an orchestrator whose adapters all share `transport`.
    pub fn new(transport: Arc<dyn HttpTransport>, config: &Config) -> Self {
        Self::from_parts(
            BitcoindService::new(transport.clone()),
            LightningFactory::new(transport),
            Arc::new(LightningStore::new()),
            config,
        )
    }

    /// Assemble from explicit services and store.
    pub fn from_parts(
        bitcoind: BitcoindService,
        lightning: LightningFactory,
        store: Arc<LightningStore>,
        config: &Config,
    ) -> Self {
        Self {
            bitcoind,
            lightning,
            store,
            events: MineEvents::new(),
            charts: Mutex::new(HashMap::new()),
            wait_interval: config.wait_interval(),
            wait_timeout: config.wait_timeout(),
        }
    }

    /// Cached Lightning node state.
    pub const fn store(&self) -> &Arc<LightningStore> {
        &self.store
    }

    /// Mined block notifications published by [`Self::mine`].
    pub const fn events(&self) -> &MineEvents {
        &self.events
    }

    /// The Bitcoin adapter.
    pub const fn bitcoind(&self) -> &BitcoindService {
        &self.bitcoind
    }

    fn service(&self, node: &LightningNode) -> &dyn LightningService {
        self.lightning.service(node)
    }

    /// Longest settle delay among `nodes`.
    pub fn settle_delay<'a>(
        &self,
        nodes: impl IntoIterator<Item = &'a LightningNode>,
    ) -> Duration {
        nodes
            .into_iter()
            .map(|n| self.service(n).settle_delay())
            .max()
            .unwrap_or_default()
    }

    async fn settle<'a>(&self, nodes: impl IntoIterator<Item = &'a LightningNode>) {
        let delay = self.settle_delay(nodes);
        debug!(?delay, "waiting for nodes to process blocks");
        tokio::time::sleep(delay).await;
    }

    /// Fetch and cache node info.
    pub async fn get_info(&self, node: &LightningNode) -> Result<NodeInfo> {
        let info = self.service(node).get_info(node).await?;
        self.store
            .set_info(node.network_id, &node.name, info.clone())
            .await;
        Ok(info)
    }

    /// Fetch and cache on-chain balances.
    pub async fn get_wallet_balance(&self, node: &LightningNode) -> Result<WalletBalances> {
        let balance = self.service(node).get_balances(node).await?;
        self.store
            .set_wallet_balance(node.network_id, &node.name, balance.clone())
            .await;
        Ok(balance)
    }

    /// Fetch and cache channels.
    pub async fn get_channels(&self, node: &LightningNode) -> Result<Vec<Channel>> {
        let channels = self.service(node).get_channels(node).await?;
        self.store
            .set_channels(node.network_id, &node.name, channels.clone())
            .await;
        Ok(channels)
    }

    /// Refresh info, balances and channels of one node.
    pub async fn get_all_info(&self, node: &LightningNode) -> Result<()> {
        self.get_info(node).await?;
        self.get_wallet_balance(node).await?;
        self.get_channels(node).await?;
        Ok(())
    }

    async fn refresh_started(&self, network: &Network) -> Result<()> {
        try_join_all(started(network).map(|n| self.get_all_info(n))).await?;
        Ok(())
    }

    /// Mine `blocks` on `node` and announce it.
    pub async fn mine(&self, node: &BitcoinNode, blocks: u64) -> Result<Vec<String>> {
        let hashes = self.bitcoind.mine(node, blocks).await?;
        self.events.publish(BlocksMined {
            blocks,
            node: node.clone(),
        });
        Ok(hashes)
    }

    /// Fund `name`'s on-chain wallet with `sats` from its backend.
    pub async fn deposit_funds(
        &self,
        network: &Network,
        name: &str,
        sats: u64,
    ) -> Result<WalletBalances> {
        let node = network.lightning_node(name)?;
        let backend = network.backend_of(node)?;
        info!(node = %node.name, backend = %backend.name, sats, "depositing funds");

        let address = self.service(node).get_new_address(node).await?;
        self.bitcoind
            .send_funds(backend, &address.address, sats_to_btc(sats))
            .await?;
        self.mine(backend, BLOCKS_TIL_CONFIRMED).await?;
        self.settle([node]).await;
        self.get_wallet_balance(node).await
    }

    /// Open a channel of `sats` from `from` to `to`.
    ///
    /// With `auto_fund`, twice the capacity is deposited into `from` first.
    pub async fn open_channel(
        &self,
        network: &Network,
        from: &str,
        to: &str,
        sats: u64,
        auto_fund: bool,
    ) -> Result<ChannelPoint> {
        let from_node = network.lightning_node(from)?;
        let to_node = network.lightning_node(to)?;

        if auto_fund {
            self.deposit_funds(network, from, sats.saturating_mul(2)).await?;
        }

        let to_info = match self.store.info(network.id, to).await {
            Some(info) => info,
            None => self.get_info(to_node).await?,
        };

        info!(from, to, sats, "opening channel");
        let point = self
            .service(from_node)
            .open_channel(from_node, &to_info.rpc_url, sats)
            .await?;

        self.mine(network.backend_of(from_node)?, BLOCKS_TIL_CONFIRMED)
            .await?;
        self.settle([from_node, to_node]).await;
        self.sync_chart(network).await?;
        info!(channel_point = %point, "channel opened");
        Ok(point)
    }

    /// Close the channel `channel_point` of `name`.
    pub async fn close_channel(
        &self,
        network: &Network,
        name: &str,
        channel_point: &str,
    ) -> Result<()> {
        let node = network.lightning_node(name)?;
        info!(node = name, channel_point, "closing channel");
        self.service(node).close_channel(node, channel_point).await?;

        self.mine(network.backend_of(node)?, BLOCKS_TIL_CONFIRMED)
            .await?;
        self.settle([node]).await;
        self.sync_chart(network).await?;
        Ok(())
    }

    /// Create an invoice on `name`.
    pub async fn create_invoice(
        &self,
        network: &Network,
        name: &str,
        sats: u64,
        memo: Option<&str>,
    ) -> Result<String> {
        let node = network.lightning_node(name)?;
        let invoice = self.service(node).create_invoice(node, sats, memo).await?;
        debug!(node = name, sats, "created invoice");
        Ok(invoice)
    }

    /// Pay `invoice` from `name`. The chart is only resynced when the payment succeeds.
    pub async fn pay_invoice(
        &self,
        network: &Network,
        name: &str,
        invoice: &str,
        sats: Option<u64>,
    ) -> Result<PayReceipt> {
        let node = network.lightning_node(name)?;
        info!(node = name, "paying invoice");
        let receipt = self.service(node).pay_invoice(node, invoice, sats).await?;
        self.sync_chart(network).await?;
        Ok(receipt)
    }

    /// Wait for every node of `network` to answer, then connect the Bitcoin peers.
    pub async fn wait_for_network(&self, network: &Network) -> Result<()> {
        let (interval, timeout) = (self.wait_interval, self.wait_timeout);

        for node in &network.nodes.bitcoin {
            self.bitcoind.wait_until_online(node, interval, timeout).await?;
        }
        try_join_all(
            network
                .nodes
                .lightning
                .iter()
                .map(|n| self.service(n).wait_until_online(n, interval, timeout)),
        )
        .await?;

        for node in &network.nodes.bitcoin {
            self.bitcoind.connect_peers(node).await?;
        }
        info!(network = network.id, "all nodes online");
        Ok(())
    }

    /// Refresh every started node and reconcile the network's chart.
    pub async fn sync_chart(&self, network: &Network) -> Result<Chart> {
        self.refresh_started(network).await?;

        let states: BTreeMap<_, _> = self
            .store
            .snapshot(network.id)
            .await
            .into_iter()
            .filter(|(name, _)| network.lightning_node(name).is_ok())
            .collect();

        let mut charts = self.charts.lock().await;
        let chart = charts
            .entry(network.id)
            .or_insert_with(|| init_chart(network));
        chart.sync_network(network);
        *chart = update_chart_from_nodes(chart, &states);
        debug!(network = network.id, links = chart.links.len(), "synced chart");
        Ok(chart.clone())
    }

    async fn sync_chart_nodes(&self, network: &Network) {
        if let Some(chart) = self.charts.lock().await.get_mut(&network.id) {
            chart.sync_network(network);
        }
    }

    /// Add a Lightning node to a network and place it on the network's chart.
    pub async fn add_lightning_node(
        &self,
        networks: &mut NetworkManager,
        network_id: u32,
        implementation: LightningImplementation,
        version: Option<&str>,
    ) -> Result<LightningNode> {
        let node = networks.add_lightning_node(network_id, implementation, version)?;
        // names are reused, so nothing cached under this one belongs to the new node
        self.store.remove_node(network_id, &node.name).await;
        self.sync_chart_nodes(networks.network(network_id)?).await;
        Ok(node)
    }

    /// Remove a Lightning node, its cached state and its chart box and links.
    pub async fn remove_lightning_node(
        &self,
        networks: &mut NetworkManager,
        network_id: u32,
        name: &str,
    ) -> Result<LightningNode> {
        let node = networks.remove_lightning_node(network_id, name)?;
        self.store.remove_node(network_id, &node.name).await;
        self.sync_chart_nodes(networks.network(network_id)?).await;
        Ok(node)
    }

    /// Remove a network along with its cached state and chart.
    pub async fn remove_network(
        &self,
        networks: &mut NetworkManager,
        network_id: u32,
    ) -> Result<Network> {
        let network = networks.remove_network(network_id)?;
        self.store.remove_network(network_id).await;
        self.charts.lock().await.remove(&network_id);
        Ok(network)
    }

    /// The last synced chart of a network.
    pub async fn chart(&self, network_id: u32) -> Option<Chart> {
        self.charts.lock().await.get(&network_id).cloned()
    }

    /// Move a chart node. Returns `false` if the chart or node is unknown.
    pub async fn move_node(
        &self,
        network_id: u32,
        name: &str,
        position: Position,
        snap_to_grid: bool,
    ) -> bool {
        self.charts
            .lock()
            .await
            .get_mut(&network_id)
            .is_some_and(|chart| chart.move_node(name, position, snap_to_grid))
    }

    /// Wait for the started nodes of `network` to settle, then refresh all of them.
    pub async fn handle_blocks_mined(&self, network: &Network) -> Result<()> {
        self.settle(started(network)).await;
        self.refresh_started(network).await
    }

    /// Refresh the affected network after every mined block event.
    pub fn spawn_mine_listener(
        self: &Arc<Self>,
        networks: Arc<RwLock<NetworkManager>>,
    ) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let mut events = self.events.subscribe();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let event = match event {
                    Ok(event) => event,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "mine listener lagged");
                        continue;
                    }
                };
                let network = match networks.read().await.network(event.node.network_id) {
                    Ok(network) => network.clone(),
                    Err(e) => {
                        warn!(error = %e, "mined blocks on an unknown network");
                        continue;
                    }
                };
                debug!(
                    network = network.id,
                    blocks = event.blocks,
                    "refreshing after mined blocks"
                );
                if let Err(e) = orchestrator.handle_blocks_mined(&network).await {
                    warn!(network = network.id, error = %e, "refresh after mining failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::NetworkSpec;
    use regnet_core::topology::{NetworkConfig, create_network};
    use regnet_core::Error;
    use regnet_nodes::testing::FakeTransport;
    use regnet_nodes::transport::Method;
    use serde_json::{Value, json};

    fn network() -> Network {
        create_network(&NetworkConfig {
            id: 1,
            name: "orchestrated".into(),
            path: "/tmp/regnet/networks/1".into(),
            bitcoind_nodes: 1,
            lnd_nodes: 2,
            clightning_nodes: 1,
            eclair_nodes: 0,
            status: Status::Started,
        })
        .unwrap()
    }

    fn script_lnd(fake: &FakeTransport, port: u16, pubkey: &'static str, channels: Value) {
        fake.on_port(port, Method::Get, "/v1/getinfo", move |_| {
            Ok(json!({"identity_pubkey": pubkey, "uris": [format!("{pubkey}@host:9735")]}))
        });
        fake.on_port(port, Method::Get, "/v1/balance/blockchain", |_| {
            Ok(json!({"confirmed_balance": "1000", "unconfirmed_balance": "0"}))
        });
        fake.on_port(port, Method::Get, "/v1/channels", move |_| Ok(channels.clone()));
        fake.on_port(port, Method::Get, "/v1/channels/pending", |_| Ok(json!({})));
    }

    fn orchestrator(fake: &Arc<FakeTransport>) -> Orchestrator {
        Orchestrator::new(fake.clone(), &Config::with_data_dir("/tmp/regnet"))
    }

    #[test]
    fn test_settle_delay_is_max_of_nodes() {
        let fake = Arc::new(FakeTransport::new());
        let orchestrator = orchestrator(&fake);
        let network = network();
        let alice = network.lightning_node("alice").unwrap();
        let carol = network.lightning_node("carol").unwrap();
        assert_eq!(carol.implementation, LightningImplementation::CLightning);
        assert_eq!(orchestrator.settle_delay([alice]), Duration::from_secs(1));
        assert_eq!(orchestrator.settle_delay([alice, carol]), Duration::from_secs(3));
        assert_eq!(orchestrator.settle_delay([]), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_sync_chart_adds_channel_links() {
        let fake = Arc::new(FakeTransport::new());
        let channel = json!({"channels": [{
            "remote_pubkey": "02bob",
            "channel_point": "aaaaaaaaaaaaaaaa:0",
            "capacity": "250000",
            "local_balance": "240000",
            "remote_balance": "0",
            "initiator": true,
        }]});
        script_lnd(&fake, 8081, "02alice", channel);
        script_lnd(&fake, 8082, "02bob", json!({}));

        let mut network = network();
        network.nodes.lightning.retain(|n| n.implementation == LightningImplementation::Lnd);

        let orchestrator = orchestrator(&fake);
        let chart = orchestrator.sync_chart(&network).await.unwrap();
        let link = &chart.links["aaaaaaaaaa:0"];
        assert_eq!(link.from.node_id, "alice");
        assert_eq!(link.to.node_id, "bob");
        assert_eq!(orchestrator.chart(1).await, Some(chart.clone()));

        let again = orchestrator.sync_chart(&network).await.unwrap();
        assert_eq!(again, chart);
    }

    #[tokio::test]
    async fn test_get_info_populates_store() {
        let fake = Arc::new(FakeTransport::new());
        script_lnd(&fake, 8081, "02alice", json!({}));
        let network = network();
        let orchestrator = orchestrator(&fake);
        orchestrator
            .get_all_info(network.lightning_node("alice").unwrap())
            .await
            .unwrap();
        let state = orchestrator.store().get(1, "alice").await.unwrap();
        assert_eq!(state.info.unwrap().pubkey, "02alice");
        assert_eq!(state.wallet_balance.unwrap().confirmed, "1000");
        assert_eq!(state.channels, Some(vec![]));
    }

    #[tokio::test]
    async fn test_unknown_node_fails_before_any_call() {
        let fake = Arc::new(FakeTransport::new());
        let orchestrator = orchestrator(&fake);
        let err = orchestrator
            .deposit_funds(&network(), "zed", 1000)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NodeNotFound(_)));
        assert!(fake.calls().is_empty());
    }

    #[tokio::test]
    async fn test_mine_publishes_event() {
        let fake = Arc::new(FakeTransport::new());
        fake.on_rpc("getnewaddress", |_| Ok(json!("bcrt1qminer")));
        fake.on_rpc("generatetoaddress", |params| {
            let blocks = params[0].as_u64().unwrap_or(0);
            Ok(json!(vec!["hash"; usize::try_from(blocks).unwrap()]))
        });
        let orchestrator = orchestrator(&fake);
        let mut events = orchestrator.events().subscribe();

        let network = network();
        let hashes = orchestrator.mine(&network.nodes.bitcoin[0], 3).await.unwrap();
        assert_eq!(hashes.len(), 3);
        let event = events.next().await.unwrap().unwrap();
        assert_eq!(event.blocks, 3);
        assert_eq!(event.node.name, "backend1");
    }

    #[tokio::test]
    async fn test_chart_follows_added_and_removed_nodes() {
        let fake = Arc::new(FakeTransport::new());
        let channel = json!({"channels": [{
            "remote_pubkey": "02bob",
            "channel_point": "bbbbbbbbbbbbbbbb:0",
            "capacity": "100000",
            "local_balance": "90000",
            "remote_balance": "0",
            "initiator": true,
        }]});
        script_lnd(&fake, 8081, "02alice", channel);
        script_lnd(&fake, 8082, "02bob", json!({}));

        let dir = tempfile::TempDir::new().unwrap();
        let mut networks = NetworkManager::new(Config::with_data_dir(dir.path())).unwrap();
        let spec = NetworkSpec {
            name: "growing".into(),
            bitcoind: 1,
            lnd: 1,
            clightning: 0,
            eclair: 0,
        };
        let id = networks.create_network(&spec).unwrap().id;
        networks.set_status(id, Status::Started).unwrap();

        let orchestrator = orchestrator(&fake);
        let chart = orchestrator
            .sync_chart(networks.network(id).unwrap())
            .await
            .unwrap();
        assert_eq!(chart.nodes.keys().collect::<Vec<_>>(), ["alice", "backend1"]);
        assert_eq!(chart.links.keys().collect::<Vec<_>>(), ["alice-backend1"]);

        let bob = orchestrator
            .add_lightning_node(&mut networks, id, LightningImplementation::Lnd, None)
            .await
            .unwrap();
        assert_eq!(bob.name, "bob");
        let placed = orchestrator.chart(id).await.unwrap();
        assert!(placed.nodes.contains_key("bob"));
        assert!(placed.links.contains_key("bob-backend1"));

        networks.set_status(id, Status::Started).unwrap();
        let chart = orchestrator
            .sync_chart(networks.network(id).unwrap())
            .await
            .unwrap();
        let link = &chart.links["bbbbbbbbbb:0"];
        assert_eq!(link.to.node_id, "bob");

        orchestrator
            .remove_lightning_node(&mut networks, id, "bob")
            .await
            .unwrap();
        assert!(orchestrator.store().get(id, "bob").await.is_none());
        let chart = orchestrator.chart(id).await.unwrap();
        assert_eq!(chart.nodes.keys().collect::<Vec<_>>(), ["alice", "backend1"]);
        assert_eq!(chart.links.keys().collect::<Vec<_>>(), ["alice-backend1"]);

        let chart = orchestrator
            .sync_chart(networks.network(id).unwrap())
            .await
            .unwrap();
        assert_eq!(chart.links.keys().collect::<Vec<_>>(), ["alice-backend1"]);
    }

    #[tokio::test]
    async fn test_readded_node_starts_without_cached_state() {
        let fake = Arc::new(FakeTransport::new());
        script_lnd(&fake, 8081, "02alice", json!({}));
        script_lnd(&fake, 8082, "02bob", json!({}));

        let dir = tempfile::TempDir::new().unwrap();
        let mut networks = NetworkManager::new(Config::with_data_dir(dir.path())).unwrap();
        let spec = NetworkSpec {
            name: "reused".into(),
            bitcoind: 1,
            lnd: 2,
            clightning: 0,
            eclair: 0,
        };
        let id = networks.create_network(&spec).unwrap().id;

        let orchestrator = orchestrator(&fake);
        let bob = networks.network(id).unwrap().lightning_node("bob").unwrap().clone();
        orchestrator.get_all_info(&bob).await.unwrap();
        assert!(orchestrator.store().get(id, "bob").await.is_some());

        orchestrator
            .remove_lightning_node(&mut networks, id, "bob")
            .await
            .unwrap();
        assert!(orchestrator.store().get(id, "bob").await.is_none());

        let readded = orchestrator
            .add_lightning_node(&mut networks, id, LightningImplementation::Lnd, None)
            .await
            .unwrap();
        assert_eq!(readded.name, "bob");
        assert!(orchestrator.store().get(id, "bob").await.is_none());
    }

    #[tokio::test]
    async fn test_remove_network_forgets_state_and_chart() {
        let fake = Arc::new(FakeTransport::new());
        script_lnd(&fake, 8081, "02alice", json!({}));

        let dir = tempfile::TempDir::new().unwrap();
        let mut networks = NetworkManager::new(Config::with_data_dir(dir.path())).unwrap();
        let spec = NetworkSpec {
            name: "doomed".into(),
            bitcoind: 1,
            lnd: 1,
            clightning: 0,
            eclair: 0,
        };
        let id = networks.create_network(&spec).unwrap().id;
        networks.set_status(id, Status::Started).unwrap();

        let orchestrator = orchestrator(&fake);
        orchestrator
            .sync_chart(networks.network(id).unwrap())
            .await
            .unwrap();
        assert!(orchestrator.store().get(id, "alice").await.is_some());

        orchestrator.remove_network(&mut networks, id).await.unwrap();
        assert!(orchestrator.chart(id).await.is_none());
        assert!(orchestrator.store().snapshot(id).await.is_empty());
    }

    #[tokio::test]
    async fn test_move_node_needs_a_synced_chart() {
        let fake = Arc::new(FakeTransport::new());
        let orchestrator = orchestrator(&fake);
        assert!(!orchestrator.move_node(1, "alice", Position { x: 0.0, y: 0.0 }, true).await);
    }
}
