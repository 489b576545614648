//! Network registry and persistence.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use regnet_core::topology::{
    NetworkConfig, PortProbe, apply_open_ports, create_bitcoind_node, create_lightning_node,
    create_network, default_lightning_version, get_open_ports,
};
use regnet_core::constants::DEFAULT_BITCOIND_VERSION;
use regnet_core::{
    BitcoinNode, Config, Error, LightningImplementation, LightningNode, Network, Result, Status,
};
use tracing::{debug, info, warn};

/// Node counts of a network to create.
#[derive(Debug, Clone)]
pub struct NetworkSpec {
    /// Network name.
    pub name: String,
    /// Number of bitcoind backends.
    pub bitcoind: usize,
    /// Number of LND nodes.
    pub lnd: usize,
    /// Number of c-lightning nodes.
    pub clightning: usize,
    /// Number of eclair nodes.
    pub eclair: usize,
}

impl NetworkSpec {
    /// One backend and one node of each Lightning implementation.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            bitcoind: 1,
            lnd: 1,
            clightning: 1,
            eclair: 1,
        }
    }
}

/// Owns every known network and keeps `networks/<id>.json` in sync with it.
#[derive(Debug)]
pub struct NetworkManager {
    config: Config,
    networks: BTreeMap<u32, Network>,
}

impl NetworkManager {
    /// Create a manager and load the networks already saved under `config`.
    pub fn new(config: Config) -> Result<Self> {
        let mut manager = Self {
            config,
            networks: BTreeMap::new(),
        };
        manager.load_networks()?;
        Ok(manager)
    }

    /// The configuration this manager was created with.
    pub const fn config(&self) -> &Config {
        &self.config
    }

    fn network_file_path(&self, id: u32) -> PathBuf {
        self.config.networks_dir().join(format!("{id}.json"))
    }

    fn save_network(&self, network: &Network) -> Result<()> {
        std::fs::create_dir_all(self.config.networks_dir())?;
        let content = serde_json::to_string_pretty(network)?;
        std::fs::write(self.network_file_path(network.id), content)?;
        debug!(network = network.id, "saved network");
        Ok(())
    }

    fn load_network(path: &Path) -> Result<Network> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn load_networks(&mut self) -> Result<()> {
        let dir = self.config.networks_dir();
        if !dir.exists() {
            return Ok(());
        }

        for entry in std::fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.extension().and_then(|s| s.to_str()) != Some("json") {
                continue;
            }
            match Self::load_network(&path) {
                Ok(network) => {
                    self.networks.insert(network.id, network);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "failed to load network"),
            }
        }
        debug!(count = self.networks.len(), "loaded networks");
        Ok(())
    }

    fn persist(&self, id: u32) -> Result<&Network> {
        let network = self.network(id)?;
        self.save_network(network)?;
        Ok(network)
    }

    fn network_mut(&mut self, id: u32) -> Result<&mut Network> {
        self.networks
            .get_mut(&id)
            .ok_or_else(|| Error::NetworkNotFound(id.to_string()))
    }

    /// Every network, ordered by id.
    pub fn networks(&self) -> impl Iterator<Item = &Network> {
        self.networks.values()
    }

    /// Look up a network by id.
    pub fn network(&self, id: u32) -> Result<&Network> {
        self.networks
            .get(&id)
            .ok_or_else(|| Error::NetworkNotFound(id.to_string()))
    }

    /// Look up a network by name.
    pub fn network_by_name(&self, name: &str) -> Result<&Network> {
        self.networks
            .values()
            .find(|n| n.name == name)
            .ok_or_else(|| Error::NetworkNotFound(name.to_string()))
    }

    /// Create and persist a stopped network.
    pub fn create_network(&mut self, spec: &NetworkSpec) -> Result<&Network> {
        if self.networks.values().any(|n| n.name == spec.name) {
            return Err(Error::Config(format!("network '{}' already exists", spec.name)));
        }

        let id = self.networks.keys().next_back().map_or(1, |id| id + 1);
        let network = create_network(&NetworkConfig {
            id,
            name: spec.name.clone(),
            path: self.config.networks_dir().join(id.to_string()),
            bitcoind_nodes: spec.bitcoind,
            lnd_nodes: spec.lnd,
            clightning_nodes: spec.clightning,
            eclair_nodes: spec.eclair,
            status: Status::Stopped,
        })?;
        info!(network = id, name = %network.name, "created network");

        self.networks.insert(id, network);
        self.persist(id)
    }

    /// Delete a network and its descriptor file.
    pub fn remove_network(&mut self, id: u32) -> Result<Network> {
        let network = self
            .networks
            .remove(&id)
            .ok_or_else(|| Error::NetworkNotFound(id.to_string()))?;
        let path = self.network_file_path(id);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        info!(network = id, "removed network");
        Ok(network)
    }

    /// Append a Lightning node, using the implementation's default version
    /// when `version` is `None`.
    pub fn add_lightning_node(
        &mut self,
        id: u32,
        implementation: LightningImplementation,
        version: Option<&str>,
    ) -> Result<LightningNode> {
        let network = self.network_mut(id)?;
        let version = version.unwrap_or_else(|| default_lightning_version(implementation));
        let node = create_lightning_node(network, implementation, version, Status::Stopped)?;
        network.nodes.lightning.push(node.clone());
        info!(network = id, node = %node.name, %implementation, "added lightning node");
        self.persist(id)?;
        Ok(node)
    }

    /// Append a bitcoind backend peered with the previous one.
    pub fn add_bitcoin_node(&mut self, id: u32, version: Option<&str>) -> Result<BitcoinNode> {
        let network = self.network_mut(id)?;
        let node = create_bitcoind_node(
            network,
            version.unwrap_or(DEFAULT_BITCOIND_VERSION),
            Status::Stopped,
        );
        network.nodes.bitcoin.push(node.clone());
        info!(network = id, node = %node.name, "added bitcoin node");
        self.persist(id)?;
        Ok(node)
    }

    /// Remove a Lightning node.
    pub fn remove_lightning_node(&mut self, id: u32, name: &str) -> Result<LightningNode> {
        let network = self.network_mut(id)?;
        let index = network
            .nodes
            .lightning
            .iter()
            .position(|n| n.name == name)
            .ok_or_else(|| Error::NodeNotFound(name.to_string()))?;
        let node = network.nodes.lightning.remove(index);
        info!(network = id, node = %node.name, "removed lightning node");
        self.persist(id)?;
        Ok(node)
    }

    /// Replace any taken ports of nodes that are not running.
    ///
    /// Returns `true` if the network was rewritten.
    pub async fn check_ports(&mut self, id: u32, probe: &dyn PortProbe) -> Result<bool> {
        let Some(ports) = get_open_ports(self.network(id)?, probe).await? else {
            return Ok(false);
        };
        apply_open_ports(self.network_mut(id)?, &ports);
        self.persist(id)?;
        Ok(true)
    }

    /// Set the status of a network and all of its nodes.
    pub fn set_status(&mut self, id: u32, status: Status) -> Result<&Network> {
        self.network_mut(id)?.set_status(status);
        info!(network = id, %status, "updated network status");
        self.persist(id)
    }
}
