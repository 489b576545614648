//! Network and node descriptors.
//!
//! Descriptors are the only state handed to and from the process launcher.
//! They are created when a network is assembled and are mutated only by the
//! topology allocator and the orchestrator.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Lifecycle status of a network or node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Node processes are being launched.
    Starting,
    /// Node processes are running.
    Started,
    /// Node processes are shutting down.
    Stopping,
    /// Nothing is running.
    Stopped,
    /// Launching or stopping failed.
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Starting => "Starting",
            Self::Started => "Started",
            Self::Stopping => "Stopping",
            Self::Stopped => "Stopped",
            Self::Error => "Error",
        };
        f.write_str(label)
    }
}

/// Bitcoin backend implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BitcoinImplementation {
    /// Bitcoin Core.
    #[serde(rename = "bitcoind")]
    Bitcoind,
}

impl BitcoinImplementation {
    /// Display name, also the source of the image name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bitcoind => "bitcoind",
        }
    }
}

impl fmt::Display for BitcoinImplementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Lightning implementation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LightningImplementation {
    /// LND (Lightning Network Daemon).
    #[serde(rename = "LND")]
    Lnd,
    /// Core Lightning behind c-lightning-REST.
    #[serde(rename = "c-lightning")]
    CLightning,
    /// ACINQ eclair.
    #[serde(rename = "eclair")]
    Eclair,
}

impl LightningImplementation {
    /// Get all available Lightning implementations.
    pub const fn all() -> &'static [Self] {
        &[Self::Lnd, Self::CLightning, Self::Eclair]
    }

    /// Display name, also the source of the image name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::Lnd => "LND",
            Self::CLightning => "c-lightning",
            Self::Eclair => "eclair",
        }
    }
}

impl fmt::Display for LightningImplementation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The purpose a published port serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PortRole {
    /// bitcoind JSON-RPC.
    Rpc,
    /// Peer-to-peer listener.
    P2p,
    /// bitcoind ZMQ raw block publisher.
    ZmqBlock,
    /// bitcoind ZMQ raw transaction publisher.
    ZmqTx,
    /// REST API.
    Rest,
    /// gRPC API.
    Grpc,
}

impl fmt::Display for PortRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Rpc => "rpc",
            Self::P2p => "p2p",
            Self::ZmqBlock => "zmqBlock",
            Self::ZmqTx => "zmqTx",
            Self::Rest => "rest",
            Self::Grpc => "grpc",
        };
        f.write_str(label)
    }
}

/// Role to host port mapping of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodePorts(BTreeMap<PortRole, u16>);

impl NodePorts {
    /// Create an empty port map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, role: PortRole, port: u16) -> Self {
        self.0.insert(role, port);
        self
    }

    /// Port published for `role`, if any.
    pub fn get(&self, role: PortRole) -> Option<u16> {
        self.0.get(&role).copied()
    }

    /// Set the port published for `role`.
    pub fn set(&mut self, role: PortRole, port: u16) {
        self.0.insert(role, port);
    }

    /// Iterate over `(role, port)` pairs in role order.
    pub fn iter(&self) -> impl Iterator<Item = (PortRole, u16)> + '_ {
        self.0.iter().map(|(role, port)| (*role, *port))
    }

    /// Overwrite every role present in `other`.
    pub fn merge(&mut self, other: &Self) {
        for (role, port) in other.iter() {
            self.set(role, port);
        }
    }

    /// Check if no ports are mapped.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Implementation-specific credential files of a Lightning node.
///
/// Paths are computed from the network root when the node is created and
/// are not stored anywhere else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NodePaths {
    /// LND data directory files.
    #[serde(rename = "LND")]
    Lnd {
        /// TLS certificate served by the REST listener.
        tls_cert: PathBuf,
        /// Admin macaroon.
        admin_macaroon: PathBuf,
        /// Read-only macaroon.
        readonly_macaroon: PathBuf,
    },
    /// c-lightning-REST files.
    #[serde(rename = "c-lightning")]
    CLightning {
        /// REST API access macaroon.
        macaroon: PathBuf,
    },
    /// No credential files (password based APIs).
    #[serde(rename = "none")]
    None,
}

/// A Bitcoin backend node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitcoinNode {
    /// Id, unique among the network's Bitcoin nodes.
    pub id: u32,
    /// Owning network id.
    pub network_id: u32,
    /// Node name.
    pub name: String,
    /// Implementation tag.
    pub implementation: BitcoinImplementation,
    /// Image version.
    pub version: String,
    /// Lifecycle status.
    pub status: Status,
    /// Names of the Bitcoin nodes this node peers with.
    pub peers: Vec<String>,
    /// Published ports.
    pub ports: NodePorts,
}

impl BitcoinNode {
    /// Port for `role`, or an error naming the node.
    pub fn require_port(&self, role: PortRole) -> Result<u16> {
        require_port(&self.name, &self.ports, role)
    }

    /// Canonical image identifier, e.g. `bitcoind:28.0`.
    pub fn image(&self) -> String {
        image_id(self.implementation.name(), &self.version)
    }
}

/// A Lightning node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LightningNode {
    /// Id, unique among the network's Lightning nodes.
    pub id: u32,
    /// Owning network id.
    pub network_id: u32,
    /// Node name.
    pub name: String,
    /// Implementation tag.
    pub implementation: LightningImplementation,
    /// Image version.
    pub version: String,
    /// Lifecycle status.
    pub status: Status,
    /// Name of the backing Bitcoin node.
    pub backend_name: String,
    /// Published ports.
    pub ports: NodePorts,
    /// Credential files.
    pub paths: NodePaths,
}

impl LightningNode {
    /// Port for `role`, or an error naming the node.
    pub fn require_port(&self, role: PortRole) -> Result<u16> {
        require_port(&self.name, &self.ports, role)
    }

    /// Canonical image identifier, e.g. `clightning:24.11`.
    pub fn image(&self) -> String {
        image_id(self.implementation.name(), &self.version)
    }
}

fn require_port(name: &str, ports: &NodePorts, role: PortRole) -> Result<u16> {
    ports.get(role).ok_or_else(|| Error::MissingPort {
        node: name.to_string(),
        role: role.to_string(),
    })
}

/// `lowercased implementation name with separators stripped : version`.
pub fn image_id(implementation: &str, version: &str) -> String {
    let name: String = implementation
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    format!("{name}:{version}")
}

/// The nodes of a network, Bitcoin backends first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkNodes {
    /// Bitcoin backends, in creation order.
    pub bitcoin: Vec<BitcoinNode>,
    /// Lightning nodes, in creation order.
    pub lightning: Vec<LightningNode>,
}

/// A regtest Lightning Network topology.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Network {
    /// Unique identifier.
    pub id: u32,
    /// Human-readable name.
    pub name: String,
    /// Network status.
    pub status: Status,
    /// Filesystem root holding the nodes' volumes.
    pub path: PathBuf,
    /// Nodes in this network.
    pub nodes: NetworkNodes,
}

impl Network {
    /// Create an empty network.
    pub fn new(id: u32, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            name: name.into(),
            status: Status::Stopped,
            path: path.into(),
            nodes: NetworkNodes::default(),
        }
    }

    /// Look up a Bitcoin node by name.
    pub fn bitcoin_node(&self, name: &str) -> Result<&BitcoinNode> {
        self.nodes
            .bitcoin
            .iter()
            .find(|n| n.name == name)
            .ok_or_else(|| Error::NodeNotFound(name.to_string()))
    }

    /// Look up a Lightning node by name.
    pub fn lightning_node(&self, name: &str) -> Result<&LightningNode> {
        self.nodes
            .lightning
            .iter()
            .find(|n| n.name == name)
            .ok_or_else(|| Error::NodeNotFound(name.to_string()))
    }

    /// Resolve the Bitcoin node backing `node`.
    pub fn backend_of(&self, node: &LightningNode) -> Result<&BitcoinNode> {
        self.nodes
            .bitcoin
            .iter()
            .find(|n| n.name == node.backend_name)
            .ok_or_else(|| {
                Error::MissingBackend(format!(
                    "'{}' is backed by '{}' which is not in network '{}'",
                    node.name, node.backend_name, self.name
                ))
            })
    }

    /// Check that every Lightning node's backend resolves within this network.
    pub fn validate_backends(&self) -> Result<()> {
        for node in &self.nodes.lightning {
            self.backend_of(node)?;
        }
        Ok(())
    }

    /// Set the status of the network and every node in it.
    pub fn set_status(&mut self, status: Status) {
        self.status = status;
        for node in &mut self.nodes.bitcoin {
            node.status = status;
        }
        for node in &mut self.nodes.lightning {
            node.status = status;
        }
    }

    /// Names of every node, Bitcoin first.
    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.nodes
            .bitcoin
            .iter()
            .map(|n| n.name.as_str())
            .chain(self.nodes.lightning.iter().map(|n| n.name.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_id_strips_separators() {
        assert_eq!(image_id("c-lightning", "24.11"), "clightning:24.11");
        assert_eq!(image_id("LND", "0.18.5-beta"), "lnd:0.18.5-beta");
    }

    #[test]
    fn test_ports_serialize_by_role() {
        let ports = NodePorts::new()
            .with(PortRole::Rest, 8081)
            .with(PortRole::Grpc, 10001);
        let json = serde_json::to_value(&ports).unwrap();
        assert_eq!(json["rest"], 8081);
        assert_eq!(json["grpc"], 10001);
    }

    #[test]
    fn test_implementation_tags_round_trip_by_name() {
        let json = serde_json::to_string(&LightningImplementation::CLightning).unwrap();
        assert_eq!(json, "\"c-lightning\"");
    }

    #[test]
    fn test_missing_port_names_node_and_role() {
        let node = BitcoinNode {
            id: 0,
            network_id: 1,
            name: "backend1".into(),
            implementation: BitcoinImplementation::Bitcoind,
            version: "28.0".into(),
            status: Status::Stopped,
            peers: vec![],
            ports: NodePorts::new(),
        };
        let err = node.require_port(PortRole::Rpc).unwrap_err();
        assert_eq!(err.to_string(), "node 'backend1' has no rpc port");
    }
}
