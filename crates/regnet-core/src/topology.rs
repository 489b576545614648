//! Network assembly, port allocation and missing image detection.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::constants::{
    DEFAULT_BITCOIND_VERSION, DEFAULT_CLIGHTNING_VERSION, DEFAULT_ECLAIR_VERSION,
    DEFAULT_LND_VERSION,
};
use crate::network::{
    BitcoinImplementation, BitcoinNode, LightningImplementation, LightningNode, Network,
    NodePaths, NodePorts, PortRole, Status,
};
use crate::{Error, Result};

const NAME_COUNT: u32 = 19;

const LIGHTNING_NAMES: [&str; NAME_COUNT as usize] = [
    "alice", "bob", "carol", "dave", "erin", "frank", "grace", "heidi", "ivan", "judy", "mallory",
    "niaj", "oscar", "peggy", "rupert", "sybil", "trent", "victor", "walter",
];

/// Deterministic name for the Lightning node with `id`.
///
/// Ids past the end of the name list wrap around with a numeric suffix,
/// so id 19 is `alice2`.
pub fn lightning_node_name(id: u32) -> String {
    let name = LIGHTNING_NAMES[(id % NAME_COUNT) as usize];
    match id / NAME_COUNT {
        0 => name.to_string(),
        round => format!("{name}{}", round + 1),
    }
}

/// Deterministic name for the Bitcoin node with `id`.
pub fn bitcoin_node_name(id: u32) -> String {
    format!("backend{}", id + 1)
}

/// First port of each role for a Bitcoin implementation; node `id` gets `base + id`.
pub const fn bitcoin_base_ports(
    implementation: BitcoinImplementation,
) -> &'static [(PortRole, u16)] {
    match implementation {
        BitcoinImplementation::Bitcoind => &[
            (PortRole::Rpc, 18443),
            (PortRole::P2p, 19444),
            (PortRole::ZmqBlock, 28334),
            (PortRole::ZmqTx, 29335),
        ],
    }
}

/// First port of each role for a Lightning implementation; node `id` gets `base + id`.
pub const fn lightning_base_ports(
    implementation: LightningImplementation,
) -> &'static [(PortRole, u16)] {
    match implementation {
        LightningImplementation::Lnd => &[
            (PortRole::Rest, 8081),
            (PortRole::Grpc, 10001),
            (PortRole::P2p, 9735),
        ],
        LightningImplementation::CLightning => &[(PortRole::Rest, 8181), (PortRole::P2p, 9835)],
        LightningImplementation::Eclair => &[(PortRole::Rest, 8281), (PortRole::P2p, 9935)],
    }
}

/// Default image version for a Lightning implementation.
pub const fn default_lightning_version(implementation: LightningImplementation) -> &'static str {
    match implementation {
        LightningImplementation::Lnd => DEFAULT_LND_VERSION,
        LightningImplementation::CLightning => DEFAULT_CLIGHTNING_VERSION,
        LightningImplementation::Eclair => DEFAULT_ECLAIR_VERSION,
    }
}

fn offset_ports(base: &[(PortRole, u16)], id: u32) -> NodePorts {
    base.iter().fold(NodePorts::new(), |ports, (role, port)| {
        let offset = u16::try_from(id).unwrap_or(u16::MAX);
        ports.with(*role, port.saturating_add(offset))
    })
}

fn node_dir(network: &Network, implementation: LightningImplementation, name: &str) -> PathBuf {
    network
        .path
        .join("volumes")
        .join(implementation.name().to_lowercase())
        .join(name)
}

fn lightning_paths(
    network: &Network,
    implementation: LightningImplementation,
    name: &str,
) -> NodePaths {
    let dir = node_dir(network, implementation, name);
    match implementation {
        LightningImplementation::Lnd => {
            let macaroons = dir.join("data").join("chain").join("bitcoin").join("regtest");
            NodePaths::Lnd {
                tls_cert: dir.join("tls.cert"),
                admin_macaroon: macaroons.join("admin.macaroon"),
                readonly_macaroon: macaroons.join("readonly.macaroon"),
            }
        }
        LightningImplementation::CLightning => NodePaths::CLightning {
            macaroon: dir.join("rest-api").join("access.macaroon"),
        },
        LightningImplementation::Eclair => NodePaths::None,
    }
}

/// Create the next Bitcoin node of `network`.
///
/// The node peers with the most recently added Bitcoin node so backends
/// form a chain.
pub fn create_bitcoind_node(network: &Network, version: &str, status: Status) -> BitcoinNode {
    let bitcoin = &network.nodes.bitcoin;
    let id = bitcoin.iter().map(|n| n.id + 1).max().unwrap_or(0);
    let implementation = BitcoinImplementation::Bitcoind;
    BitcoinNode {
        id,
        network_id: network.id,
        name: bitcoin_node_name(id),
        implementation,
        version: version.to_string(),
        status,
        peers: bitcoin.last().map(|n| vec![n.name.clone()]).unwrap_or_default(),
        ports: offset_ports(bitcoin_base_ports(implementation), id),
    }
}

/// Create the next Lightning node of `network`.
///
/// Backends are assigned round-robin over the existing Bitcoin nodes.
pub fn create_lightning_node(
    network: &Network,
    implementation: LightningImplementation,
    version: &str,
    status: Status,
) -> Result<LightningNode> {
    let bitcoin = &network.nodes.bitcoin;
    if bitcoin.is_empty() {
        return Err(Error::MissingBackend(format!(
            "network '{}' has no bitcoin nodes",
            network.name
        )));
    }
    let id = network
        .nodes
        .lightning
        .iter()
        .map(|n| n.id + 1)
        .max()
        .unwrap_or(0);
    let name = lightning_node_name(id);
    let backend = &bitcoin[id as usize % bitcoin.len()];
    Ok(LightningNode {
        id,
        network_id: network.id,
        paths: lightning_paths(network, implementation, &name),
        name,
        implementation,
        version: version.to_string(),
        status,
        backend_name: backend.name.clone(),
        ports: offset_ports(lightning_base_ports(implementation), id),
    })
}

/// Node counts and identity of a network to assemble.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Network id.
    pub id: u32,
    /// Network name.
    pub name: String,
    /// Filesystem root of the network.
    pub path: PathBuf,
    /// Number of bitcoind nodes.
    pub bitcoind_nodes: usize,
    /// Number of LND nodes.
    pub lnd_nodes: usize,
    /// Number of c-lightning nodes.
    pub clightning_nodes: usize,
    /// Number of eclair nodes.
    pub eclair_nodes: usize,
    /// Initial status of the network and its nodes.
    pub status: Status,
}

/// Assemble a network: Bitcoin nodes first, then LND, c-lightning and eclair nodes.
pub fn create_network(config: &NetworkConfig) -> Result<Network> {
    let mut network = Network::new(config.id, config.name.clone(), config.path.clone());
    network.status = config.status;

    for _ in 0..config.bitcoind_nodes {
        let node = create_bitcoind_node(&network, DEFAULT_BITCOIND_VERSION, config.status);
        network.nodes.bitcoin.push(node);
    }

    let lightning = [
        (LightningImplementation::Lnd, config.lnd_nodes),
        (LightningImplementation::CLightning, config.clightning_nodes),
        (LightningImplementation::Eclair, config.eclair_nodes),
    ];
    for (implementation, count) in lightning {
        for _ in 0..count {
            let version = default_lightning_version(implementation);
            let node = create_lightning_node(&network, implementation, version, config.status)?;
            network.nodes.lightning.push(node);
        }
    }

    Ok(network)
}

/// Asks the operating system whether a port can be bound.
#[async_trait]
pub trait PortProbe: Send + Sync {
    /// Check if `port` is free.
    async fn is_available(&self, port: u16) -> bool;
}

/// Probes ports by binding a listener on all interfaces.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsPortProbe;

#[async_trait]
impl PortProbe for OsPortProbe {
    async fn is_available(&self, port: u16) -> bool {
        tokio::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .await
            .is_ok()
    }
}

async fn next_open_port(probe: &dyn PortProbe, from: u16) -> Result<u16> {
    let mut port = from;
    loop {
        if probe.is_available(port).await {
            return Ok(port);
        }
        port = port.checked_add(1).ok_or(Error::NoOpenPort(from))?;
    }
}

/// Confirm a range of ports is free, substituting the next free port for any taken one.
///
/// `requested` must be ascending. A substituted port is searched for at or
/// after the previous (possibly adjusted) port plus one, so the result stays
/// strictly ascending and adjusted ranges never overlap.
///
/// If 10002 is taken, `[10001, 10002, 10003]` becomes `[10001, 10003, 10004]`.
pub async fn get_open_port_range(probe: &dyn PortProbe, requested: &[u16]) -> Result<Vec<u16>> {
    let mut open: Vec<u16> = Vec::with_capacity(requested.len());
    for &port in requested {
        let start = match open.last() {
            Some(&last) if port <= last => last.checked_add(1).ok_or(Error::NoOpenPort(last))?,
            _ => port,
        };
        open.push(next_open_port(probe, start).await?);
    }
    Ok(open)
}

/// Replacement ports keyed by node name.
pub type OpenPorts = BTreeMap<String, NodePorts>;

async fn check_group(
    probe: &dyn PortProbe,
    role: PortRole,
    group: &[(&str, u16)],
    out: &mut OpenPorts,
) -> Result<()> {
    let requested: Vec<u16> = group.iter().map(|(_, port)| *port).collect();
    let open = get_open_port_range(probe, &requested).await?;
    if open != requested {
        for ((name, _), port) in group.iter().zip(open) {
            out.entry((*name).to_string()).or_default().set(role, port);
        }
    }
    Ok(())
}

/// Check the ports of every node that is not running and propose replacements.
///
/// Started nodes are skipped since their ports are in use by themselves.
/// Returns `None` when every port is free, so callers can skip rewriting
/// the descriptors.
pub async fn get_open_ports(network: &Network, probe: &dyn PortProbe) -> Result<Option<OpenPorts>> {
    let mut ports = OpenPorts::new();

    let bitcoin: Vec<&BitcoinNode> = network
        .nodes
        .bitcoin
        .iter()
        .filter(|n| n.status != Status::Started)
        .collect();
    for (role, _) in bitcoin_base_ports(BitcoinImplementation::Bitcoind) {
        let group: Vec<(&str, u16)> = bitcoin
            .iter()
            .filter_map(|n| n.ports.get(*role).map(|port| (n.name.as_str(), port)))
            .collect();
        if !group.is_empty() {
            check_group(probe, *role, &group, &mut ports).await?;
        }
    }

    for implementation in LightningImplementation::all() {
        let nodes: Vec<&LightningNode> = network
            .nodes
            .lightning
            .iter()
            .filter(|n| n.implementation == *implementation && n.status != Status::Started)
            .collect();
        for (role, _) in lightning_base_ports(*implementation) {
            let group: Vec<(&str, u16)> = nodes
                .iter()
                .filter_map(|n| n.ports.get(*role).map(|port| (n.name.as_str(), port)))
                .collect();
            if !group.is_empty() {
                check_group(probe, *role, &group, &mut ports).await?;
            }
        }
    }

    Ok(if ports.is_empty() { None } else { Some(ports) })
}

/// Rewrite node ports with the replacements from [`get_open_ports`].
pub fn apply_open_ports(network: &mut Network, ports: &OpenPorts) {
    for node in &mut network.nodes.bitcoin {
        if let Some(update) = ports.get(&node.name) {
            info!(node = %node.name, ?update, "reassigning ports");
            node.ports.merge(update);
        }
    }
    for node in &mut network.nodes.lightning {
        if let Some(update) = ports.get(&node.name) {
            info!(node = %node.name, ?update, "reassigning ports");
            node.ports.merge(update);
        }
    }
}

/// Images needed by `network` that are not in `available`, without duplicates.
pub fn missing_images(network: &Network, available: &[String]) -> Vec<String> {
    let needed = network
        .nodes
        .bitcoin
        .iter()
        .map(BitcoinNode::image)
        .chain(network.nodes.lightning.iter().map(LightningNode::image));

    let mut missing: Vec<String> = Vec::new();
    for image in needed {
        if !available.contains(&image) && !missing.contains(&image) {
            missing.push(image);
        }
    }
    if !missing.is_empty() {
        debug!(network = %network.name, ?missing, "network is missing docker images");
    }
    missing
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct TakenPorts(HashSet<u16>);

    #[async_trait]
    impl PortProbe for TakenPorts {
        async fn is_available(&self, port: u16) -> bool {
            !self.0.contains(&port)
        }
    }

    fn taken(ports: &[u16]) -> TakenPorts {
        TakenPorts(ports.iter().copied().collect())
    }

    fn network() -> Network {
        create_network(&NetworkConfig {
            id: 1,
            name: "my network".into(),
            path: PathBuf::from("/tmp/regnet/networks/1"),
            bitcoind_nodes: 1,
            lnd_nodes: 2,
            clightning_nodes: 1,
            eclair_nodes: 0,
            status: Status::Stopped,
        })
        .unwrap()
    }

    #[test]
    fn test_create_network_names_and_backends() {
        let network = network();
        let names: Vec<_> = network.node_names().collect();
        assert_eq!(names, ["backend1", "alice", "bob", "carol"]);
        assert!(network.nodes.lightning.iter().all(|n| n.backend_name == "backend1"));
        assert_eq!(network.nodes.lightning[2].implementation, LightningImplementation::CLightning);
        network.validate_backends().unwrap();
    }

    #[test]
    fn test_ports_are_base_plus_id() {
        let network = network();
        let bob = network.lightning_node("bob").unwrap();
        assert_eq!(bob.ports.get(PortRole::Rest), Some(8082));
        assert_eq!(bob.ports.get(PortRole::Grpc), Some(10002));
        let carol = network.lightning_node("carol").unwrap();
        assert_eq!(carol.ports.get(PortRole::Rest), Some(8183));
        assert_eq!(carol.ports.get(PortRole::Grpc), None);
        let backend = network.bitcoin_node("backend1").unwrap();
        assert_eq!(backend.ports.get(PortRole::Rpc), Some(18443));
    }

    #[test]
    fn test_ports_are_unique_within_network() {
        let network = create_network(&NetworkConfig {
            id: 2,
            name: "big".into(),
            path: PathBuf::from("/tmp/big"),
            bitcoind_nodes: 3,
            lnd_nodes: 4,
            clightning_nodes: 4,
            eclair_nodes: 4,
            status: Status::Stopped,
        })
        .unwrap();
        let mut seen = HashSet::new();
        let all = network
            .nodes
            .bitcoin
            .iter()
            .flat_map(|n| n.ports.iter())
            .chain(network.nodes.lightning.iter().flat_map(|n| n.ports.iter()));
        for (_, port) in all {
            assert!(seen.insert(port), "port {port} assigned twice");
        }
    }

    #[test]
    fn test_backends_round_robin_and_peer_chain() {
        let network = create_network(&NetworkConfig {
            id: 3,
            name: "multi".into(),
            path: PathBuf::from("/tmp/multi"),
            bitcoind_nodes: 2,
            lnd_nodes: 3,
            clightning_nodes: 0,
            eclair_nodes: 0,
            status: Status::Stopped,
        })
        .unwrap();
        let backends: Vec<_> = network
            .nodes
            .lightning
            .iter()
            .map(|n| n.backend_name.as_str())
            .collect();
        assert_eq!(backends, ["backend1", "backend2", "backend1"]);
        assert!(network.nodes.bitcoin[0].peers.is_empty());
        assert_eq!(network.nodes.bitcoin[1].peers, ["backend1"]);
    }

    #[test]
    fn test_lightning_requires_bitcoin_backend() {
        let network = Network::new(1, "empty", "/tmp/empty");
        let err = create_lightning_node(
            &network,
            LightningImplementation::Lnd,
            "0.18.5-beta",
            Status::Stopped,
        )
        .unwrap_err();
        assert!(matches!(err, Error::MissingBackend(_)));
    }

    #[test]
    fn test_lnd_paths_live_under_network_volume() {
        let network = network();
        let alice = network.lightning_node("alice").unwrap();
        match &alice.paths {
            NodePaths::Lnd { tls_cert, admin_macaroon, .. } => {
                assert_eq!(
                    tls_cert,
                    &PathBuf::from("/tmp/regnet/networks/1/volumes/lnd/alice/tls.cert")
                );
                assert!(admin_macaroon.ends_with("data/chain/bitcoin/regtest/admin.macaroon"));
            }
            other => panic!("unexpected paths {other:?}"),
        }
    }

    #[test]
    fn test_names_wrap_with_suffix() {
        assert_eq!(lightning_node_name(0), "alice");
        assert_eq!(lightning_node_name(18), "walter");
        assert_eq!(lightning_node_name(19), "alice2");
        assert_eq!(lightning_node_name(39), "bob3");
        assert_eq!(lightning_node_name(u32::MAX), "frank226050911");
        assert_eq!(bitcoin_node_name(0), "backend1");
    }

    #[tokio::test]
    async fn test_open_port_range_unchanged_when_free() {
        let ports = get_open_port_range(&taken(&[]), &[10001, 10002, 10003]).await.unwrap();
        assert_eq!(ports, [10001, 10002, 10003]);
    }

    #[tokio::test]
    async fn test_open_port_range_shifts_after_taken_port() {
        let ports = get_open_port_range(&taken(&[10002]), &[10001, 10002, 10003]).await.unwrap();
        assert_eq!(ports, [10001, 10003, 10004]);
    }

    #[tokio::test]
    async fn test_open_port_range_stays_ascending() {
        let requested = [10001, 10002, 10003, 10004];
        let ports = get_open_port_range(&taken(&[10001, 10002, 10005]), &requested)
            .await
            .unwrap();
        assert_eq!(ports, [10003, 10004, 10006, 10007]);
        assert!(ports.windows(2).all(|w| w[0] < w[1]));
        assert!(ports[0] > requested[0]);
    }

    #[tokio::test]
    async fn test_open_ports_none_when_all_free() {
        let network = network();
        assert!(get_open_ports(&network, &taken(&[])).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_open_ports_reports_group_of_taken_port() {
        let mut network = network();
        let ports = get_open_ports(&network, &taken(&[8081]))
            .await
            .unwrap()
            .expect("ports should change");
        assert_eq!(ports["alice"].get(PortRole::Rest), Some(8082));
        assert_eq!(ports["bob"].get(PortRole::Rest), Some(8083));
        assert_eq!(ports["alice"].get(PortRole::Grpc), None);
        assert!(!ports.contains_key("carol"));

        apply_open_ports(&mut network, &ports);
        let alice = network.lightning_node("alice").unwrap();
        assert_eq!(alice.ports.get(PortRole::Rest), Some(8082));
        assert_eq!(alice.ports.get(PortRole::Grpc), Some(10001));
    }

    #[tokio::test]
    async fn test_open_ports_skips_started_nodes() {
        let mut network = network();
        network.set_status(Status::Started);
        assert!(get_open_ports(&network, &taken(&[8081, 18443])).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_os_probe_detects_bound_port() {
        let listener = tokio::net::TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!OsPortProbe.is_available(port).await);
        let ports = get_open_port_range(&OsPortProbe, &[port]).await.unwrap();
        assert!(ports[0] > port);
    }

    #[test]
    fn test_missing_images_deduplicated() {
        let network = network();
        let missing = missing_images(&network, &[]);
        assert_eq!(missing, ["bitcoind:28.0", "lnd:0.18.5-beta", "clightning:24.11"]);

        let available = vec!["lnd:0.18.5-beta".to_string(), "bitcoind:28.0".to_string()];
        assert_eq!(missing_images(&network, &available), ["clightning:24.11"]);
    }
}
