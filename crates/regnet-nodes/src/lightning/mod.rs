//! Lightning node adapters.
//!
//! Three implementations with structurally different APIs sit behind
//! [`LightningService`]. Every adapter normalizes amounts to satoshis and
//! only reports channels the queried node initiated that are not closed.
//! [`LightningFactory`] is the one place that picks an adapter for a node.

use std::time::Duration;

use async_trait::async_trait;
use regnet_core::{
    Channel, ChannelPoint, Error, LightningImplementation, LightningNode, NewAddress, NodeInfo,
    PayReceipt, Peer, PeerUri, Result, WalletBalances, wait_for,
};
use serde::{Deserialize, Deserializer};

mod clightning;
mod eclair;
mod factory;
mod lnd;

pub use clightning::CLightningService;
pub use eclair::EclairService;
pub use factory::LightningFactory;
pub use lnd::LndService;

/// The capability set every Lightning adapter provides.
#[async_trait]
pub trait LightningService: Send + Sync {
    /// Implementation this adapter serves.
    fn implementation(&self) -> LightningImplementation;

    /// How long to wait after mining for nodes of this implementation to
    /// process the new blocks.
    fn settle_delay(&self) -> Duration;

    /// Node identity, sync state and channel counts.
    async fn get_info(&self, node: &LightningNode) -> Result<NodeInfo>;

    /// On-chain wallet balances.
    async fn get_balances(&self, node: &LightningNode) -> Result<WalletBalances>;

    /// Fresh on-chain receiving address.
    async fn get_new_address(&self, node: &LightningNode) -> Result<NewAddress>;

    /// Non-closed channels initiated by `node`.
    async fn get_channels(&self, node: &LightningNode) -> Result<Vec<Channel>>;

    /// Connected peers.
    async fn get_peers(&self, node: &LightningNode) -> Result<Vec<Peer>>;

    /// Connect to the peer at `rpc_url` (`pubkey@host:port`).
    async fn connect_peer(&self, node: &LightningNode, rpc_url: &str) -> Result<()>;

    /// Open a channel of `sats` to the node at `to_rpc_url`, connecting first
    /// if the two are not yet peers.
    async fn open_channel(
        &self,
        from: &LightningNode,
        to_rpc_url: &str,
        sats: u64,
    ) -> Result<ChannelPoint>;

    /// Cooperatively close the channel identified by `channel_point`.
    async fn close_channel(&self, node: &LightningNode, channel_point: &str) -> Result<()>;

    /// Create a BOLT11 invoice for `sats`.
    async fn create_invoice(
        &self,
        node: &LightningNode,
        sats: u64,
        memo: Option<&str>,
    ) -> Result<String>;

    /// Pay `invoice`, optionally overriding its amount.
    ///
    /// A failure reported by the node is returned as [`Error::PaymentFailed`]
    /// carrying the node's reason.
    async fn pay_invoice(
        &self,
        node: &LightningNode,
        invoice: &str,
        sats: Option<u64>,
    ) -> Result<PayReceipt>;

    /// Poll [`get_info`](Self::get_info) until the node answers.
    async fn wait_until_online(
        &self,
        node: &LightningNode,
        interval: Duration,
        timeout: Duration,
    ) -> Result<NodeInfo> {
        wait_for(|| self.get_info(node), interval, timeout).await
    }
}

/// Reject nodes of another implementation.
pub(crate) fn ensure_implementation(
    required: LightningImplementation,
    node: &LightningNode,
) -> Result<()> {
    if node.implementation == required {
        Ok(())
    } else {
        Err(Error::WrongAdapterForNode {
            required,
            actual: node.implementation,
        })
    }
}

/// Connect `from` to the peer behind `to_rpc_url` unless already connected.
/// Returns the peer's pubkey.
pub(crate) async fn ensure_peer<S>(
    service: &S,
    from: &LightningNode,
    to_rpc_url: &str,
) -> Result<String>
where
    S: LightningService + ?Sized,
{
    let uri: PeerUri = to_rpc_url.parse()?;
    let peers = service.get_peers(from).await?;
    if peers.iter().any(|p| p.pubkey == uri.pubkey) {
        tracing::debug!(node = %from.name, peer = %uri.pubkey, "already connected");
    } else {
        service.connect_peer(from, to_rpc_url).await?;
    }
    Ok(uri.pubkey)
}

/// Accept an integer sent either as a JSON number or as a decimal string,
/// as gateways for 64-bit protobuf fields do.
pub(crate) fn de_u64<'de, D>(deserializer: D) -> std::result::Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) if s.is_empty() => Ok(0),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}
