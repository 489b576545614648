//! Normalized Lightning node state.
//!
//! Every adapter converts its native payloads into these shapes. All amounts
//! are satoshis rendered as decimal strings, whatever unit the node reports.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Information about a Lightning node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    /// Identity public key.
    pub pubkey: String,
    /// Node alias.
    pub alias: String,
    /// Is synced to chain.
    pub synced_to_chain: bool,
    /// Block height.
    pub block_height: u32,
    /// Number of pending channels.
    pub num_pending_channels: u32,
    /// Number of active channels.
    pub num_active_channels: u32,
    /// Number of inactive channels.
    pub num_inactive_channels: u32,
    /// Connection identifier, `pubkey@host:port`.
    pub rpc_url: String,
}

/// On-chain wallet balances, in satoshis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletBalances {
    /// Confirmed plus unconfirmed.
    pub total: String,
    /// Confirmed balance.
    pub confirmed: String,
    /// Unconfirmed balance.
    pub unconfirmed: String,
}

impl WalletBalances {
    /// Build from confirmed and unconfirmed satoshi amounts.
    pub fn from_sats(confirmed: u64, unconfirmed: u64) -> Self {
        Self {
            total: (confirmed + unconfirmed).to_string(),
            confirmed: confirmed.to_string(),
            unconfirmed: unconfirmed.to_string(),
        }
    }
}

/// A fresh on-chain receiving address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAddress {
    /// The address.
    pub address: String,
}

/// Channel state as classified at the last poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelStatus {
    /// Funding transaction not yet confirmed.
    Opening,
    /// Usable.
    Open,
    /// Cooperative close in progress.
    Closing,
    /// Unilateral close in progress.
    #[serde(rename = "Force Closing")]
    ForceClosing,
    /// Closing transaction broadcast, awaiting confirmation.
    #[serde(rename = "Waiting to Close")]
    WaitingToClose,
    /// Closed on chain.
    Closed,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Opening => "Opening",
            Self::Open => "Open",
            Self::Closing => "Closing",
            Self::ForceClosing => "Force Closing",
            Self::WaitingToClose => "Waiting to Close",
            Self::Closed => "Closed",
        };
        f.write_str(label)
    }
}

/// A channel initiated by the queried node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Channel {
    /// Anything but [`ChannelStatus::Open`].
    pub pending: bool,
    /// Stable key derived from the funding outpoint.
    pub unique_id: String,
    /// Identifier the node accepts when closing the channel.
    pub channel_point: String,
    /// Counterparty public key.
    pub pubkey: String,
    /// Capacity.
    pub capacity: String,
    /// Our side of the balance.
    pub local_balance: String,
    /// Their side of the balance.
    pub remote_balance: String,
    /// Classified state.
    pub status: ChannelStatus,
}

/// The funding outpoint of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPoint {
    /// Funding transaction id.
    pub txid: String,
    /// Funding output index. Adapters whose node does not report it use 0.
    pub index: u32,
}

impl ChannelPoint {
    /// The last twelve characters of `txid:index`.
    pub fn unique_id(&self) -> String {
        unique_id(&self.to_string())
    }
}

impl fmt::Display for ChannelPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.txid, self.index)
    }
}

impl std::str::FromStr for ChannelPoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (txid, index) = s
            .rsplit_once(':')
            .ok_or_else(|| Error::UnexpectedResponse(format!("invalid channel point '{s}'")))?;
        let index = index
            .parse()
            .map_err(|_| Error::UnexpectedResponse(format!("invalid channel point '{s}'")))?;
        Ok(Self {
            txid: txid.to_string(),
            index,
        })
    }
}

/// Last twelve characters of a funding outpoint string.
pub fn unique_id(outpoint: &str) -> String {
    let start = outpoint
        .char_indices()
        .rev()
        .nth(11)
        .map_or(0, |(index, _)| index);
    outpoint[start..].to_string()
}

/// A connected peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Peer public key.
    pub pubkey: String,
    /// Network address the peer is connected on.
    pub address: String,
}

/// Result of a successful payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayReceipt {
    /// Payment preimage, hex.
    pub preimage: String,
    /// Amount paid in satoshis.
    pub amount: u64,
    /// Destination public key.
    pub destination: String,
}

/// A parsed `pubkey@host:port` connection identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerUri {
    /// Peer public key.
    pub pubkey: String,
    /// `host:port`.
    pub host: String,
}

impl std::str::FromStr for PeerUri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('@') {
            Some((pubkey, host)) if !pubkey.is_empty() && !host.is_empty() => Ok(Self {
                pubkey: pubkey.to_string(),
                host: host.to_string(),
            }),
            _ => Err(Error::InvalidPeerAddress(s.to_string())),
        }
    }
}

/// Cached state of one Lightning node. A `None` field has not been polled yet.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LightningNodeState {
    /// Latest node info.
    pub info: Option<NodeInfo>,
    /// Latest wallet balances.
    pub wallet_balance: Option<WalletBalances>,
    /// Latest channel list.
    pub channels: Option<Vec<Channel>>,
}
