//! Core types and configuration for regnet.
//!
//! This crate provides the network data model, topology assembly, the chart
//! model, shared error types and the polling primitive used across the
//! regnet workspace.

pub mod constants;
pub mod graph;
pub mod topology;
pub mod units;

mod config;
mod error;
mod network;
mod node_info;
mod wait;

pub use config::Config;
pub use error::{Error, Result};
pub use network::{
    BitcoinImplementation, BitcoinNode, LightningImplementation, LightningNode, Network,
    NetworkNodes, NodePaths, NodePorts, PortRole, Status, image_id,
};
pub use node_info::{
    Channel, ChannelPoint, ChannelStatus, LightningNodeState, NewAddress, NodeInfo, PayReceipt,
    Peer, PeerUri, WalletBalances, unique_id,
};
pub use wait::wait_for;
