//! Clients for the nodes of a regtest network.
//!
//! [`BitcoindService`] drives the bitcoind backends over JSON-RPC. The
//! Lightning adapters sit behind [`LightningService`] and are picked per node
//! by [`LightningFactory`]. Every request goes through an [`HttpTransport`],
//! so tests can script node responses with `testing::FakeTransport`.

pub mod bitcoind;
pub mod lightning;
pub mod transport;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use bitcoind::{BitcoindService, BlockchainInfo, WalletInfo, WalletTransaction};
pub use lightning::{
    CLightningService, EclairService, LightningFactory, LightningService, LndService,
};
pub use transport::{HttpRequest, HttpTransport, ReqwestTransport};
