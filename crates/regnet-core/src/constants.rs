//! Regtest constants shared by the allocator, the adapters and the workflows.

use std::time::Duration;

/// RPC username baked into every bitcoind container.
pub const BITCOIN_RPC_USER: &str = "polaruser";
/// RPC password baked into every bitcoind container.
pub const BITCOIN_RPC_PASS: &str = "polarpass";
/// API password baked into every eclair container.
pub const ECLAIR_API_PASS: &str = "eclairpw";

/// Host the node processes publish their ports on.
pub const LOCALHOST: &str = "127.0.0.1";

/// Confirmations before a coinbase output can be spent.
pub const COINBASE_MATURITY: u64 = 100;
/// Regtest halving interval in blocks.
pub const HALVING_INTERVAL: u64 = 150;
/// Block subsidy of the first halving epoch, in satoshis (50 BTC).
pub const INITIAL_BLOCK_REWARD_SATS: u64 = 50 * SATS_PER_BTC;
/// Depth mined by workflows to confirm a transaction.
pub const BLOCKS_TIL_CONFIRMED: u64 = 6;

/// Satoshis per bitcoin.
pub const SATS_PER_BTC: u64 = 100_000_000;

/// Pause after a maturity mining burst so sibling nodes can catch up.
pub const MATURITY_CONVERGENCE_DELAY: Duration = Duration::from_secs(2);

/// Docker repository every node image is published under.
pub const IMAGE_REPOSITORY: &str = "polarlightning";

/// Default bitcoind version for new networks.
pub const DEFAULT_BITCOIND_VERSION: &str = "28.0";
/// Default LND version for new networks.
pub const DEFAULT_LND_VERSION: &str = "0.18.5-beta";
/// Default c-lightning version for new networks.
pub const DEFAULT_CLIGHTNING_VERSION: &str = "24.11";
/// Default eclair version for new networks.
pub const DEFAULT_ECLAIR_VERSION: &str = "0.11.0";
