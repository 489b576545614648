//! Bitcoin Core adapter.
//!
//! Talks JSON-RPC to a node's published RPC port and adds the regtest
//! funding logic: when the wallet cannot cover a send it mines enough
//! mature coinbase outputs first.

use std::sync::Arc;
use std::time::Duration;

use regnet_core::constants::{
    BITCOIN_RPC_PASS, BITCOIN_RPC_USER, COINBASE_MATURITY, HALVING_INTERVAL,
    INITIAL_BLOCK_REWARD_SATS, LOCALHOST, MATURITY_CONVERGENCE_DELAY,
};
use regnet_core::units::btc_to_sats;
use regnet_core::{BitcoinNode, Error, PortRole, Result, wait_for};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use crate::transport::{Auth, HttpRequest, HttpTransport};

/// Subset of `getblockchaininfo`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BlockchainInfo {
    /// Chain name, `regtest` here.
    pub chain: String,
    /// Current height.
    pub blocks: u64,
    /// Headers seen.
    #[serde(default)]
    pub headers: u64,
    /// Tip hash.
    #[serde(default, rename = "bestblockhash")]
    pub best_block_hash: String,
}

/// Subset of `getwalletinfo`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WalletInfo {
    /// Loaded wallet name.
    #[serde(default, rename = "walletname")]
    pub wallet_name: String,
    /// Spendable balance in BTC.
    #[serde(default)]
    pub balance: f64,
    /// Number of wallet transactions.
    #[serde(default, rename = "txcount")]
    pub tx_count: u64,
}

/// An entry of `listtransactions`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WalletTransaction {
    /// Transaction id.
    #[serde(default)]
    pub txid: String,
    /// `generate`, `immature`, `receive` or `send`.
    #[serde(default)]
    pub category: String,
    /// Confirmations; negative for conflicted transactions.
    #[serde(default)]
    pub confirmations: i64,
}

/// Block subsidy in satoshis at `height`.
///
/// The subsidy halves every [`HALVING_INTERVAL`] blocks, so it is the full
/// initial reward for heights `0..interval`, half of it from `interval` on,
/// and zero once it has been shifted out entirely.
pub const fn block_reward(height: u64) -> u64 {
    let halvings = height / HALVING_INTERVAL;
    if halvings >= 64 {
        0
    } else {
        INITIAL_BLOCK_REWARD_SATS >> halvings
    }
}

/// Number of blocks to mine at `height` to generate `sats`, never less than one.
pub const fn blocks_to_mine(height: u64, sats: u64) -> u64 {
    let reward = block_reward(height);
    if reward == 0 || sats < reward {
        return 1;
    }
    sats / reward
}

/// Blocks still needed for the most confirmed wallet output to become spendable.
pub const fn maturity_shortfall(max_confirmations: u64) -> u64 {
    COINBASE_MATURITY.saturating_sub(max_confirmations)
}

/// JSON-RPC client for bitcoind nodes.
#[derive(Clone)]
pub struct BitcoindService {
    transport: Arc<dyn HttpTransport>,
}

impl std::fmt::Debug for BitcoindService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BitcoindService").finish_non_exhaustive()
    }
}

impl BitcoindService {
    /// Create a service sending through `transport`.
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    async fn rpc<T: DeserializeOwned>(
        &self,
        node: &BitcoinNode,
        method: &str,
        params: Value,
    ) -> Result<T> {
        let port = node.require_port(PortRole::Rpc)?;
        let request = HttpRequest::post(format!("http://{LOCALHOST}:{port}/"))
            .auth(Auth::basic(BITCOIN_RPC_USER, BITCOIN_RPC_PASS))
            .json(json!({
                "jsonrpc": "1.0",
                "id": method,
                "method": method,
                "params": params,
            }));
        let mut response = self.transport.send(request).await?;

        if let Some(error) = response.get("error").filter(|e| !e.is_null()) {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| error.to_string(), str::to_string);
            // bitcoind reports RPC errors with status 500
            return Err(Error::Http {
                status: 500,
                message,
            });
        }
        let result = response
            .get_mut("result")
            .map(Value::take)
            .unwrap_or_default();
        Ok(serde_json::from_value(result)?)
    }

    /// Chain state of `node`.
    pub async fn get_blockchain_info(&self, node: &BitcoinNode) -> Result<BlockchainInfo> {
        self.rpc(node, "getblockchaininfo", json!([])).await
    }

    /// Wallet summary of `node`.
    pub async fn get_wallet_info(&self, node: &BitcoinNode) -> Result<WalletInfo> {
        self.rpc(node, "getwalletinfo", json!([])).await
    }

    /// Spendable wallet balance in BTC.
    pub async fn get_balance(&self, node: &BitcoinNode) -> Result<f64> {
        self.rpc(node, "getbalance", json!([])).await
    }

    /// Recent wallet transactions.
    pub async fn list_transactions(&self, node: &BitcoinNode) -> Result<Vec<WalletTransaction>> {
        self.rpc(node, "listtransactions", json!([])).await
    }

    /// Fresh receiving address of the node's wallet.
    pub async fn get_new_address(&self, node: &BitcoinNode) -> Result<String> {
        self.rpc(node, "getnewaddress", json!([])).await
    }

    /// Add every configured peer of `node`. Peers that were already added are skipped.
    pub async fn connect_peers(&self, node: &BitcoinNode) -> Result<()> {
        for peer in &node.peers {
            match self
                .rpc::<Value>(node, "addnode", json!([peer, "add"]))
                .await
            {
                Ok(_) => debug!(node = %node.name, %peer, "added peer"),
                Err(e) if e.to_string().contains("already added") => {
                    debug!(node = %node.name, %peer, "peer already added");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Mine `blocks` blocks to a fresh wallet address. Returns the block hashes.
    pub async fn mine(&self, node: &BitcoinNode, blocks: u64) -> Result<Vec<String>> {
        let address = self.get_new_address(node).await?;
        let hashes: Vec<String> = self
            .rpc(node, "generatetoaddress", json!([blocks, address]))
            .await?;
        info!(node = %node.name, blocks, "mined blocks");
        Ok(hashes)
    }

    /// Send `amount` BTC to `address`. Returns the transaction id.
    pub async fn send_to_address(
        &self,
        node: &BitcoinNode,
        address: &str,
        amount: f64,
    ) -> Result<String> {
        self.rpc(node, "sendtoaddress", json!([address, amount])).await
    }

    /// Mine until the wallet's most confirmed output is spendable.
    ///
    /// Returns the number of blocks mined. When any were mined, waits
    /// [`MATURITY_CONVERGENCE_DELAY`] so the other nodes can catch up.
    pub async fn mine_until_maturity(&self, node: &BitcoinNode) -> Result<u64> {
        let transactions = self.list_transactions(node).await?;
        let max_confirmations = transactions
            .iter()
            .map(|tx| tx.confirmations.max(0).unsigned_abs())
            .max()
            .unwrap_or(0);
        let needed = maturity_shortfall(max_confirmations);
        if needed > 0 {
            debug!(node = %node.name, max_confirmations, needed, "mining until coinbase maturity");
            self.mine(node, needed).await?;
            tokio::time::sleep(MATURITY_CONVERGENCE_DELAY).await;
        }
        Ok(needed)
    }

    /// Send `amount` BTC to `to`, mining more coins first if the wallet
    /// balance does not exceed the amount.
    ///
    /// # Arguments
    /// * `node` - Bitcoin node whose wallet pays
    /// * `to` - Destination address
    /// * `amount` - Amount in BTC
    pub async fn send_funds(&self, node: &BitcoinNode, to: &str, amount: f64) -> Result<String> {
        let height = self.get_blockchain_info(node).await?.blocks;
        let balance = self.get_balance(node).await?;
        if balance > amount {
            return self.send_to_address(node, to, amount).await;
        }

        let shortfall = btc_to_sats(amount - balance);
        info!(node = %node.name, balance, amount, "insufficient balance, mining more coins");
        self.mine_until_maturity(node).await?;
        self.mine(node, blocks_to_mine(height, shortfall)).await?;
        self.send_to_address(node, to, amount).await.map_err(|e| {
            warn!(node = %node.name, error = %e, "send failed after mining");
            Error::InsufficientFundsRecoveryFailed(Box::new(e))
        })
    }

    /// Poll `getblockchaininfo` until the node answers.
    pub async fn wait_until_online(
        &self,
        node: &BitcoinNode,
        interval: Duration,
        timeout: Duration,
    ) -> Result<BlockchainInfo> {
        wait_for(|| self.get_blockchain_info(node), interval, timeout).await
    }
}
