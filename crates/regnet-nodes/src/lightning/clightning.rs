//! c-lightning adapter over c-lightning-REST.
//!
//! The REST server reports amounts in millisatoshis and does not return the
//! funding output index of a new channel, which is reported as 0.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regnet_core::constants::LOCALHOST;
use regnet_core::units::{msat_to_sats, sats_to_msat};
use regnet_core::{
    Channel, ChannelPoint, ChannelStatus, Error, LightningImplementation, LightningNode,
    NewAddress, NodeInfo, NodePaths, PayReceipt, Peer, PortRole, Result, WalletBalances,
    unique_id,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::{Value, json};
use tracing::debug;

use super::{LightningService, de_u64, ensure_implementation, ensure_peer};
use crate::transport::{Auth, HttpRequest, HttpTransport, MacaroonEncoding, Method};

const SETTLE_DELAY: Duration = Duration::from_secs(3);
/// Minimum relay fee of bitcoind.
const OPEN_FEE_RATE: &str = "253perkw";

/// A millisatoshi amount, sent as a number or as a string like `"1000msat"`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Msat(u64);

impl<'de> Deserialize<'de> for Msat {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Self(n)),
            Raw::Text(s) => s
                .trim_end_matches("msat")
                .parse()
                .map(Self)
                .map_err(serde::de::Error::custom),
        }
    }
}

impl Msat {
    const fn sats(self) -> u64 {
        msat_to_sats(self.0)
    }
}

#[derive(Debug, Deserialize)]
struct Binding {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    address: String,
    #[serde(default)]
    port: u16,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetInfoResponse {
    id: String,
    #[serde(default)]
    alias: String,
    #[serde(default)]
    binding: Vec<Binding>,
    #[serde(default)]
    blockheight: u32,
    #[serde(default)]
    num_active_channels: u32,
    #[serde(default)]
    num_pending_channels: u32,
    #[serde(default)]
    num_inactive_channels: u32,
    #[serde(default)]
    warning_bitcoind_sync: Option<String>,
    #[serde(default)]
    warning_lightningd_sync: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetBalanceResponse {
    #[serde(default, deserialize_with = "de_u64")]
    conf_balance: u64,
    #[serde(default, deserialize_with = "de_u64")]
    unconf_balance: u64,
}

#[derive(Debug, Deserialize)]
struct NewAddrResponse {
    #[serde(alias = "bech32")]
    address: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListChannel {
    id: String,
    state: String,
    channel_id: String,
    funding_txid: String,
    #[serde(default)]
    msatoshi_to_us: Msat,
    #[serde(default)]
    msatoshi_total: Msat,
    #[serde(default)]
    funding_allocation_msat: HashMap<String, Msat>,
}

#[derive(Debug, Deserialize)]
struct ClnPeer {
    id: String,
    #[serde(default)]
    connected: bool,
    #[serde(default)]
    netaddr: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OpenChannelResponse {
    txid: String,
}

#[derive(Debug, Deserialize)]
struct InvoiceResponse {
    bolt11: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PayResponse {
    #[serde(default, alias = "payment_preimage")]
    payment_preimage: String,
    #[serde(default, alias = "amount_msat")]
    msatoshi: Option<Msat>,
    #[serde(default)]
    destination: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DecodePayResponse {
    #[serde(default)]
    payee: String,
    #[serde(default, alias = "amount_msat")]
    msatoshi: Option<Msat>,
}

/// Classify a channel state. Unknown states are treated as still opening.
fn channel_status(state: &str) -> ChannelStatus {
    match state {
        "CHANNELD_NORMAL" => ChannelStatus::Open,
        "CHANNELD_SHUTTING_DOWN" | "CLOSINGD_SIGEXCHANGE" => ChannelStatus::Closing,
        "CLOSINGD_COMPLETE" | "FUNDING_SPEND_SEEN" => ChannelStatus::WaitingToClose,
        "AWAITING_UNILATERAL" => ChannelStatus::ForceClosing,
        "ONCHAIN" | "CLOSED" => ChannelStatus::Closed,
        _ => ChannelStatus::Opening,
    }
}

/// Core Lightning REST client.
#[derive(Clone)]
pub struct CLightningService {
    transport: Arc<dyn HttpTransport>,
}

impl std::fmt::Debug for CLightningService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CLightningService").finish_non_exhaustive()
    }
}

impl CLightningService {
    /// Create a service sending through `transport`.
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    fn request(node: &LightningNode, method: Method, path: &str) -> Result<HttpRequest> {
        ensure_implementation(LightningImplementation::CLightning, node)?;
        let port = node.require_port(PortRole::Rest)?;
        let NodePaths::CLightning { macaroon } = &node.paths else {
            return Err(Error::Config(format!(
                "node '{}' has no c-lightning credentials",
                node.name
            )));
        };
        Ok(
            HttpRequest::new(method, format!("https://{LOCALHOST}:{port}/v1/{path}"))
                .header("encodingtype", "base64")
                .auth(Auth::Macaroon {
                    header: "macaroon".to_string(),
                    path: macaroon.clone(),
                    encoding: MacaroonEncoding::Base64,
                }),
        )
    }

    async fn send<T: DeserializeOwned>(&self, request: HttpRequest) -> Result<T> {
        let response = self.transport.send(request).await?;
        Ok(serde_json::from_value(response)?)
    }

    async fn get<T: DeserializeOwned>(&self, node: &LightningNode, path: &str) -> Result<T> {
        self.send(Self::request(node, Method::Get, path)?).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        node: &LightningNode,
        path: &str,
        body: Value,
    ) -> Result<T> {
        self.send(Self::request(node, Method::Post, path)?.json(body))
            .await
    }
}

#[async_trait]
impl LightningService for CLightningService {
    fn implementation(&self) -> LightningImplementation {
        LightningImplementation::CLightning
    }

    fn settle_delay(&self) -> Duration {
        SETTLE_DELAY
    }

    async fn get_info(&self, node: &LightningNode) -> Result<NodeInfo> {
        let info: GetInfoResponse = self.get(node, "getinfo").await?;
        let rpc_url = info
            .binding
            .iter()
            .rfind(|b| b.kind == "ipv4")
            .map(|b| format!("{}@{}:{}", info.id, b.address, b.port))
            .unwrap_or_default();
        Ok(NodeInfo {
            synced_to_chain: info.warning_bitcoind_sync.is_none()
                && info.warning_lightningd_sync.is_none(),
            pubkey: info.id,
            alias: info.alias,
            block_height: info.blockheight,
            num_pending_channels: info.num_pending_channels,
            num_active_channels: info.num_active_channels,
            num_inactive_channels: info.num_inactive_channels,
            rpc_url,
        })
    }

    async fn get_balances(&self, node: &LightningNode) -> Result<WalletBalances> {
        let balance: GetBalanceResponse = self.get(node, "getBalance").await?;
        Ok(WalletBalances::from_sats(
            balance.conf_balance,
            balance.unconf_balance,
        ))
    }

    async fn get_new_address(&self, node: &LightningNode) -> Result<NewAddress> {
        let response: NewAddrResponse = self.get(node, "newaddr").await?;
        Ok(NewAddress {
            address: response.address,
        })
    }

    async fn get_channels(&self, node: &LightningNode) -> Result<Vec<Channel>> {
        let pubkey = self.get_info(node).await?.pubkey;
        let channels: Vec<ListChannel> = self.get(node, "channel/listChannels").await?;
        Ok(channels
            .into_iter()
            .filter(|c| {
                c.funding_allocation_msat
                    .get(&pubkey)
                    .is_some_and(|amount| amount.0 > 0)
            })
            .filter_map(|c| {
                let status = channel_status(&c.state);
                (status != ChannelStatus::Closed).then(|| Channel {
                    pending: status != ChannelStatus::Open,
                    unique_id: unique_id(&format!("{}:0", c.funding_txid)),
                    channel_point: c.channel_id,
                    pubkey: c.id,
                    capacity: c.msatoshi_total.sats().to_string(),
                    local_balance: c.msatoshi_to_us.sats().to_string(),
                    remote_balance: msat_to_sats(
                        c.msatoshi_total.0.saturating_sub(c.msatoshi_to_us.0),
                    )
                    .to_string(),
                    status,
                })
            })
            .collect())
    }

    async fn get_peers(&self, node: &LightningNode) -> Result<Vec<Peer>> {
        let peers: Vec<ClnPeer> = self.get(node, "peer/listPeers").await?;
        Ok(peers
            .into_iter()
            .filter(|p| p.connected)
            .map(|p| Peer {
                address: p.netaddr.into_iter().next().unwrap_or_default(),
                pubkey: p.id,
            })
            .collect())
    }

    async fn connect_peer(&self, node: &LightningNode, rpc_url: &str) -> Result<()> {
        let _: Value = self.post(node, "peer/connect", json!({ "id": rpc_url })).await?;
        debug!(node = %node.name, peer = %rpc_url, "connected peer");
        Ok(())
    }

    async fn open_channel(
        &self,
        from: &LightningNode,
        to_rpc_url: &str,
        sats: u64,
    ) -> Result<ChannelPoint> {
        ensure_implementation(LightningImplementation::CLightning, from)?;
        let pubkey = ensure_peer(self, from, to_rpc_url).await?;
        let body = json!({
            "id": pubkey,
            "satoshis": sats.to_string(),
            "feeRate": OPEN_FEE_RATE,
        });
        let response: OpenChannelResponse = self.post(from, "channel/openChannel", body).await?;
        Ok(ChannelPoint {
            txid: response.txid,
            index: 0,
        })
    }

    async fn close_channel(&self, node: &LightningNode, channel_point: &str) -> Result<()> {
        let path = format!("channel/closeChannel/{channel_point}");
        let _: Value = self.send(Self::request(node, Method::Delete, &path)?).await?;
        Ok(())
    }

    async fn create_invoice(
        &self,
        node: &LightningNode,
        sats: u64,
        memo: Option<&str>,
    ) -> Result<String> {
        let description = memo
            .filter(|m| !m.is_empty())
            .map_or_else(|| format!("Invoice for {}", node.name), str::to_string);
        let body = json!({
            "amount": sats_to_msat(sats),
            "label": uuid::Uuid::new_v4().to_string(),
            "description": description,
        });
        let response: InvoiceResponse = self.post(node, "invoice/genInvoice", body).await?;
        Ok(response.bolt11)
    }

    async fn pay_invoice(
        &self,
        node: &LightningNode,
        invoice: &str,
        sats: Option<u64>,
    ) -> Result<PayReceipt> {
        let mut body = json!({ "invoice": invoice });
        if let Some(sats) = sats {
            body["amount"] = json!(sats_to_msat(sats));
        }
        let response: PayResponse = match self.post(node, "pay", body).await {
            Ok(response) => response,
            Err(Error::Http { message, .. }) => return Err(Error::PaymentFailed(message)),
            Err(e) => return Err(e),
        };
        if let Some(status) = response.status.as_deref().filter(|s| *s != "complete") {
            return Err(Error::PaymentFailed(format!("payment {status}")));
        }

        let (amount, destination) = match (response.msatoshi, response.destination) {
            (Some(msat), Some(destination)) => (msat.sats(), destination),
            (msat, destination) => {
                let decoded: DecodePayResponse =
                    self.get(node, &format!("pay/decodePay/{invoice}")).await?;
                (
                    msat.or(decoded.msatoshi).map_or(0, Msat::sats),
                    destination.unwrap_or(decoded.payee),
                )
            }
        };
        Ok(PayReceipt {
            preimage: response.payment_preimage,
            amount,
            destination,
        })
    }
}
