//! LND adapter over the REST gateway.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use regnet_core::constants::LOCALHOST;
use regnet_core::{
    Channel, ChannelPoint, ChannelStatus, Error, LightningImplementation, LightningNode,
    NewAddress, NodeInfo, NodePaths, PayReceipt, Peer, PeerUri, PortRole, Result, WalletBalances,
    unique_id,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::debug;

use super::{LightningService, de_u64, ensure_implementation, ensure_peer};
use crate::transport::{Auth, HttpRequest, HttpTransport, MacaroonEncoding, Method};

const SETTLE_DELAY: Duration = Duration::from_secs(1);
const MACAROON_HEADER: &str = "Grpc-Metadata-macaroon";
const INITIATOR_REMOTE: &str = "INITIATOR_REMOTE";

#[derive(Debug, Deserialize)]
struct GetInfoResponse {
    identity_pubkey: String,
    #[serde(default)]
    alias: String,
    #[serde(default)]
    synced_to_chain: bool,
    #[serde(default)]
    block_height: u32,
    #[serde(default)]
    num_pending_channels: u32,
    #[serde(default)]
    num_active_channels: u32,
    #[serde(default)]
    num_inactive_channels: u32,
    #[serde(default)]
    uris: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct WalletBalanceResponse {
    #[serde(default, deserialize_with = "de_u64")]
    confirmed_balance: u64,
    #[serde(default, deserialize_with = "de_u64")]
    unconfirmed_balance: u64,
}

#[derive(Debug, Default, Deserialize)]
struct ListChannelsResponse {
    #[serde(default)]
    channels: Vec<OpenChannel>,
}

#[derive(Debug, Deserialize)]
struct OpenChannel {
    remote_pubkey: String,
    channel_point: String,
    #[serde(default, deserialize_with = "de_u64")]
    capacity: u64,
    #[serde(default, deserialize_with = "de_u64")]
    local_balance: u64,
    #[serde(default, deserialize_with = "de_u64")]
    remote_balance: u64,
    #[serde(default)]
    initiator: bool,
}

#[derive(Debug, Default, Deserialize)]
struct PendingChannelsResponse {
    #[serde(default)]
    pending_open_channels: Vec<PendingEntry>,
    #[serde(default)]
    pending_closing_channels: Vec<PendingEntry>,
    #[serde(default)]
    pending_force_closing_channels: Vec<PendingEntry>,
    #[serde(default)]
    waiting_close_channels: Vec<PendingEntry>,
}

#[derive(Debug, Deserialize)]
struct PendingEntry {
    channel: PendingChannel,
}

#[derive(Debug, Deserialize)]
struct PendingChannel {
    remote_node_pub: String,
    channel_point: String,
    #[serde(default, deserialize_with = "de_u64")]
    capacity: u64,
    #[serde(default, deserialize_with = "de_u64")]
    local_balance: u64,
    #[serde(default, deserialize_with = "de_u64")]
    remote_balance: u64,
    #[serde(default)]
    initiator: String,
}

#[derive(Debug, Default, Deserialize)]
struct ListPeersResponse {
    #[serde(default)]
    peers: Vec<LndPeer>,
}

#[derive(Debug, Deserialize)]
struct LndPeer {
    pub_key: String,
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize)]
struct ChannelPointResponse {
    #[serde(default)]
    funding_txid_bytes: Option<String>,
    #[serde(default)]
    funding_txid_str: Option<String>,
    #[serde(default)]
    output_index: u32,
}

#[derive(Debug, Deserialize)]
struct AddInvoiceResponse {
    payment_request: String,
}

#[derive(Debug, Default, Deserialize)]
struct SendPaymentResponse {
    #[serde(default)]
    payment_error: String,
    #[serde(default)]
    payment_preimage: String,
    #[serde(default)]
    payment_route: Option<Route>,
}

#[derive(Debug, Deserialize)]
struct Route {
    #[serde(default, deserialize_with = "de_u64")]
    total_amt: u64,
    #[serde(default, deserialize_with = "de_u64")]
    total_fees: u64,
}

#[derive(Debug, Deserialize)]
struct PayReq {
    destination: String,
    #[serde(default, deserialize_with = "de_u64")]
    num_satoshis: u64,
}

fn channel(
    channel_point: &str,
    pubkey: &str,
    (capacity, local, remote): (u64, u64, u64),
    status: ChannelStatus,
) -> Channel {
    Channel {
        pending: status != ChannelStatus::Open,
        unique_id: unique_id(channel_point),
        channel_point: channel_point.to_string(),
        pubkey: pubkey.to_string(),
        capacity: capacity.to_string(),
        local_balance: local.to_string(),
        remote_balance: remote.to_string(),
        status,
    }
}

/// Funding txid from an open response. The byte form is little-endian.
fn funding_txid(response: &ChannelPointResponse) -> Result<String> {
    if let Some(txid) = response.funding_txid_str.as_deref().filter(|s| !s.is_empty()) {
        return Ok(txid.to_string());
    }
    let encoded = response
        .funding_txid_bytes
        .as_deref()
        .ok_or_else(|| {
            Error::UnexpectedResponse("open channel response has no funding txid".into())
        })?;
    let mut bytes = STANDARD
        .decode(encoded)
        .map_err(|e| Error::UnexpectedResponse(format!("invalid funding txid: {e}")))?;
    bytes.reverse();
    Ok(hex::encode(bytes))
}

/// Stream messages carry failures in the body rather than the status.
fn stream_error(message: &Value) -> Option<Error> {
    let error = message.get("error")?;
    let text = error
        .get("message")
        .and_then(Value::as_str)
        .map_or_else(|| error.to_string(), str::to_string);
    Some(Error::Http {
        status: error
            .get("http_code")
            .and_then(Value::as_u64)
            .and_then(|c| u16::try_from(c).ok())
            .unwrap_or(500),
        message: text,
    })
}

/// LND REST client.
#[derive(Clone)]
pub struct LndService {
    transport: Arc<dyn HttpTransport>,
}

impl std::fmt::Debug for LndService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LndService").finish_non_exhaustive()
    }
}

impl LndService {
    /// Create a service sending through `transport`.
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    fn request(node: &LightningNode, method: Method, path: &str) -> Result<HttpRequest> {
        ensure_implementation(LightningImplementation::Lnd, node)?;
        let port = node.require_port(PortRole::Rest)?;
        let NodePaths::Lnd { admin_macaroon, .. } = &node.paths else {
            return Err(Error::Config(format!("node '{}' has no LND credentials", node.name)));
        };
        Ok(HttpRequest::new(method, format!("https://{LOCALHOST}:{port}/v1/{path}")).auth(
            Auth::Macaroon {
                header: MACAROON_HEADER.to_string(),
                path: admin_macaroon.clone(),
                encoding: MacaroonEncoding::Hex,
            },
        ))
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
        self.send(Self::request(node, Method::Post, path)?.json(body)).await
    }

    async fn decode_invoice(&self, node: &LightningNode, invoice: &str) -> Result<PayReq> {
        self.get(node, &format!("payreq/{invoice}")).await
    }
}

#[async_trait]
impl LightningService for LndService {
    fn implementation(&self) -> LightningImplementation {
        LightningImplementation::Lnd
    }

    fn settle_delay(&self) -> Duration {
        SETTLE_DELAY
    }

    async fn get_info(&self, node: &LightningNode) -> Result<NodeInfo> {
        let info: GetInfoResponse = self.get(node, "getinfo").await?;
        Ok(NodeInfo {
            rpc_url: info.uris.first().cloned().unwrap_or_default(),
            pubkey: info.identity_pubkey,
            alias: info.alias,
            synced_to_chain: info.synced_to_chain,
            block_height: info.block_height,
            num_pending_channels: info.num_pending_channels,
            num_active_channels: info.num_active_channels,
            num_inactive_channels: info.num_inactive_channels,
        })
    }

    async fn get_balances(&self, node: &LightningNode) -> Result<WalletBalances> {
        let balance: WalletBalanceResponse = self.get(node, "balance/blockchain").await?;
        Ok(WalletBalances::from_sats(
            balance.confirmed_balance,
            balance.unconfirmed_balance,
        ))
    }

    async fn get_new_address(&self, node: &LightningNode) -> Result<NewAddress> {
        self.get(node, "newaddress").await
    }

    async fn get_channels(&self, node: &LightningNode) -> Result<Vec<Channel>> {
        let open: ListChannelsResponse = self.get(node, "channels").await?;
        let pending: PendingChannelsResponse = self.get(node, "channels/pending").await?;

        let mut channels: Vec<Channel> = open
            .channels
            .iter()
            .filter(|c| c.initiator)
            .map(|c| {
                channel(
                    &c.channel_point,
                    &c.remote_pubkey,
                    (c.capacity, c.local_balance, c.remote_balance),
                    ChannelStatus::Open,
                )
            })
            .collect();

        let groups = [
            (&pending.pending_open_channels, ChannelStatus::Opening),
            (&pending.pending_closing_channels, ChannelStatus::Closing),
            (&pending.pending_force_closing_channels, ChannelStatus::ForceClosing),
            (&pending.waiting_close_channels, ChannelStatus::WaitingToClose),
        ];
        for (entries, status) in groups {
            channels.extend(
                entries
                    .iter()
                    .map(|e| &e.channel)
                    .filter(|c| c.initiator != INITIATOR_REMOTE)
                    .map(|c| {
                        channel(
                            &c.channel_point,
                            &c.remote_node_pub,
                            (c.capacity, c.local_balance, c.remote_balance),
                            status,
                        )
                    }),
            );
        }
        Ok(channels)
    }

    async fn get_peers(&self, node: &LightningNode) -> Result<Vec<Peer>> {
        let response: ListPeersResponse = self.get(node, "peers").await?;
        Ok(response
            .peers
            .into_iter()
            .map(|p| Peer {
                pubkey: p.pub_key,
                address: p.address,
            })
            .collect())
    }

    async fn connect_peer(&self, node: &LightningNode, rpc_url: &str) -> Result<()> {
        let uri: PeerUri = rpc_url.parse()?;
        let body = json!({
            "addr": { "pubkey": uri.pubkey, "host": uri.host },
            "perm": false,
        });
        let _: Value = self.post(node, "peers", body).await?;
        debug!(node = %node.name, peer = %uri.pubkey, "connected peer");
        Ok(())
    }

    async fn open_channel(
        &self,
        from: &LightningNode,
        to_rpc_url: &str,
        sats: u64,
    ) -> Result<ChannelPoint> {
        ensure_implementation(LightningImplementation::Lnd, from)?;
        let pubkey = ensure_peer(self, from, to_rpc_url).await?;
        let pubkey_bytes =
            hex::decode(&pubkey).map_err(|_| Error::InvalidPeerAddress(to_rpc_url.to_string()))?;
        let body = json!({
            "node_pubkey": STANDARD.encode(pubkey_bytes),
            "local_funding_amount": sats.to_string(),
            "sat_per_vbyte": "1",
        });
        let response: ChannelPointResponse = self.post(from, "channels", body).await?;
        Ok(ChannelPoint {
            txid: funding_txid(&response)?,
            index: response.output_index,
        })
    }

    async fn close_channel(&self, node: &LightningNode, channel_point: &str) -> Result<()> {
        ensure_implementation(LightningImplementation::Lnd, node)?;
        let point: ChannelPoint = channel_point.parse()?;
        let path = format!("channels/{}/{}", point.txid, point.index);
        let request = Self::request(node, Method::Delete, &path)?.first_message();
        let message = self.transport.send(request).await?;
        if let Some(err) = stream_error(&message) {
            return Err(err);
        }
        debug!(node = %node.name, %channel_point, "close pending");
        Ok(())
    }

    async fn create_invoice(
        &self,
        node: &LightningNode,
        sats: u64,
        memo: Option<&str>,
    ) -> Result<String> {
        let body = json!({
            "value": sats.to_string(),
            "memo": memo.unwrap_or_default(),
        });
        let response: AddInvoiceResponse = self.post(node, "invoices", body).await?;
        Ok(response.payment_request)
    }

    async fn pay_invoice(
        &self,
        node: &LightningNode,
        invoice: &str,
        sats: Option<u64>,
    ) -> Result<PayReceipt> {
        let mut body = json!({ "payment_request": invoice });
        if let Some(sats) = sats {
            body["amt"] = json!(sats.to_string());
        }
        let response: SendPaymentResponse = self.post(node, "channels/transactions", body).await?;
        if !response.payment_error.is_empty() {
            return Err(Error::PaymentFailed(response.payment_error));
        }

        let decoded = self.decode_invoice(node, invoice).await?;
        let routed = response
            .payment_route
            .map(|r| r.total_amt.saturating_sub(r.total_fees))
            .filter(|amount| *amount > 0);
        let preimage = STANDARD
            .decode(&response.payment_preimage)
            .map_or(response.payment_preimage, hex::encode);

        Ok(PayReceipt {
            preimage,
            amount: routed.or(sats).unwrap_or(decoded.num_satoshis),
            destination: decoded.destination,
        })
    }
}
