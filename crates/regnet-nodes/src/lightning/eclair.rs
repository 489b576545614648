//! eclair adapter over its form-encoded REST API.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regnet_core::constants::{ECLAIR_API_PASS, LOCALHOST};
use regnet_core::units::{msat_to_sats, sats_to_msat};
use regnet_core::{
    Channel, ChannelPoint, ChannelStatus, Error, LightningImplementation, LightningNode,
    NewAddress, NodeInfo, PayReceipt, Peer, PortRole, Result, WalletBalances, unique_id,
};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use super::{LightningService, de_u64, ensure_implementation, ensure_peer};
use crate::transport::{Auth, HttpRequest, HttpTransport};

const SETTLE_DELAY: Duration = Duration::from_secs(1);
const FUNDING_TXID_MARKER: &str = "fundingTxId=";

const INITIATOR_POINTERS: [&str; 3] = [
    "/data/commitments/params/localParams/isInitiator",
    "/data/commitments/localParams/isInitiator",
    "/data/commitments/localParams/isFunder",
];
const TO_LOCAL_POINTERS: [&str; 2] = [
    "/data/commitments/active/0/localCommit/spec/toLocal",
    "/data/commitments/localCommit/spec/toLocal",
];
const TO_REMOTE_POINTERS: [&str; 2] = [
    "/data/commitments/active/0/localCommit/spec/toRemote",
    "/data/commitments/localCommit/spec/toRemote",
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetInfoResponse {
    node_id: String,
    #[serde(default)]
    alias: String,
    #[serde(default)]
    block_height: u32,
    #[serde(default)]
    public_addresses: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OnChainBalance {
    #[serde(default, deserialize_with = "de_u64")]
    confirmed: u64,
    #[serde(default, deserialize_with = "de_u64")]
    unconfirmed: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EclairPeer {
    node_id: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreateInvoiceResponse {
    serialized: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParsedInvoice {
    node_id: String,
    #[serde(default)]
    amount: Option<u64>,
}

/// Classify a channel state. Unknown states are treated as still opening.
fn channel_status(state: &str) -> ChannelStatus {
    match state {
        "NORMAL" | "OFFLINE" | "SYNCING" => ChannelStatus::Open,
        "SHUTDOWN" | "NEGOTIATING" => ChannelStatus::Closing,
        "CLOSING" => ChannelStatus::WaitingToClose,
        "CLOSED" => ChannelStatus::Closed,
        _ => ChannelStatus::Opening,
    }
}

fn first_pointer<'a>(value: &'a Value, pointers: &[&str]) -> Option<&'a Value> {
    pointers.iter().find_map(|p| value.pointer(p))
}

/// A raw `/channels` entry, reduced to what the adapter reads.
struct RawChannel<'a> {
    state: &'a str,
    value: &'a Value,
}

impl<'a> RawChannel<'a> {
    fn new(value: &'a Value) -> Self {
        Self {
            state: value.get("state").and_then(Value::as_str).unwrap_or_default(),
            value,
        }
    }

    fn is_initiator(&self) -> bool {
        first_pointer(self.value, &INITIATOR_POINTERS)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    fn msat(&self, pointers: &[&str]) -> u64 {
        first_pointer(self.value, pointers)
            .and_then(Value::as_u64)
            .unwrap_or(0)
    }

    fn str_field(&self, name: &str) -> String {
        self.value
            .get(name)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    fn to_channel(&self) -> Channel {
        let status = channel_status(self.state);
        let to_local = self.msat(&TO_LOCAL_POINTERS);
        let to_remote = self.msat(&TO_REMOTE_POINTERS);
        let channel_id = self.str_field("channelId");
        Channel {
            pending: status != ChannelStatus::Open,
            unique_id: unique_id(&channel_id),
            channel_point: channel_id,
            pubkey: self.str_field("nodeId"),
            capacity: msat_to_sats(to_local + to_remote).to_string(),
            local_balance: msat_to_sats(to_local).to_string(),
            remote_balance: msat_to_sats(to_remote).to_string(),
            status,
        }
    }
}

/// Pull the funding txid out of eclair's `open` reply.
fn parse_funding_txid(reply: &str) -> Result<String> {
    reply
        .split_once(FUNDING_TXID_MARKER)
        .map(|(_, rest)| {
            rest.split(|c: char| !c.is_ascii_hexdigit())
                .next()
                .unwrap_or_default()
                .to_string()
        })
        .filter(|txid| !txid.is_empty())
        .ok_or_else(|| Error::UnexpectedResponse(format!("no funding txid in '{reply}'")))
}

/// eclair REST client.
#[derive(Clone)]
pub struct EclairService {
    transport: Arc<dyn HttpTransport>,
}

impl std::fmt::Debug for EclairService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EclairService").finish_non_exhaustive()
    }
}

impl EclairService {
    /// Create a service sending through `transport`.
    pub fn new(transport: Arc<dyn HttpTransport>) -> Self {
        Self { transport }
    }

    async fn call_raw(
        &self,
        node: &LightningNode,
        endpoint: &str,
        form: &[(&str, String)],
    ) -> Result<Value> {
        ensure_implementation(LightningImplementation::Eclair, node)?;
        let port = node.require_port(PortRole::Rest)?;
        let request = HttpRequest::post(format!("http://{LOCALHOST}:{port}/{endpoint}"))
            .auth(Auth::basic("", ECLAIR_API_PASS))
            .form(form.iter().map(|(k, v)| (*k, v.clone())));
        self.transport.send(request).await
    }

    async fn call<T: DeserializeOwned>(
        &self,
        node: &LightningNode,
        endpoint: &str,
        form: &[(&str, String)],
    ) -> Result<T> {
        let response = self.call_raw(node, endpoint, form).await?;
        Ok(serde_json::from_value(response)?)
    }

    async fn raw_channels(&self, node: &LightningNode) -> Result<Vec<Value>> {
        self.call(node, "channels", &[]).await
    }
}

#[async_trait]
impl LightningService for EclairService {
    fn implementation(&self) -> LightningImplementation {
        LightningImplementation::Eclair
    }

    fn settle_delay(&self) -> Duration {
        SETTLE_DELAY
    }

    async fn get_info(&self, node: &LightningNode) -> Result<NodeInfo> {
        let info: GetInfoResponse = self.call(node, "getinfo", &[]).await?;
        let channels = self.raw_channels(node).await?;

        let (mut active, mut pending, mut inactive) = (0, 0, 0);
        for channel in channels.iter().map(RawChannel::new) {
            match channel.state {
                "NORMAL" => active += 1,
                "OFFLINE" | "SYNCING" => inactive += 1,
                state if channel_status(state) == ChannelStatus::Opening => pending += 1,
                _ => {}
            }
        }

        Ok(NodeInfo {
            rpc_url: info
                .public_addresses
                .first()
                .map(|address| format!("{}@{address}", info.node_id))
                .unwrap_or_default(),
            pubkey: info.node_id,
            alias: info.alias,
            // eclair does not expose a sync flag
            synced_to_chain: true,
            block_height: info.block_height,
            num_pending_channels: pending,
            num_active_channels: active,
            num_inactive_channels: inactive,
        })
    }

    async fn get_balances(&self, node: &LightningNode) -> Result<WalletBalances> {
        let balance: OnChainBalance = self.call(node, "onchainbalance", &[]).await?;
        Ok(WalletBalances::from_sats(balance.confirmed, balance.unconfirmed))
    }

    async fn get_new_address(&self, node: &LightningNode) -> Result<NewAddress> {
        let address: String = self.call(node, "getnewaddress", &[]).await?;
        Ok(NewAddress { address })
    }

    async fn get_channels(&self, node: &LightningNode) -> Result<Vec<Channel>> {
        let channels = self.raw_channels(node).await?;
        Ok(channels
            .iter()
            .map(RawChannel::new)
            .filter(|c| c.is_initiator() && channel_status(c.state) != ChannelStatus::Closed)
            .map(|c| c.to_channel())
            .collect())
    }

    async fn get_peers(&self, node: &LightningNode) -> Result<Vec<Peer>> {
        let peers: Vec<EclairPeer> = self.call(node, "peers", &[]).await?;
        Ok(peers
            .into_iter()
            .filter(|p| p.state == "CONNECTED")
            .map(|p| Peer {
                pubkey: p.node_id,
                address: p.address.unwrap_or_default(),
            })
            .collect())
    }

    async fn connect_peer(&self, node: &LightningNode, rpc_url: &str) -> Result<()> {
        self.call_raw(node, "connect", &[("uri", rpc_url.to_string())])
            .await?;
        debug!(node = %node.name, peer = %rpc_url, "connected peer");
        Ok(())
    }

    async fn open_channel(
        &self,
        from: &LightningNode,
        to_rpc_url: &str,
        sats: u64,
    ) -> Result<ChannelPoint> {
        ensure_implementation(LightningImplementation::Eclair, from)?;
        let pubkey = ensure_peer(self, from, to_rpc_url).await?;
        let form = [
            ("nodeId", pubkey),
            ("fundingSatoshis", sats.to_string()),
            ("fundingFeerateSatByte", "1".to_string()),
        ];
        let reply = self.call_raw(from, "open", &form).await?;
        let reply = reply.as_str().map_or_else(|| reply.to_string(), str::to_string);
        Ok(ChannelPoint {
            txid: parse_funding_txid(&reply)?,
            index: 0,
        })
    }

    async fn close_channel(&self, node: &LightningNode, channel_point: &str) -> Result<()> {
        self.call_raw(node, "close", &[("channelId", channel_point.to_string())])
            .await?;
        Ok(())
    }

    async fn create_invoice(
        &self,
        node: &LightningNode,
        sats: u64,
        memo: Option<&str>,
    ) -> Result<String> {
        let form = [
            ("description", memo.unwrap_or_default().to_string()),
            ("amountMsat", sats_to_msat(sats).to_string()),
        ];
        let response: CreateInvoiceResponse = self.call(node, "createinvoice", &form).await?;
        Ok(response.serialized)
    }

    async fn pay_invoice(
        &self,
        node: &LightningNode,
        invoice: &str,
        sats: Option<u64>,
    ) -> Result<PayReceipt> {
        let mut form = vec![
            ("invoice", invoice.to_string()),
            ("blocking", "true".to_string()),
        ];
        if let Some(sats) = sats {
            form.push(("amountMsat", sats_to_msat(sats).to_string()));
        }
        let response = self.call_raw(node, "payinvoice", &form).await?;

        if response.get("type").and_then(Value::as_str) == Some("payment-failed") {
            let reason = response
                .get("failures")
                .and_then(Value::as_array)
                .and_then(|failures| failures.iter().find_map(|f| f.get("t")?.as_str()))
                .unwrap_or("payment failed")
                .to_string();
            return Err(Error::PaymentFailed(reason));
        }

        let preimage = response
            .get("paymentPreimage")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let amount = response.get("recipientAmount").and_then(Value::as_u64);
        let destination = response.get("recipientNodeId").and_then(Value::as_str);

        let (amount, destination) = match (amount, destination) {
            (Some(msat), Some(destination)) => (msat_to_sats(msat), destination.to_string()),
            (msat, destination) => {
                let parsed: ParsedInvoice = self
                    .call(node, "parseinvoice", &[("invoice", invoice.to_string())])
                    .await?;
                (
                    msat.or(parsed.amount).map_or(0, msat_to_sats),
                    destination.map_or(parsed.node_id, str::to_string),
                )
            }
        };
        Ok(PayReceipt {
            preimage,
            amount,
            destination,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lightning::fixtures;
    use crate::testing::FakeTransport;
    use crate::transport::Method;
    use serde_json::json;

    fn setup() -> (Arc<FakeTransport>, EclairService, LightningNode) {
        let fake = Arc::new(FakeTransport::new());
        let service = EclairService::new(fake.clone());
        (fake, service, fixtures::node("carol"))
    }

    fn raw_channel(state: &str, pubkey: &str, initiator: bool) -> Value {
        json!({
            "nodeId": pubkey,
            "channelId": format!("{pubkey}-channel-0123456789"),
            "state": state,
            "data": {
                "commitments": {
                    "localParams": { "isInitiator": initiator },
                    "localCommit": { "spec": { "toLocal": 400_000, "toRemote": 600_000 } },
                },
            },
        })
    }

    #[tokio::test]
    async fn test_get_info_counts_channels() {
        let (fake, service, carol) = setup();
        fake.on(Method::Post, "/getinfo", |_| {
            Ok(json!({"nodeId": "03carol", "alias": "carol", "blockHeight": 150,
                      "publicAddresses": ["carol:9735"]}))
        });
        fake.on(Method::Post, "/channels", |_| {
            Ok(json!([
                raw_channel("NORMAL", "02aaa", true),
                raw_channel("OFFLINE", "02bbb", false),
                raw_channel("WAIT_FOR_FUNDING_CONFIRMED", "02ccc", true),
                raw_channel("CLOSED", "02ddd", true),
            ]))
        });

        let info = service.get_info(&carol).await.unwrap();
        assert_eq!(info.rpc_url, "03carol@carol:9735");
        assert!(info.synced_to_chain);
        assert_eq!(info.num_active_channels, 1);
        assert_eq!(info.num_inactive_channels, 1);
        assert_eq!(info.num_pending_channels, 1);

        let call = &fake.calls()[0];
        assert_eq!(call.url, "http://127.0.0.1:8283/getinfo");
        assert_eq!(call.auth, Auth::basic("", "eclairpw"));
    }

    #[tokio::test]
    async fn test_get_channels_filters_and_converts() {
        let (fake, service, carol) = setup();
        fake.on(Method::Post, "/channels", |_| {
            Ok(json!([
                raw_channel("NORMAL", "02aaa", true),
                raw_channel("NORMAL", "02bbb", false),
                raw_channel("CLOSED", "02ccc", true),
                raw_channel("WAIT_FOR_FUNDING_CONFIRMED", "02ddd", true),
                raw_channel("SOMETHING_NEW", "02eee", true),
            ]))
        });
        let channels = service.get_channels(&carol).await.unwrap();
        let pubkeys: Vec<&str> = channels.iter().map(|c| c.pubkey.as_str()).collect();
        assert_eq!(pubkeys, vec!["02aaa", "02ddd", "02eee"]);

        assert_eq!(channels[0].status, ChannelStatus::Open);
        assert_eq!(channels[0].capacity, "1000");
        assert_eq!(channels[0].local_balance, "400");
        assert_eq!(channels[0].remote_balance, "600");
        assert_eq!(channels[0].channel_point, "02aaa-channel-0123456789");
        assert_eq!(channels[1].status, ChannelStatus::Opening);
        assert_eq!(channels[2].status, ChannelStatus::Opening);
        assert!(channels[2].pending);
    }

    #[tokio::test]
    async fn test_get_balances_and_address() {
        let (fake, service, carol) = setup();
        fake.on(Method::Post, "/onchainbalance", |_| {
            Ok(json!({"confirmed": 250_000, "unconfirmed": 0}))
        });
        fake.on(Method::Post, "/getnewaddress", |_| Ok(json!("bcrt1qcarol")));
        let balances = service.get_balances(&carol).await.unwrap();
        assert_eq!(balances.confirmed, "250000");
        assert_eq!(balances.total, "250000");
        assert_eq!(service.get_new_address(&carol).await.unwrap().address, "bcrt1qcarol");
    }

    #[tokio::test]
    async fn test_open_channel_parses_txid() {
        let (fake, service, carol) = setup();
        fake.on(Method::Post, "/peers", |_| Ok(json!([])));
        fake.on(Method::Post, "/connect", |request| {
            assert_eq!(request.form_field("uri"), Some("02aaa@alice:9735"));
            Ok(json!("connected"))
        });
        fake.on(Method::Post, "/open", |request| {
            assert_eq!(request.form_field("nodeId"), Some("02aaa"));
            assert_eq!(request.form_field("fundingFeerateSatByte"), Some("1"));
            Ok(json!(concat!(
                "created channel 56d7d6eda04d80138270c49709f1eadb5ab4939e5061309ccdacdb98ce637d0e ",
                "with fundingTxId=",
                "c4a2b6e9f5d0c3b7a1e8f0d2c6b4a9e7f3d5c1b8a0e2f4d6c8b0a2e4f6d8c0b2 ",
                "and fees=24750 sat",
            )))
        });

        let point = service.open_channel(&carol, "02aaa@alice:9735", 1000).await.unwrap();
        assert_eq!(
            point.txid,
            "c4a2b6e9f5d0c3b7a1e8f0d2c6b4a9e7f3d5c1b8a0e2f4d6c8b0a2e4f6d8c0b2"
        );
        assert_eq!(point.index, 0);
        assert_eq!(fake.count(Method::Post, "/connect"), 1);
    }

    #[tokio::test]
    async fn test_open_channel_skips_connect_for_existing_peer() {
        let (fake, service, carol) = setup();
        fake.on(Method::Post, "/peers", |_| {
            Ok(json!([{"nodeId": "02aaa", "state": "CONNECTED", "address": "alice:9735"}]))
        });
        fake.on(Method::Post, "/open", |_| Ok(json!("created channel x with fundingTxId=abcd")));
        let point = service.open_channel(&carol, "02aaa@alice:9735", 1000).await.unwrap();
        assert_eq!(point.txid, "abcd");
        assert_eq!(fake.count(Method::Post, "/connect"), 0);
    }

    #[test]
    fn test_parse_funding_txid_requires_marker() {
        assert!(parse_funding_txid("created channel x").is_err());
        assert_eq!(parse_funding_txid("fundingTxId=ab12, fees").unwrap(), "ab12");
    }

    #[tokio::test]
    async fn test_pay_invoice_failure() {
        let (fake, service, carol) = setup();
        fake.on(Method::Post, "/payinvoice", |request| {
            assert_eq!(request.form_field("blocking"), Some("true"));
            Ok(json!({"type": "payment-failed", "failures": [{"t": "route not found"}]}))
        });
        let err = service.pay_invoice(&carol, "lnbcrt1", None).await.unwrap_err();
        assert!(matches!(err, Error::PaymentFailed(_)));
        assert_eq!(err.to_string(), "route not found");
    }

    #[tokio::test]
    async fn test_pay_invoice_parses_invoice_for_missing_amount() {
        let (fake, service, carol) = setup();
        fake.on(Method::Post, "/payinvoice", |_| {
            Ok(json!({
                "type": "payment-sent",
                "paymentPreimage": "pre",
                "recipientNodeId": "02aaa",
            }))
        });
        fake.on(Method::Post, "/parseinvoice", |_| {
            Ok(json!({"nodeId": "02aaa", "amount": 5_000_000}))
        });
        let receipt = service.pay_invoice(&carol, "lnbcrt1", None).await.unwrap();
        assert_eq!(receipt.preimage, "pre");
        assert_eq!(receipt.amount, 5000);
        assert_eq!(receipt.destination, "02aaa");
    }

    #[tokio::test]
    async fn test_create_invoice_sends_msat() {
        let (fake, service, carol) = setup();
        fake.on(Method::Post, "/createinvoice", |request| {
            assert_eq!(request.form_field("amountMsat"), Some("1000000"));
            Ok(json!({"serialized": "lnbcrt10u1"}))
        });
        assert_eq!(service.create_invoice(&carol, 1000, None).await.unwrap(), "lnbcrt10u1");
    }

    #[tokio::test]
    async fn test_rejects_other_implementations() {
        let (_fake, service, _) = setup();
        let err = service.get_balances(&fixtures::node("alice")).await.unwrap_err();
        assert!(matches!(
            err,
            Error::WrongAdapterForNode {
                required: LightningImplementation::Eclair,
                actual: LightningImplementation::Lnd,
            }
        ));
    }
}
