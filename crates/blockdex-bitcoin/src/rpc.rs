//! [`BackendClient`] over the bitcoind JSON-RPC interface.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use jsonrpsee::core::client::ClientT;
use jsonrpsee::core::params::ArrayParams;
use jsonrpsee::core::ClientError;
use jsonrpsee::http_client::{HeaderMap, HeaderValue, HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use blockdex_core::error::BackendError;
use blockdex_core::traits::BackendClient;
use blockdex_core::types::{Amount, Block, BlockHeader, BlockId, ChainInfo, Tx, Vin, Vout};

/// `RPC_INVALID_ADDRESS_OR_KEY`: unknown tx or block.
const RPC_INVALID_ADDRESS_OR_KEY: i32 = -5;
/// `RPC_INVALID_PARAMETER`: also returned for a height above the tip.
const RPC_INVALID_PARAMETER: i32 = -8;

const SATS_PER_COIN: f64 = 100_000_000.0;
const NOTIFY_CAPACITY: usize = 64;

// --- Wire types ---

#[derive(Deserialize, Default)]
struct ScriptSigJson {
    #[serde(default)]
    hex: String,
}

#[derive(Deserialize)]
struct VinJson {
    coinbase: Option<String>,
    #[serde(default)]
    txid: String,
    #[serde(default)]
    vout: u32,
    #[serde(rename = "scriptSig", default)]
    script_sig: ScriptSigJson,
    #[serde(default)]
    sequence: u32,
}

#[derive(Deserialize, Default)]
struct ScriptPubKeyJson {
    #[serde(default)]
    hex: String,
    address: Option<String>,
    #[serde(default)]
    addresses: Vec<String>,
}

#[derive(Deserialize)]
struct VoutJson {
    value: f64,
    n: u32,
    #[serde(rename = "scriptPubKey", default)]
    script_pub_key: ScriptPubKeyJson,
}

#[derive(Deserialize)]
struct TxJson {
    txid: String,
    #[serde(default)]
    version: i32,
    #[serde(default)]
    locktime: u32,
    vin: Vec<VinJson>,
    vout: Vec<VoutJson>,
    #[serde(default)]
    size: u32,
    #[serde(default)]
    vsize: u32,
    #[serde(default)]
    hex: String,
    #[serde(default)]
    confirmations: u32,
    blockhash: Option<String>,
    #[serde(default)]
    blocktime: i64,
    #[serde(default)]
    time: i64,
}

#[derive(Deserialize)]
struct HeaderJson {
    hash: String,
    #[serde(default)]
    previousblockhash: String,
    nextblockhash: Option<String>,
    height: u32,
    /// -1 for blocks off the best chain.
    confirmations: i64,
    #[serde(default)]
    size: u32,
    time: i64,
}

#[derive(Deserialize)]
struct BlockJson {
    #[serde(flatten)]
    header: HeaderJson,
    tx: Vec<TxJson>,
}

#[derive(Deserialize)]
struct SmartFeeJson {
    feerate: Option<f64>,
}

fn to_sat(btc: f64) -> Result<Amount, BackendError> {
    if !btc.is_finite() || btc < 0.0 {
        return Err(BackendError::InvalidResponse(format!("bad amount {btc}")));
    }
    Ok((btc * SATS_PER_COIN).round() as Amount)
}

impl From<HeaderJson> for BlockHeader {
    fn from(h: HeaderJson) -> Self {
        Self {
            hash: h.hash,
            prev: h.previousblockhash,
            next: h.nextblockhash,
            height: h.height,
            confirmations: u32::try_from(h.confirmations.max(0)).unwrap_or(u32::MAX),
            size: h.size,
            time: h.time,
        }
    }
}

impl TxJson {
    fn into_tx(self, height: u32) -> Result<Tx, BackendError> {
        let vin = self
            .vin
            .into_iter()
            .map(|v| Vin {
                coinbase: v.coinbase,
                txid: v.txid,
                vout: v.vout,
                script_sig_hex: v.script_sig.hex,
                sequence: v.sequence,
                addresses: Vec::new(),
            })
            .collect();
        let vout = self
            .vout
            .into_iter()
            .map(|v| {
                let mut addresses = v.script_pub_key.addresses;
                if let Some(a) = v.script_pub_key.address {
                    addresses = vec![a];
                }
                Ok(Vout { value_sat: to_sat(v.value)?, n: v.n, script_pubkey_hex: v.script_pub_key.hex, addresses })
            })
            .collect::<Result<Vec<_>, BackendError>>()?;
        Ok(Tx {
            txid: self.txid,
            version: self.version,
            lock_time: self.locktime,
            vin,
            vout,
            block_height: height,
            block_hash: self.blockhash,
            block_time: self.blocktime,
            time: if self.time != 0 { self.time } else { self.blocktime },
            confirmations: self.confirmations,
            size: self.size,
            vsize: if self.vsize != 0 { self.vsize } else { self.size },
            hex: self.hex,
            eth: None,
        })
    }
}

fn map_error(method: &str, e: ClientError) -> BackendError {
    match e {
        ClientError::Call(obj) => {
            let (code, message) = (obj.code(), obj.message().to_string());
            if code == RPC_INVALID_ADDRESS_OR_KEY || (code == RPC_INVALID_PARAMETER && message.contains("out of range")) {
                BackendError::NotFound(format!("{method}: {message}"))
            } else {
                BackendError::Rpc { code: i64::from(code), message }
            }
        }
        ClientError::RequestTimeout => BackendError::Timeout(0),
        ClientError::ParseError(e) => BackendError::InvalidResponse(format!("{method}: {e}")),
        e => BackendError::Unavailable(format!("{method}: {e}")),
    }
}

/// `Authorization` header for credentials embedded in the URL, with the URL
/// stripped of them.
fn split_credentials(url: &str) -> (String, Option<String>) {
    let Some((scheme, rest)) = url.split_once("://") else {
        return (url.to_string(), None);
    };
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rsplit_once('@') {
        Some((creds, host)) => {
            let token = base64::engine::general_purpose::STANDARD.encode(creds);
            (format!("{scheme}://{host}{}", &rest[authority_end..]), Some(format!("Basic {token}")))
        }
        None => (url.to_string(), None),
    }
}

pub struct BitcoinRpc {
    client: HttpClient,
    new_blocks: broadcast::Sender<BlockHeader>,
    new_txs: broadcast::Sender<String>,
}

impl BitcoinRpc {
    /// Client for `url`; `user:password@` in the URL becomes basic auth.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, BackendError> {
        let (url, auth) = split_credentials(url);
        let mut headers = HeaderMap::new();
        if let Some(auth) = auth {
            let value = HeaderValue::from_str(&auth).map_err(|e| BackendError::Unavailable(e.to_string()))?;
            headers.insert("Authorization", value);
        }
        let client = HttpClientBuilder::default()
            .request_timeout(timeout)
            .set_headers(headers)
            .build(&url)
            .map_err(|e| BackendError::Unavailable(format!("{url}: {e}")))?;
        let (new_blocks, _) = broadcast::channel(NOTIFY_CAPACITY);
        let (new_txs, _) = broadcast::channel(NOTIFY_CAPACITY);
        Ok(Self { client, new_blocks, new_txs })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: ArrayParams) -> Result<T, BackendError> {
        self.client.request(method, params).await.map_err(|e| map_error(method, e))
    }

    /// Poll the best block hash every `period` and publish new tips to
    /// [`subscribe_new_block`](BackendClient::subscribe_new_block) receivers.
    pub fn spawn_tip_poller(self: &Arc<Self>, period: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut last = String::new();
            loop {
                tokio::select! {
                    _ = shutdown.wait_for(|v| *v) => break,
                    _ = tokio::time::sleep(period) => {}
                }
                match this.get_best_block_hash().await {
                    Ok(hash) if hash != last => match this.get_block_header(&hash).await {
                        Ok(header) => {
                            debug!(height = header.height, %hash, "new tip");
                            last = hash;
                            // No receivers is fine.
                            let _ = this.new_blocks.send(header);
                        }
                        Err(e) => warn!(%hash, error = %e, "tip header unavailable"),
                    },
                    Ok(_) => {}
                    Err(e) => debug!(error = %e, "tip poll failed"),
                }
            }
            info!("tip poller stopped");
        })
    }
}

#[async_trait]
impl BackendClient for BitcoinRpc {
    async fn get_chain_info(&self) -> Result<ChainInfo, BackendError> {
        let chain: Value = self.call("getblockchaininfo", rpc_params![]).await?;
        let net: Value = self.call("getnetworkinfo", rpc_params![]).await?;
        let text = |v: &Value| match v {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            v => v.to_string(),
        };
        let num = |v: &Value| v.as_u64().unwrap_or(0);
        Ok(ChainInfo {
            chain: text(&chain["chain"]),
            blocks: u32::try_from(num(&chain["blocks"])).unwrap_or(u32::MAX),
            headers: u32::try_from(num(&chain["headers"])).unwrap_or(u32::MAX),
            best_block_hash: text(&chain["bestblockhash"]),
            difficulty: text(&chain["difficulty"]),
            size_on_disk: num(&chain["size_on_disk"]),
            version: text(&net["version"]),
            subversion: text(&net["subversion"]),
            protocol_version: text(&net["protocolversion"]),
            time_offset: net["timeoffset"].as_i64().unwrap_or(0),
            warnings: text(&chain["warnings"]),
            consensus: None,
        })
    }

    async fn get_best_block_height(&self) -> Result<u32, BackendError> {
        self.call("getblockcount", rpc_params![]).await
    }

    async fn get_best_block_hash(&self) -> Result<String, BackendError> {
        self.call("getbestblockhash", rpc_params![]).await
    }

    async fn get_block_hash(&self, height: u32) -> Result<String, BackendError> {
        self.call("getblockhash", rpc_params![height]).await
    }

    async fn get_block_header(&self, hash: &str) -> Result<BlockHeader, BackendError> {
        let h: HeaderJson = self.call("getblockheader", rpc_params![hash, true]).await?;
        Ok(h.into())
    }

    async fn get_block(&self, id: &BlockId) -> Result<Block, BackendError> {
        let hash = match id {
            BlockId::Hash(h) => h.clone(),
            BlockId::Height(h) => self.get_block_hash(*h).await?,
        };
        let b: BlockJson = self.call("getblock", rpc_params![&hash, 2]).await?;
        let height = b.header.height;
        let txs = b.tx.into_iter().map(|t| t.into_tx(height)).collect::<Result<Vec<_>, _>>()?;
        Ok(Block { header: b.header.into(), txs })
    }

    async fn get_block_raw(&self, hash: &str) -> Result<String, BackendError> {
        self.call("getblock", rpc_params![hash, 0]).await
    }

    async fn get_transaction(&self, txid: &str) -> Result<Tx, BackendError> {
        let t: TxJson = self.call("getrawtransaction", rpc_params![txid, true]).await?;
        t.into_tx(0)
    }

    async fn get_transaction_specific(&self, tx: &Tx) -> Result<Value, BackendError> {
        self.call("getrawtransaction", rpc_params![&tx.txid, true]).await
    }

    async fn get_mempool_transactions(&self) -> Result<Vec<String>, BackendError> {
        self.call("getrawmempool", rpc_params![]).await
    }

    async fn estimate_fee(&self, blocks: u32) -> Result<Amount, BackendError> {
        let rate: f64 = self.call("estimatefee", rpc_params![blocks]).await?;
        // -1 means not enough data.
        if rate < 0.0 { Ok(0) } else { to_sat(rate) }
    }

    async fn estimate_smart_fee(&self, blocks: u32, conservative: bool) -> Result<Amount, BackendError> {
        let mode = if conservative { "CONSERVATIVE" } else { "ECONOMICAL" };
        let r: SmartFeeJson = self.call("estimatesmartfee", rpc_params![blocks, mode]).await?;
        match r.feerate {
            Some(rate) => to_sat(rate),
            None => {
                debug!(blocks, "no smart fee estimate");
                Ok(0)
            }
        }
    }

    async fn send_raw_transaction(&self, hex: &str) -> Result<String, BackendError> {
        self.call("sendrawtransaction", rpc_params![hex]).await
    }

    fn subscribe_new_block(&self) -> broadcast::Receiver<BlockHeader> {
        self.new_blocks.subscribe()
    }

    fn subscribe_new_tx(&self) -> broadcast::Receiver<String> {
        self.new_txs.subscribe()
    }
}
