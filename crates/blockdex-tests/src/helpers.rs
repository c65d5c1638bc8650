//! Shared fixtures: a UTF-8 address parser, a scripted in-memory backend and
//! a fully wired indexing environment on a temporary database.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, watch};

use blockdex_api::Worker;
use blockdex_core::error::{BackendError, ParseError};
use blockdex_core::mempool::{Mempool, SharedMempool};
use blockdex_core::notify::Notifier;
use blockdex_core::traits::{BackendClient, Parser};
use blockdex_core::types::{
    AddrDesc, Amount, Block, BlockHeader, BlockId, ChainInfo, ChainType, ContractInfo, EthereumTxData, Tx, Vin,
    Vout,
};
use blockdex_db::{Indexer, IndexerConfig};
use blockdex_sync::{MempoolSync, SyncWorker};

/// Time of block 0, aligned to an hour.
pub const GENESIS_TIME: i64 = 1_500_001_200;
pub const BLOCK_PERIOD: i64 = 600;

pub fn block_time(height: u32) -> i64 {
    GENESIS_TIME + height as i64 * BLOCK_PERIOD
}

pub fn txid(n: u32) -> String {
    format!("{n:064x}")
}

// ------------------------------------------------------------------
// Parser
// ------------------------------------------------------------------

/// Descriptors are the UTF-8 bytes of the address. An xpub `x` derives
/// `x/<change>/<index>`.
pub struct TestParser(pub ChainType);

impl Parser for TestParser {
    fn chain_type(&self) -> ChainType {
        self.0
    }

    fn amount_decimals(&self) -> u8 {
        match self.0 {
            ChainType::Bitcoin => 8,
            ChainType::Ethereum => 18,
        }
    }

    fn packed_txid_len(&self) -> usize {
        32
    }

    fn get_addr_desc_from_vout(&self, vout: &Vout) -> Result<AddrDesc, ParseError> {
        vout.addresses
            .first()
            .map(|a| AddrDesc::new(a.as_bytes()))
            .ok_or(ParseError::AddressMissing)
    }

    fn get_addr_desc_from_address(&self, address: &str) -> Result<AddrDesc, ParseError> {
        if address.is_empty() || address.contains(' ') {
            return Err(ParseError::InvalidAddress(address.into()));
        }
        Ok(AddrDesc::new(address.as_bytes()))
    }

    fn get_addresses_from_addr_desc(&self, ad: &AddrDesc) -> Result<(Vec<String>, bool), ParseError> {
        Ok((vec![String::from_utf8_lossy(ad.as_bytes()).into_owned()], true))
    }

    fn derive_address_descriptors_from_to(
        &self,
        xpub: &str,
        change: u32,
        from: u32,
        to: u32,
    ) -> Result<Vec<AddrDesc>, ParseError> {
        if !xpub.starts_with("xpub") {
            return Err(ParseError::InvalidXpub(xpub.into()));
        }
        Ok((from..to).map(|i| AddrDesc::new(format!("{xpub}/{change}/{i}").into_bytes())).collect())
    }
}

// ------------------------------------------------------------------
// Transactions
// ------------------------------------------------------------------

fn outputs(outs: &[(&str, Amount)]) -> Vec<Vout> {
    outs.iter()
        .enumerate()
        .map(|(n, (addr, value))| Vout {
            value_sat: *value,
            n: n as u32,
            addresses: vec![addr.to_string()],
            ..Default::default()
        })
        .collect()
}

pub fn coinbase_tx(id: u32, outs: &[(&str, Amount)]) -> Tx {
    Tx {
        txid: txid(id),
        version: 1,
        vin: vec![Vin { coinbase: Some(format!("{id:08x}")), sequence: u32::MAX, ..Default::default() }],
        vout: outputs(outs),
        size: 120,
        ..Default::default()
    }
}

/// Tx spending `(prev id, vout)` outpoints, `vsize` bytes long.
pub fn spend_tx(id: u32, inputs: &[(u32, u32)], outs: &[(&str, Amount)], vsize: u32) -> Tx {
    Tx {
        txid: txid(id),
        version: 2,
        vin: inputs
            .iter()
            .map(|(p, v)| Vin { txid: txid(*p), vout: *v, sequence: u32::MAX, ..Default::default() })
            .collect(),
        vout: outputs(outs),
        size: vsize + 40,
        vsize,
        ..Default::default()
    }
}

/// Account-model tx from `from` to `to` carrying `value`.
pub fn eth_tx(id: u32, from: &str, to: &str, value: Amount, eth: EthereumTxData) -> Tx {
    Tx {
        txid: txid(id),
        vin: vec![Vin { addresses: vec![from.to_string()], ..Default::default() }],
        vout: vec![Vout { value_sat: value, addresses: vec![to.to_string()], ..Default::default() }],
        eth: Some(eth),
        ..Default::default()
    }
}

// ------------------------------------------------------------------
// Backend
// ------------------------------------------------------------------

#[derive(Default)]
struct ChainState {
    blocks: Vec<Block>,
    mempool: Vec<Tx>,
    /// Blocks mined so far; salts block hashes so branches never collide.
    mined: u64,
    get_block_failures: u32,
    contracts: HashMap<String, ContractInfo>,
    balances: HashMap<AddrDesc, Amount>,
    sent: Vec<String>,
}

/// In-memory backend whose chain the test scripts.
pub struct TestBackend {
    state: Mutex<ChainState>,
    new_blocks: broadcast::Sender<BlockHeader>,
    new_txs: broadcast::Sender<String>,
    pub smart_fee: Amount,
}

impl Default for TestBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl TestBackend {
    pub fn new() -> Self {
        let (new_blocks, _) = broadcast::channel(64);
        let (new_txs, _) = broadcast::channel(64);
        Self { state: Mutex::new(ChainState::default()), new_blocks, new_txs, smart_fee: 2_000 }
    }

    pub fn height(&self) -> Option<u32> {
        self.state.lock().blocks.len().checked_sub(1).map(|h| h as u32)
    }

    pub fn block_hash(&self, height: u32) -> Option<String> {
        self.state.lock().blocks.get(height as usize).map(|b| b.header.hash.clone())
    }

    /// Append a block with `txs` on top of the current tip. Mined txs leave
    /// the backend mempool.
    pub fn mine(&self, txs: Vec<Tx>) -> BlockHeader {
        let header = {
            let mut st = self.state.lock();
            st.mined += 1;
            let height = st.blocks.len() as u32;
            let prev = st.blocks.last().map(|b| b.header.hash.clone()).unwrap_or_default();
            let mut h = Sha256::new();
            h.update(prev.as_bytes());
            h.update(st.mined.to_le_bytes());
            for tx in &txs {
                h.update(tx.txid.as_bytes());
            }
            let header = BlockHeader {
                hash: hex::encode(h.finalize()),
                prev,
                height,
                time: block_time(height),
                size: 200 + txs.iter().map(|t| t.size).sum::<u32>(),
                ..Default::default()
            };
            if let Some(last) = st.blocks.last_mut() {
                last.header.next = Some(header.hash.clone());
            }
            st.mempool.retain(|m| !txs.iter().any(|t| t.txid == m.txid));
            st.blocks.push(Block { header: header.clone(), txs });
            header
        };
        let _ = self.new_blocks.send(header.clone());
        header
    }

    /// Mine `n` blocks each paying a coinbase of `value` to `address`, with
    /// txids starting at `first_id`.
    pub fn mine_coinbases(&self, n: u32, first_id: u32, address: &str, value: Amount) {
        for i in 0..n {
            self.mine(vec![coinbase_tx(first_id + i, &[(address, value)])]);
        }
    }

    /// Drop every block at and above `height`; later [`mine`](Self::mine)
    /// calls build the competing branch.
    pub fn reorg(&self, height: u32) {
        let mut st = self.state.lock();
        st.blocks.truncate(height as usize);
        if let Some(last) = st.blocks.last_mut() {
            last.header.next = None;
        }
    }

    pub fn add_mempool_tx(&self, tx: Tx) {
        let txid = tx.txid.clone();
        self.state.lock().mempool.push(tx);
        let _ = self.new_txs.send(txid);
    }

    pub fn remove_mempool_tx(&self, txid: &str) {
        self.state.lock().mempool.retain(|t| t.txid != txid);
    }

    /// Fail the next `n` `get_block` calls with a transport error.
    pub fn fail_get_block(&self, n: u32) {
        self.state.lock().get_block_failures = n;
    }

    pub fn add_contract(&self, info: ContractInfo) {
        self.state.lock().contracts.insert(info.contract.clone(), info);
    }

    pub fn set_balance(&self, address: &str, balance: Amount) {
        self.state.lock().balances.insert(AddrDesc::new(address.as_bytes()), balance);
    }

    /// Raw transactions passed to `send_raw_transaction`.
    pub fn sent(&self) -> Vec<String> {
        self.state.lock().sent.clone()
    }

    fn with_block_data(st: &ChainState, block: &Block) -> Block {
        let tip = st.blocks.len() as u32;
        let mut b = block.clone();
        b.header.confirmations = tip - b.header.height;
        for tx in &mut b.txs {
            tx.block_height = b.header.height;
            tx.block_hash = Some(b.header.hash.clone());
            tx.block_time = b.header.time;
            tx.time = b.header.time;
            tx.confirmations = b.header.confirmations;
        }
        b
    }
}

fn not_found(what: impl Into<String>) -> BackendError {
    BackendError::NotFound(what.into())
}

#[async_trait]
impl BackendClient for TestBackend {
    async fn get_chain_info(&self) -> Result<ChainInfo, BackendError> {
        let st = self.state.lock();
        let blocks = st.blocks.len().saturating_sub(1) as u32;
        Ok(ChainInfo {
            chain: "regtest".into(),
            blocks,
            headers: blocks,
            best_block_hash: st.blocks.last().map(|b| b.header.hash.clone()).unwrap_or_default(),
            difficulty: "1".into(),
            version: "1".into(),
            subversion: "/test:0.1/".into(),
            ..Default::default()
        })
    }

    async fn get_best_block_height(&self) -> Result<u32, BackendError> {
        self.height().ok_or_else(|| not_found("empty chain"))
    }

    async fn get_best_block_hash(&self) -> Result<String, BackendError> {
        let st = self.state.lock();
        st.blocks.last().map(|b| b.header.hash.clone()).ok_or_else(|| not_found("empty chain"))
    }

    async fn get_block_hash(&self, height: u32) -> Result<String, BackendError> {
        self.block_hash(height).ok_or_else(|| not_found(format!("height {height}")))
    }

    async fn get_block_header(&self, hash: &str) -> Result<BlockHeader, BackendError> {
        let st = self.state.lock();
        let b = st
            .blocks
            .iter()
            .find(|b| b.header.hash == hash)
            .ok_or_else(|| not_found(format!("block {hash}")))?;
        Ok(Self::with_block_data(&st, b).header)
    }

    async fn get_block(&self, id: &BlockId) -> Result<Block, BackendError> {
        let mut st = self.state.lock();
        if st.get_block_failures > 0 {
            st.get_block_failures -= 1;
            return Err(BackendError::Unavailable("connection reset".into()));
        }
        let b = match id {
            BlockId::Height(h) => st.blocks.get(*h as usize),
            BlockId::Hash(hash) => st.blocks.iter().find(|b| b.header.hash == *hash),
        }
        .ok_or_else(|| not_found(format!("block {id}")))?;
        Ok(Self::with_block_data(&st, b))
    }

    async fn get_transaction(&self, txid: &str) -> Result<Tx, BackendError> {
        let st = self.state.lock();
        for b in &st.blocks {
            if let Some(pos) = b.txs.iter().position(|t| t.txid == txid) {
                return Ok(Self::with_block_data(&st, b).txs.swap_remove(pos));
            }
        }
        st.mempool.iter().find(|t| t.txid == txid).cloned().ok_or_else(|| not_found(format!("tx {txid}")))
    }

    async fn get_transaction_specific(&self, tx: &Tx) -> Result<serde_json::Value, BackendError> {
        Ok(serde_json::json!({ "txid": tx.txid, "version": tx.version }))
    }

    async fn get_mempool_transactions(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.state.lock().mempool.iter().map(|t| t.txid.clone()).collect())
    }

    async fn estimate_fee(&self, _blocks: u32) -> Result<Amount, BackendError> {
        Ok(self.smart_fee)
    }

    async fn estimate_smart_fee(&self, blocks: u32, conservative: bool) -> Result<Amount, BackendError> {
        let base = self.smart_fee * 10 / (blocks.max(1) as Amount + 9);
        Ok(if conservative { base * 2 } else { base })
    }

    async fn send_raw_transaction(&self, hex: &str) -> Result<String, BackendError> {
        let raw = hex::decode(hex).map_err(|_| BackendError::Rpc { code: -22, message: "TX decode failed".into() })?;
        self.state.lock().sent.push(hex.to_string());
        Ok(hex::encode(Sha256::digest(Sha256::digest(&raw))))
    }

    async fn get_balance(&self, ad: &AddrDesc) -> Result<Amount, BackendError> {
        Ok(self.state.lock().balances.get(ad).copied().unwrap_or(0))
    }

    async fn get_nonce(&self, _ad: &AddrDesc) -> Result<u64, BackendError> {
        Ok(0)
    }

    async fn get_contract_info(&self, contract: &AddrDesc) -> Result<Option<ContractInfo>, BackendError> {
        let key = String::from_utf8_lossy(contract.as_bytes()).into_owned();
        Ok(self.state.lock().contracts.get(&key).cloned())
    }

    fn subscribe_new_block(&self) -> broadcast::Receiver<BlockHeader> {
        self.new_blocks.subscribe()
    }

    fn subscribe_new_tx(&self) -> broadcast::Receiver<String> {
        self.new_txs.subscribe()
    }
}

// ------------------------------------------------------------------
// Environment
// ------------------------------------------------------------------

/// Indexer, sync workers and query worker sharing one backend and mempool.
pub struct TestEnv {
    pub backend: Arc<TestBackend>,
    pub ix: Arc<Indexer>,
    pub mempool: SharedMempool,
    pub notifier: Notifier,
    pub sync: Arc<SyncWorker>,
    pub mempool_sync: Arc<MempoolSync>,
    pub worker: Worker,
    pub shutdown: watch::Sender<bool>,
    pub cfg: IndexerConfig,
    _dir: tempfile::TempDir,
}

/// Test defaults: sequential sync, small chunks, three attempts per call.
pub fn test_config(dir: &std::path::Path) -> IndexerConfig {
    IndexerConfig {
        coin: "Testcoin".into(),
        coin_shortcut: "TEST".into(),
        data_dir: dir.to_path_buf(),
        rpc_timeout: 5,
        sync_workers: 1,
        sync_chunk: 4,
        sync_retry_attempts: 3,
        mempool_workers: 2,
        mempool_sub_workers: 2,
        ..IndexerConfig::default()
    }
    .sanitized()
}

impl TestEnv {
    pub fn new(chain: ChainType) -> Self {
        Self::with_config(chain, Arc::new(TestBackend::new()), |_| {})
    }

    /// Environment over `backend` with `tweak` applied to the test config.
    pub fn with_config(chain: ChainType, backend: Arc<TestBackend>, tweak: impl FnOnce(&mut IndexerConfig)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        tweak(&mut cfg);
        let ix = Arc::new(
            Indexer::open(cfg.db_path(), Arc::new(TestParser(chain)), &cfg.coin, &cfg.coin_shortcut)
                .unwrap()
                .with_block_filters(cfg.filter_params().unwrap()),
        );
        let (shutdown, shutdown_rx) = watch::channel(false);
        let mempool = Mempool::shared();
        let notifier = Notifier::new();
        let dyn_backend: Arc<dyn BackendClient> = backend.clone();
        let sync = Arc::new(SyncWorker::new(
            ix.clone(),
            dyn_backend.clone(),
            mempool.clone(),
            notifier.clone(),
            &cfg,
            shutdown_rx.clone(),
        ));
        let mempool_sync = Arc::new(MempoolSync::new(
            ix.clone(),
            dyn_backend.clone(),
            mempool.clone(),
            notifier.clone(),
            &cfg,
            shutdown_rx,
        ));
        let worker = Worker::new(ix.clone(), dyn_backend, mempool.clone(), &cfg);
        Self { backend, ix, mempool, notifier, sync, mempool_sync, worker, shutdown, cfg, _dir: dir }
    }

    /// Sync to the backend tip and resync the mempool.
    pub async fn sync(&self) {
        self.sync.resync_index(false).await.unwrap();
        self.mempool_sync.resync().await.unwrap();
    }

    pub fn best(&self) -> Option<(u32, String)> {
        self.ix.get_best_block().unwrap()
    }
}
