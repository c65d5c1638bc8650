//! Fire-and-forget notification fan-out.
//!
//! Subscribers receive events through `tokio::sync::broadcast` receivers.
//! Publishing never blocks; events sent while nobody listens are dropped and
//! slow subscribers observe `RecvError::Lagged`.

use tokio::sync::broadcast;

use crate::types::AddrDesc;

const CHANNEL_CAPACITY: usize = 1024;

/// A newly connected block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewBlock {
    pub height: u32,
    pub hash: String,
}

/// A mempool transaction touching an address descriptor.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NewTxAddr {
    pub addr_desc: AddrDesc,
    pub txid: String,
}

#[derive(Clone)]
pub struct Notifier {
    new_block: broadcast::Sender<NewBlock>,
    new_tx: broadcast::Sender<String>,
    new_tx_addr: broadcast::Sender<NewTxAddr>,
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new()
    }
}

impl Notifier {
    pub fn new() -> Self {
        let (new_block, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (new_tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (new_tx_addr, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { new_block, new_tx, new_tx_addr }
    }

    pub fn on_new_block(&self) -> broadcast::Receiver<NewBlock> {
        self.new_block.subscribe()
    }

    pub fn on_new_tx(&self) -> broadcast::Receiver<String> {
        self.new_tx.subscribe()
    }

    pub fn on_new_tx_addr(&self) -> broadcast::Receiver<NewTxAddr> {
        self.new_tx_addr.subscribe()
    }

    pub fn notify_new_block(&self, height: u32, hash: &str) {
        let _ = self.new_block.send(NewBlock { height, hash: hash.to_string() });
    }

    pub fn notify_new_tx(&self, txid: &str) {
        let _ = self.new_tx.send(txid.to_string());
    }

    pub fn notify_new_tx_addr(&self, addr_desc: &AddrDesc, txid: &str) {
        let _ = self.new_tx_addr.send(NewTxAddr { addr_desc: addr_desc.clone(), txid: txid.to_string() });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishing_without_subscribers_is_silent() {
        let n = Notifier::new();
        n.notify_new_block(1, "aa");
        n.notify_new_tx("bb");
        n.notify_new_tx_addr(&AddrDesc::new(vec![1]), "bb");
    }

    #[tokio::test]
    async fn subscribers_receive_events() {
        let n = Notifier::new();
        let mut blocks = n.on_new_block();
        let mut addrs = n.on_new_tx_addr();
        n.notify_new_block(7, "hash7");
        n.notify_new_tx_addr(&AddrDesc::new(vec![9]), "tx");
        assert_eq!(blocks.recv().await.unwrap(), NewBlock { height: 7, hash: "hash7".into() });
        let ev = addrs.recv().await.unwrap();
        assert_eq!(ev.addr_desc, AddrDesc::new(vec![9]));
        assert_eq!(ev.txid, "tx");
    }
}
