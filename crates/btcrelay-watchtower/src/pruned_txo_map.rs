use crate::Result;
use bitcoin::BlockHash;
use btcrelay_bitcoind::{BitcoinRpc, BlockInfo};
use btcrelay_primitives::{TxoEntry, TxoHash};
use btcrelay_storage::TypedStore;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

/// Storage key of the persisted window tip height.
pub const TIP_HEIGHT_KEY: &str = "wt-height";

#[derive(Debug, Clone)]
struct CachedBlock {
    hash: BlockHash,
    txo_hashes: Vec<TxoHash>,
}

/// Outputs created in the last `window` blocks of the Bitcoin chain, indexed by [`TxoHash`].
///
/// Blocks falling out of the window are pruned together with their outputs. When a different block
/// shows up at a cached height, the cached block and all its descendants are dropped first.
pub struct PrunedTxoMap {
    bitcoind: Arc<dyn BitcoinRpc>,
    store: TypedStore<u32>,
    window: u32,
    txos: HashMap<TxoHash, TxoEntry>,
    blocks: BTreeMap<u32, CachedBlock>,
}

impl PrunedTxoMap {
    /// Constructs a new instance of [`PrunedTxoMap`].
    pub fn new(bitcoind: Arc<dyn BitcoinRpc>, store: TypedStore<u32>, window: u32) -> Self {
        Self {
            bitcoind,
            store,
            window: window.max(1),
            txos: HashMap::new(),
            blocks: BTreeMap::new(),
        }
    }

    /// Fills the window with the blocks ending at the persisted tip height, or at `relay_height` if
    /// nothing was persisted yet.
    ///
    /// Returns the height the window ends at.
    pub async fn init(&mut self, relay_height: u32) -> Result<u32> {
        let persisted = self.store.get(TIP_HEIGHT_KEY).await?;
        let bitcoin_tip = self.bitcoind.get_tip_height().await?;
        let tip = persisted.unwrap_or(relay_height).min(bitcoin_tip);

        tracing::debug!(tip, ?persisted, window = self.window, "Initializing pruned TXO map");

        let start = tip.saturating_sub(self.window - 1);
        for height in start..=tip {
            let hash = self.bitcoind.get_block_hash(height).await?;
            let block = self.bitcoind.get_block(&hash).await?;
            self.ingest(block, &HashSet::new());
        }

        Ok(tip)
    }

    /// Adds the block `block_hash` to the window.
    ///
    /// Returns the outputs of the block whose hash is in `watched`.
    pub async fn add_block(
        &mut self,
        block_hash: &BlockHash,
        watched: &HashSet<TxoHash>,
    ) -> Result<Vec<(TxoHash, TxoEntry)>> {
        let block = self.bitcoind.get_block(block_hash).await?;
        let found = self.ingest(block, watched);

        if let Some(tip) = self.tip_height() {
            self.store.put(TIP_HEIGHT_KEY, &tip).await?;
        }

        Ok(found)
    }

    fn ingest(&mut self, block: BlockInfo, watched: &HashSet<TxoHash>) -> Vec<(TxoHash, TxoEntry)> {
        let height = block.height;

        match self.blocks.get(&height) {
            Some(cached) if cached.hash == block.hash => {
                tracing::trace!(height, block_hash = %block.hash, "Block already in TXO window");
                return Vec::new();
            }
            Some(cached) => {
                tracing::warn!(
                    height,
                    old = %cached.hash,
                    new = %block.hash,
                    "Reorg detected, dropping cached blocks"
                );
                let stale = self.blocks.split_off(&height);
                self.forget(stale);
            }
            None => {}
        }

        let mut found = Vec::new();
        let mut txo_hashes = Vec::new();

        for tx in &block.tx {
            for vout in &tx.vout {
                let txo_hash = vout.txo_hash();
                let entry = TxoEntry {
                    txid: tx.txid,
                    vout: vout.n,
                    height,
                };
                self.txos.insert(txo_hash, entry);
                txo_hashes.push(txo_hash);
                if watched.contains(&txo_hash) {
                    found.push((txo_hash, entry));
                }
            }
        }

        tracing::debug!(
            height,
            block_hash = %block.hash,
            outputs = txo_hashes.len(),
            found = found.len(),
            "Added block to TXO window"
        );

        self.blocks.insert(
            height,
            CachedBlock {
                hash: block.hash,
                txo_hashes,
            },
        );

        self.prune();

        found
    }

    /// Removes every block at or below `tip - window`, including heights left out by gaps.
    fn prune(&mut self) {
        let Some(tip) = self.tip_height() else {
            return;
        };
        let Some(cutoff) = tip.checked_sub(self.window) else {
            return;
        };
        let kept = self.blocks.split_off(&(cutoff + 1));
        let pruned = std::mem::replace(&mut self.blocks, kept);
        self.forget(pruned);
    }

    fn forget(&mut self, blocks: BTreeMap<u32, CachedBlock>) {
        for (height, block) in blocks {
            for txo_hash in block.txo_hashes {
                // Another block may have produced the same output hash later on.
                if self
                    .txos
                    .get(&txo_hash)
                    .is_some_and(|entry| entry.height == height)
                {
                    self.txos.remove(&txo_hash);
                }
            }
        }
    }

    /// Brings the window up to `target`, following the chain backwards until a cached block is
    /// found or the window is left.
    ///
    /// Returns the watched outputs of all newly added blocks.
    pub async fn sync_to_tip_hash(
        &mut self,
        target: &BlockHash,
        watched: &HashSet<TxoHash>,
    ) -> Result<Vec<(TxoHash, TxoEntry)>> {
        let lowest = self
            .tip_height()
            .map(|tip| tip.saturating_sub(self.window));

        let mut pending = Vec::new();
        let mut hash = *target;

        loop {
            let info = self
                .bitcoind
                .get_block_header(&hash)
                .await?
                .ok_or(btcrelay_bitcoind::Error::BlockNotFound(hash))?;

            if self.cached_hash(info.height) == Some(info.hash) {
                break;
            }

            pending.push(info.hash);

            let Some(lowest) = lowest else {
                break;
            };

            if info.height <= lowest {
                break;
            }

            match info.previousblockhash {
                Some(prev) if self.cached_hash(info.height - 1) != Some(prev) => hash = prev,
                _ => break,
            }
        }

        let mut found = Vec::new();
        for hash in pending.iter().rev() {
            found.extend(self.add_block(hash, watched).await?);
        }

        Ok(found)
    }

    fn cached_hash(&self, height: u32) -> Option<BlockHash> {
        self.blocks.get(&height).map(|block| block.hash)
    }

    pub fn get_txo(&self, txo_hash: &TxoHash) -> Option<&TxoEntry> {
        self.txos.get(txo_hash)
    }

    /// Height of the newest block in the window.
    pub fn tip_height(&self) -> Option<u32> {
        self.blocks.last_key_value().map(|(height, _)| *height)
    }

    /// Height of the oldest block in the window.
    pub fn lowest_height(&self) -> Option<u32> {
        self.blocks.first_key_value().map(|(height, _)| *height)
    }

    /// Number of outputs in the window.
    pub fn len(&self) -> usize {
        self.txos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txos.is_empty()
    }
}
