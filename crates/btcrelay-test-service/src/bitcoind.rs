use crate::block_data;
use bitcoin::absolute::LockTime;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::hashes::Hash;
use bitcoin::{
    Amount, Block, BlockHash, CompactTarget, OutPoint, ScriptBuf, Sequence, Transaction,
    TxMerkleNode, TxIn, TxOut, Txid, Witness, block, transaction,
};
use btcrelay_bitcoind::{
    BitcoinRpc, BlockHeaderInfo, BlockInfo, BlockTransaction, Error, RawTransactionInfo, Result,
    ScriptPubKey, SyncInfo, Vout,
};
use btcrelay_primitives::{ChainWork, work_from_nbits};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};

/// Difficulty of every mined block.
pub const DEFAULT_NBITS: u32 = 0x1d00ffff;

/// Seconds between consecutive mined blocks.
pub const BLOCK_INTERVAL: u32 = 600;

struct MockBlock {
    block: Block,
    height: u32,
    chain_work: ChainWork,
}

#[derive(Default)]
struct ChainState {
    blocks: HashMap<BlockHash, MockBlock>,
    /// Hashes of the best chain, indexed by height.
    main: Vec<BlockHash>,
    /// Block that most recently included each transaction.
    txs: HashMap<Txid, BlockHash>,
    ibd: bool,
    counter: u32,
    /// Blocks whose header lookups fail.
    unavailable: HashSet<BlockHash>,
}

impl ChainState {
    fn confirmations(&self, hash: &BlockHash, height: u32) -> i32 {
        if self.main.get(height as usize) == Some(hash) {
            (self.main.len() as u32 - height) as i32
        } else {
            -1
        }
    }

    fn next_on_main(&self, hash: &BlockHash, height: u32) -> Option<BlockHash> {
        if self.main.get(height as usize) == Some(hash) {
            self.main.get(height as usize + 1).copied()
        } else {
            None
        }
    }

    fn push_block(&mut self, block: Block) -> BlockHash {
        let hash = block.block_hash();
        let height = self.main.len() as u32;
        let parent_work = self
            .main
            .last()
            .and_then(|parent| self.blocks.get(parent))
            .map(|parent| parent.chain_work)
            .unwrap_or_default();
        let chain_work = parent_work + work_from_nbits(block.header.bits.to_consensus());

        for tx in &block.txdata {
            self.txs.insert(tx.compute_txid(), hash);
        }

        self.blocks.insert(
            hash,
            MockBlock {
                block,
                height,
                chain_work,
            },
        );
        self.main.push(hash);
        hash
    }
}

/// In-memory Bitcoin chain served through [`BitcoinRpc`].
///
/// The chain starts with the first mainnet blocks. Blocks mined on top carry no proof of work.
/// Reorganized blocks stay known with `-1` confirmations like on a real node.
pub struct MockBitcoind {
    state: RwLock<ChainState>,
}

impl Default for MockBitcoind {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBitcoind {
    pub fn new() -> Self {
        let mut state = ChainState::default();
        for block in block_data() {
            state.push_block(block);
        }
        Self {
            state: RwLock::new(state),
        }
    }

    pub fn tip_height(&self) -> u32 {
        self.state.read().main.len() as u32 - 1
    }

    pub fn tip_hash(&self) -> BlockHash {
        *self
            .state
            .read()
            .main
            .last()
            .expect("Chain starts with genesis")
    }

    /// Returns the best chain block at `height`.
    pub fn block_hash(&self, height: u32) -> BlockHash {
        self.state.read().main[height as usize]
    }

    pub fn block(&self, hash: &BlockHash) -> Option<Block> {
        self.state.read().blocks.get(hash).map(|b| b.block.clone())
    }

    pub fn set_ibd(&self, ibd: bool) {
        self.state.write().ibd = ibd;
    }

    /// Makes header lookups of `hash` fail with an RPC error.
    pub fn make_header_unavailable(&self, hash: BlockHash) {
        self.state.write().unavailable.insert(hash);
    }

    /// Mines `count` blocks containing only a coinbase.
    pub fn mine_blocks(&self, count: u32) -> Vec<BlockHash> {
        (0..count).map(|_| self.mine_block(Vec::new())).collect()
    }

    /// Mines blocks until the tip reaches `height`.
    pub fn mine_to_height(&self, height: u32) -> Vec<BlockHash> {
        let count = height.saturating_sub(self.tip_height());
        self.mine_blocks(count)
    }

    /// Mines a block including `outputs` in a single payment transaction.
    pub fn mine_payment(&self, outputs: Vec<TxOut>) -> (BlockHash, Txid) {
        let tx = self.payment_tx(outputs);
        let txid = tx.compute_txid();
        (self.mine_block(vec![tx]), txid)
    }

    /// Builds a transaction paying `outputs` from a unique dummy input.
    pub fn payment_tx(&self, outputs: Vec<TxOut>) -> Transaction {
        let counter = self.next_counter();
        let mut prev = [0xab; 32];
        prev[..4].copy_from_slice(&counter.to_le_bytes());
        Transaction {
            version: transaction::Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint {
                    txid: Txid::from_byte_array(prev),
                    vout: 0,
                },
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: outputs,
        }
    }

    /// Mines a block on top of the best chain including `txs` after the coinbase.
    pub fn mine_block(&self, txs: Vec<Transaction>) -> BlockHash {
        let counter = self.next_counter();
        let mut state = self.state.write();

        let height = state.main.len() as u32;
        let parent = *state.main.last().expect("Chain starts with genesis");
        let parent_time = state.blocks[&parent].block.header.time;

        // Unique per block so that every coinbase output has its own TxoHash.
        let unique_script = ScriptBuf::builder()
            .push_int(height as i64)
            .push_int(counter as i64)
            .into_script();

        let coinbase = Transaction {
            version: transaction::Version::ONE,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: unique_script.clone(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(50 * 100_000_000),
                script_pubkey: unique_script,
            }],
        };

        let mut txdata = vec![coinbase];
        txdata.extend(txs);

        let mut block = Block {
            header: block::Header {
                version: block::Version::ONE,
                prev_blockhash: parent,
                merkle_root: TxMerkleNode::all_zeros(),
                time: parent_time + BLOCK_INTERVAL,
                bits: CompactTarget::from_consensus(DEFAULT_NBITS),
                nonce: counter,
            },
            txdata,
        };
        block.header.merkle_root = block
            .compute_merkle_root()
            .expect("Block has a coinbase");

        state.push_block(block)
    }

    /// Disconnects every best chain block at or above `height`, the next mined block is built at
    /// `height`.
    pub fn reorg_at(&self, height: u32) {
        let mut state = self.state.write();
        assert!(height > 0, "Can not reorg genesis");
        state.main.truncate(height as usize);
    }

    fn next_counter(&self) -> u32 {
        let mut state = self.state.write();
        state.counter += 1;
        state.counter
    }

    fn header_info(state: &ChainState, hash: &BlockHash) -> Option<BlockHeaderInfo> {
        let mock = state.blocks.get(hash)?;
        let header = &mock.block.header;
        Some(BlockHeaderInfo {
            hash: *hash,
            confirmations: state.confirmations(hash, mock.height),
            height: mock.height,
            version: header.version.to_consensus(),
            merkleroot: header.merkle_root,
            time: header.time,
            nonce: header.nonce,
            bits: format!("{:08x}", header.bits.to_consensus()),
            chainwork: mock.chain_work.to_string(),
            previousblockhash: (mock.height > 0).then_some(header.prev_blockhash),
            nextblockhash: state.next_on_main(hash, mock.height),
        })
    }
}

fn to_vouts(tx: &Transaction) -> Vec<Vout> {
    tx.output
        .iter()
        .enumerate()
        .map(|(n, output)| Vout {
            value: output.value,
            n: n as u32,
            script_pub_key: ScriptPubKey {
                hex: output.script_pubkey.clone(),
            },
        })
        .collect()
}

#[async_trait::async_trait]
impl BitcoinRpc for MockBitcoind {
    async fn get_block_header(&self, hash: &BlockHash) -> Result<Option<BlockHeaderInfo>> {
        let state = self.state.read();
        if state.unavailable.contains(hash) {
            return Err(Error::Rpc {
                code: -1,
                message: format!("Header of {hash} unavailable"),
            });
        }
        Ok(Self::header_info(&state, hash))
    }

    async fn get_block(&self, hash: &BlockHash) -> Result<BlockInfo> {
        let state = self.state.read();
        let mock = state.blocks.get(hash).ok_or(Error::BlockNotFound(*hash))?;
        Ok(BlockInfo {
            hash: *hash,
            confirmations: state.confirmations(hash, mock.height),
            height: mock.height,
            time: mock.block.header.time,
            tx: mock
                .block
                .txdata
                .iter()
                .map(|tx| BlockTransaction {
                    txid: tx.compute_txid(),
                    vout: to_vouts(tx),
                })
                .collect(),
            previousblockhash: (mock.height > 0).then_some(mock.block.header.prev_blockhash),
            nextblockhash: state.next_on_main(hash, mock.height),
        })
    }

    async fn get_raw_transaction(&self, txid: &Txid) -> Result<RawTransactionInfo> {
        let state = self.state.read();
        let block_hash = state
            .txs
            .get(txid)
            .ok_or(Error::TransactionNotFound(*txid))?;
        let mock = &state.blocks[block_hash];
        let tx = mock
            .block
            .txdata
            .iter()
            .find(|tx| tx.compute_txid() == *txid)
            .ok_or(Error::TransactionNotFound(*txid))?;

        let confirmations = state.confirmations(block_hash, mock.height);

        Ok(RawTransactionInfo {
            hex: serialize_hex(tx),
            txid: *txid,
            vout: to_vouts(tx),
            blockhash: (confirmations > 0).then_some(*block_hash),
            confirmations: (confirmations > 0).then_some(confirmations as u32),
        })
    }

    async fn get_block_hash(&self, height: u32) -> Result<BlockHash> {
        self.state
            .read()
            .main
            .get(height as usize)
            .copied()
            .ok_or(Error::BlockHeightOutOfRange(height))
    }

    async fn get_tip_height(&self) -> Result<u32> {
        Ok(self.tip_height())
    }

    async fn get_best_block_hash(&self) -> Result<BlockHash> {
        Ok(self.tip_hash())
    }

    async fn get_sync_info(&self) -> Result<SyncInfo> {
        let state = self.state.read();
        let height = state.main.len() as u32 - 1;
        Ok(SyncInfo {
            ibd: state.ibd,
            headers: height,
            blocks: height,
            verification_progress: if state.ibd { 0.5 } else { 1.0 },
        })
    }
}
