use crate::BoxError;
use bitcoin::BlockHash;
use btcrelay_primitives::{ChainWork, ForkId, Header, PREV_TIMESTAMPS_LEN, StoredHeader};
use std::collections::HashSet;

/// Tip of the relay's canonical chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipData {
    pub commit_hash: [u8; 32],
    pub block_hash: BlockHash,
    pub chain_work: ChainWork,
    pub block_height: u32,
}

/// Summary of the relay contract state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayState {
    pub tip_commit_hash: [u8; 32],
    pub tip_block_hash: BlockHash,
    /// Cumulative chainwork of the relay's canonical chain.
    pub chain_work: ChainWork,
    pub block_height: u32,
    /// Id the next newly created fork will get.
    pub fork_counter: ForkId,
    /// Commitment hashes of the canonical chain headers the contract still recognizes.
    pub commitments: HashSet<[u8; 32]>,
}

impl RelayState {
    pub fn tip_data(&self) -> TipData {
        TipData {
            commit_hash: self.tip_commit_hash,
            block_hash: self.tip_block_hash,
            chain_work: self.chain_work,
            block_height: self.block_height,
        }
    }

    /// Returns `true` if `commit_hash` belongs to the relay's canonical chain.
    pub fn recognizes(&self, commit_hash: &[u8; 32]) -> bool {
        self.commitments.contains(commit_hash)
    }
}

/// Read-only view of the relay contract.
#[async_trait::async_trait]
pub trait RelayView: Send + Sync {
    /// Fails if the relay has not been initialized.
    async fn get_state(&self) -> Result<RelayState, BoxError>;

    /// Returns `None` if the relay has not been initialized yet.
    async fn get_tip_data(&self) -> Result<Option<TipData>, BoxError>;
}

/// Relay contract on a target chain.
///
/// The submission methods only build transactions, sending them is up to the caller. Headers must
/// be submitted in increasing height order, each batch building on the commitment returned for the
/// previous one.
#[async_trait::async_trait]
pub trait BtcRelay: RelayView {
    /// Transaction type of the target chain.
    type Tx: Send + Sync + 'static;

    /// Builds a transaction extending the canonical chain by `headers` on top of `stored`.
    async fn submit_main_headers(
        &self,
        headers: &[Header],
        stored: &StoredHeader,
    ) -> Result<Self::Tx, BoxError>;

    /// Builds a transaction extending fork `fork_id` by `headers` on top of `stored`.
    ///
    /// `is_new_fork` creates the fork, in which case `fork_id` must be the relay's current fork
    /// counter.
    async fn submit_fork_headers(
        &self,
        headers: &[Header],
        stored: &StoredHeader,
        fork_id: ForkId,
        is_new_fork: bool,
    ) -> Result<Self::Tx, BoxError>;

    /// Builds the transaction initializing the relay at `header`.
    async fn save_initial_header(
        &self,
        header: &Header,
        blockheight: u32,
        chain_work: ChainWork,
        last_diff_adjustment: u32,
        prev_block_timestamps: [u32; PREV_TIMESTAMPS_LEN],
    ) -> Result<Self::Tx, BoxError>;

    /// Reclaims storage of abandoned forks, starting after `last_swept`.
    ///
    /// Returns the last swept fork id. Relays without per-fork storage keep the default.
    async fn sweep_fork_data(&self, last_swept: Option<ForkId>) -> Result<Option<ForkId>, BoxError> {
        Ok(last_swept)
    }
}
