use crate::recovery::CheckpointRecovery;
use crate::relay::BtcRelay;
use crate::{Error, Result, SyncConfig};
use bitcoin::BlockHash;
use btcrelay_bitcoind::{BitcoinRpc, BlockHeaderInfo};
use btcrelay_primitives::{
    ChainWork, ForkId, Header, MAIN_CHAIN, StoredHeader, compute_next_commitment, gt256,
};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Chain the next batch of headers is submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Extend the relay's canonical chain.
    Main,
    /// Open a new fork, the relay tip is no longer on the Bitcoin main chain.
    NewFork,
    /// Extend an already opened fork.
    Fork(ForkId),
}

/// One header submission transaction.
#[derive(Debug, Clone)]
pub struct HeaderSubmission<Tx> {
    pub tx: Tx,
    /// Chain the submitted headers end up on, `0` once a fork overtook the canonical chain.
    pub fork_id: ForkId,
    /// Locally computed commitments of the submitted headers, in height order.
    pub computed_headers: Vec<StoredHeader>,
}

/// Outcome of [`RelaySynchronizer::sync_to_latest_txs`].
#[derive(Debug, Clone)]
pub struct SyncResult<Tx> {
    /// Submissions in the order they must be sent.
    pub submissions: Vec<HeaderSubmission<Tx>>,
    /// Commitment of every block known after the submissions, including the relay tip.
    pub computed_headers: BTreeMap<u32, StoredHeader>,
    /// Bitcoin headers from the relay tip to the Bitcoin tip.
    pub block_headers: BTreeMap<u32, BlockHeaderInfo>,
    /// Block the relay tip was anchored at when the pass started.
    pub relay_tip_block_hash: BlockHash,
    /// Bitcoin tip reached by the pass.
    pub latest_block_header: BlockHeaderInfo,
    /// Commitment of [`Self::latest_block_header`].
    pub target_stored_header: StoredHeader,
}

impl<Tx> SyncResult<Tx> {
    /// Number of Bitcoin blocks submitted by this pass.
    pub fn synced_blocks(&self) -> usize {
        self.block_headers.len().saturating_sub(1)
    }
}

/// Walks the Bitcoin chain from the relay tip and prepares the header submissions needed to bring
/// the relay up to date.
pub struct RelaySynchronizer<R> {
    relay: Arc<R>,
    bitcoind: Arc<dyn BitcoinRpc>,
    recovery: CheckpointRecovery,
    config: SyncConfig,
}

impl<R: BtcRelay> RelaySynchronizer<R> {
    /// Constructs a new instance of [`RelaySynchronizer`].
    pub fn new(
        relay: Arc<R>,
        bitcoind: Arc<dyn BitcoinRpc>,
        recovery: CheckpointRecovery,
        config: SyncConfig,
    ) -> Self {
        Self {
            relay,
            bitcoind,
            recovery,
            config,
        }
    }

    pub fn recovery(&self) -> &CheckpointRecovery {
        &self.recovery
    }

    pub async fn sync_to_latest_txs(&self) -> Result<SyncResult<R::Tx>> {
        let state = self.relay.get_state().await.map_err(Error::Relay)?;
        let main_chain_work = state.chain_work;

        let relay_tip = self.bitcoind.get_block_header(&state.tip_block_hash).await?;

        let (mut mode, mut last_stored, mut cursor) = match relay_tip {
            Some(info) if info.is_on_main_chain() => {
                let stored = self
                    .recovery
                    .retrieve_log(&state.tip_commit_hash, &state.tip_block_hash)
                    .await?;
                (SyncMode::Main, stored, info)
            }
            _ => {
                tracing::warn!(
                    relay_tip = %state.tip_block_hash,
                    "Relay tip is not on the Bitcoin main chain, submitting a fork"
                );
                let (stored, info) = self.recovery.retrieve_latest_known_block_log().await?;
                (SyncMode::NewFork, stored, info)
            }
        };

        tracing::debug!(
            height = cursor.height,
            block_hash = %cursor.hash,
            ?mode,
            "Starting relay sync"
        );

        let relay_tip_block_hash = cursor.hash;

        let mut computed_headers = BTreeMap::from([(last_stored.blockheight, last_stored.clone())]);
        let mut block_headers = BTreeMap::from([(cursor.height, cursor.clone())]);
        let mut submissions = Vec::new();
        let mut batch = Vec::new();

        while let Some(next_hash) = cursor.nextblockhash {
            let info = self
                .bitcoind
                .get_block_header(&next_hash)
                .await?
                .ok_or(Error::BlockNotFound(next_hash))?;

            block_headers.insert(info.height, info.clone());
            batch.push(info.to_header()?);

            if batch.len() >= self.config.batch_size(mode) {
                let submission = self
                    .submit_batch(&mut mode, &last_stored, &batch, &main_chain_work)
                    .await?;
                last_stored = self.record(submission, &mut computed_headers, &mut submissions);
                batch.clear();
            }

            let has_next = info.nextblockhash.is_some();
            cursor = info;

            if has_next && !self.config.header_delay.is_zero() {
                tokio::time::sleep(self.config.header_delay).await;
            }
        }

        if !batch.is_empty() {
            let submission = self
                .submit_batch(&mut mode, &last_stored, &batch, &main_chain_work)
                .await?;
            last_stored = self.record(submission, &mut computed_headers, &mut submissions);
        }

        tracing::info!(
            blocks = block_headers.len() - 1,
            txs = submissions.len(),
            tip = cursor.height,
            "Prepared relay header submissions"
        );

        Ok(SyncResult {
            submissions,
            computed_headers,
            block_headers,
            relay_tip_block_hash,
            latest_block_header: cursor,
            target_stored_header: last_stored,
        })
    }

    fn record(
        &self,
        submission: HeaderSubmission<R::Tx>,
        computed_headers: &mut BTreeMap<u32, StoredHeader>,
        submissions: &mut Vec<HeaderSubmission<R::Tx>>,
    ) -> StoredHeader {
        for stored in &submission.computed_headers {
            computed_headers.insert(stored.blockheight, stored.clone());
        }
        let last = submission
            .computed_headers
            .last()
            .cloned()
            .expect("Submissions are only built from non-empty batches; qed");
        submissions.push(submission);
        last
    }

    async fn submit_batch(
        &self,
        mode: &mut SyncMode,
        base: &StoredHeader,
        headers: &[Header],
        main_chain_work: &ChainWork,
    ) -> Result<HeaderSubmission<R::Tx>> {
        let (tx, fork_id) = match *mode {
            SyncMode::Main => {
                let tx = self.relay.submit_main_headers(headers, base).await;
                (tx, MAIN_CHAIN)
            }
            SyncMode::NewFork => {
                let fork_id = self
                    .relay
                    .get_state()
                    .await
                    .map_err(Error::Relay)?
                    .fork_counter;
                let tx = self
                    .relay
                    .submit_fork_headers(headers, base, fork_id, true)
                    .await;
                (tx, fork_id)
            }
            SyncMode::Fork(fork_id) => {
                let tx = self
                    .relay
                    .submit_fork_headers(headers, base, fork_id, false)
                    .await;
                (tx, fork_id)
            }
        };
        let tx = tx.map_err(Error::Relay)?;

        let computed_headers = headers
            .iter()
            .scan(base.clone(), |prev, header| {
                *prev = compute_next_commitment(prev, header);
                Some(prev.clone())
            })
            .collect::<Vec<_>>();

        let mut fork_id = fork_id;

        if *mode != SyncMode::Main {
            let fork_work = computed_headers
                .last()
                .map(|stored| stored.chain_work)
                .unwrap_or(base.chain_work);
            if gt256(fork_work.as_bytes(), main_chain_work.as_bytes()) {
                tracing::info!(fork_id, "Fork overtook the relay's canonical chain");
                fork_id = MAIN_CHAIN;
            }
        }

        *mode = if fork_id == MAIN_CHAIN {
            SyncMode::Main
        } else {
            SyncMode::Fork(fork_id)
        };

        tracing::debug!(
            fork_id,
            count = headers.len(),
            from = base.blockheight + 1,
            "Built header submission"
        );

        Ok(HeaderSubmission {
            tx,
            fork_id,
            computed_headers,
        })
    }
}
