use crate::{MockBitcoind, MockEventLog};
use btcrelay_primitives::{
    ChainWork, DIFF_ADJUSTMENT_PERIOD, ForkId, Header, PREV_TIMESTAMPS_LEN, StoredHeader,
    compute_next_commitment, gt256,
};
use btcrelay_synchronizer::{
    BoxError, BtcRelay, ChainEvent, ForkStored, HeaderStored, LogTopic, RelayState, RelayView,
    TipData,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Transaction built by [`MockRelay`], applied with [`MockRelay::apply`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockRelayTx {
    MainHeaders {
        headers: Vec<Header>,
        stored: StoredHeader,
    },
    ForkHeaders {
        headers: Vec<Header>,
        stored: StoredHeader,
        fork_id: ForkId,
        is_new_fork: bool,
    },
    InitialHeader(StoredHeader),
}

#[derive(Debug, thiserror::Error)]
pub enum MockRelayError {
    #[error("Relay not initialized")]
    NotInitialized,
    #[error("Relay already initialized")]
    AlreadyInitialized,
    #[error("Unknown base commitment at height {0}")]
    UnknownCommitment(u32),
    #[error("Header at height {0} does not extend its base")]
    InvalidPrevBlock(u32),
    #[error("Unknown fork {0}")]
    UnknownFork(ForkId),
    #[error("Expected new fork id {expected}, got {got}")]
    ForkIdMismatch { expected: ForkId, got: ForkId },
}

struct Fork {
    base: StoredHeader,
    headers: Vec<StoredHeader>,
}

impl Fork {
    fn tip(&self) -> &StoredHeader {
        self.headers.last().unwrap_or(&self.base)
    }
}

struct RelayChain {
    main: BTreeMap<u32, StoredHeader>,
    forks: HashMap<ForkId, Fork>,
    fork_counter: ForkId,
}

impl RelayChain {
    fn tip(&self) -> Result<&StoredHeader, MockRelayError> {
        self.main
            .last_key_value()
            .map(|(_, stored)| stored)
            .ok_or(MockRelayError::NotInitialized)
    }
}

/// Relay contract keeping its state in memory and emitting its events to a [`MockEventLog`].
///
/// Submissions only build [`MockRelayTx`]s, the chain state changes once they are applied.
pub struct MockRelay {
    chain: RwLock<RelayChain>,
    events: Arc<MockEventLog>,
    swept: RwLock<Vec<ForkId>>,
}

impl MockRelay {
    pub fn new(events: Arc<MockEventLog>) -> Self {
        Self {
            chain: RwLock::new(RelayChain {
                main: BTreeMap::new(),
                forks: HashMap::new(),
                fork_counter: 1,
            }),
            events,
            swept: RwLock::new(Vec::new()),
        }
    }

    /// Builds the initial commitment of the relay at the best chain block `height` of `bitcoind`.
    pub fn initial_header(bitcoind: &MockBitcoind, height: u32) -> StoredHeader {
        let block = bitcoind
            .block(&bitcoind.block_hash(height))
            .expect("Block exists");

        let mut prev_block_timestamps = [0u32; PREV_TIMESTAMPS_LEN];
        for (i, timestamp) in prev_block_timestamps.iter_mut().enumerate() {
            let offset = (PREV_TIMESTAMPS_LEN - i) as u32;
            if let Some(h) = height.checked_sub(offset) {
                *timestamp = bitcoind
                    .block(&bitcoind.block_hash(h))
                    .expect("Block exists")
                    .header
                    .time;
            }
        }

        let epoch_start = height - height % DIFF_ADJUSTMENT_PERIOD;
        let last_diff_adjustment = bitcoind
            .block(&bitcoind.block_hash(epoch_start))
            .expect("Block exists")
            .header
            .time;

        StoredHeader {
            chain_work: ChainWork::from(height as u128 + 1),
            header: Header::from(&block.header),
            last_diff_adjustment,
            blockheight: height,
            prev_block_timestamps,
        }
    }

    /// Initializes the relay at the best chain block `height` of `bitcoind`.
    pub fn initialize_at(&self, bitcoind: &MockBitcoind, height: u32) {
        self.apply(&MockRelayTx::InitialHeader(Self::initial_header(
            bitcoind, height,
        )))
        .expect("Relay is not initialized yet");
    }

    pub fn tip_height(&self) -> Option<u32> {
        self.chain.read().main.last_key_value().map(|(h, _)| *h)
    }

    /// Returns the canonical commitment at `height`.
    pub fn stored_header(&self, height: u32) -> Option<StoredHeader> {
        self.chain.read().main.get(&height).cloned()
    }

    pub fn fork_counter(&self) -> ForkId {
        self.chain.read().fork_counter
    }

    pub fn swept_forks(&self) -> Vec<ForkId> {
        self.swept.read().clone()
    }

    /// Applies a transaction, emitting the events of the stored headers.
    pub fn apply(&self, tx: &MockRelayTx) -> Result<(), MockRelayError> {
        let mut chain = self.chain.write();

        match tx {
            MockRelayTx::InitialHeader(stored) => {
                if !chain.main.is_empty() {
                    return Err(MockRelayError::AlreadyInitialized);
                }
                chain.main.insert(stored.blockheight, stored.clone());
                self.emit_main(std::slice::from_ref(stored));
            }
            MockRelayTx::MainHeaders { headers, stored } => {
                if chain.tip()?.commit_hash() != stored.commit_hash() {
                    return Err(MockRelayError::UnknownCommitment(stored.blockheight));
                }
                let computed = extend(stored, headers)?;
                for next in &computed {
                    chain.main.insert(next.blockheight, next.clone());
                }
                self.emit_main(&computed);
            }
            MockRelayTx::ForkHeaders {
                headers,
                stored,
                fork_id,
                is_new_fork,
            } => {
                let fork_id = *fork_id;

                if *is_new_fork {
                    if fork_id != chain.fork_counter {
                        return Err(MockRelayError::ForkIdMismatch {
                            expected: chain.fork_counter,
                            got: fork_id,
                        });
                    }
                    let recognized = chain
                        .main
                        .get(&stored.blockheight)
                        .is_some_and(|main| main.commit_hash() == stored.commit_hash());
                    if !recognized {
                        return Err(MockRelayError::UnknownCommitment(stored.blockheight));
                    }
                    chain.fork_counter += 1;
                    chain.forks.insert(
                        fork_id,
                        Fork {
                            base: stored.clone(),
                            headers: Vec::new(),
                        },
                    );
                }

                let fork = chain
                    .forks
                    .get_mut(&fork_id)
                    .ok_or(MockRelayError::UnknownFork(fork_id))?;
                if fork.tip().commit_hash() != stored.commit_hash() {
                    return Err(MockRelayError::UnknownCommitment(stored.blockheight));
                }

                let computed = extend(stored, headers)?;
                fork.headers.extend(computed.iter().cloned());
                self.emit_fork(fork_id, &computed);

                let fork_work = chain.forks[&fork_id].tip().chain_work;
                if gt256(fork_work.as_bytes(), chain.tip()?.chain_work.as_bytes()) {
                    let fork = chain
                        .forks
                        .remove(&fork_id)
                        .expect("Fork was just extended");
                    let base_height = fork.base.blockheight;
                    chain.main.retain(|height, _| *height <= base_height);
                    for stored in fork.headers {
                        chain.main.insert(stored.blockheight, stored);
                    }
                }
            }
        }

        Ok(())
    }

    fn emit_main(&self, stored: &[StoredHeader]) {
        let events = stored
            .iter()
            .map(|stored| {
                ChainEvent::HeaderStored(HeaderStored {
                    block_hash: stored.block_hash(),
                    commit_hash: stored.commit_hash(),
                    header: stored.clone(),
                })
            })
            .collect();
        self.events.push(topics(stored), events, false);
    }

    fn emit_fork(&self, fork_id: ForkId, stored: &[StoredHeader]) {
        let events = stored
            .iter()
            .map(|stored| {
                ChainEvent::ForkStored(ForkStored {
                    fork_id,
                    block_hash: stored.block_hash(),
                    commit_hash: stored.commit_hash(),
                    header: stored.clone(),
                })
            })
            .collect();
        self.events.push(topics(stored), events, false);
    }
}

fn topics(stored: &[StoredHeader]) -> Vec<LogTopic> {
    std::iter::once(LogTopic::Relay)
        .chain(stored.iter().map(|s| LogTopic::Block(s.block_hash())))
        .collect()
}

fn extend(base: &StoredHeader, headers: &[Header]) -> Result<Vec<StoredHeader>, MockRelayError> {
    let mut prev = base.clone();
    let mut computed = Vec::with_capacity(headers.len());
    for header in headers {
        if header.prev_blockhash() != prev.block_hash() {
            return Err(MockRelayError::InvalidPrevBlock(prev.blockheight + 1));
        }
        prev = compute_next_commitment(&prev, header);
        computed.push(prev.clone());
    }
    Ok(computed)
}

#[async_trait::async_trait]
impl RelayView for MockRelay {
    async fn get_state(&self) -> Result<RelayState, BoxError> {
        let chain = self.chain.read();
        let tip = chain.tip()?;
        Ok(RelayState {
            tip_commit_hash: tip.commit_hash(),
            tip_block_hash: tip.block_hash(),
            chain_work: tip.chain_work,
            block_height: tip.blockheight,
            fork_counter: chain.fork_counter,
            commitments: chain.main.values().map(StoredHeader::commit_hash).collect(),
        })
    }

    async fn get_tip_data(&self) -> Result<Option<TipData>, BoxError> {
        let chain = self.chain.read();
        Ok(chain.main.last_key_value().map(|(_, tip)| TipData {
            commit_hash: tip.commit_hash(),
            block_hash: tip.block_hash(),
            chain_work: tip.chain_work,
            block_height: tip.blockheight,
        }))
    }
}

#[async_trait::async_trait]
impl BtcRelay for MockRelay {
    type Tx = MockRelayTx;

    async fn submit_main_headers(
        &self,
        headers: &[Header],
        stored: &StoredHeader,
    ) -> Result<Self::Tx, BoxError> {
        Ok(MockRelayTx::MainHeaders {
            headers: headers.to_vec(),
            stored: stored.clone(),
        })
    }

    async fn submit_fork_headers(
        &self,
        headers: &[Header],
        stored: &StoredHeader,
        fork_id: ForkId,
        is_new_fork: bool,
    ) -> Result<Self::Tx, BoxError> {
        Ok(MockRelayTx::ForkHeaders {
            headers: headers.to_vec(),
            stored: stored.clone(),
            fork_id,
            is_new_fork,
        })
    }

    async fn save_initial_header(
        &self,
        header: &Header,
        blockheight: u32,
        chain_work: ChainWork,
        last_diff_adjustment: u32,
        prev_block_timestamps: [u32; PREV_TIMESTAMPS_LEN],
    ) -> Result<Self::Tx, BoxError> {
        Ok(MockRelayTx::InitialHeader(StoredHeader {
            chain_work,
            header: *header,
            last_diff_adjustment,
            blockheight,
            prev_block_timestamps,
        }))
    }

    async fn sweep_fork_data(&self, last_swept: Option<ForkId>) -> Result<Option<ForkId>, BoxError> {
        let mut chain = self.chain.write();
        let first = last_swept.map_or(1, |id| id + 1);
        let mut swept = last_swept;
        for fork_id in first..chain.fork_counter {
            chain.forks.remove(&fork_id);
            self.swept.write().push(fork_id);
            swept = Some(fork_id);
        }
        Ok(swept)
    }
}
