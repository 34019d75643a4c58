use crate::{Error, Result, RunnerConfig, SyncLatch, TransactionSender};
use bitcoin::BlockHash;
use btcrelay_bitcoind::{BitcoinRpc, BlockHeaderInfo};
use btcrelay_primitives::{DIFF_ADJUSTMENT_PERIOD, ForkId, PREV_TIMESTAMPS_LEN, TxoHash};
use btcrelay_storage::{Storage, TypedStore};
use btcrelay_synchronizer::{
    BtcRelay, CheckpointRecovery, EventLog, LogEntry, LogTopic, RelaySynchronizer, RelayView,
    TipData,
};
use btcrelay_watchtower::{ClaimBundle, HeaderSource, SwapContract, Watchtower};
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::task::JoinHandle;

/// Storage key of the last swept fork id.
pub const FORK_KEY: &str = "FORK";

/// Storage key of the newest processed swap contract log entry.
pub const EVENTS_KEY: &str = "EVENTS";

/// Initialization progress of a [`RelayRunner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStatus {
    Offline,
    SignerInit,
    RelayCheck,
    WatchtowerInit,
    EventsSync,
    InitialSync,
    /// Initialized, syncing on every trigger.
    Active,
}

/// Outcome of a sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    /// Bitcoin blocks submitted to the relay.
    pub blocks: usize,
    /// Header transactions sent.
    pub txns: usize,
    pub swaps_claimed: usize,
}

/// Target chain collaborators of a [`RelayRunner`].
pub struct ChainComponents<R, S> {
    pub relay: Arc<R>,
    pub events: Arc<dyn EventLog>,
    pub swap_contract: Arc<dyn SwapContract>,
    pub sender: Arc<S>,
    /// Persists the runner's and the watchtower's state.
    pub storage: Arc<dyn Storage>,
}

/// Keeps the relay of one target chain in sync with Bitcoin and claims the chain swaps it
/// watches.
pub struct RelayRunner<R: BtcRelay, S> {
    chain_id: String,
    config: RunnerConfig,
    relay: Arc<R>,
    bitcoind: Arc<dyn BitcoinRpc>,
    events: Arc<dyn EventLog>,
    sender: Arc<S>,
    synchronizer: RelaySynchronizer<R>,
    recovery: CheckpointRecovery,
    watchtower: tokio::sync::Mutex<Watchtower>,
    fork_store: TypedStore<ForkId>,
    events_store: TypedStore<String>,
    last_swept_fork: Mutex<Option<ForkId>>,
    status: RwLock<RunnerStatus>,
    latch: SyncLatch,
}

impl<R, S> RelayRunner<R, S>
where
    R: BtcRelay + 'static,
    S: TransactionSender<Tx = R::Tx> + 'static,
{
    /// Constructs a new instance of [`RelayRunner`].
    pub fn new(
        chain_id: impl Into<String>,
        config: RunnerConfig,
        bitcoind: Arc<dyn BitcoinRpc>,
        components: ChainComponents<R, S>,
    ) -> Self {
        let ChainComponents {
            relay,
            events,
            swap_contract,
            sender,
            storage,
        } = components;

        let recovery = CheckpointRecovery::new(
            relay.clone() as Arc<dyn RelayView>,
            events.clone(),
            bitcoind.clone(),
            config.sync.log_page_size,
        );
        let synchronizer = RelaySynchronizer::new(
            relay.clone(),
            bitcoind.clone(),
            recovery.clone(),
            config.sync.clone(),
        );
        let watchtower = Watchtower::new(
            config.watchtower.clone(),
            bitcoind.clone(),
            swap_contract,
            recovery.clone(),
            storage.clone(),
        );

        Self {
            chain_id: chain_id.into(),
            config,
            relay,
            bitcoind,
            events,
            sender,
            synchronizer,
            recovery,
            watchtower: tokio::sync::Mutex::new(watchtower),
            fork_store: TypedStore::new(storage.clone()),
            events_store: TypedStore::new(storage),
            last_swept_fork: Mutex::new(None),
            status: RwLock::new(RunnerStatus::Offline),
            latch: SyncLatch::new(),
        }
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    pub fn status(&self) -> RunnerStatus {
        *self.status.read()
    }

    pub fn latch(&self) -> &SyncLatch {
        &self.latch
    }

    fn set_status(&self, status: RunnerStatus) {
        tracing::debug!(chain = %self.chain_id, ?status, "Runner status changed");
        *self.status.write() = status;
    }

    /// Brings the runner from [`RunnerStatus::Offline`] to [`RunnerStatus::Active`].
    ///
    /// A failing first sync pass is logged, the runner becomes active regardless.
    pub async fn init(&self) -> Result<()> {
        self.set_status(RunnerStatus::SignerInit);

        let last_swept = self.fork_store.get(FORK_KEY).await?;
        *self.last_swept_fork.lock() = last_swept;

        self.set_status(RunnerStatus::RelayCheck);

        let tip = self.ensure_relay_initialized().await?;
        tracing::info!(
            chain = %self.chain_id,
            commit_hash = %hex::encode(tip.commit_hash),
            block_hash = %tip.block_hash,
            height = tip.block_height,
            "Relay tip"
        );

        self.set_status(RunnerStatus::WatchtowerInit);

        self.watchtower.lock().await.init(tip.block_height).await?;

        self.set_status(RunnerStatus::EventsSync);

        let mut claims = self.sync_events().await?;

        self.set_status(RunnerStatus::InitialSync);

        claims.extend(
            self.watchtower
                .lock()
                .await
                .initial_sync(&tip.block_hash)
                .await?,
        );
        let claimed = self.execute_claims(dedup_claims(claims)).await;
        tracing::info!(chain = %self.chain_id, claimed, "Watchtower initialized");

        match self.sync_pass().await {
            Ok(stats) => tracing::info!(chain = %self.chain_id, ?stats, "Initial sync complete"),
            Err(err) => {
                tracing::error!(chain = %self.chain_id, ?err, "Initial sync failed, continuing")
            }
        }

        self.set_status(RunnerStatus::Active);

        Ok(())
    }

    /// Returns the relay tip, initializing the relay first if needed.
    pub async fn ensure_relay_initialized(&self) -> Result<TipData> {
        if let Some(tip) = self.relay.get_tip_data().await.map_err(Error::Relay)? {
            return Ok(tip);
        }

        self.initialize_relay().await?;

        self.relay
            .get_tip_data()
            .await
            .map_err(Error::Relay)?
            .ok_or(Error::RelayNotInitialized)
    }

    /// Initializes the relay at the block `initial_relay_depth` below the Bitcoin tip.
    async fn initialize_relay(&self) -> Result<()> {
        let tip = self.bitcoind.get_tip_height().await?;
        let depth = self.config.initial_relay_depth;
        let height = tip
            .checked_sub(depth)
            .filter(|height| *height as usize >= PREV_TIMESTAMPS_LEN)
            .ok_or(Error::ChainTooShort { tip, depth })?;

        let block = self.header_at(height).await?;
        let epoch_start = self.header_at(height - height % DIFF_ADJUSTMENT_PERIOD).await?;

        // Filled from the newest previous block backwards, stored oldest first.
        let mut prev_block_timestamps = [0u32; PREV_TIMESTAMPS_LEN];
        let mut prev_hash = block.previousblockhash;
        for timestamp in prev_block_timestamps.iter_mut().rev() {
            let hash = prev_hash.ok_or(Error::ChainTooShort { tip, depth })?;
            let prev = self.header_by_hash(&hash).await?;
            *timestamp = prev.time;
            prev_hash = prev.previousblockhash;
        }

        let tx = self
            .relay
            .save_initial_header(
                &block.to_header()?,
                height,
                block.chain_work()?,
                epoch_start.time,
                prev_block_timestamps,
            )
            .await
            .map_err(Error::Relay)?;

        self.sender.send_headers(vec![tx]).await.map_err(Error::Send)?;

        tracing::info!(
            chain = %self.chain_id,
            height,
            block_hash = %block.hash,
            "Relay initialized"
        );

        Ok(())
    }

    async fn header_at(&self, height: u32) -> Result<BlockHeaderInfo> {
        let hash = self.bitcoind.get_block_hash(height).await?;
        self.header_by_hash(&hash).await
    }

    async fn header_by_hash(&self, hash: &BlockHash) -> Result<BlockHeaderInfo> {
        Ok(self
            .bitcoind
            .get_block_header(hash)
            .await?
            .ok_or(btcrelay_bitcoind::Error::BlockNotFound(*hash))?)
    }

    /// Feeds the swap contract events logged since the last call to the watchtower, oldest first.
    ///
    /// Returns the claims of swaps whose payment already matured.
    async fn sync_events(&self) -> Result<Vec<ClaimBundle>> {
        let checkpoint = self.events_store.get(EVENTS_KEY).await?;

        let mut new_entries = Vec::<LogEntry>::new();
        let mut before: Option<String> = None;

        'scan: loop {
            let page = self
                .events
                .fetch_page(
                    &LogTopic::Swaps,
                    before.as_deref(),
                    self.config.sync.log_page_size,
                )
                .await
                .map_err(Error::EventLog)?;

            let Some(last) = page.last() else {
                break;
            };
            before = Some(last.id.clone());

            for entry in page {
                if checkpoint.as_ref() == Some(&entry.id) {
                    break 'scan;
                }
                new_entries.push(entry);
            }
        }

        let Some(newest) = new_entries.first().map(|entry| entry.id.clone()) else {
            return Ok(Vec::new());
        };

        let mut claims = Vec::new();
        let mut watchtower = self.watchtower.lock().await;
        for entry in new_entries.iter().rev() {
            for event in entry.decode_events() {
                if let Some(bundle) = watchtower.handle_event(&event).await? {
                    claims.push(bundle);
                }
            }
        }
        drop(watchtower);

        self.events_store.put(EVENTS_KEY, &newest).await?;

        tracing::debug!(
            chain = %self.chain_id,
            entries = new_entries.len(),
            %newest,
            "Processed swap events"
        );

        Ok(claims)
    }

    /// Submits the missing headers and claims every mature swap.
    pub async fn sync_pass(&self) -> Result<SyncStats> {
        tracing::info!(chain = %self.chain_id, "Syncing to latest");

        let mut claims = self.sync_events().await?;

        let result = self.synchronizer.sync_to_latest_txs().await?;
        let blocks = result.synced_blocks();
        let txns = result.submissions.len();

        tracing::debug!(chain = %self.chain_id, blocks, txns, "Synchronizing blocks");

        claims.extend(
            self.watchtower
                .lock()
                .await
                .sync_to_tip_hash(&result.latest_block_header.hash, &result.computed_headers)
                .await?,
        );
        let mut claims = dedup_claims(claims);

        let txs = result
            .submissions
            .into_iter()
            .map(|submission| submission.tx)
            .collect::<Vec<_>>();

        let sent = if txs.is_empty() {
            Ok(())
        } else {
            self.sender.send_headers(txs).await
        };

        let swaps_claimed = match sent {
            Ok(()) => {
                let claimed = self.execute_claims(claims).await;
                self.try_sweep_fork_data().await;
                claimed
            }
            Err(err) => {
                tracing::error!(
                    chain = %self.chain_id,
                    ?err,
                    "Failed to send header transactions, claiming committed swaps only"
                );
                let (latest, _) = self.recovery.retrieve_latest_known_block_log().await?;
                claims.retain(|bundle| {
                    bundle.header_source == HeaderSource::Recovered
                        && bundle.matured_at <= latest.blockheight
                });
                self.execute_claims(claims).await
            }
        };

        let stats = SyncStats {
            blocks,
            txns,
            swaps_claimed,
        };

        tracing::info!(chain = %self.chain_id, ?stats, "Sync pass done");

        Ok(stats)
    }

    /// Sends `claims` with at most `max_concurrent_claims` in flight.
    ///
    /// Failed claims are not re-attempted. Returns the number of successful claims.
    async fn execute_claims(&self, claims: Vec<ClaimBundle>) -> usize {
        if claims.is_empty() {
            return 0;
        }

        tracing::info!(chain = %self.chain_id, swaps = claims.len(), "Sending claims");

        let results = futures::stream::iter(claims.into_iter().map(|bundle| async move {
            let result = self.sender.send_claim(&bundle).await;
            (bundle.swap.txo_hash, result)
        }))
        .buffer_unordered(self.config.max_concurrent_claims.max(1))
        .collect::<Vec<_>>()
        .await;

        let mut claimed = 0;
        let mut watchtower = self.watchtower.lock().await;

        for (txo_hash, result) in results {
            match result {
                Ok(()) => {
                    tracing::info!(chain = %self.chain_id, %txo_hash, "Swap claimed");
                    claimed += 1;
                    if let Err(err) = watchtower.mark_claimed(&txo_hash).await {
                        tracing::error!(%txo_hash, ?err, "Failed to forget claimed swap");
                    }
                }
                Err(err) => {
                    tracing::error!(
                        chain = %self.chain_id,
                        %txo_hash,
                        ?err,
                        "Failed to claim swap, not re-attempting"
                    );
                    watchtower.mark_claim_reverted(&txo_hash);
                }
            }
        }

        claimed
    }

    /// Reclaims the storage of abandoned relay forks, failures are only logged.
    async fn try_sweep_fork_data(&self) {
        let last_swept = *self.last_swept_fork.lock();

        match self.relay.sweep_fork_data(last_swept).await {
            Ok(swept) if swept != last_swept => {
                if let Some(fork_id) = swept {
                    if let Err(err) = self.fork_store.put(FORK_KEY, &fork_id).await {
                        tracing::error!(?err, "Failed to persist swept fork id");
                    }
                }
                *self.last_swept_fork.lock() = swept;
                tracing::debug!(chain = %self.chain_id, ?swept, "Swept fork data");
            }
            Ok(_) => {}
            Err(err) => tracing::error!(chain = %self.chain_id, ?err, "Failed to sweep fork data"),
        }
    }

    /// Triggers a sync pass in the background.
    ///
    /// Returns `None` if the runner is not active yet or a pass is already running, in which case
    /// one more pass runs after the current one.
    pub fn sync_to_latest(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.status() != RunnerStatus::Active {
            return None;
        }

        if !self.latch.try_start() {
            tracing::info!(chain = %self.chain_id, "Sync running, latching new block");
            return None;
        }

        let this = self.clone();
        Some(tokio::spawn(async move {
            loop {
                if let Err(err) = this.sync_pass().await {
                    tracing::error!(chain = %this.chain_id, ?err, "Sync pass failed");
                }

                if !this.latch.finish() {
                    break;
                }

                tracing::info!(chain = %this.chain_id, "New block latched, syncing again");
            }
        }))
    }
}

/// Keeps the first claim of every swap.
fn dedup_claims(claims: Vec<ClaimBundle>) -> Vec<ClaimBundle> {
    let mut unique = BTreeMap::<TxoHash, ClaimBundle>::new();
    for bundle in claims {
        unique.entry(bundle.swap.txo_hash).or_insert(bundle);
    }
    unique.into_values().collect()
}
