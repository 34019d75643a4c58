use crate::{RelayRunner, Result, RunnerConfig, RunnerStatus, TipPoller, TransactionSender};
use btcrelay_bitcoind::{BitcoinRpc, SyncInfo};
use btcrelay_synchronizer::BtcRelay;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Per-chain runner driven by a [`MultiChainRunner`].
#[async_trait::async_trait]
pub trait ChainRunner: Send + Sync {
    fn chain_id(&self) -> &str;

    fn status(&self) -> RunnerStatus;

    async fn init(&self) -> Result<()>;

    /// Triggers a background sync pass, see [`RelayRunner::sync_to_latest`].
    fn trigger_sync(self: Arc<Self>) -> Option<JoinHandle<()>>;
}

#[async_trait::async_trait]
impl<R, S> ChainRunner for RelayRunner<R, S>
where
    R: BtcRelay + 'static,
    S: TransactionSender<Tx = R::Tx> + 'static,
{
    fn chain_id(&self) -> &str {
        RelayRunner::chain_id(self)
    }

    fn status(&self) -> RunnerStatus {
        RelayRunner::status(self)
    }

    async fn init(&self) -> Result<()> {
        RelayRunner::init(self).await
    }

    fn trigger_sync(self: Arc<Self>) -> Option<JoinHandle<()>> {
        self.sync_to_latest()
    }
}

/// Blocks until bitcoind answers and has left initial block download.
pub async fn wait_for_bitcoin_rpc(bitcoind: &dyn BitcoinRpc, backoff: Duration) -> SyncInfo {
    tracing::info!("Waiting for bitcoind");

    loop {
        match bitcoind.get_sync_info().await {
            Ok(info) if !info.ibd => {
                tracing::info!(blocks = info.blocks, "Bitcoind ready");
                return info;
            }
            Ok(info) => tracing::info!(
                blocks = info.blocks,
                headers = info.headers,
                progress = info.verification_progress,
                "Bitcoind in initial block download"
            ),
            Err(err) => tracing::warn!(?err, "Bitcoind offline"),
        }

        tokio::time::sleep(backoff).await;
    }
}

/// Status of a [`MultiChainRunner`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultiChainStatus {
    Offline,
    AwaitingBitcoind,
    Active,
}

/// Drives the runners of all target chains from a single Bitcoin node.
pub struct MultiChainRunner {
    bitcoind: Arc<dyn BitcoinRpc>,
    runners: Vec<Arc<dyn ChainRunner>>,
    config: RunnerConfig,
    status: RwLock<MultiChainStatus>,
}

impl MultiChainRunner {
    /// Constructs a new instance of [`MultiChainRunner`].
    pub fn new(
        bitcoind: Arc<dyn BitcoinRpc>,
        runners: Vec<Arc<dyn ChainRunner>>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            bitcoind,
            runners,
            config,
            status: RwLock::new(MultiChainStatus::Offline),
        }
    }

    pub fn status(&self) -> MultiChainStatus {
        *self.status.read()
    }

    pub fn runners(&self) -> &[Arc<dyn ChainRunner>] {
        &self.runners
    }

    /// Waits for bitcoind, then initializes every chain concurrently.
    ///
    /// A chain failing to initialize stays offline without affecting the others.
    pub async fn init(&self) {
        *self.status.write() = MultiChainStatus::AwaitingBitcoind;

        wait_for_bitcoin_rpc(&*self.bitcoind, self.config.ibd_backoff()).await;

        *self.status.write() = MultiChainStatus::Active;

        let results = futures::future::join_all(self.runners.iter().map(|runner| runner.init())).await;

        for (runner, result) in self.runners.iter().zip(results) {
            match result {
                Ok(()) => tracing::info!(chain = runner.chain_id(), "Chain runner active"),
                Err(err) => {
                    tracing::error!(chain = runner.chain_id(), ?err, "Failed to initialize chain")
                }
            }
        }
    }

    /// Triggers a sync pass on every chain.
    pub fn sync_to_latest(&self) -> Vec<JoinHandle<()>> {
        self.runners
            .iter()
            .filter_map(|runner| runner.clone().trigger_sync())
            .collect()
    }

    /// Spawns the polling tip watcher triggering all chains on every new Bitcoin block.
    pub fn spawn_tip_poller(self: &Arc<Self>) -> JoinHandle<()> {
        let poller = TipPoller::new(self.bitcoind.clone(), self.config.poll_interval());
        let this = self.clone();
        tokio::spawn(poller.run(move |_| {
            this.sync_to_latest();
        }))
    }
}
