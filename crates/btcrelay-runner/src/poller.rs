use bitcoin::BlockHash;
use btcrelay_bitcoind::BitcoinRpc;
use std::sync::Arc;
use std::time::Duration;

/// Detects new Bitcoin blocks by polling the node's best block hash.
pub struct TipPoller {
    bitcoind: Arc<dyn BitcoinRpc>,
    interval: Duration,
    last_seen: Option<BlockHash>,
}

impl TipPoller {
    /// Constructs a new instance of [`TipPoller`].
    pub fn new(bitcoind: Arc<dyn BitcoinRpc>, interval: Duration) -> Self {
        Self {
            bitcoind,
            interval,
            last_seen: None,
        }
    }

    /// Returns the new best block hash if it changed since the previous poll.
    ///
    /// The first poll only records the current tip.
    pub async fn poll_once(&mut self) -> btcrelay_bitcoind::Result<Option<BlockHash>> {
        let best = self.bitcoind.get_best_block_hash().await?;
        match self.last_seen.replace(best) {
            Some(previous) if previous != best => Ok(Some(best)),
            _ => Ok(None),
        }
    }

    /// Polls forever, calling `on_new_tip` for every tip change.
    pub async fn run(mut self, on_new_tip: impl Fn(BlockHash) + Send) {
        loop {
            match self.poll_once().await {
                Ok(Some(best)) => {
                    tracing::info!(%best, "New Bitcoin tip");
                    on_new_tip(best);
                }
                Ok(None) => {}
                Err(err) => tracing::warn!(?err, "Failed to poll Bitcoin tip"),
            }

            tokio::time::sleep(self.interval).await;
        }
    }
}
