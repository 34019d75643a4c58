//! Synchronization of Bitcoin headers into an on-chain relay contract.
//!
//! [`RelaySynchronizer`] compares the relay tip against the Bitcoin chain served by a
//! [`BitcoinRpc`](btcrelay_bitcoind::BitcoinRpc) and produces the header submissions needed to
//! catch up, opening a fork when the relay tip has been reorganized away. Full [`StoredHeader`]
//! commitments are not kept on chain, [`CheckpointRecovery`] reconstructs them from the relay's
//! event log.
//!
//! [`StoredHeader`]: btcrelay_primitives::StoredHeader

mod events;
mod recovery;
mod relay;
mod synchronizer;

pub use self::events::{
    ChainEvent, EventDecodeError, EventLog, ForkStored, HeaderStored, LogEntry, LogTopic,
    PaymentHash, RawEvent, SwapInitialized, SwapKind,
};
pub use self::recovery::{CheckpointRecovery, DEFAULT_LOG_PAGE_SIZE};
pub use self::relay::{BtcRelay, RelayState, RelayView, TipData};
pub use self::synchronizer::{HeaderSubmission, RelaySynchronizer, SyncMode, SyncResult};

use bitcoin::BlockHash;
use std::time::Duration;

/// Boxed error returned by target chain collaborators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Synchronizer error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Block {0} not found on bitcoind")]
    BlockNotFound(BlockHash),

    #[error("Event log exhausted while looking for {0}")]
    LogExhausted(String),

    #[error("Relay contract: {0}")]
    Relay(BoxError),

    #[error("Event log: {0}")]
    EventLog(BoxError),

    #[error(transparent)]
    Bitcoind(#[from] btcrelay_bitcoind::Error),

    #[error(transparent)]
    Primitives(#[from] btcrelay_primitives::Error),
}

impl Error {
    /// Returns `true` if the pass may succeed when retried on the next trigger.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::BlockNotFound(_) => true,
            Self::Bitcoind(err) => err.is_transient(),
            _ => false,
        }
    }
}

/// Synchronizer result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Relay synchronizer configuration.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Headers per transaction extending the canonical chain.
    pub main_batch_size: usize,
    /// Headers per transaction extending a fork.
    pub fork_batch_size: usize,
    /// Delay between consecutive header fetches, zero disables it.
    pub header_delay: Duration,
    /// Entries fetched per event log page.
    pub log_page_size: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            main_batch_size: 7,
            fork_batch_size: 6,
            header_delay: Duration::from_secs(1),
            log_page_size: DEFAULT_LOG_PAGE_SIZE,
        }
    }
}

impl SyncConfig {
    /// Returns the batch capacity for submissions in `mode`.
    pub fn batch_size(&self, mode: SyncMode) -> usize {
        let size = match mode {
            SyncMode::Main => self.main_batch_size,
            SyncMode::NewFork | SyncMode::Fork(_) => self.fork_batch_size,
        };
        size.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_size_depends_on_mode() {
        let config = SyncConfig::default();
        assert_eq!(config.batch_size(SyncMode::Main), 7);
        assert_eq!(config.batch_size(SyncMode::NewFork), 6);
        assert_eq!(config.batch_size(SyncMode::Fork(3)), 6);

        let config = SyncConfig {
            main_batch_size: 0,
            ..Default::default()
        };
        assert_eq!(config.batch_size(SyncMode::Main), 1);
    }
}
