//! Coordination of the relay synchronizer and the watchtower of every target chain.
//!
//! A [`RelayRunner`] drives one target chain: it initializes the relay if needed, replays the swap
//! contract events into its watchtower and, on every new Bitcoin block, submits the missing headers
//! and claims the swaps that matured. [`MultiChainRunner`] fans Bitcoin block notifications out to
//! the runners of all configured chains.

mod config;
mod latch;
mod multi;
mod poller;
mod runner;

pub use self::config::{RunnerConfig, open_chain_storage};
pub use self::latch::SyncLatch;
pub use self::multi::{ChainRunner, MultiChainRunner, MultiChainStatus, wait_for_bitcoin_rpc};
pub use self::poller::TipPoller;
pub use self::runner::{
    ChainComponents, EVENTS_KEY, FORK_KEY, RelayRunner, RunnerStatus, SyncStats,
};

use btcrelay_synchronizer::BoxError;
use btcrelay_watchtower::ClaimBundle;

/// Runner error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Bitcoind(#[from] btcrelay_bitcoind::Error),

    #[error(transparent)]
    Primitives(#[from] btcrelay_primitives::Error),

    #[error(transparent)]
    Storage(#[from] btcrelay_storage::Error),

    #[error(transparent)]
    Synchronizer(#[from] btcrelay_synchronizer::Error),

    #[error(transparent)]
    Watchtower(#[from] btcrelay_watchtower::Error),

    #[error("Relay: {0}")]
    Relay(BoxError),

    #[error("Event log: {0}")]
    EventLog(BoxError),

    #[error("Failed to send transactions: {0}")]
    Send(BoxError),

    #[error("Bitcoin tip {tip} is too low to initialize the relay {depth} blocks below it")]
    ChainTooShort { tip: u32, depth: u32 },

    #[error("Relay is still not initialized")]
    RelayNotInitialized,
}

/// Runner result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Signs and sends target chain transactions, waiting for their confirmation.
#[async_trait::async_trait]
pub trait TransactionSender: Send + Sync {
    /// Transaction type of the target chain.
    type Tx: Send + Sync + 'static;

    /// Sends `txs` one after another, stopping at the first failure.
    async fn send_headers(&self, txs: Vec<Self::Tx>) -> std::result::Result<(), BoxError>;

    /// Executes the operations of `bundle` in order.
    async fn send_claim(&self, bundle: &ClaimBundle) -> std::result::Result<(), BoxError>;
}
