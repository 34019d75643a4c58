//! Watchtower claiming chain swaps on behalf of their users.
//!
//! A chain swap locks funds on the target chain until the counterparty proves, through the relay,
//! that a Bitcoin output paying the agreed [`TxoHash`] got enough confirmations. The watchtower
//! keeps a [`PrunedTxoMap`] of the outputs created in the most recent blocks, matches them against
//! the [`SwapRegistry`] and builds the [`ClaimBundle`]s proving the payments.
//!
//! [`TxoHash`]: btcrelay_primitives::TxoHash

mod claim;
mod pruned_txo_map;
mod swap_registry;
mod watchtower;

pub use self::claim::{ClaimBundle, ClaimOperation, ClaimVariant, HeaderSource};
pub use self::pruned_txo_map::{PrunedTxoMap, TIP_HEIGHT_KEY};
pub use self::swap_registry::{SavedSwap, SwapRegistry};
pub use self::watchtower::Watchtower;

use bitcoin::{BlockHash, Txid};
use btcrelay_primitives::TxoHash;
use btcrelay_synchronizer::{BoxError, PaymentHash};

/// Watchtower error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Bitcoind(#[from] btcrelay_bitcoind::Error),

    #[error(transparent)]
    Storage(#[from] btcrelay_storage::Error),

    #[error(transparent)]
    Synchronizer(#[from] btcrelay_synchronizer::Error),

    #[error("Swap contract: {0}")]
    SwapContract(BoxError),

    #[error("Output hash mismatch, expected {expected}, got {actual}")]
    TxoHashMismatch { expected: TxoHash, actual: TxoHash },

    #[error("Not enough confirmations, have {have}, need {need}")]
    NotEnoughConfirmations { have: u32, need: u32 },

    #[error("No stored header found for block {0}")]
    MissingStoredHeader(BlockHash),

    #[error("Output {vout} of transaction {txid} not found")]
    MissingOutput { txid: Txid, vout: u32 },

    #[error("Transaction {0} is not included in a block")]
    TransactionNotInBlock(Txid),

    #[error("Transaction {0} has invalid hex")]
    InvalidTransactionHex(Txid),
}

/// Watchtower result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Escrow of a swap as reported by the swap contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscrowState {
    /// Confirmations the Bitcoin payment needs before it can be claimed.
    pub confirmations: u32,
    /// Whether the claimed funds are paid out to an account instead of its contract balance.
    pub pay_out: bool,
}

/// Swap contract on the target chain.
#[async_trait::async_trait]
pub trait SwapContract: Send + Sync {
    /// Returns the escrow locked under `payment_hash`, `None` once it was claimed or refunded.
    async fn get_escrow(
        &self,
        payment_hash: &PaymentHash,
    ) -> std::result::Result<Option<EscrowState>, BoxError>;

    /// Returns `true` if a previous claim attempt left transaction data for `reversed_txid` on
    /// chain.
    async fn has_scratch_data(
        &self,
        reversed_txid: &[u8; 32],
    ) -> std::result::Result<bool, BoxError>;
}

/// Watchtower configuration.
#[derive(Debug, Clone)]
pub struct WatchtowerConfig {
    /// Number of most recent blocks kept in the [`PrunedTxoMap`].
    pub window: u32,
    /// Maximum size of a single transaction data write.
    pub write_chunk_size: usize,
    /// Maximum number of claims built concurrently.
    pub claim_concurrency: usize,
}

impl Default for WatchtowerConfig {
    fn default() -> Self {
        Self {
            window: 30,
            write_chunk_size: 1000,
            claim_concurrency: 15,
        }
    }
}
