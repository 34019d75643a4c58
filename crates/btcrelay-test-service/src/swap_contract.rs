use crate::MockEventLog;
use btcrelay_primitives::{MerkleProof, TxoHash};
use btcrelay_synchronizer::{BoxError, ChainEvent, LogTopic, PaymentHash, SwapInitialized, SwapKind};
use btcrelay_watchtower::{ClaimBundle, ClaimOperation, EscrowState, SwapContract};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum MockSwapError {
    #[error("No escrow for the payment hash")]
    UnknownEscrow,
    #[error("Claim does not verify a transaction")]
    MissingVerification,
    #[error("Merkle proof does not match the stored header")]
    InvalidMerkleProof,
    #[error("Written data is incomplete")]
    IncompleteData,
}

/// Swap contract keeping escrows in memory and emitting its events to a [`MockEventLog`].
pub struct MockSwapContract {
    events: Arc<MockEventLog>,
    escrows: RwLock<HashMap<PaymentHash, EscrowState>>,
    scratch_data: RwLock<HashSet<[u8; 32]>>,
    claimed: RwLock<Vec<PaymentHash>>,
}

impl MockSwapContract {
    pub fn new(events: Arc<MockEventLog>) -> Self {
        Self {
            events,
            escrows: RwLock::new(HashMap::new()),
            scratch_data: RwLock::new(HashSet::new()),
            claimed: RwLock::new(Vec::new()),
        }
    }

    /// Locks an escrow and emits its initialization event.
    pub fn initialize_swap(
        &self,
        payment_hash: PaymentHash,
        txo_hash: TxoHash,
        kind: SwapKind,
        confirmations: u32,
        pay_out: bool,
    ) {
        self.escrows.write().insert(
            payment_hash,
            EscrowState {
                confirmations,
                pay_out,
            },
        );
        self.events.push(
            vec![LogTopic::Swaps],
            vec![ChainEvent::SwapInitialized(SwapInitialized {
                payment_hash,
                txo_hash,
                kind,
                confirmations,
            })],
            false,
        );
    }

    /// Settles an escrow in favor of the claimer.
    pub fn claim(&self, payment_hash: &PaymentHash) -> bool {
        if self.escrows.write().remove(payment_hash).is_none() {
            return false;
        }
        self.claimed.write().push(*payment_hash);
        self.events.push(
            vec![LogTopic::Swaps],
            vec![ChainEvent::SwapClaimed {
                payment_hash: *payment_hash,
            }],
            false,
        );
        true
    }

    /// Returns an escrow to its offerer.
    pub fn refund(&self, payment_hash: &PaymentHash) -> bool {
        if self.escrows.write().remove(payment_hash).is_none() {
            return false;
        }
        self.events.push(
            vec![LogTopic::Swaps],
            vec![ChainEvent::SwapRefunded {
                payment_hash: *payment_hash,
            }],
            false,
        );
        true
    }

    pub fn add_scratch_data(&self, reversed_txid: [u8; 32]) {
        self.scratch_data.write().insert(reversed_txid);
    }

    pub fn claimed(&self) -> Vec<PaymentHash> {
        self.claimed.read().clone()
    }

    /// Checks the proof carried by `bundle` and claims its swap.
    pub fn execute_claim(&self, bundle: &ClaimBundle) -> Result<(), MockSwapError> {
        if !self.escrows.read().contains_key(&bundle.swap.payment_hash) {
            return Err(MockSwapError::UnknownEscrow);
        }

        let (proof, merkle_root) = bundle
            .operations
            .iter()
            .find_map(|op| match op {
                ClaimOperation::VerifyTransaction {
                    reversed_txid,
                    position,
                    reversed_merkle_proof,
                    stored_header,
                    ..
                } => Some((
                    MerkleProof {
                        reversed_txid: *reversed_txid,
                        pos: *position,
                        merkle: reversed_merkle_proof.clone(),
                    },
                    stored_header.header.merkle_root,
                )),
                _ => None,
            })
            .ok_or(MockSwapError::MissingVerification)?;

        if proof.compute_root() != merkle_root {
            return Err(MockSwapError::InvalidMerkleProof);
        }

        let total_len = bundle.operations.iter().find_map(|op| match op {
            ClaimOperation::WriteData { total_len, .. } => Some(*total_len as usize),
            _ => None,
        });
        if total_len != Some(bundle.written_data().len()) {
            return Err(MockSwapError::IncompleteData);
        }

        self.scratch_data.write().remove(&proof.reversed_txid);
        self.claim(&bundle.swap.payment_hash);

        Ok(())
    }
}

#[async_trait::async_trait]
impl SwapContract for MockSwapContract {
    async fn get_escrow(&self, payment_hash: &PaymentHash) -> Result<Option<EscrowState>, BoxError> {
        Ok(self.escrows.read().get(payment_hash).copied())
    }

    async fn has_scratch_data(&self, reversed_txid: &[u8; 32]) -> Result<bool, BoxError> {
        Ok(self.scratch_data.read().contains(reversed_txid))
    }
}
