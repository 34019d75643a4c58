use crate::SavedSwap;
use bitcoin::Txid;
use bitcoin::hashes::Hash;
use btcrelay_primitives::{MerkleProof, StoredHeader};
use btcrelay_synchronizer::PaymentHash;

/// Where the [`StoredHeader`] proving a claim was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderSource {
    /// Computed locally for a header submission that may not have landed on chain yet.
    Optimistic,
    /// Recovered from the relay's event log, hence committed on chain.
    Recovered,
}

/// Destination of the claimed funds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimVariant {
    /// Funds are paid out to the claimer's account.
    PayOut,
    /// Funds are credited to the claimer's balance in the swap contract.
    InitializerBalance,
}

/// Step of a claim, executed in order by the target chain sender.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOperation {
    /// Drops transaction data left behind by an earlier attempt.
    CloseData,
    /// Writes `chunk` at `offset` into the scratch account holding the transaction data.
    WriteData {
        offset: u32,
        total_len: u32,
        chunk: Vec<u8>,
    },
    /// Proves inclusion of the written transaction through the relay.
    VerifyTransaction {
        reversed_txid: [u8; 32],
        confirmations: u32,
        position: u32,
        reversed_merkle_proof: Vec<[u8; 32]>,
        stored_header: StoredHeader,
    },
    Claim {
        payment_hash: PaymentHash,
        reversed_txid: [u8; 32],
        variant: ClaimVariant,
    },
}

/// Everything needed to claim one swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimBundle {
    pub swap: SavedSwap,
    pub txid: Txid,
    pub vout: u32,
    /// Height of the block including the payment.
    pub blockheight: u32,
    /// Height at which the payment reached the required confirmations.
    pub matured_at: u32,
    pub header_source: HeaderSource,
    pub operations: Vec<ClaimOperation>,
}

pub(crate) struct ClaimParams<'a> {
    pub swap: &'a SavedSwap,
    pub vout: u32,
    pub raw_tx: &'a [u8],
    pub proof: MerkleProof,
    pub confirmations: u32,
    pub stored_header: StoredHeader,
    pub variant: ClaimVariant,
    pub has_scratch_data: bool,
    pub write_chunk_size: usize,
}

/// Lays out the claim operations.
///
/// The transaction data written before verification is `vout (u32 LE) || raw transaction`.
pub(crate) fn build_claim_operations(params: ClaimParams<'_>) -> Vec<ClaimOperation> {
    let ClaimParams {
        swap,
        vout,
        raw_tx,
        proof,
        confirmations,
        stored_header,
        variant,
        has_scratch_data,
        write_chunk_size,
    } = params;

    let mut data = Vec::with_capacity(4 + raw_tx.len());
    data.extend_from_slice(&vout.to_le_bytes());
    data.extend_from_slice(raw_tx);

    let total_len = data.len() as u32;
    let chunk_size = write_chunk_size.max(1);

    let mut operations = Vec::new();

    if has_scratch_data {
        operations.push(ClaimOperation::CloseData);
    }

    operations.extend(
        data.chunks(chunk_size)
            .enumerate()
            .map(|(index, chunk)| ClaimOperation::WriteData {
                offset: (index * chunk_size) as u32,
                total_len,
                chunk: chunk.to_vec(),
            }),
    );

    operations.push(ClaimOperation::VerifyTransaction {
        reversed_txid: proof.reversed_txid,
        confirmations,
        position: proof.pos,
        reversed_merkle_proof: proof.merkle,
        stored_header,
    });

    operations.push(ClaimOperation::Claim {
        payment_hash: swap.payment_hash,
        reversed_txid: proof.reversed_txid,
        variant,
    });

    operations
}

impl ClaimBundle {
    /// Returns the transaction data written by the bundle, reassembled from its chunks.
    pub fn written_data(&self) -> Vec<u8> {
        self.operations
            .iter()
            .filter_map(|op| match op {
                ClaimOperation::WriteData { chunk, .. } => Some(chunk.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    /// Returns the txid in the byte order used by the relay contract.
    pub fn reversed_txid(&self) -> [u8; 32] {
        self.txid.to_byte_array()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use btcrelay_primitives::{ChainWork, Header, TxoHash};

    fn stored_header() -> StoredHeader {
        StoredHeader {
            chain_work: ChainWork::from(1u128),
            header: Header {
                version: 1,
                reversed_prev_blockhash: [0; 32],
                merkle_root: [1; 32],
                timestamp: 1,
                nbits: 0x1d00ffff,
                nonce: 0,
            },
            last_diff_adjustment: 0,
            blockheight: 10,
            prev_block_timestamps: [0; 10],
        }
    }

    fn params<'a>(swap: &'a SavedSwap, raw_tx: &'a [u8], has_scratch_data: bool) -> ClaimParams<'a> {
        ClaimParams {
            swap,
            vout: 2,
            raw_tx,
            proof: MerkleProof {
                reversed_txid: [9; 32],
                pos: 3,
                merkle: vec![[5; 32], [6; 32]],
            },
            confirmations: 3,
            stored_header: stored_header(),
            variant: ClaimVariant::PayOut,
            has_scratch_data,
            write_chunk_size: 1000,
        }
    }

    #[test]
    fn transaction_data_is_split_into_contiguous_chunks() {
        let swap = SavedSwap {
            txo_hash: TxoHash::from_bytes([1; 32]),
            payment_hash: [2; 32],
            confirmations: 3,
        };
        let raw_tx = (0..2500u32).map(|i| i as u8).collect::<Vec<_>>();

        let ops = build_claim_operations(params(&swap, &raw_tx, false));

        let writes = ops
            .iter()
            .filter_map(|op| match op {
                ClaimOperation::WriteData {
                    offset,
                    total_len,
                    chunk,
                } => Some((*offset, *total_len, chunk.len())),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(writes, vec![(0, 2504, 1000), (1000, 2504, 1000), (2000, 2504, 504)]);

        assert!(matches!(ops[3], ClaimOperation::VerifyTransaction { position: 3, .. }));
        assert_eq!(
            ops[4],
            ClaimOperation::Claim {
                payment_hash: [2; 32],
                reversed_txid: [9; 32],
                variant: ClaimVariant::PayOut,
            }
        );
    }

    #[test]
    fn leftover_scratch_data_is_closed_first() {
        let swap = SavedSwap {
            txo_hash: TxoHash::from_bytes([1; 32]),
            payment_hash: [2; 32],
            confirmations: 1,
        };
        let ops = build_claim_operations(params(&swap, &[0xaa; 10], true));
        assert_eq!(ops[0], ClaimOperation::CloseData);
        assert_eq!(ops.len(), 4);

        let ClaimOperation::WriteData { chunk, .. } = &ops[1] else {
            panic!("Expected WriteData");
        };
        assert_eq!(&chunk[..4], &2u32.to_le_bytes());
        assert_eq!(&chunk[4..], &[0xaa; 10]);
    }
}
