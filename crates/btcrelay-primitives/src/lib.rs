//! Primitives shared by the relay synchronizer and the watchtower.
//!
//! The relay contract on the target chain does not store Bitcoin headers verbatim. Each accepted
//! header is folded into a [`StoredHeader`] commitment carrying the cumulative chainwork, the
//! timestamps needed for the median-time-past rule and the last retarget timestamp. The
//! synchronizer recomputes these commitments locally with [`compute_next_commitment`] so that it
//! never needs to wait for the target chain before building the next submission.

mod merkle;
mod state_predictor;
mod txo;

pub use self::merkle::{MerkleProof, compute_merkle_proof};
pub use self::state_predictor::{
    DIFF_ADJUSTMENT_PERIOD, compute_next_commitment, gt256, nbits_to_target, work_from_nbits,
};
pub use self::txo::{TxoEntry, TxoHash};

use bitcoin::hashes::{Hash, sha256d};
use bitcoin::{BlockHash, block::Header as BitcoinHeader};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Number of previous block timestamps carried by a [`StoredHeader`].
pub const PREV_TIMESTAMPS_LEN: usize = 10;

/// Identifier of a fork tracked by the relay contract.
///
/// `0` always refers to the canonical chain.
pub type ForkId = u64;

/// Fork id of the canonical chain.
pub const MAIN_CHAIN: ForkId = 0;

/// Primitive error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid nbits: {0}")]
    InvalidBits(String),
    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("Expected 32 bytes, got {0}")]
    InvalidLength(usize),
}

/// Bitcoin block header in the layout expected by the relay contract.
///
/// Hashes are kept in internal byte order, i.e. reversed compared to the hex representation
/// returned by bitcoind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub version: i32,
    pub reversed_prev_blockhash: [u8; 32],
    pub merkle_root: [u8; 32],
    pub timestamp: u32,
    pub nbits: u32,
    pub nonce: u32,
}

impl Header {
    /// Returns the 80-byte consensus serialization of the header.
    pub fn to_bytes(&self) -> [u8; 80] {
        let mut data = [0u8; 80];
        data[0..4].copy_from_slice(&self.version.to_le_bytes());
        data[4..36].copy_from_slice(&self.reversed_prev_blockhash);
        data[36..68].copy_from_slice(&self.merkle_root);
        data[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        data[72..76].copy_from_slice(&self.nbits.to_le_bytes());
        data[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        data
    }

    /// Returns the hash of this header.
    pub fn block_hash(&self) -> BlockHash {
        BlockHash::from_byte_array(sha256d::Hash::hash(&self.to_bytes()).to_byte_array())
    }

    /// Returns the hash of the parent block.
    pub fn prev_blockhash(&self) -> BlockHash {
        BlockHash::from_byte_array(self.reversed_prev_blockhash)
    }
}

impl From<&BitcoinHeader> for Header {
    fn from(header: &BitcoinHeader) -> Self {
        Self {
            version: header.version.to_consensus(),
            reversed_prev_blockhash: header.prev_blockhash.to_byte_array(),
            merkle_root: header.merkle_root.to_byte_array(),
            timestamp: header.time,
            nbits: header.bits.to_consensus(),
            nonce: header.nonce,
        }
    }
}

/// 256-bit unsigned big-endian accumulator of chainwork.
///
/// The derived ordering compares the bytes lexicographically, which for fixed-width big-endian
/// integers is the numeric order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChainWork(pub [u8; 32]);

impl ChainWork {
    /// Zero chainwork.
    pub const fn zero() -> Self {
        Self([0u8; 32])
    }

    /// Returns the raw big-endian bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Adds `other` in place, carrying across all 32 bytes. Overflow out of the top byte is
    /// discarded.
    pub fn add_assign_work(&mut self, other: &ChainWork) {
        let mut carry = 0u16;
        for pos in (0..32).rev() {
            let value = self.0[pos] as u16 + other.0[pos] as u16 + carry;
            self.0[pos] = (value & 0xff) as u8;
            carry = value >> 8;
        }
    }
}

impl std::ops::Add for ChainWork {
    type Output = ChainWork;

    fn add(mut self, other: ChainWork) -> ChainWork {
        self.add_assign_work(&other);
        self
    }
}

impl From<u128> for ChainWork {
    fn from(value: u128) -> Self {
        let mut bytes = [0u8; 32];
        bytes[16..].copy_from_slice(&value.to_be_bytes());
        Self(bytes)
    }
}

impl TryFrom<&[u8]> for ChainWork {
    type Error = Error;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let inner: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::InvalidLength(bytes.len()))?;
        Ok(Self(inner))
    }
}

impl std::fmt::Display for ChainWork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Commitment the relay contract keeps for every accepted block header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredHeader {
    /// Cumulative chainwork up to and including this block.
    pub chain_work: ChainWork,
    /// Bitcoin header of this block.
    pub header: Header,
    /// Timestamp of the block that started the current difficulty period.
    pub last_diff_adjustment: u32,
    /// Height of this block.
    pub blockheight: u32,
    /// Timestamps of the 10 blocks preceding this one, oldest first.
    pub prev_block_timestamps: [u32; PREV_TIMESTAMPS_LEN],
}

impl StoredHeader {
    /// Returns the canonical serialization hashed into the commitment.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(32 + 80 + 8 + 4 * PREV_TIMESTAMPS_LEN);
        data.extend_from_slice(self.chain_work.as_bytes());
        data.extend_from_slice(&self.header.to_bytes());
        data.extend_from_slice(&self.last_diff_adjustment.to_le_bytes());
        data.extend_from_slice(&self.blockheight.to_le_bytes());
        for timestamp in self.prev_block_timestamps {
            data.extend_from_slice(&timestamp.to_le_bytes());
        }
        data
    }

    /// Returns the commitment hash recognized by the relay contract.
    pub fn commit_hash(&self) -> [u8; 32] {
        Sha256::digest(self.to_bytes()).into()
    }

    /// Returns the hash of the committed Bitcoin block.
    pub fn block_hash(&self) -> BlockHash {
        self.header.block_hash()
    }
}

/// Parses the `bits` field returned by bitcoind, e.g. `"1d00ffff"`.
pub fn parse_compact_bits(bits: &str) -> Result<u32, Error> {
    u32::from_str_radix(bits, 16).map_err(|_| Error::InvalidBits(bits.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::consensus::encode::deserialize_hex;

    // Block #1 on mainnet.
    const BLOCK1_HEADER: &str = "010000006fe28c0ab6f1b372c1a6a246ae63f74f931e8365e15a089c68d6190000000000982051fd1e4ba744bbbe680e1fee14677ba1a3c3540bf7b1cdb606e857233e0e61bc6649ffff001d01e36299";

    #[test]
    fn header_conversion_preserves_block_hash() {
        let bitcoin_header: BitcoinHeader = deserialize_hex(BLOCK1_HEADER).unwrap();
        let header = Header::from(&bitcoin_header);

        assert_eq!(header.block_hash(), bitcoin_header.block_hash());
        assert_eq!(header.prev_blockhash(), bitcoin_header.prev_blockhash);
        assert_eq!(header.nbits, 0x1d00ffff);
        assert_eq!(header.timestamp, 1231469665);
        assert_eq!(
            header.block_hash().to_string(),
            "00000000839a8e6886ab5951d76f411475428afc90947ee320161bbf18eb6048"
        );
    }

    #[test]
    fn chain_work_addition_carries_across_bytes() {
        let a = ChainWork::from(0xffu128);
        let b = ChainWork::from(0x01u128);
        assert_eq!(a + b, ChainWork::from(0x100u128));

        let a = ChainWork::from(u128::MAX);
        let b = ChainWork::from(1u128);
        let mut expected = [0u8; 32];
        expected[15] = 1;
        assert_eq!(a + b, ChainWork(expected));
        assert!(gt256(&(a + b).0, &a.0));
    }

    #[test]
    fn commit_hash_changes_with_any_field() {
        let stored = StoredHeader {
            chain_work: ChainWork::from(1000u128),
            header: Header {
                version: 2,
                reversed_prev_blockhash: [1u8; 32],
                merkle_root: [2u8; 32],
                timestamp: 100,
                nbits: 0x1d00ffff,
                nonce: 7,
            },
            last_diff_adjustment: 50,
            blockheight: 10,
            prev_block_timestamps: [1, 2, 3, 4, 5, 6, 7, 8, 9, 10],
        };
        let original = stored.commit_hash();

        let mut changed = stored.clone();
        changed.prev_block_timestamps[0] = 0;
        assert_ne!(changed.commit_hash(), original);

        let mut changed = stored.clone();
        changed.blockheight += 1;
        assert_ne!(changed.commit_hash(), original);

        assert_eq!(stored.to_bytes().len(), 32 + 80 + 8 + 40);
        assert_eq!(stored.clone().commit_hash(), original);
    }

    #[test]
    fn stored_header_json_roundtrip_keeps_fixed_timestamps() {
        let stored = StoredHeader {
            chain_work: ChainWork::from(7u128),
            header: Header {
                version: 1,
                reversed_prev_blockhash: [0u8; 32],
                merkle_root: [0u8; 32],
                timestamp: 1,
                nbits: 0x1d00ffff,
                nonce: 0,
            },
            last_diff_adjustment: 0,
            blockheight: 1,
            prev_block_timestamps: [0; PREV_TIMESTAMPS_LEN],
        };
        let json = serde_json::to_value(&stored).unwrap();
        let decoded: StoredHeader = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, stored);
    }

    #[test]
    fn parse_bits() {
        assert_eq!(parse_compact_bits("1d00ffff").unwrap(), 0x1d00ffff);
        assert!(parse_compact_bits("zz").is_err());
    }
}
