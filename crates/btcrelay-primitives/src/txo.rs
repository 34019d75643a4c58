use crate::Error;
use bitcoin::Txid;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

/// Identifies a transaction output by what it pays, `sha256(value_le_u64 || script_pubkey)`.
///
/// Swaps lock funds against a [`TxoHash`] rather than an outpoint since the outpoint is unknown
/// until the payment is broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxoHash([u8; 32]);

impl TxoHash {
    /// Constructs a new instance of [`TxoHash`] from raw bytes.
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Computes the hash of an output paying `value` satoshis to `script_pubkey`.
    pub fn from_output(value: u64, script_pubkey: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(value.to_le_bytes());
        hasher.update(script_pubkey);
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// An all-zero hash marks a swap that does not want to be claimed by watchtowers.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for TxoHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl FromStr for TxoHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s)?;
        let len = bytes.len();
        let inner: [u8; 32] = bytes.try_into().map_err(|_| Error::InvalidLength(len))?;
        Ok(Self(inner))
    }
}

impl Serialize for TxoHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TxoHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Output observed in a block of the pruned window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxoEntry {
    pub txid: Txid,
    pub vout: u32,
    pub height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;

    #[test]
    fn txo_hash_commits_to_value_and_script() {
        let script = hex!("0014751e76e8199196d454941c45d1b3a323f1433bd6");
        let a = TxoHash::from_output(50_000, &script);
        let b = TxoHash::from_output(50_001, &script);
        let c = TxoHash::from_output(50_000, &script[1..]);
        assert_ne!(a, b);
        assert_ne!(a, c);

        let mut preimage = 50_000u64.to_le_bytes().to_vec();
        preimage.extend_from_slice(&script);
        let expected: [u8; 32] = Sha256::digest(&preimage).into();
        assert_eq!(a.as_bytes(), &expected);
    }

    #[test]
    fn txo_hash_hex_serde() {
        let hash = TxoHash::from_output(1, &[0x51]);
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{hash}\""));
        let decoded: TxoHash = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, hash);

        assert!("00".parse::<TxoHash>().is_err());
        assert!("zz".parse::<TxoHash>().is_err());
        assert!(TxoHash::default().is_zero());
        assert!(!hash.is_zero());
    }
}
