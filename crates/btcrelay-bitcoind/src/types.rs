//! Bitcoin Core JSON-RPC response types.
//!
//! Only the fields consumed by the relay are modeled, unknown fields are ignored when decoding.

use bitcoin::{Amount, BlockHash, ScriptBuf, TxMerkleNode, Txid};
use btcrelay_primitives::{ChainWork, Header, TxoHash, parse_compact_bits};
use serde::{Deserialize, Serialize};

/// Response for `getblockheader` RPC with verbose=true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockHeaderInfo {
    /// The block hash.
    pub hash: BlockHash,
    /// The number of confirmations, -1 if the block is not on the main chain.
    pub confirmations: i32,
    /// The block height or index.
    pub height: u32,
    /// The block version.
    pub version: i32,
    /// The merkle root.
    pub merkleroot: TxMerkleNode,
    /// The block time in UNIX epoch time.
    pub time: u32,
    /// The nonce.
    pub nonce: u32,
    /// The bits.
    pub bits: String,
    /// Expected number of hashes required to produce the chain up to this block (in hex).
    #[serde(default)]
    pub chainwork: String,
    /// The hash of the previous block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previousblockhash: Option<BlockHash>,
    /// The hash of the next block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nextblockhash: Option<BlockHash>,
}

impl BlockHeaderInfo {
    /// Returns `true` if the block is part of the node's best chain.
    pub fn is_on_main_chain(&self) -> bool {
        self.confirmations > 0
    }

    /// Converts the response into the header layout used by the relay contract.
    pub fn to_header(&self) -> Result<Header, btcrelay_primitives::Error> {
        use bitcoin::hashes::Hash;

        Ok(Header {
            version: self.version,
            reversed_prev_blockhash: self
                .previousblockhash
                .map(|hash| hash.to_byte_array())
                .unwrap_or_default(),
            merkle_root: self.merkleroot.to_byte_array(),
            timestamp: self.time,
            nbits: parse_compact_bits(&self.bits)?,
            nonce: self.nonce,
        })
    }

    /// Parses the cumulative chainwork reported by the node.
    pub fn chain_work(&self) -> Result<ChainWork, btcrelay_primitives::Error> {
        let bytes = hex::decode(&self.chainwork)?;
        if bytes.len() > 32 {
            return Err(btcrelay_primitives::Error::InvalidLength(bytes.len()));
        }
        let mut padded = [0u8; 32];
        padded[32 - bytes.len()..].copy_from_slice(&bytes);
        Ok(ChainWork(padded))
    }
}

/// Response for `getblock` RPC with verbosity=2.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockInfo {
    /// The block hash.
    pub hash: BlockHash,
    /// The number of confirmations, -1 if the block is not on the main chain.
    pub confirmations: i32,
    /// The block height or index.
    pub height: u32,
    /// The block time in UNIX epoch time.
    pub time: u32,
    /// Transactions of the block, in block order.
    pub tx: Vec<BlockTransaction>,
    /// The hash of the previous block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previousblockhash: Option<BlockHash>,
    /// The hash of the next block.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nextblockhash: Option<BlockHash>,
}

impl BlockInfo {
    /// Returns the txids of the block in block order.
    pub fn txids(&self) -> Vec<Txid> {
        self.tx.iter().map(|tx| tx.txid).collect()
    }
}

/// Transaction embedded in a verbose `getblock` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockTransaction {
    /// The transaction id.
    pub txid: Txid,
    /// The transaction outputs.
    pub vout: Vec<Vout>,
}

/// Response for `getrawtransaction` RPC with verbose=true.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTransactionInfo {
    /// The serialized, hex-encoded data for the transaction.
    pub hex: String,
    /// The transaction id.
    pub txid: Txid,
    /// The transaction outputs.
    pub vout: Vec<Vout>,
    /// The block hash, absent for mempool transactions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blockhash: Option<BlockHash>,
    /// Number of confirmations, absent for mempool transactions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmations: Option<u32>,
}

/// Transaction output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vout {
    /// The value in BTC.
    #[serde(with = "bitcoin::amount::serde::as_btc")]
    pub value: Amount,
    /// Index.
    pub n: u32,
    /// The script pubkey.
    #[serde(rename = "scriptPubKey")]
    pub script_pub_key: ScriptPubKey,
}

impl Vout {
    /// Returns the [`TxoHash`] identifying this output.
    pub fn txo_hash(&self) -> TxoHash {
        TxoHash::from_output(self.value.to_sat(), self.script_pub_key.hex.as_bytes())
    }
}

/// Script pubkey.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScriptPubKey {
    /// The raw output script.
    pub hex: ScriptBuf,
}

/// Node synchronization state derived from `getblockchaininfo`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncInfo {
    /// Whether initial block download is still in progress.
    #[serde(rename = "initialblockdownload")]
    pub ibd: bool,
    /// The current number of validated headers.
    pub headers: u32,
    /// The current number of blocks processed.
    pub blocks: u32,
    /// Estimate of verification progress [0..1].
    #[serde(rename = "verificationprogress")]
    pub verification_progress: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_block_header_response() {
        let json = r#"{
            "hash": "00000000839a8e6886ab5951d76f411475428afc90947ee320161bbf18eb6048",
            "confirmations": 870000,
            "height": 1,
            "version": 1,
            "versionHex": "00000001",
            "merkleroot": "0e3e2357e806b6cdb1f70b54c3a3a17b6714ee1f0e68bebb44a74b1efd512098",
            "time": 1231469665,
            "mediantime": 1231469665,
            "nonce": 2573394689,
            "bits": "1d00ffff",
            "difficulty": 1,
            "chainwork": "0000000000000000000000000000000000000000000000000000000200020002",
            "nTx": 1,
            "previousblockhash": "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f",
            "nextblockhash": "000000006a625f06636b8bb6ac7b960a8d03705d1ace08b1a19da3fdcc99ddbd"
        }"#;
        let info: BlockHeaderInfo = serde_json::from_str(json).unwrap();
        assert!(info.is_on_main_chain());

        let header = info.to_header().unwrap();
        assert_eq!(header.block_hash(), info.hash);
        assert_eq!(header.nbits, 0x1d00ffff);
        assert_eq!(info.chain_work().unwrap(), ChainWork::from(0x200020002u128));
    }

    #[test]
    fn vout_value_is_converted_to_satoshis() {
        let json = r#"{
            "value": 0.00123456,
            "n": 1,
            "scriptPubKey": {
                "asm": "OP_TRUE",
                "hex": "51",
                "type": "nonstandard"
            }
        }"#;
        let vout: Vout = serde_json::from_str(json).unwrap();
        assert_eq!(vout.value.to_sat(), 123_456);
        assert_eq!(vout.txo_hash(), TxoHash::from_output(123_456, &[0x51]));
    }

    #[test]
    fn sync_info_from_blockchain_info() {
        let json = r#"{
            "chain": "main",
            "blocks": 100,
            "headers": 200,
            "bestblockhash": "00000000839a8e6886ab5951d76f411475428afc90947ee320161bbf18eb6048",
            "initialblockdownload": true,
            "verificationprogress": 0.5
        }"#;
        let info: SyncInfo = serde_json::from_str(json).unwrap();
        assert!(info.ibd);
        assert_eq!(info.headers, 200);
    }
}
