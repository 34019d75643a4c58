//! Access to the Bitcoin chain as seen by a Bitcoin Core node.
//!
//! The relay only ever reads from Bitcoin. [`BitcoinRpc`] lists the queries it needs,
//! [`BitcoindClient`] serves them from a bitcoind JSON-RPC endpoint.

mod client;
mod error;
mod types;

pub use self::client::BitcoindClient;
pub use self::error::Error;
pub use self::types::{
    BlockHeaderInfo, BlockInfo, BlockTransaction, RawTransactionInfo, ScriptPubKey, SyncInfo, Vout,
};

use bitcoin::{BlockHash, Txid};
use std::sync::Arc;

/// Bitcoind client result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Read access to the Bitcoin chain.
#[async_trait::async_trait]
pub trait BitcoinRpc: Send + Sync {
    /// Returns the header of the given block, `None` if the node does not know it.
    async fn get_block_header(&self, hash: &BlockHash) -> Result<Option<BlockHeaderInfo>>;

    /// Returns the block with all transactions decoded.
    async fn get_block(&self, hash: &BlockHash) -> Result<BlockInfo>;

    async fn get_raw_transaction(&self, txid: &Txid) -> Result<RawTransactionInfo>;

    /// Returns the hash of the main chain block at `height`.
    async fn get_block_hash(&self, height: u32) -> Result<BlockHash>;

    async fn get_tip_height(&self) -> Result<u32>;

    async fn get_best_block_hash(&self) -> Result<BlockHash>;

    async fn get_sync_info(&self) -> Result<SyncInfo>;
}

#[async_trait::async_trait]
impl<T: BitcoinRpc + ?Sized> BitcoinRpc for Arc<T> {
    async fn get_block_header(&self, hash: &BlockHash) -> Result<Option<BlockHeaderInfo>> {
        (**self).get_block_header(hash).await
    }

    async fn get_block(&self, hash: &BlockHash) -> Result<BlockInfo> {
        (**self).get_block(hash).await
    }

    async fn get_raw_transaction(&self, txid: &Txid) -> Result<RawTransactionInfo> {
        (**self).get_raw_transaction(txid).await
    }

    async fn get_block_hash(&self, height: u32) -> Result<BlockHash> {
        (**self).get_block_hash(height).await
    }

    async fn get_tip_height(&self) -> Result<u32> {
        (**self).get_tip_height().await
    }

    async fn get_best_block_hash(&self) -> Result<BlockHash> {
        (**self).get_best_block_hash().await
    }

    async fn get_sync_info(&self) -> Result<SyncInfo> {
        (**self).get_sync_info().await
    }
}

/// Bitcoind connection parameters.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "cli", derive(clap::Args))]
pub struct BitcoindConfig {
    /// Bitcoind JSON-RPC endpoint.
    #[cfg_attr(
        feature = "cli",
        arg(long = "bitcoind-url", default_value = "http://127.0.0.1:8332")
    )]
    pub rpc_url: String,

    /// Bitcoind RPC user.
    #[cfg_attr(feature = "cli", arg(long = "bitcoind-user"))]
    pub rpc_user: Option<String>,

    /// Bitcoind RPC password.
    #[cfg_attr(feature = "cli", arg(long = "bitcoind-password"))]
    pub rpc_password: Option<String>,

    /// Request timeout in seconds.
    #[cfg_attr(feature = "cli", arg(long = "bitcoind-timeout", default_value_t = 60))]
    pub request_timeout: u64,
}

impl Default for BitcoindConfig {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8332".to_string(),
            rpc_user: None,
            rpc_password: None,
            request_timeout: 60,
        }
    }
}
