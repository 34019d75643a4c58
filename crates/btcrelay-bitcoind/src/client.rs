use crate::error::{Error, RPC_INVALID_ADDRESS_OR_KEY, RPC_INVALID_PARAMETER};
use crate::types::{BlockHeaderInfo, BlockInfo, RawTransactionInfo, SyncInfo};
use crate::{BitcoinRpc, BitcoindConfig, Result};
use bitcoin::base64::Engine;
use bitcoin::base64::engine::general_purpose::STANDARD;
use bitcoin::{BlockHash, Txid};
use jsonrpsee::core::client::ClientT;
use jsonrpsee::core::params::ArrayParams;
use jsonrpsee::http_client::{HeaderMap, HeaderValue, HttpClient, HttpClientBuilder};
use jsonrpsee::rpc_params;
use serde::de::DeserializeOwned;
use std::time::Duration;

/// Client of a Bitcoin Core node over JSON-RPC/HTTP.
pub struct BitcoindClient {
    client: HttpClient,
}

impl BitcoindClient {
    /// Constructs a new instance of [`BitcoindClient`].
    pub fn new(config: &BitcoindConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();

        if let (Some(user), Some(password)) = (&config.rpc_user, &config.rpc_password) {
            let token = STANDARD.encode(format!("{user}:{password}"));
            let value = HeaderValue::from_str(&format!("Basic {token}"))
                .map_err(|err| Error::InvalidCredentials(err.to_string()))?;
            headers.insert("Authorization", value);
        }

        let client = HttpClientBuilder::default()
            .set_headers(headers)
            .request_timeout(Duration::from_secs(config.request_timeout))
            .build(&config.rpc_url)?;

        Ok(Self { client })
    }

    async fn call<R: DeserializeOwned>(&self, method: &str, params: ArrayParams) -> Result<R> {
        tracing::trace!(method, "Sending bitcoind request");
        Ok(self.client.request(method, params).await?)
    }
}

#[async_trait::async_trait]
impl BitcoinRpc for BitcoindClient {
    async fn get_block_header(&self, hash: &BlockHash) -> Result<Option<BlockHeaderInfo>> {
        match self.call("getblockheader", rpc_params![hash, true]).await {
            Ok(header) => Ok(Some(header)),
            Err(Error::Rpc { code, .. }) if code == RPC_INVALID_ADDRESS_OR_KEY => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn get_block(&self, hash: &BlockHash) -> Result<BlockInfo> {
        match self.call("getblock", rpc_params![hash, 2]).await {
            Err(Error::Rpc { code, .. }) if code == RPC_INVALID_ADDRESS_OR_KEY => {
                Err(Error::BlockNotFound(*hash))
            }
            res => res,
        }
    }

    async fn get_raw_transaction(&self, txid: &Txid) -> Result<RawTransactionInfo> {
        match self.call("getrawtransaction", rpc_params![txid, true]).await {
            Err(Error::Rpc { code, .. }) if code == RPC_INVALID_ADDRESS_OR_KEY => {
                Err(Error::TransactionNotFound(*txid))
            }
            res => res,
        }
    }

    async fn get_block_hash(&self, height: u32) -> Result<BlockHash> {
        match self.call("getblockhash", rpc_params![height]).await {
            Err(Error::Rpc { code, .. }) if code == RPC_INVALID_PARAMETER => {
                Err(Error::BlockHeightOutOfRange(height))
            }
            res => res,
        }
    }

    async fn get_tip_height(&self) -> Result<u32> {
        self.call("getblockcount", rpc_params![]).await
    }

    async fn get_best_block_hash(&self) -> Result<BlockHash> {
        self.call("getbestblockhash", rpc_params![]).await
    }

    async fn get_sync_info(&self) -> Result<SyncInfo> {
        self.call("getblockchaininfo", rpc_params![]).await
    }
}
