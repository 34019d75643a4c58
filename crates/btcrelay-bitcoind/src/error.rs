use bitcoin::{BlockHash, Txid};
use jsonrpsee::core::ClientError;

/// Bitcoin Core RPC error code returned for unknown blocks and transactions.
pub(crate) const RPC_INVALID_ADDRESS_OR_KEY: i32 = -5;

/// Bitcoin Core RPC error code returned for a height above the tip.
pub(crate) const RPC_INVALID_PARAMETER: i32 = -8;

/// Bitcoind client errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Block {0} not found")]
    BlockNotFound(BlockHash),

    #[error("Block height {0} out of range")]
    BlockHeightOutOfRange(u32),

    #[error("Transaction {0} not found")]
    TransactionNotFound(Txid),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i32, message: String },

    #[error("Invalid bitcoind credentials: {0}")]
    InvalidCredentials(String),

    #[error(transparent)]
    Transport(ClientError),

    #[error(transparent)]
    Primitives(#[from] btcrelay_primitives::Error),
}

impl Error {
    /// Returns `true` if the error may go away by retrying later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::BlockNotFound(_))
    }
}

impl From<ClientError> for Error {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::Call(call) => Self::Rpc {
                code: call.code(),
                message: call.message().to_string(),
            },
            other => Self::Transport(other),
        }
    }
}
