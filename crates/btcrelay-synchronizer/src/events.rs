use crate::BoxError;
use bitcoin::BlockHash;
use btcrelay_primitives::{ForkId, StoredHeader, TxoHash};
use serde::{Deserialize, Serialize};

/// Hash of the payment secret identifying a swap on the target chain.
pub type PaymentHash = [u8; 32];

const HEADER_STORED: &str = "StoreHeader";
const FORK_STORED: &str = "StoreFork";
const SWAP_INITIALIZED: &str = "InitializeEvent";
const SWAP_CLAIMED: &str = "ClaimEvent";
const SWAP_REFUNDED: &str = "RefundEvent";

/// Log stream the target chain exposes events under.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LogTopic {
    /// Every event emitted by the relay contract.
    Relay,
    /// Relay events touching the header of a specific block.
    Block(BlockHash),
    /// Every event emitted by the swap contract.
    Swaps,
}

/// Event as emitted on chain, before decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub name: String,
    pub data: serde_json::Value,
}

/// Target chain transaction together with the events it emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    /// Transaction identifier, used as the pagination cursor.
    pub id: String,
    /// Whether the transaction failed. Events of failed transactions must be ignored.
    pub failed: bool,
    pub events: Vec<RawEvent>,
}

impl LogEntry {
    /// Returns the successfully decoded events of this entry.
    ///
    /// Unknown events are skipped silently, malformed ones with a warning.
    pub fn decode_events(&self) -> Vec<ChainEvent> {
        if self.failed {
            return Vec::new();
        }

        self.events
            .iter()
            .filter_map(|raw| match ChainEvent::decode(raw) {
                Ok(event) => event,
                Err(err) => {
                    tracing::warn!(id = %self.id, ?err, "Skipping malformed event");
                    None
                }
            })
            .collect()
    }
}

/// Paginated access to the target chain's event log.
#[async_trait::async_trait]
pub trait EventLog: Send + Sync {
    /// Returns up to `limit` entries of `topic`, newest first, strictly older than the entry
    /// `before` if given. An empty page means the log is exhausted.
    async fn fetch_page(
        &self,
        topic: &LogTopic,
        before: Option<&str>,
        limit: usize,
    ) -> Result<Vec<LogEntry>, BoxError>;
}

/// Kind of a swap, only [`SwapKind::Chain`] swaps are claimable by watchtowers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapKind {
    Htlc,
    Chain,
    ChainNonced,
    ChainTxid,
}

/// Events of the relay and swap contracts.
#[derive(Debug, Clone, PartialEq)]
pub enum ChainEvent {
    /// A header was appended to the canonical chain of the relay.
    HeaderStored(HeaderStored),
    /// A header was appended to a fork of the relay.
    ForkStored(ForkStored),
    SwapInitialized(SwapInitialized),
    SwapClaimed { payment_hash: PaymentHash },
    SwapRefunded { payment_hash: PaymentHash },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeaderStored {
    pub block_hash: BlockHash,
    #[serde(with = "hex::serde")]
    pub commit_hash: [u8; 32],
    pub header: StoredHeader,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkStored {
    pub fork_id: ForkId,
    pub block_hash: BlockHash,
    #[serde(with = "hex::serde")]
    pub commit_hash: [u8; 32],
    pub header: StoredHeader,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SwapInitialized {
    #[serde(with = "hex::serde")]
    pub payment_hash: PaymentHash,
    pub txo_hash: TxoHash,
    pub kind: SwapKind,
    pub confirmations: u32,
}

#[derive(Serialize, Deserialize)]
struct PaymentHashData {
    #[serde(with = "hex::serde")]
    payment_hash: PaymentHash,
}

/// Failure to decode a known event.
#[derive(Debug, thiserror::Error)]
#[error("Failed to decode {name} event: {source}")]
pub struct EventDecodeError {
    pub name: String,
    #[source]
    pub source: serde_json::Error,
}

impl ChainEvent {
    /// Decodes a raw event. Returns `Ok(None)` for events this crate does not know.
    pub fn decode(raw: &RawEvent) -> Result<Option<Self>, EventDecodeError> {
        let decode_err = |source| EventDecodeError {
            name: raw.name.clone(),
            source,
        };
        let data = raw.data.clone();

        let event = match raw.name.as_str() {
            HEADER_STORED => Self::HeaderStored(serde_json::from_value(data).map_err(decode_err)?),
            FORK_STORED => Self::ForkStored(serde_json::from_value(data).map_err(decode_err)?),
            SWAP_INITIALIZED => {
                Self::SwapInitialized(serde_json::from_value(data).map_err(decode_err)?)
            }
            SWAP_CLAIMED => {
                let PaymentHashData { payment_hash } =
                    serde_json::from_value(data).map_err(decode_err)?;
                Self::SwapClaimed { payment_hash }
            }
            SWAP_REFUNDED => {
                let PaymentHashData { payment_hash } =
                    serde_json::from_value(data).map_err(decode_err)?;
                Self::SwapRefunded { payment_hash }
            }
            _ => return Ok(None),
        };

        Ok(Some(event))
    }

    /// Encodes the event in its on-chain representation.
    pub fn encode(&self) -> RawEvent {
        let (name, data) = match self {
            Self::HeaderStored(event) => (HEADER_STORED, serde_json::to_value(event)),
            Self::ForkStored(event) => (FORK_STORED, serde_json::to_value(event)),
            Self::SwapInitialized(event) => (SWAP_INITIALIZED, serde_json::to_value(event)),
            Self::SwapClaimed { payment_hash } => (
                SWAP_CLAIMED,
                serde_json::to_value(PaymentHashData {
                    payment_hash: *payment_hash,
                }),
            ),
            Self::SwapRefunded { payment_hash } => (
                SWAP_REFUNDED,
                serde_json::to_value(PaymentHashData {
                    payment_hash: *payment_hash,
                }),
            ),
        };

        RawEvent {
            name: name.to_string(),
            data: data.expect("Event payloads only contain serializable fields; qed"),
        }
    }

    /// Returns the stored header data if this is a relay header event.
    pub fn stored_header(&self) -> Option<(&BlockHash, &[u8; 32], &StoredHeader)> {
        match self {
            Self::HeaderStored(HeaderStored {
                block_hash,
                commit_hash,
                header,
            })
            | Self::ForkStored(ForkStored {
                block_hash,
                commit_hash,
                header,
                ..
            }) => Some((block_hash, commit_hash, header)),
            _ => None,
        }
    }
}
