//! Recovery of [`StoredHeader`]s from the relay's event log.
//!
//! The relay contract only keeps the commitment hashes of recent headers. The full commitment of a
//! block is recovered by scanning the events the contract emitted when the header was stored.

use crate::events::{EventLog, LogEntry, LogTopic};
use crate::relay::RelayView;
use crate::{Error, Result};
use bitcoin::BlockHash;
use btcrelay_bitcoind::{BitcoinRpc, BlockHeaderInfo};
use btcrelay_primitives::StoredHeader;
use std::sync::Arc;

/// Default number of log entries fetched per page.
pub const DEFAULT_LOG_PAGE_SIZE: usize = 500;

/// Backward cursor over the pages of a log topic.
struct LogCursor<'a> {
    events: &'a dyn EventLog,
    topic: LogTopic,
    before: Option<String>,
    page_size: usize,
}

impl<'a> LogCursor<'a> {
    fn new(events: &'a dyn EventLog, topic: LogTopic, page_size: usize) -> Self {
        Self {
            events,
            topic,
            before: None,
            page_size,
        }
    }

    /// Returns the next older page, `None` once the log is exhausted.
    async fn next_page(&mut self) -> Result<Option<Vec<LogEntry>>> {
        let page = self
            .events
            .fetch_page(&self.topic, self.before.as_deref(), self.page_size)
            .await
            .map_err(Error::EventLog)?;

        match page.last() {
            Some(last) => {
                self.before = Some(last.id.clone());
                Ok(Some(page))
            }
            None => Ok(None),
        }
    }
}

/// Looks up committed headers in the relay's event log.
#[derive(Clone)]
pub struct CheckpointRecovery {
    relay: Arc<dyn RelayView>,
    events: Arc<dyn EventLog>,
    bitcoind: Arc<dyn BitcoinRpc>,
    page_size: usize,
}

impl CheckpointRecovery {
    /// Constructs a new instance of [`CheckpointRecovery`].
    pub fn new(
        relay: Arc<dyn RelayView>,
        events: Arc<dyn EventLog>,
        bitcoind: Arc<dyn BitcoinRpc>,
        page_size: usize,
    ) -> Self {
        Self {
            relay,
            events,
            bitcoind,
            page_size,
        }
    }

    /// Returns the header committed as `commit_hash` for block `block_hash`.
    pub async fn retrieve_log(
        &self,
        commit_hash: &[u8; 32],
        block_hash: &BlockHash,
    ) -> Result<StoredHeader> {
        let mut cursor = LogCursor::new(
            self.events.as_ref(),
            LogTopic::Block(*block_hash),
            self.page_size,
        );

        while let Some(page) = cursor.next_page().await? {
            for entry in page {
                for event in entry.decode_events() {
                    if let Some((_, event_commit_hash, header)) = event.stored_header() {
                        if event_commit_hash == commit_hash {
                            return Ok(header.clone());
                        }
                    }
                }
            }
        }

        Err(Error::LogExhausted(format!(
            "commitment {} of block {block_hash}",
            hex::encode(commit_hash)
        )))
    }

    /// Returns the most recently stored header that is both on the Bitcoin main chain and still
    /// recognized by the relay, along with its Bitcoin header.
    pub async fn retrieve_latest_known_block_log(&self) -> Result<(StoredHeader, BlockHeaderInfo)> {
        let state = self.relay.get_state().await.map_err(Error::Relay)?;

        let mut cursor = LogCursor::new(self.events.as_ref(), LogTopic::Relay, self.page_size);

        while let Some(page) = cursor.next_page().await? {
            for entry in page {
                // Newest header of the entry first.
                for event in entry.decode_events().iter().rev() {
                    let Some((block_hash, commit_hash, header)) = event.stored_header() else {
                        continue;
                    };

                    if !state.recognizes(commit_hash) {
                        continue;
                    }

                    match self.bitcoind.get_block_header(block_hash).await {
                        Ok(Some(info)) if info.is_on_main_chain() => {
                            tracing::debug!(
                                height = info.height,
                                %block_hash,
                                "Recovered latest known relay block"
                            );
                            return Ok((header.clone(), info));
                        }
                        Err(err) => {
                            tracing::debug!(
                                %block_hash,
                                ?err,
                                "Failed to fetch logged block, skipping"
                            );
                            continue;
                        }
                        // Stored on a branch Bitcoin has since abandoned.
                        Ok(_) => continue,
                    }
                }
            }
        }

        Err(Error::LogExhausted(
            "a relay block on the Bitcoin main chain".to_string(),
        ))
    }

    /// Returns the header committed for `block_hash` once the relay reached `required_height`.
    ///
    /// Returns `None` if the relay is still below `required_height` or if the log holds no
    /// recognized commitment for the block.
    pub async fn retrieve_block_log(
        &self,
        block_hash: &BlockHash,
        required_height: u32,
    ) -> Result<Option<StoredHeader>> {
        let state = self.relay.get_state().await.map_err(Error::Relay)?;

        if state.block_height < required_height {
            tracing::debug!(
                relay_height = state.block_height,
                required_height,
                "Relay not yet synchronized to the required height"
            );
            return Ok(None);
        }

        self.scan_block_topic(block_hash, &state.commitments).await
    }

    /// Returns the header committed for `block_hash` together with the current relay height.
    pub async fn retrieve_block_log_and_height(
        &self,
        block_hash: &BlockHash,
    ) -> Result<(Option<StoredHeader>, u32)> {
        let state = self.relay.get_state().await.map_err(Error::Relay)?;
        let header = self.scan_block_topic(block_hash, &state.commitments).await?;
        Ok((header, state.block_height))
    }

    async fn scan_block_topic(
        &self,
        block_hash: &BlockHash,
        commitments: &std::collections::HashSet<[u8; 32]>,
    ) -> Result<Option<StoredHeader>> {
        let mut cursor = LogCursor::new(
            self.events.as_ref(),
            LogTopic::Block(*block_hash),
            self.page_size,
        );

        while let Some(page) = cursor.next_page().await? {
            for entry in page {
                for event in entry.decode_events() {
                    if let Some((event_block_hash, commit_hash, header)) = event.stored_header() {
                        if event_block_hash == block_hash && commitments.contains(commit_hash) {
                            return Ok(Some(header.clone()));
                        }
                    }
                }
            }
        }

        Ok(None)
    }
}
