use btcrelay_storage::{FileStorage, Storage};
use btcrelay_synchronizer::SyncConfig;
use btcrelay_watchtower::WatchtowerConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Runner configuration shared by all target chains.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "cli", derive(clap::Args))]
pub struct RunnerConfig {
    /// Directory holding the persisted state, one subdirectory per target chain.
    #[cfg_attr(feature = "cli", arg(long, default_value = "btcrelay-data"))]
    pub data_dir: PathBuf,

    /// Confirmations of the block the relay is initialized at.
    #[cfg_attr(feature = "cli", arg(long, default_value_t = 25))]
    pub initial_relay_depth: u32,

    /// Maximum number of claims sent concurrently.
    #[cfg_attr(feature = "cli", arg(long, default_value_t = 15))]
    pub max_concurrent_claims: usize,

    /// Seconds between bitcoind readiness checks while it is offline or in initial block download.
    #[cfg_attr(feature = "cli", arg(long, default_value_t = 30))]
    pub ibd_backoff_secs: u64,

    /// Milliseconds between Bitcoin tip polls.
    #[cfg_attr(feature = "cli", arg(long, default_value_t = 5000))]
    pub poll_interval_ms: u64,

    #[cfg_attr(feature = "cli", arg(skip))]
    pub sync: SyncConfig,

    #[cfg_attr(feature = "cli", arg(skip))]
    pub watchtower: WatchtowerConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("btcrelay-data"),
            initial_relay_depth: 25,
            max_concurrent_claims: 15,
            ibd_backoff_secs: 30,
            poll_interval_ms: 5000,
            sync: SyncConfig::default(),
            watchtower: WatchtowerConfig::default(),
        }
    }
}

impl RunnerConfig {
    pub fn ibd_backoff(&self) -> Duration {
        Duration::from_secs(self.ibd_backoff_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Opens the file storage of `chain_id` under `data_dir`.
pub async fn open_chain_storage(
    data_dir: &Path,
    chain_id: &str,
) -> btcrelay_storage::Result<Arc<dyn Storage>> {
    let storage = FileStorage::open(data_dir.join(chain_id)).await?;
    Ok(Arc::new(storage))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_intervals() {
        let config = RunnerConfig::default();
        assert_eq!(config.ibd_backoff(), Duration::from_secs(30));
        assert_eq!(config.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.watchtower.window, 30);
        assert_eq!(config.sync.log_page_size, 500);
    }
}
