//! In-memory collaborators for integration tests.
//!
//! [`MockBitcoind`] serves a Bitcoin chain that tests extend and reorganize at will, [`MockRelay`]
//! and [`MockSwapContract`] emulate the target chain contracts on top of a shared
//! [`MockEventLog`].

mod bitcoind;
mod event_log;
mod relay;
mod swap_contract;

pub use self::bitcoind::{BLOCK_INTERVAL, DEFAULT_NBITS, MockBitcoind};
pub use self::event_log::MockEventLog;
pub use self::relay::{MockRelay, MockRelayError, MockRelayTx};
pub use self::swap_contract::{MockSwapContract, MockSwapError};

use bitcoin::consensus::encode::deserialize_hex;
use bitcoin::{Amount, Block, ScriptBuf, TxOut};
use btcrelay_bitcoind::BitcoinRpc;
use btcrelay_primitives::TxoHash;
use btcrelay_storage::Storage;
use btcrelay_synchronizer::{
    CheckpointRecovery, EventLog, RelaySynchronizer, RelayView, SyncConfig, SyncResult,
};
use btcrelay_watchtower::{Watchtower, WatchtowerConfig};
use std::sync::Arc;
use std::time::Duration;

fn decode_raw_block(hex_str: &str) -> Block {
    deserialize_hex(hex_str).expect("Failed to decode hex data to Block")
}

pub fn block_data() -> Vec<Block> {
    // genesis block
    let block0 = decode_raw_block("0100000000000000000000000000000000000000000000000000000000000000000000003ba3edfd7a7b12b27ac72c3e67768f617fc81bc3888a51323a9fb8aa4b1e5e4a29ab5f49ffff001d1dac2b7c0101000000010000000000000000000000000000000000000000000000000000000000000000ffffffff4d04ffff001d0104455468652054696d65732030332f4a616e2f32303039204368616e63656c6c6f72206f6e206272696e6b206f66207365636f6e64206261696c6f757420666f722062616e6b73ffffffff0100f2052a01000000434104678afdb0fe5548271967f1a67130b7105cd6a828e03909a67962e0ea1f61deb649f6bc3f4cef38c4f35504e51ec112de5c384df7ba0b8d578a4c702b6bf11d5fac00000000");
    // https://webbtc.com/block/00000000839a8e6886ab5951d76f411475428afc90947ee320161bbf18eb6048
    // height 1
    let block1 = decode_raw_block("010000006fe28c0ab6f1b372c1a6a246ae63f74f931e8365e15a089c68d6190000000000982051fd1e4ba744bbbe680e1fee14677ba1a3c3540bf7b1cdb606e857233e0e61bc6649ffff001d01e362990101000000010000000000000000000000000000000000000000000000000000000000000000ffffffff0704ffff001d0104ffffffff0100f2052a0100000043410496b538e853519c726a2c91e61ec11600ae1390813a627c66fb8be7947be63c52da7589379515d4e0a604f8141781e62294721166bf621e73a82cbf2342c858eeac00000000");
    // https://webbtc.com/block/000000006a625f06636b8bb6ac7b960a8d03705d1ace08b1a19da3fdcc99ddbd.hex
    // height 2
    let block2  = decode_raw_block("010000004860eb18bf1b1620e37e9490fc8a427514416fd75159ab86688e9a8300000000d5fdcc541e25de1c7a5addedf24858b8bb665c9f36ef744ee42c316022c90f9bb0bc6649ffff001d08d2bd610101000000010000000000000000000000000000000000000000000000000000000000000000ffffffff0704ffff001d010bffffffff0100f2052a010000004341047211a824f55b505228e4c3d5194c1fcfaa15a456abdf37f9b9d97a4040afc073dee6c89064984f03385237d92167c13e236446b417ab79a0fcae412ae3316b77ac00000000");
    // https://webbtc.com/block/0000000082b5015589a3fdf2d4baff403e6f0be035a5d9742c1cae6295464449.hex
    // height 3
    let block3 = decode_raw_block("01000000bddd99ccfda39da1b108ce1a5d70038d0a967bacb68b6b63065f626a0000000044f672226090d85db9a9f2fbfe5f0f9609b387af7be5b7fbb7a1767c831c9e995dbe6649ffff001d05e0ed6d0101000000010000000000000000000000000000000000000000000000000000000000000000ffffffff0704ffff001d010effffffff0100f2052a0100000043410494b9d3e76c5b1629ecf97fff95d7a4bbdac87cc26099ada28066c6ff1eb9191223cd897194a08d0c2726c5747f1db49e8cf90e75dc3e3550ae9b30086f3cd5aaac00000000");
    vec![block0, block1, block2, block3]
}

/// Output of `value` satoshis to a witness script derived from `seed`.
pub fn swap_output(value: u64, seed: u8) -> TxOut {
    let mut script = vec![0x00, 0x20];
    script.extend_from_slice(&[seed; 32]);
    TxOut {
        value: Amount::from_sat(value),
        script_pubkey: ScriptBuf::from_bytes(script),
    }
}

/// Returns the [`TxoHash`] of `output`.
pub fn txo_hash_of(output: &TxOut) -> TxoHash {
    TxoHash::from_output(output.value.to_sat(), output.script_pubkey.as_bytes())
}

/// Synchronizer configuration without delays.
pub fn sync_config() -> SyncConfig {
    SyncConfig {
        header_delay: Duration::ZERO,
        ..Default::default()
    }
}

/// Mock Bitcoin chain and target chain sharing one event log.
pub struct TestEnv {
    pub bitcoind: Arc<MockBitcoind>,
    pub events: Arc<MockEventLog>,
    pub relay: Arc<MockRelay>,
    pub swaps: Arc<MockSwapContract>,
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl TestEnv {
    pub fn new() -> Self {
        let events = Arc::new(MockEventLog::new());
        Self {
            bitcoind: Arc::new(MockBitcoind::new()),
            relay: Arc::new(MockRelay::new(events.clone())),
            swaps: Arc::new(MockSwapContract::new(events.clone())),
            events,
        }
    }

    pub fn recovery(&self) -> CheckpointRecovery {
        CheckpointRecovery::new(
            self.relay.clone() as Arc<dyn RelayView>,
            self.events.clone() as Arc<dyn EventLog>,
            self.bitcoind.clone() as Arc<dyn BitcoinRpc>,
            sync_config().log_page_size,
        )
    }

    pub fn synchronizer(&self) -> RelaySynchronizer<MockRelay> {
        RelaySynchronizer::new(
            self.relay.clone(),
            self.bitcoind.clone(),
            self.recovery(),
            sync_config(),
        )
    }

    pub fn watchtower(&self, storage: Arc<dyn Storage>) -> Watchtower {
        Watchtower::new(
            WatchtowerConfig::default(),
            self.bitcoind.clone(),
            self.swaps.clone(),
            self.recovery(),
            storage,
        )
    }

    /// Runs a synchronizer pass and applies all its submissions to the relay.
    pub async fn sync_relay(&self) -> SyncResult<MockRelayTx> {
        let result = self
            .synchronizer()
            .sync_to_latest_txs()
            .await
            .expect("Sync pass succeeds");
        for submission in &result.submissions {
            self.relay
                .apply(&submission.tx)
                .expect("Submission applies cleanly");
        }
        result
    }
}
