use btcrelay_primitives::TxoHash;
use btcrelay_storage::{InMemoryStorage, Storage, TypedStore};
use btcrelay_test_service::{MockBitcoind, swap_output, txo_hash_of};
use btcrelay_watchtower::{PrunedTxoMap, TIP_HEIGHT_KEY};
use std::collections::HashSet;
use std::sync::Arc;

fn new_map(bitcoind: &Arc<MockBitcoind>, storage: &Arc<dyn Storage>, window: u32) -> PrunedTxoMap {
    PrunedTxoMap::new(bitcoind.clone(), TypedStore::new(storage.clone()), window)
}

fn coinbase_hash(bitcoind: &MockBitcoind, height: u32) -> TxoHash {
    let block = bitcoind.block(&bitcoind.block_hash(height)).unwrap();
    txo_hash_of(&block.txdata[0].output[0])
}

#[tokio::test]
async fn window_only_keeps_recent_blocks() {
    let bitcoind = Arc::new(MockBitcoind::new());
    bitcoind.mine_to_height(40);
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::default());

    let mut map = new_map(&bitcoind, &storage, 10);
    assert_eq!(map.init(35).await.unwrap(), 35);
    assert_eq!(map.lowest_height(), Some(26));
    assert_eq!(map.tip_height(), Some(35));
    assert_eq!(map.len(), 10);
    // Initialization does not persist.
    assert!(storage.get(TIP_HEIGHT_KEY).await.unwrap().is_none());

    let outputs = vec![swap_output(1_000, 1), swap_output(2_000, 2)];
    let watched = HashSet::from([txo_hash_of(&outputs[1])]);
    bitcoind.mine_payment(outputs.clone());
    bitcoind.mine_blocks(3);

    let found = map
        .sync_to_tip_hash(&bitcoind.tip_hash(), &watched)
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].0, txo_hash_of(&outputs[1]));
    assert_eq!(found[0].1.height, 41);
    assert_eq!(found[0].1.vout, 1);

    // Heights 35..=44 remain: 10 coinbase outputs plus the two payments.
    assert_eq!(map.tip_height(), Some(44));
    assert_eq!(map.lowest_height(), Some(35));
    assert_eq!(map.len(), 12);
    for height in 26..35 {
        assert!(map.get_txo(&coinbase_hash(&bitcoind, height)).is_none());
    }
    for height in 35..=44 {
        assert_eq!(
            map.get_txo(&coinbase_hash(&bitcoind, height)).map(|e| e.height),
            Some(height)
        );
    }

    let persisted = TypedStore::<u32>::new(storage.clone())
        .get(TIP_HEIGHT_KEY)
        .await
        .unwrap();
    assert_eq!(persisted, Some(44));

    // A restarted map resumes from the persisted height.
    let mut restarted = new_map(&bitcoind, &storage, 10);
    assert_eq!(restarted.init(20).await.unwrap(), 44);
    assert_eq!(restarted.len(), 12);
}

#[tokio::test]
async fn reorg_drops_outputs_of_replaced_blocks() {
    let bitcoind = Arc::new(MockBitcoind::new());
    bitcoind.mine_to_height(20);
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::default());

    let mut map = new_map(&bitcoind, &storage, 10);
    map.init(20).await.unwrap();

    let stale_output = swap_output(5_000, 7);
    bitcoind.mine_payment(vec![stale_output.clone()]);
    bitcoind.mine_blocks(1);
    map.sync_to_tip_hash(&bitcoind.tip_hash(), &HashSet::new())
        .await
        .unwrap();
    let stale_coinbases = [coinbase_hash(&bitcoind, 21), coinbase_hash(&bitcoind, 22)];
    assert_eq!(
        map.get_txo(&txo_hash_of(&stale_output)).map(|e| e.height),
        Some(21)
    );

    bitcoind.reorg_at(21);
    let replacement = swap_output(6_000, 8);
    bitcoind.mine_payment(vec![replacement.clone()]);

    let watched = HashSet::from([txo_hash_of(&replacement)]);
    let found = map
        .sync_to_tip_hash(&bitcoind.tip_hash(), &watched)
        .await
        .unwrap();
    assert_eq!(found.len(), 1);

    assert!(map.get_txo(&txo_hash_of(&stale_output)).is_none());
    for stale in stale_coinbases {
        assert!(map.get_txo(&stale).is_none());
    }
    assert_eq!(
        map.get_txo(&txo_hash_of(&replacement)).map(|e| e.height),
        Some(21)
    );
    assert_eq!(map.tip_height(), Some(21));
    // Heights 13..=21 with one coinbase each, plus the replacement payment.
    assert_eq!(map.lowest_height(), Some(13));
    assert_eq!(map.len(), 10);
}

#[tokio::test]
async fn pruning_covers_skipped_heights() {
    let bitcoind = Arc::new(MockBitcoind::new());
    bitcoind.mine_to_height(40);
    let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::default());

    let mut map = new_map(&bitcoind, &storage, 5);
    map.init(20).await.unwrap();
    assert_eq!(map.len(), 5);

    map.add_block(&bitcoind.block_hash(40), &HashSet::new())
        .await
        .unwrap();

    assert_eq!(map.lowest_height(), Some(40));
    assert_eq!(map.len(), 1);
    for height in 16..=20 {
        assert!(map.get_txo(&coinbase_hash(&bitcoind, height)).is_none());
    }
}
