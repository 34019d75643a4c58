use btcrelay_bitcoind::BitcoinRpc;
use btcrelay_primitives::{MAIN_CHAIN, StoredHeader};
use btcrelay_synchronizer::{CheckpointRecovery, Error, EventLog, RelayView};
use btcrelay_test_service::{MockRelayTx, TestEnv};
use std::sync::Arc;

fn assert_matches_relay(env: &TestEnv, stored: &StoredHeader) {
    assert_eq!(
        env.relay.stored_header(stored.blockheight).as_ref(),
        Some(stored),
        "Locally computed commitment at {} differs from the relay",
        stored.blockheight
    );
}

#[tokio::test]
async fn sync_main_chain_in_batches() {
    let env = TestEnv::new();
    env.bitcoind.mine_to_height(30);
    env.relay.initialize_at(&env.bitcoind, 10);

    let result = env.sync_relay().await;

    let sizes = result
        .submissions
        .iter()
        .map(|submission| submission.computed_headers.len())
        .collect::<Vec<_>>();
    assert_eq!(sizes, vec![7, 7, 6]);
    assert!(
        result
            .submissions
            .iter()
            .all(|submission| submission.fork_id == MAIN_CHAIN
                && matches!(submission.tx, MockRelayTx::MainHeaders { .. }))
    );

    assert_eq!(result.synced_blocks(), 20);
    assert_eq!(result.relay_tip_block_hash, env.bitcoind.block_hash(10));
    assert_eq!(result.latest_block_header.height, 30);
    assert_eq!(
        result.computed_headers.keys().copied().collect::<Vec<_>>(),
        (10..=30).collect::<Vec<_>>()
    );
    assert_eq!(result.target_stored_header.blockheight, 30);
    assert_eq!(
        result.target_stored_header.block_hash(),
        env.bitcoind.block_hash(30)
    );

    assert_eq!(env.relay.tip_height(), Some(30));
    for stored in result.computed_headers.values() {
        assert_matches_relay(&env, stored);
    }

    // Nothing left to submit.
    let result = env.sync_relay().await;
    assert!(result.submissions.is_empty());
    assert_eq!(result.synced_blocks(), 0);
    assert_eq!(result.target_stored_header.blockheight, 30);
}

#[tokio::test]
async fn fork_overtaking_the_relay_chain_is_reported_as_main_chain() {
    let env = TestEnv::new();
    env.bitcoind.mine_to_height(30);
    env.relay.initialize_at(&env.bitcoind, 20);
    env.sync_relay().await;

    env.bitcoind.reorg_at(27);
    env.bitcoind.mine_blocks(6);
    assert_eq!(env.bitcoind.tip_height(), 32);

    let result = env.synchronizer().sync_to_latest_txs().await.unwrap();

    assert_eq!(result.submissions.len(), 1);
    let submission = &result.submissions[0];
    assert_eq!(submission.fork_id, MAIN_CHAIN);
    assert!(matches!(
        submission.tx,
        MockRelayTx::ForkHeaders {
            fork_id: 1,
            is_new_fork: true,
            ..
        }
    ));
    assert_eq!(
        submission
            .computed_headers
            .iter()
            .map(|stored| stored.blockheight)
            .collect::<Vec<_>>(),
        (27..=32).collect::<Vec<_>>()
    );
    // Fork starts from the newest relay block still on the Bitcoin main chain.
    assert_eq!(result.relay_tip_block_hash, env.bitcoind.block_hash(26));

    env.relay.apply(&submission.tx).unwrap();
    assert_eq!(env.relay.tip_height(), Some(32));
    assert_matches_relay(&env, &result.target_stored_header);

    // Following passes extend the canonical chain again.
    env.bitcoind.mine_blocks(2);
    let result = env.sync_relay().await;
    assert_eq!(result.submissions.len(), 1);
    assert!(matches!(
        result.submissions[0].tx,
        MockRelayTx::MainHeaders { .. }
    ));
    assert_eq!(env.relay.tip_height(), Some(34));
}

#[tokio::test]
async fn fork_switches_to_main_submissions_once_it_overtakes() {
    let env = TestEnv::new();
    env.bitcoind.mine_to_height(30);
    env.relay.initialize_at(&env.bitcoind, 20);
    env.sync_relay().await;

    env.bitcoind.reorg_at(27);
    env.bitcoind.mine_blocks(8);

    let result = env.sync_relay().await;

    assert_eq!(result.submissions.len(), 2);
    assert!(matches!(
        result.submissions[0].tx,
        MockRelayTx::ForkHeaders {
            is_new_fork: true,
            ..
        }
    ));
    assert!(matches!(
        result.submissions[1].tx,
        MockRelayTx::MainHeaders { .. }
    ));
    assert!(result.submissions.iter().all(|s| s.fork_id == MAIN_CHAIN));
    assert_eq!(env.relay.tip_height(), Some(34));
    assert_matches_relay(&env, &result.target_stored_header);
}

#[tokio::test]
async fn lighter_fork_keeps_its_fork_id() {
    let env = TestEnv::new();
    env.bitcoind.mine_to_height(30);
    env.relay.initialize_at(&env.bitcoind, 20);
    env.sync_relay().await;

    env.bitcoind.reorg_at(29);
    env.bitcoind.mine_blocks(1);

    let result = env.sync_relay().await;
    assert_eq!(result.submissions.len(), 1);
    assert_eq!(result.submissions[0].fork_id, 1);
    // The relay keeps its heavier chain.
    assert_eq!(env.relay.tip_height(), Some(30));
    assert_ne!(
        env.relay.stored_header(29).unwrap().block_hash(),
        env.bitcoind.block_hash(29)
    );

    // Once Bitcoin's chain outgrows the relay chain the next fork takes over.
    env.bitcoind.mine_blocks(2);
    let result = env.sync_relay().await;
    assert_eq!(result.submissions.len(), 1);
    assert_eq!(result.submissions[0].fork_id, MAIN_CHAIN);
    assert!(matches!(
        result.submissions[0].tx,
        MockRelayTx::ForkHeaders {
            fork_id: 2,
            is_new_fork: true,
            ..
        }
    ));
    assert_eq!(env.relay.tip_height(), Some(31));
    assert_eq!(
        env.relay.stored_header(31).unwrap().block_hash(),
        env.bitcoind.block_hash(31)
    );
}

fn recovery_with_page_size(env: &TestEnv, page_size: usize) -> CheckpointRecovery {
    CheckpointRecovery::new(
        env.relay.clone() as Arc<dyn RelayView>,
        env.events.clone() as Arc<dyn EventLog>,
        env.bitcoind.clone() as Arc<dyn BitcoinRpc>,
        page_size,
    )
}

#[tokio::test]
async fn checkpoint_recovery_pages_through_the_log() {
    let env = TestEnv::new();
    env.bitcoind.mine_to_height(40);
    env.relay.initialize_at(&env.bitcoind, 10);
    env.sync_relay().await;

    let recovery = recovery_with_page_size(&env, 2);
    let expected = env.relay.stored_header(12).unwrap();

    let found = recovery
        .retrieve_log(&expected.commit_hash(), &expected.block_hash())
        .await
        .unwrap();
    assert_eq!(found, expected);

    let (latest, info) = recovery.retrieve_latest_known_block_log().await.unwrap();
    assert_eq!(latest.blockheight, 40);
    assert_eq!(info.height, 40);

    let err = recovery
        .retrieve_log(&[0xee; 32], &expected.block_hash())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::LogExhausted(_)));
}

#[tokio::test]
async fn latest_known_block_skips_unavailable_headers() {
    let env = TestEnv::new();
    env.bitcoind.mine_to_height(40);
    env.relay.initialize_at(&env.bitcoind, 10);
    env.sync_relay().await;

    env.bitcoind.make_header_unavailable(env.bitcoind.block_hash(40));

    let (latest, info) = env.recovery().retrieve_latest_known_block_log().await.unwrap();
    assert_eq!(latest.blockheight, 39);
    assert_eq!(info.height, 39);
    assert_eq!(latest, env.relay.stored_header(39).unwrap());
}

#[tokio::test]
async fn block_log_requires_relay_height() {
    let env = TestEnv::new();
    env.bitcoind.mine_to_height(20);
    env.relay.initialize_at(&env.bitcoind, 10);
    env.sync_relay().await;

    let recovery = env.recovery();
    let block_hash = env.bitcoind.block_hash(15);

    let stored = recovery
        .retrieve_block_log(&block_hash, 20)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.blockheight, 15);
    assert_eq!(stored.block_hash(), block_hash);

    assert!(
        recovery
            .retrieve_block_log(&block_hash, 21)
            .await
            .unwrap()
            .is_none()
    );

    let (stored, relay_height) = recovery
        .retrieve_block_log_and_height(&env.bitcoind.block_hash(18))
        .await
        .unwrap();
    assert_eq!(stored.map(|s| s.blockheight), Some(18));
    assert_eq!(relay_height, 20);

    // Blocks the relay never stored are not found.
    env.bitcoind.mine_blocks(1);
    let (stored, _) = recovery
        .retrieve_block_log_and_height(&env.bitcoind.block_hash(21))
        .await
        .unwrap();
    assert!(stored.is_none());
}
