use crate::claim::{ClaimParams, build_claim_operations};
use crate::{
    ClaimBundle, ClaimVariant, Error, HeaderSource, PrunedTxoMap, Result, SavedSwap, SwapContract,
    SwapRegistry, WatchtowerConfig,
};
use bitcoin::BlockHash;
use btcrelay_bitcoind::BitcoinRpc;
use btcrelay_primitives::{StoredHeader, TxoEntry, TxoHash, compute_merkle_proof};
use btcrelay_storage::{Storage, TypedStore};
use btcrelay_synchronizer::{ChainEvent, CheckpointRecovery, SwapInitialized, SwapKind};
use futures::StreamExt;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Matches Bitcoin outputs against saved chain swaps and builds claims for the mature ones.
pub struct Watchtower {
    config: WatchtowerConfig,
    bitcoind: Arc<dyn BitcoinRpc>,
    swap_contract: Arc<dyn SwapContract>,
    recovery: CheckpointRecovery,
    txo_map: PrunedTxoMap,
    registry: SwapRegistry,
    /// Swaps whose claim failed on chain, not retried until restart.
    reverted: HashSet<TxoHash>,
}

impl Watchtower {
    /// Constructs a new instance of [`Watchtower`].
    pub fn new(
        config: WatchtowerConfig,
        bitcoind: Arc<dyn BitcoinRpc>,
        swap_contract: Arc<dyn SwapContract>,
        recovery: CheckpointRecovery,
        storage: Arc<dyn Storage>,
    ) -> Self {
        let txo_map = PrunedTxoMap::new(
            bitcoind.clone(),
            TypedStore::new(storage.clone()),
            config.window,
        );
        Self {
            config,
            bitcoind,
            swap_contract,
            recovery,
            txo_map,
            registry: SwapRegistry::new(storage),
            reverted: HashSet::new(),
        }
    }

    /// Loads the saved swaps and fills the output window.
    pub async fn init(&mut self, relay_tip_height: u32) -> Result<()> {
        let swaps = self.registry.load().await?;
        let window_tip = self.txo_map.init(relay_tip_height).await?;

        tracing::info!(swaps, window_tip, relay_tip_height, "Watchtower initialized");

        Ok(())
    }

    /// Builds the claims of swaps that matured while the watchtower was offline and brings the
    /// window up to the relay tip.
    pub async fn initial_sync(&mut self, relay_tip_hash: &BlockHash) -> Result<Vec<ClaimBundle>> {
        self.sync_to_tip_hash(relay_tip_hash, &BTreeMap::new()).await
    }

    pub fn txo_map(&self) -> &PrunedTxoMap {
        &self.txo_map
    }

    pub fn registry(&self) -> &SwapRegistry {
        &self.registry
    }

    /// Advances the window to `tip_hash` and returns the claims of every mature swap.
    ///
    /// `computed_headers` are the commitments the synchronizer computed for its pending header
    /// submissions. Blocks not covered by them are looked up in the relay's event log.
    pub async fn sync_to_tip_hash(
        &mut self,
        tip_hash: &BlockHash,
        computed_headers: &BTreeMap<u32, StoredHeader>,
    ) -> Result<Vec<ClaimBundle>> {
        let watched = self.registry.txo_hashes();
        let observed = self.txo_map.sync_to_tip_hash(tip_hash, &watched).await?;

        let Some(tip) = self.txo_map.tip_height() else {
            return Ok(Vec::new());
        };

        let mut candidates = BTreeMap::<TxoHash, (TxoEntry, SavedSwap)>::new();

        for (txo_hash, entry) in observed {
            if let Some(swap) = self.registry.get(&txo_hash) {
                candidates.insert(txo_hash, (entry, swap.clone()));
            }
        }

        for swap in self.registry.iter() {
            if let Some(entry) = self.txo_map.get_txo(&swap.txo_hash) {
                candidates
                    .entry(swap.txo_hash)
                    .or_insert_with(|| (*entry, swap.clone()));
            }
        }

        candidates.retain(|txo_hash, (entry, swap)| {
            !self.reverted.contains(txo_hash) && swap.is_mature(entry.height, tip)
        });

        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        tracing::debug!(tip, swaps = candidates.len(), "Building claims for mature swaps");

        let this = &*self;
        let results = futures::stream::iter(candidates.into_values().map(
            |(entry, swap)| async move {
                let result = this.create_claim_txs(&entry, &swap, computed_headers).await;
                (swap, result)
            },
        ))
        .buffer_unordered(self.config.claim_concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

        let mut bundles = Vec::new();
        for (swap, result) in results {
            match result {
                Ok(Some(bundle)) => bundles.push(bundle),
                Ok(None) => {
                    tracing::warn!(
                        txo_hash = %swap.txo_hash,
                        "Swap no longer exists on chain, removing"
                    );
                    self.registry.remove(&swap.txo_hash).await?;
                }
                Err(err) => {
                    tracing::error!(txo_hash = %swap.txo_hash, ?err, "Failed to build claim");
                }
            }
        }

        bundles.sort_by_key(|bundle| (bundle.blockheight, bundle.swap.txo_hash));

        Ok(bundles)
    }

    /// Builds the claim of `swap` paid by the output `entry`.
    ///
    /// Returns `None` if the swap's escrow is gone from the swap contract.
    pub async fn create_claim_txs(
        &self,
        entry: &TxoEntry,
        swap: &SavedSwap,
        computed_headers: &BTreeMap<u32, StoredHeader>,
    ) -> Result<Option<ClaimBundle>> {
        let Some(escrow) = self
            .swap_contract
            .get_escrow(&swap.payment_hash)
            .await
            .map_err(Error::SwapContract)?
        else {
            return Ok(None);
        };

        let tx = self.bitcoind.get_raw_transaction(&entry.txid).await?;

        let output = tx
            .vout
            .iter()
            .find(|vout| vout.n == entry.vout)
            .ok_or(Error::MissingOutput {
                txid: entry.txid,
                vout: entry.vout,
            })?;

        let actual = output.txo_hash();
        if actual != swap.txo_hash {
            return Err(Error::TxoHashMismatch {
                expected: swap.txo_hash,
                actual,
            });
        }

        let confirmations = tx.confirmations.unwrap_or(0);
        if confirmations < escrow.confirmations {
            return Err(Error::NotEnoughConfirmations {
                have: confirmations,
                need: escrow.confirmations,
            });
        }

        let block_hash = tx
            .blockhash
            .ok_or(Error::TransactionNotInBlock(entry.txid))?;

        let matured_at = entry.height.saturating_add(escrow.confirmations).saturating_sub(1);

        let optimistic = computed_headers
            .get(&entry.height)
            .filter(|stored| stored.block_hash() == block_hash);

        let (stored_header, header_source) = match optimistic {
            Some(stored) => (stored.clone(), HeaderSource::Optimistic),
            None => {
                let stored = self
                    .recovery
                    .retrieve_block_log(&block_hash, matured_at)
                    .await?
                    .ok_or(Error::MissingStoredHeader(block_hash))?;
                (stored, HeaderSource::Recovered)
            }
        };

        let block = self.bitcoind.get_block(&block_hash).await?;
        let txids = block.txids();
        let proof = txids
            .iter()
            .position(|txid| *txid == entry.txid)
            .and_then(|index| compute_merkle_proof(&txids, index))
            .ok_or(Error::TransactionNotInBlock(entry.txid))?;

        let raw_tx =
            hex::decode(&tx.hex).map_err(|_| Error::InvalidTransactionHex(entry.txid))?;

        let has_scratch_data = self
            .swap_contract
            .has_scratch_data(&proof.reversed_txid)
            .await
            .map_err(Error::SwapContract)?;

        let variant = if escrow.pay_out {
            ClaimVariant::PayOut
        } else {
            ClaimVariant::InitializerBalance
        };

        let operations = build_claim_operations(ClaimParams {
            swap,
            vout: entry.vout,
            raw_tx: &raw_tx,
            proof,
            confirmations: escrow.confirmations,
            stored_header,
            variant,
            has_scratch_data,
            write_chunk_size: self.config.write_chunk_size,
        });

        tracing::debug!(
            txid = %entry.txid,
            height = entry.height,
            ?header_source,
            "Built swap claim"
        );

        Ok(Some(ClaimBundle {
            swap: swap.clone(),
            txid: entry.txid,
            vout: entry.vout,
            blockheight: entry.height,
            matured_at,
            header_source,
            operations,
        }))
    }

    /// Applies a swap contract event, returning a claim if a newly saved swap is already mature.
    pub async fn handle_event(&mut self, event: &ChainEvent) -> Result<Option<ClaimBundle>> {
        match event {
            ChainEvent::SwapInitialized(initialized) => self.on_swap_initialized(initialized).await,
            ChainEvent::SwapClaimed { payment_hash } | ChainEvent::SwapRefunded { payment_hash } => {
                if let Some(swap) = self.registry.remove_by_payment_hash(payment_hash).await? {
                    tracing::debug!(txo_hash = %swap.txo_hash, "Swap settled, removed");
                    self.reverted.remove(&swap.txo_hash);
                }
                Ok(None)
            }
            ChainEvent::HeaderStored(_) | ChainEvent::ForkStored(_) => Ok(None),
        }
    }

    async fn on_swap_initialized(
        &mut self,
        initialized: &SwapInitialized,
    ) -> Result<Option<ClaimBundle>> {
        if initialized.kind != SwapKind::Chain || initialized.txo_hash.is_zero() {
            return Ok(None);
        }

        let Some(escrow) = self
            .swap_contract
            .get_escrow(&initialized.payment_hash)
            .await
            .map_err(Error::SwapContract)?
        else {
            tracing::debug!(
                txo_hash = %initialized.txo_hash,
                "Swap already settled, not watching"
            );
            return Ok(None);
        };

        let swap = SavedSwap {
            txo_hash: initialized.txo_hash,
            payment_hash: initialized.payment_hash,
            confirmations: escrow.confirmations,
        };
        self.registry.save(swap.clone()).await?;

        tracing::info!(
            txo_hash = %swap.txo_hash,
            confirmations = swap.confirmations,
            "Watching new chain swap"
        );

        let (Some(entry), Some(tip)) = (
            self.txo_map.get_txo(&swap.txo_hash).copied(),
            self.txo_map.tip_height(),
        ) else {
            return Ok(None);
        };

        if !swap.is_mature(entry.height, tip) {
            return Ok(None);
        }

        match self.create_claim_txs(&entry, &swap, &BTreeMap::new()).await {
            Ok(Some(bundle)) => Ok(Some(bundle)),
            Ok(None) => {
                self.registry.remove(&swap.txo_hash).await?;
                Ok(None)
            }
            Err(err) => {
                tracing::error!(txo_hash = %swap.txo_hash, ?err, "Failed to build claim");
                Ok(None)
            }
        }
    }

    /// Stops retrying the claim of `txo_hash` after it failed on chain.
    pub fn mark_claim_reverted(&mut self, txo_hash: &TxoHash) {
        self.reverted.insert(*txo_hash);
    }

    /// Forgets the swap paid by `txo_hash` after a successful claim.
    pub async fn mark_claimed(&mut self, txo_hash: &TxoHash) -> Result<()> {
        self.reverted.remove(txo_hash);
        self.registry.remove(txo_hash).await?;
        Ok(())
    }
}
