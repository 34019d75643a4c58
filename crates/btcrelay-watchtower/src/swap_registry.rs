use crate::Result;
use btcrelay_primitives::TxoHash;
use btcrelay_storage::{Storage, TypedStore};
use btcrelay_synchronizer::PaymentHash;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const SWAP_KEY_PREFIX: &str = "swap-";

/// Chain swap the watchtower is waiting to claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedSwap {
    pub txo_hash: TxoHash,
    #[serde(with = "hex::serde")]
    pub payment_hash: PaymentHash,
    /// Confirmations the payment needs before the swap can be claimed.
    pub confirmations: u32,
}

impl SavedSwap {
    /// Returns the Bitcoin height at which an output included at `height` becomes claimable.
    pub fn matured_at(&self, height: u32) -> u32 {
        height.saturating_add(self.confirmations).saturating_sub(1)
    }

    /// Returns `true` if an output included at `height` is claimable with the chain at `tip`.
    pub fn is_mature(&self, height: u32, tip: u32) -> bool {
        tip >= self.matured_at(height)
    }
}

/// Persisted set of [`SavedSwap`]s, indexed by output hash and payment hash.
pub struct SwapRegistry {
    store: TypedStore<SavedSwap>,
    swaps: HashMap<TxoHash, SavedSwap>,
    by_payment_hash: HashMap<PaymentHash, TxoHash>,
}

impl SwapRegistry {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            store: TypedStore::with_prefix(storage, SWAP_KEY_PREFIX),
            swaps: HashMap::new(),
            by_payment_hash: HashMap::new(),
        }
    }

    /// Loads the persisted swaps, replacing the in-memory state.
    pub async fn load(&mut self) -> Result<usize> {
        self.swaps.clear();
        self.by_payment_hash.clear();

        for (key, swap) in self.store.load_all().await? {
            if key != swap.txo_hash.to_string() {
                tracing::warn!(%key, txo_hash = %swap.txo_hash, "Ignoring swap stored under a foreign key");
                continue;
            }
            self.by_payment_hash.insert(swap.payment_hash, swap.txo_hash);
            self.swaps.insert(swap.txo_hash, swap);
        }

        tracing::debug!(swaps = self.swaps.len(), "Loaded saved swaps");

        Ok(self.swaps.len())
    }

    pub async fn save(&mut self, swap: SavedSwap) -> Result<()> {
        self.store.put(&swap.txo_hash.to_string(), &swap).await?;
        self.by_payment_hash.insert(swap.payment_hash, swap.txo_hash);
        self.swaps.insert(swap.txo_hash, swap);
        Ok(())
    }

    pub async fn remove(&mut self, txo_hash: &TxoHash) -> Result<Option<SavedSwap>> {
        let Some(swap) = self.swaps.remove(txo_hash) else {
            return Ok(None);
        };
        self.by_payment_hash.remove(&swap.payment_hash);
        self.store.remove(&txo_hash.to_string()).await?;
        Ok(Some(swap))
    }

    pub async fn remove_by_payment_hash(
        &mut self,
        payment_hash: &PaymentHash,
    ) -> Result<Option<SavedSwap>> {
        match self.by_payment_hash.get(payment_hash).copied() {
            Some(txo_hash) => self.remove(&txo_hash).await,
            None => Ok(None),
        }
    }

    pub fn get(&self, txo_hash: &TxoHash) -> Option<&SavedSwap> {
        self.swaps.get(txo_hash)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SavedSwap> {
        self.swaps.values()
    }

    pub fn txo_hashes(&self) -> HashSet<TxoHash> {
        self.swaps.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.swaps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.swaps.is_empty()
    }
}
