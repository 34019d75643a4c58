//! Key-value persistence for relay and watchtower state.
//!
//! Values are stored as JSON documents under short string keys. [`FileStorage`] keeps one file per
//! key in a directory, [`InMemoryStorage`] is used by tests and ephemeral deployments.

mod file;
mod memory;

pub use self::file::FileStorage;
pub use self::memory::InMemoryStorage;

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;

/// Storage error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid storage key: {0:?}")]
    InvalidKey(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

/// Storage result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Raw key-value storage.
#[async_trait::async_trait]
pub trait Storage: Send + Sync {
    /// Inserts or overwrites the value at `key`.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Returns every stored entry.
    async fn list(&self) -> Result<Vec<(String, Vec<u8>)>>;

    /// Removes the value at `key`, returns whether it existed.
    async fn remove(&self, key: &str) -> Result<bool>;
}

/// Keys end up as file names, only a conservative character set is accepted.
pub(crate) fn ensure_valid_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidKey(key.to_string()))
    }
}

/// Typed view over a [`Storage`] serializing values as JSON.
///
/// Several stores can share one [`Storage`] by using distinct key prefixes, [`TypedStore::load_all`]
/// only returns the entries under the store's own prefix.
pub struct TypedStore<T> {
    storage: Arc<dyn Storage>,
    prefix: String,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Clone for TypedStore<T> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            prefix: self.prefix.clone(),
            _phantom: PhantomData,
        }
    }
}

impl<T> TypedStore<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Constructs a new instance of [`TypedStore`].
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self::with_prefix(storage, "")
    }

    /// Constructs a store whose keys are all prefixed with `prefix`.
    pub fn with_prefix(storage: Arc<dyn Storage>, prefix: impl Into<String>) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
            _phantom: PhantomData,
        }
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    pub async fn put(&self, key: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_vec(value)?;
        self.storage.put(&self.full_key(key), encoded).await
    }

    pub async fn get(&self, key: &str) -> Result<Option<T>> {
        self.storage
            .get(&self.full_key(key))
            .await?
            .map(|data| serde_json::from_slice(&data).map_err(Into::into))
            .transpose()
    }

    /// Decodes every entry under the store's prefix, keys are returned without the prefix.
    ///
    /// Entries that fail to decode are skipped with a warning so that a single corrupt document does
    /// not prevent the rest of the state from loading.
    pub async fn load_all(&self) -> Result<Vec<(String, T)>> {
        let entries = self.storage.list().await?;
        Ok(entries
            .into_iter()
            .filter_map(|(key, data)| {
                let key = key.strip_prefix(self.prefix.as_str())?.to_string();
                Some((key, data))
            })
            .filter_map(|(key, data)| match serde_json::from_slice(&data) {
                Ok(value) => Some((key, value)),
                Err(err) => {
                    tracing::warn!(%key, ?err, "Skipping undecodable storage entry");
                    None
                }
            })
            .collect())
    }

    pub async fn remove(&self, key: &str) -> Result<bool> {
        self.storage.remove(&self.full_key(key)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn typed_store_roundtrip() {
        let store = TypedStore::<Item>::new(Arc::new(InMemoryStorage::default()));
        let item = Item {
            name: "a".to_string(),
            count: 3,
        };

        assert!(store.get("a").await.unwrap().is_none());
        store.put("a", &item).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(item.clone()));
        assert_eq!(store.load_all().await.unwrap(), vec![("a".to_string(), item)]);
        assert!(store.remove("a").await.unwrap());
        assert!(!store.remove("a").await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_entries_are_skipped() {
        let storage = Arc::new(InMemoryStorage::default());
        storage.put("bad", b"not json".to_vec()).await.unwrap();
        let store = TypedStore::<Item>::new(storage);
        store
            .put(
                "good",
                &Item {
                    name: "b".to_string(),
                    count: 1,
                },
            )
            .await
            .unwrap();

        let all = store.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "good");
        assert!(store.get("bad").await.is_err());
    }

    #[tokio::test]
    async fn prefixed_stores_share_storage() {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::default());
        let items = TypedStore::<Item>::with_prefix(storage.clone(), "item-");
        let counter = TypedStore::<u32>::new(storage.clone());

        items
            .put(
                "x",
                &Item {
                    name: "x".to_string(),
                    count: 2,
                },
            )
            .await
            .unwrap();
        counter.put("height", &7).await.unwrap();

        assert!(storage.get("item-x").await.unwrap().is_some());
        let all = items.load_all().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].0, "x");
        assert_eq!(counter.get("height").await.unwrap(), Some(7));
        assert!(items.remove("x").await.unwrap());
        assert!(items.load_all().await.unwrap().is_empty());
    }

    #[test]
    fn key_validation() {
        assert!(ensure_valid_key("FORK").is_ok());
        assert!(ensure_valid_key("00ff_tip-height").is_ok());
        assert!(ensure_valid_key("").is_err());
        assert!(ensure_valid_key("../escape").is_err());
        assert!(ensure_valid_key("a.json").is_err());
    }
}
