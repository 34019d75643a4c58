use crate::{Result, Storage, ensure_valid_key};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const FILE_EXTENSION: &str = "json";

/// [`Storage`] keeping every entry in its own file `<dir>/<key>.json`.
#[derive(Debug, Clone)]
pub struct FileStorage {
    dir: PathBuf,
}

impl FileStorage {
    /// Constructs a new instance of [`FileStorage`], creating `dir` if needed.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    fn file_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{FILE_EXTENSION}"))
    }
}

#[async_trait::async_trait]
impl Storage for FileStorage {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        ensure_valid_key(key)?;
        // Write to a sibling file first so that a crash never leaves a truncated entry behind.
        let tmp = self.dir.join(format!("{key}.tmp"));
        tokio::fs::write(&tmp, value).await?;
        tokio::fs::rename(&tmp, self.file_path(key)).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        ensure_valid_key(key)?;
        match tokio::fs::read(self.file_path(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn list(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;

        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(FILE_EXTENSION) {
                continue;
            }
            let Some(key) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let data = tokio::fs::read(&path).await?;
            entries.push((key.to_string(), data));
        }

        entries.sort_by(|a, b| a.0.cmp(&b.0));

        Ok(entries)
    }

    async fn remove(&self, key: &str) -> Result<bool> {
        ensure_valid_key(key)?;
        match tokio::fs::remove_file(self.file_path(key)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_storage_persists_across_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("swaps");

        let storage = FileStorage::open(&dir).await.unwrap();
        storage.put("b", b"2".to_vec()).await.unwrap();
        storage.put("a", b"1".to_vec()).await.unwrap();
        storage.put("a", b"3".to_vec()).await.unwrap();

        // Stray files are ignored by `list`.
        tokio::fs::write(dir.join("notes.txt"), b"x").await.unwrap();

        let reopened = FileStorage::open(&dir).await.unwrap();
        assert_eq!(reopened.get("a").await.unwrap(), Some(b"3".to_vec()));
        assert_eq!(
            reopened.list().await.unwrap(),
            vec![
                ("a".to_string(), b"3".to_vec()),
                ("b".to_string(), b"2".to_vec())
            ]
        );

        assert!(reopened.remove("a").await.unwrap());
        assert!(!reopened.remove("a").await.unwrap());
        assert_eq!(reopened.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn file_storage_rejects_path_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(tmp.path()).await.unwrap();
        assert!(storage.put("../x", Vec::new()).await.is_err());
    }
}
