//! Filesystem chunk store used by the PmidNode persona.
//!
//! Chunks live as flat files under `{root}/chunks/`, named by the data
//! name's storage key (base32 + kind tag, so always filesystem-safe).

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::error::{Result, VaultError};
use crate::name::DataName;

#[derive(Clone)]
pub struct ChunkStore {
    dir: PathBuf,
}

impl ChunkStore {
    pub async fn open(root: &Path) -> Result<Self> {
        let dir = root.join("chunks");
        fs::create_dir_all(&dir).await?;
        Ok(ChunkStore { dir })
    }

    fn chunk_path(&self, name: &DataName) -> PathBuf {
        self.dir.join(name.encode())
    }

    pub async fn put(&self, name: &DataName, content: &[u8]) -> Result<()> {
        fs::write(self.chunk_path(name), content).await?;
        Ok(())
    }

    pub async fn get(&self, name: &DataName) -> Result<Vec<u8>> {
        match fs::read(self.chunk_path(name)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(VaultError::NotFound),
            Err(e) => Err(VaultError::StorageFault(e.to_string())),
        }
    }

    /// Idempotent.
    pub async fn delete(&self, name: &DataName) -> Result<()> {
        match fs::remove_file(self.chunk_path(name)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VaultError::StorageFault(e.to_string())),
        }
    }

    pub async fn has(&self, name: &DataName) -> bool {
        fs::try_exists(self.chunk_path(name)).await.unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::name::{DataKind, Identity, IDENTITY_SIZE};

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir().join(format!("vault_chunks_{}", rand::random::<u64>()))
    }

    fn name(fill: u8) -> DataName {
        DataName::new(DataKind::ImmutableData, Identity([fill; IDENTITY_SIZE]))
    }

    #[tokio::test]
    async fn put_get_delete_roundtrip() {
        let store = ChunkStore::open(&scratch_dir()).await.unwrap();
        let chunk = name(1);
        store.put(&chunk, b"chunk bytes").await.unwrap();
        assert!(store.has(&chunk).await);
        assert_eq!(store.get(&chunk).await.unwrap(), b"chunk bytes");

        store.delete(&chunk).await.unwrap();
        assert!(!store.has(&chunk).await);
        assert_eq!(store.get(&chunk).await.unwrap_err(), VaultError::NotFound);
    }

    #[tokio::test]
    async fn delete_missing_chunk_is_ok() {
        let store = ChunkStore::open(&scratch_dir()).await.unwrap();
        store.delete(&name(2)).await.unwrap();
    }

    #[tokio::test]
    async fn overwrite_replaces_content() {
        let store = ChunkStore::open(&scratch_dir()).await.unwrap();
        let chunk = name(3);
        store.put(&chunk, b"first").await.unwrap();
        store.put(&chunk, b"second").await.unwrap();
        assert_eq!(store.get(&chunk).await.unwrap(), b"second");
    }
}
