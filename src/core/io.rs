use crate::core::error::{ConvertError, Result};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

/// Bounded retry for writes hitting a transient permission error, e.g. a
/// file briefly locked by an antivirus scan or a sync client.
const PERMISSION_RETRIES: u32 = 3;
const PERMISSION_RETRY_DELAY: Duration = Duration::from_millis(250);

#[async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;
    async fn write(&self, path: &Path, content: &[u8]) -> Result<()>;
    async fn delete(&self, path: &Path) -> Result<()>;
    async fn exists(&self, path: &Path) -> Result<bool>;
    async fn list(&self, dir: &Path) -> Result<Vec<std::path::PathBuf>>;

    async fn read_to_string(&self, path: &Path) -> Result<String> {
        let bytes = self.read(path).await?;
        String::from_utf8(bytes)
            .map_err(|e| ConvertError::Other(anyhow::anyhow!("{:?}: invalid utf-8: {}", path, e)))
    }
}

pub struct NativeStorage;

impl NativeStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NativeStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for NativeStorage {
    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(path).await?)
    }

    async fn write(&self, path: &Path, content: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut attempt = 0;
        loop {
            match tokio::fs::write(path, content).await {
                Ok(()) => return Ok(()),
                Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                    attempt += 1;
                    if attempt > PERMISSION_RETRIES {
                        return Err(ConvertError::FileSystemPermission(format!(
                            "{}: {}",
                            path.display(),
                            e
                        )));
                    }
                    log::warn!(
                        "permission denied writing {:?}, retry {}/{}",
                        path,
                        attempt,
                        PERMISSION_RETRIES
                    );
                    tokio::time::sleep(PERMISSION_RETRY_DELAY).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        if tokio::fs::try_exists(path).await? {
            if path.is_dir() {
                tokio::fs::remove_dir_all(path).await?;
            } else {
                tokio::fs::remove_file(path).await?;
            }
        }
        Ok(())
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(tokio::fs::try_exists(path).await?)
    }

    async fn list(&self, dir: &Path) -> Result<Vec<std::path::PathBuf>> {
        let mut entries = Vec::new();
        if tokio::fs::try_exists(dir).await? {
            let mut rd = tokio::fs::read_dir(dir).await?;
            while let Some(entry) = rd.next_entry().await? {
                entries.push(entry.path());
            }
        }
        entries.sort();
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_creates_parent_directories() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = NativeStorage::new();
        let path = dir.path().join("a/b/c.txt");
        storage.write(&path, b"hello").await?;
        assert_eq!(storage.read(&path).await?, b"hello");
        Ok(())
    }

    #[tokio::test]
    async fn delete_is_idempotent() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = NativeStorage::new();
        let path = dir.path().join("gone.txt");
        storage.delete(&path).await?;
        storage.write(&path, b"x").await?;
        storage.delete(&path).await?;
        assert!(!storage.exists(&path).await?);
        Ok(())
    }

    #[tokio::test]
    async fn list_returns_sorted_entries() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let storage = NativeStorage::new();
        storage.write(&dir.path().join("b.bin"), b"1").await?;
        storage.write(&dir.path().join("a.bin"), b"2").await?;
        let entries = storage.list(dir.path()).await?;
        assert_eq!(entries.len(), 2);
        assert!(entries[0].ends_with("a.bin"));
        Ok(())
    }
}
