//! Object storage boundary.
//!
//! The pipeline downloads raw file bytes through [`ObjectStore`]; uploads
//! happen at the edge before a processing job is enqueued. [`LocalStorage`]
//! keeps objects under a configured root directory; tests use the in-memory
//! implementation from [`crate::testing`].

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;

use crate::error::{Error, Result};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the bytes behind a storage locator. Missing objects are
    /// `NotFound`; I/O failures are transient.
    async fn download(&self, locator: &str) -> Result<Vec<u8>>;

    /// Store bytes under a locator, overwriting any previous object.
    async fn upload(&self, locator: &str, bytes: &[u8]) -> Result<()>;

    /// Remove an object. Removing a missing object succeeds.
    async fn delete(&self, locator: &str) -> Result<()>;
}

/// Filesystem-backed object store rooted at a configured directory.
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve a locator to a path under the root. Locators are relative
    /// and must not traverse upward.
    fn resolve(&self, locator: &str) -> Result<PathBuf> {
        let rel = Path::new(locator);
        if rel.is_absolute()
            || rel
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
        {
            return Err(Error::Validation(format!("invalid storage locator: {locator}")));
        }
        Ok(self.root.join(rel))
    }
}

#[async_trait]
impl ObjectStore for LocalStorage {
    async fn download(&self, locator: &str) -> Result<Vec<u8>> {
        let path = self.resolve(locator)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::NotFound(format!("object not found: {locator}")))
            }
            Err(e) => Err(Error::TransientProvider(format!(
                "storage read failed for {locator}: {e}"
            ))),
        }
    }

    async fn upload(&self, locator: &str, bytes: &[u8]) -> Result<()> {
        let path = self.resolve(locator)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::TransientProvider(format!("storage mkdir failed for {locator}: {e}"))
            })?;
        }
        tokio::fs::write(&path, bytes).await.map_err(|e| {
            Error::TransientProvider(format!("storage write failed for {locator}: {e}"))
        })
    }

    async fn delete(&self, locator: &str) -> Result<()> {
        let path = self.resolve(locator)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::TransientProvider(format!(
                "storage delete failed for {locator}: {e}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_download_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        storage.upload("u1/report.pdf", b"content").await.unwrap();
        let bytes = storage.download("u1/report.pdf").await.unwrap();
        assert_eq!(bytes, b"content");
    }

    #[tokio::test]
    async fn missing_object_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        let err = storage.download("nope.bin").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        storage.upload("a.txt", b"x").await.unwrap();
        storage.delete("a.txt").await.unwrap();
        storage.delete("a.txt").await.unwrap();
    }

    #[tokio::test]
    async fn traversal_locators_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path());

        assert!(storage.download("../etc/passwd").await.is_err());
        assert!(storage.upload("/abs/path", b"x").await.is_err());
    }
}
