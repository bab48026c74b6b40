//! Filesystem-backed object store.
//!
//! Layout: `<root>/<bucket>/<key>`. Uploads are atomic (temp file in the
//! destination directory, then rename), so a concurrent `key_exists` never
//! observes a partially written object.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{ClientError, ClientResult};
use crate::traits::ObjectStore;

pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    /// Create a store rooted at `root`. Creates the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> ClientResult<Self> {
        fs::create_dir_all(root.as_ref())?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
        })
    }

    fn object_path(&self, bucket: &str, key: &str) -> PathBuf {
        self.root.join(bucket).join(key.trim_start_matches('/'))
    }
}

fn copy_atomic(from: &Path, to: &Path) -> io::Result<()> {
    let dir = to
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "destination has no parent"))?;
    fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    let mut src = fs::File::open(from)?;
    io::copy(&mut src, tmp.as_file_mut())?;
    tmp.persist(to).map_err(|e| e.error)?;
    Ok(())
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn key_exists(&self, bucket: &str, key: &str) -> ClientResult<bool> {
        Ok(self.object_path(bucket, key).is_file())
    }

    async fn download_file(&self, path: &Path, bucket: &str, key: &str) -> ClientResult<()> {
        let object = self.object_path(bucket, key);
        if !object.is_file() {
            return Err(ClientError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            });
        }
        debug!(bucket = %bucket, key = %key, path = %path.display(), "downloading object");
        let dest = path.to_path_buf();
        tokio::task::spawn_blocking(move || copy_atomic(&object, &dest))
            .await
            .map_err(|e| ClientError::Io(io::Error::new(io::ErrorKind::Other, e)))??;
        Ok(())
    }

    async fn upload_file(&self, path: &Path, bucket: &str, key: &str) -> ClientResult<()> {
        let object = self.object_path(bucket, key);
        debug!(bucket = %bucket, key = %key, path = %path.display(), "uploading object");
        let src = path.to_path_buf();
        tokio::task::spawn_blocking(move || copy_atomic(&src, &object))
            .await
            .map_err(|e| ClientError::Io(io::Error::new(io::ErrorKind::Other, e)))??;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_store() -> (tempfile::TempDir, FsObjectStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path().join("buckets")).unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn upload_then_download_roundtrip() {
        let (dir, store) = make_store();
        let src = dir.path().join("artifact.tar.gz");
        fs::write(&src, b"archive bytes").unwrap();

        store
            .upload_file(&src, "release", "releases/bundles/1/artifact.tar.gz")
            .await
            .unwrap();
        assert!(store
            .key_exists("release", "releases/bundles/1/artifact.tar.gz")
            .await
            .unwrap());

        let dest = dir.path().join("staging/nested/artifact.tar.gz");
        store
            .download_file(&dest, "release", "releases/bundles/1/artifact.tar.gz")
            .await
            .unwrap();
        assert_eq!(fs::read(dest).unwrap(), b"archive bytes");
    }

    #[tokio::test]
    async fn missing_key_reports_not_found() {
        let (dir, store) = make_store();
        assert!(!store.key_exists("source", "nope").await.unwrap());
        let err = store
            .download_file(&dir.path().join("x"), "source", "nope")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn buckets_are_isolated() {
        let (dir, store) = make_store();
        let src = dir.path().join("f");
        fs::write(&src, b"1").unwrap();
        store.upload_file(&src, "a", "k").await.unwrap();
        assert!(!store.key_exists("b", "k").await.unwrap());
    }
}
