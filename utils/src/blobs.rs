use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::RwLock;

use sha1::{Digest, Sha1};
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;

use crate::errors::{FilesetError, FilesetResult};

/// Hex-encoded SHA-1 of a byte slice; the identity of every blob.
pub fn sha1_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Content-addressed blob storage, keyed by SHA-1 hex digest.
///
/// Each unique body is stored once under its external key. Writes verify
/// the declared digest against the actual bytes before anything durable
/// happens, so a lying client cannot poison the store. Existence checks go
/// through a positive-only in-process cache; misses always hit the store
/// so a blob uploaded by another process is seen immediately.
#[derive(Debug)]
pub struct BlobStore {
    location: PathBuf,
    bucket: String,
    exists_cache: RwLock<HashSet<String>>,
}

impl BlobStore {
    /// Create a blob store rooted at a writeable directory.
    pub fn new(location: PathBuf, bucket: impl Into<String>) -> FilesetResult<Self> {
        if !location.exists() {
            fs::create_dir_all(&location)?;
        }
        if !location.is_dir() {
            return Err(FilesetError::IoError(ErrorKind::PermissionDenied.into()));
        }
        let md = fs::metadata(&location)?;
        if md.permissions().readonly() {
            return Err(FilesetError::IoError(ErrorKind::PermissionDenied.into()));
        }

        Ok(BlobStore {
            location,
            bucket: bucket.into(),
            exists_cache: RwLock::new(HashSet::new()),
        })
    }

    /// The stable storage key for a blob: `/<bucket>/blobs/<sha>`. The
    /// serving path hands this key straight to the streaming facility.
    pub fn external_key(&self, sha: &str) -> String {
        format!("/{}/blobs/{}", self.bucket, sha)
    }

    /// True iff a blob with this digest is durably stored.
    pub async fn exists(&self, sha: &str) -> FilesetResult<bool> {
        if let Ok(cache) = self.exists_cache.read() {
            if cache.contains(sha) {
                return Ok(true);
            }
        }
        let key = self.external_key(sha);
        let found = cacache::metadata(&self.location, &key).await?.is_some();
        if found {
            self.cache_positive(sha);
        }
        Ok(found)
    }

    /// Store `bytes` under `sha`, verifying the digest first. Rejected
    /// writes leave no trace.
    pub async fn write(
        &self,
        sha: &str,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> FilesetResult<()> {
        let actual = sha1_hex(bytes);
        if actual != sha {
            return Err(FilesetError::HashMismatch {
                expected: sha.to_string(),
                actual,
            });
        }

        let key = self.external_key(sha);
        let metadata = serde_json::json!({ "content_type": content_type });
        let mut writer = cacache::WriteOpts::new()
            .metadata(metadata)
            .open(&self.location, &key)
            .await?;
        writer.write_all(bytes).await?;
        writer.commit().await?;

        self.cache_positive(sha);
        Ok(())
    }

    /// Read a blob's bytes, or fail with BlobNotFound.
    pub async fn read(&self, sha: &str) -> FilesetResult<Vec<u8>> {
        let key = self.external_key(sha);
        match cacache::read(&self.location, &key).await {
            Ok(bytes) => Ok(bytes),
            Err(cacache::Error::EntryNotFound(_, _)) => {
                Err(FilesetError::BlobNotFound(sha.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// The content type recorded when the blob was written, if any.
    pub async fn content_type(&self, sha: &str) -> FilesetResult<Option<String>> {
        let key = self.external_key(sha);
        let Some(entry) = cacache::metadata(&self.location, &key).await? else {
            return Ok(None);
        };
        Ok(entry
            .metadata
            .get("content_type")
            .and_then(|value| value.as_str())
            .map(str::to_string))
    }

    /// Open a blob as a byte stream for the response body.
    pub async fn stream(&self, sha: &str) -> FilesetResult<ReaderStream<cacache::Reader>> {
        let key = self.external_key(sha);
        match cacache::Reader::open(&self.location, &key).await {
            Ok(reader) => Ok(ReaderStream::new(reader)),
            Err(cacache::Error::EntryNotFound(_, _)) => {
                Err(FilesetError::BlobNotFound(sha.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn cache_positive(&self, sha: &str) {
        if let Ok(mut cache) = self.exists_cache.write() {
            cache.insert(sha.to_string());
        }
    }
}
