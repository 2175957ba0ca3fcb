//! Content-addressable blob stores.
//!
//! Two interchangeable [`ContentStore`] backends:
//! - [`FilesystemContentStore`]: sharded directory tree, atomic writes,
//!   HMAC-signed URLs verified by an external file server
//! - [`ObjectContentStore`]: S3-compatible object storage with native
//!   presigned URLs
//!
//! ## Example
//!
//! ```rust,ignore
//! use strata_db::content_store::FilesystemContentStore;
//!
//! let store = FilesystemContentStore::new("/var/strata/blobs", "https://files.example.com", secret);
//! let blob = store.put(&data, "pdf").await?;
//! let url = store.signed_url(&blob.path, Duration::from_secs(3600)).await?;
//! ```

use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use http::Method;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path as ObjectPath;
use object_store::signer::Signer;
use object_store::{ObjectStore, PutPayload};
use sha2::Sha256;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use strata_core::{
    compute_content_hash, new_v7, storage_path_for, BlobMetadata, ContentStore, Error, Result,
    StoredBlob,
};

type HmacSha256 = Hmac<Sha256>;

/// Filesystem content store.
///
/// Path format: `{root}/{hash[0:2]}/{hash[2:4]}/{hash}.{ext}`
pub struct FilesystemContentStore {
    root: PathBuf,
    base_url: String,
    signing_secret: Vec<u8>,
}

impl FilesystemContentStore {
    /// Create a new filesystem store rooted at `root`.
    pub fn new(
        root: impl Into<PathBuf>,
        base_url: impl Into<String>,
        signing_secret: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            root: root.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            signing_secret: signing_secret.into(),
        }
    }

    /// Resolve a store-relative path, rejecting anything that could escape the root.
    fn full_path(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let safe = !path.is_empty()
            && !path.contains('\\')
            && relative
                .components()
                .all(|component| matches!(component, Component::Normal(_)));
        if !safe {
            return Err(Error::InvalidInput(format!("invalid storage path: {path}")));
        }
        Ok(self.root.join(relative))
    }

    /// Validate that the store can write, read, and delete files.
    ///
    /// Run at startup to surface permission or mount problems early.
    pub async fn validate(&self) -> Result<()> {
        let probe = self.root.join(format!(".health-check-{}", new_v7()));
        fs::create_dir_all(&self.root).await?;
        fs::write(&probe, b"storage-health-check").await?;
        let read_back = fs::read(&probe).await?;
        fs::remove_file(&probe).await?;
        if read_back != b"storage-health-check" {
            return Err(Error::Storage("read-back mismatch".to_string()));
        }
        Ok(())
    }

    fn sign(&self, path: &str, expires: i64) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(&self.signing_secret)
            .map_err(|e| Error::Config(format!("invalid signing secret: {e}")))?;
        mac.update(format!("{path}:{expires}").as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Check a signed URL's `expires` and `signature` parameters for `path`.
    ///
    /// Used by the file server that serves blobs; comparison is constant time.
    pub fn verify_signature(&self, path: &str, expires: i64, signature: &str) -> bool {
        if expires < Utc::now().timestamp() {
            return false;
        }
        let Ok(expected) = hex::decode(signature) else {
            return false;
        };
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.signing_secret) else {
            return false;
        };
        mac.update(format!("{path}:{expires}").as_bytes());
        mac.verify_slice(&expected).is_ok()
    }

    /// Write via temp file + rename so readers never observe partial blobs.
    async fn write_atomic(&self, full_path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                warn!(parent = %parent.display(), error = %e, "content_store: create_dir_all failed");
                e
            })?;
        }

        // Unique temp name: concurrent writers of the same content must not
        // share a temp file.
        let temp_path = full_path.with_extension(format!("{}.tmp", new_v7().simple()));
        let mut file = fs::File::create(&temp_path).await.map_err(|e| {
            warn!(temp_path = %temp_path.display(), error = %e, "content_store: File::create failed");
            e
        })?;
        file.write_all(data).await?;
        file.sync_all().await?;
        drop(file);

        if let Err(e) = fs::rename(&temp_path, full_path).await {
            warn!(to = %full_path.display(), error = %e, "content_store: rename failed");
            let _ = fs::remove_file(&temp_path).await;
            return Err(e.into());
        }

        // 0644, never executable
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(full_path, std::fs::Permissions::from_mode(0o644)).await?;
        }

        Ok(())
    }
}

fn not_found_or_io(path: &str, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound(format!("blob {path}"))
    } else {
        Error::Io(e)
    }
}

#[async_trait]
impl ContentStore for FilesystemContentStore {
    async fn put(&self, data: &[u8], ext: &str) -> Result<StoredBlob> {
        let hash = compute_content_hash(data);
        let path = storage_path_for(&hash, ext);
        let full_path = self.full_path(&path)?;
        let blob = StoredBlob {
            path,
            size: data.len() as i64,
            hash,
        };

        if fs::try_exists(&full_path).await? {
            debug!(storage_path = %blob.path, "content_store: blob already stored");
            return Ok(blob);
        }

        debug!(storage_path = %blob.path, size = data.len(), "content_store: write");
        self.write_atomic(&full_path, data).await?;
        Ok(blob)
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.full_path(path)?;
        fs::read(&full_path)
            .await
            .map_err(|e| not_found_or_io(path, e))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let full_path = self.full_path(path)?;
        Ok(fs::try_exists(full_path).await?)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let full_path = self.full_path(path)?;
        match fs::remove_file(&full_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn metadata(&self, path: &str) -> Result<BlobMetadata> {
        let full_path = self.full_path(path)?;
        let meta = fs::metadata(&full_path)
            .await
            .map_err(|e| not_found_or_io(path, e))?;
        let modified_at: DateTime<Utc> = meta.modified()?.into();
        Ok(BlobMetadata {
            size: meta.len() as i64,
            modified_at,
        })
    }

    async fn signed_url(&self, path: &str, ttl: Duration) -> Result<String> {
        self.full_path(path)?;
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        let signature = self.sign(path, expires)?;
        Ok(format!(
            "{}/{}?expires={}&signature={}",
            self.base_url, path, expires, signature
        ))
    }

    fn backend_name(&self) -> &'static str {
        "filesystem"
    }
}

/// S3-compatible object store.
pub struct ObjectContentStore {
    store: AmazonS3,
    bucket: String,
}

impl ObjectContentStore {
    /// Build an S3 store from the environment plus explicit bucket settings.
    ///
    /// `endpoint` selects an S3-compatible provider (MinIO, Spaces, ...);
    /// plain `http://` endpoints are allowed for local development.
    pub fn new(bucket: &str, region: &str, endpoint: Option<&str>) -> Result<Self> {
        let mut builder = AmazonS3Builder::from_env()
            .with_region(region)
            .with_bucket_name(bucket);

        if let Some(endpoint) = endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        let store = builder
            .build()
            .map_err(|e| Error::Config(format!("S3 store: {e}")))?;

        info!(bucket, region, endpoint = ?endpoint, "Object content store configured");
        Ok(Self {
            store,
            bucket: bucket.to_string(),
        })
    }

    fn storage_error(&self, op: &str, path: &str, e: object_store::Error) -> Error {
        match e {
            object_store::Error::NotFound { .. } => Error::NotFound(format!("blob {path}")),
            other => {
                warn!(bucket = %self.bucket, key = %path, op, error = %other, "S3 operation failed");
                Error::Storage(format!("{op} {path}: {other}"))
            }
        }
    }
}

#[async_trait]
impl ContentStore for ObjectContentStore {
    async fn put(&self, data: &[u8], ext: &str) -> Result<StoredBlob> {
        let hash = compute_content_hash(data);
        let path = storage_path_for(&hash, ext);
        let location = ObjectPath::from(path.as_str());
        let blob = StoredBlob {
            path: path.clone(),
            size: data.len() as i64,
            hash,
        };

        if self.exists(&path).await? {
            debug!(bucket = %self.bucket, key = %path, "S3 blob already stored");
            return Ok(blob);
        }

        self.store
            .put(&location, PutPayload::from(data.to_vec()))
            .await
            .map_err(|e| self.storage_error("put", &path, e))?;

        debug!(bucket = %self.bucket, key = %path, size = data.len(), "S3 upload successful");
        Ok(blob)
    }

    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        let location = ObjectPath::from(path);
        let result = self
            .store
            .get(&location)
            .await
            .map_err(|e| self.storage_error("get", path, e))?;
        let bytes = result
            .bytes()
            .await
            .map_err(|e| self.storage_error("read", path, e))?;
        Ok(bytes.to_vec())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        match self.store.head(&ObjectPath::from(path)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(self.storage_error("head", path, e)),
        }
    }

    async fn delete(&self, path: &str) -> Result<()> {
        match self.store.delete(&ObjectPath::from(path)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(self.storage_error("delete", path, e)),
        }
    }

    async fn metadata(&self, path: &str) -> Result<BlobMetadata> {
        let meta = self
            .store
            .head(&ObjectPath::from(path))
            .await
            .map_err(|e| self.storage_error("head", path, e))?;
        Ok(BlobMetadata {
            size: meta.size as i64,
            modified_at: meta.last_modified,
        })
    }

    async fn signed_url(&self, path: &str, ttl: Duration) -> Result<String> {
        let url = self
            .store
            .signed_url(Method::GET, &ObjectPath::from(path), ttl)
            .await
            .map_err(|e| self.storage_error("sign", path, e))?;
        Ok(url.to_string())
    }

    fn backend_name(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> FilesystemContentStore {
        FilesystemContentStore::new(dir.path(), "http://files.test/", b"secret".to_vec())
    }

    fn query_param<'a>(url: &'a str, name: &str) -> &'a str {
        url.split(['?', '&'])
            .find_map(|part| part.strip_prefix(&format!("{name}=")))
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn test_put_get_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let blob = store.put(b"hello world", "txt").await.unwrap();
        assert_eq!(blob.size, 11);
        assert_eq!(blob.path, storage_path_for(&blob.hash, "txt"));
        assert!(dir.path().join(&blob.path).exists());

        assert_eq!(store.get(&blob.path).await.unwrap(), b"hello world");
        assert!(store.exists(&blob.path).await.unwrap());
    }

    #[tokio::test]
    async fn test_put_identical_content_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        let first = store.put(b"same", "bin").await.unwrap();
        let second = store.put(b"same", "bin").await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_metadata_and_delete() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let blob = store.put(b"12345", "bin").await.unwrap();

        let meta = store.metadata(&blob.path).await.unwrap();
        assert_eq!(meta.size, 5);

        store.delete(&blob.path).await.unwrap();
        assert!(!store.exists(&blob.path).await.unwrap());
        // Deleting twice is fine
        store.delete(&blob.path).await.unwrap();

        let err = store.get(&blob.path).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        for path in ["../etc/passwd", "/etc/passwd", "ab/../../x", "", "a\\b"] {
            let err = store.get(path).await.unwrap_err();
            assert!(matches!(err, Error::InvalidInput(_)), "path {path:?}");
        }
    }

    #[tokio::test]
    async fn test_signed_url_verifies() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let blob = store.put(b"signed", "txt").await.unwrap();

        let url = store
            .signed_url(&blob.path, Duration::from_secs(60))
            .await
            .unwrap();
        assert!(url.starts_with(&format!("http://files.test/{}?", blob.path)));

        let expires: i64 = query_param(&url, "expires").parse().unwrap();
        let signature = query_param(&url, "signature");
        assert!(store.verify_signature(&blob.path, expires, signature));
        assert!(!store.verify_signature("other/path.txt", expires, signature));
        assert!(!store.verify_signature(&blob.path, expires + 1, signature));
        assert!(!store.verify_signature(&blob.path, expires, "zz"));
    }

    #[tokio::test]
    async fn test_expired_signature_rejected() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let expired = Utc::now().timestamp() - 10;
        let signature = store.sign("ab/cd/x.txt", expired).unwrap();
        assert!(!store.verify_signature("ab/cd/x.txt", expired, &signature));
    }

    #[tokio::test]
    async fn test_validate_creates_root() {
        let dir = TempDir::new().unwrap();
        let store = FilesystemContentStore::new(dir.path().join("nested/blobs"), "", b"k".to_vec());
        store.validate().await.unwrap();
    }
}
