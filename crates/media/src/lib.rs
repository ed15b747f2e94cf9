//! Blob storage for chat media: content sniffing, collision-resistant naming
//! and the put/get contract the messaging session writes binary frames to.

use std::{collections::HashMap, io::ErrorKind, path::PathBuf, sync::Arc};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use nkata_core::MediaKind;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{fs, io::AsyncWriteExt, sync::RwLock};
use uuid::Uuid;

const DEFAULT_MAX_BLOB_BYTES: usize = 16 * 1024 * 1024;
const FALLBACK_EXTENSION: &str = "bin";
const FALLBACK_MIME: &str = "application/octet-stream";

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob not found: {0}")]
    NotFound(String),
    #[error("blob of {size} bytes exceeds the {limit} byte limit")]
    TooLarge { size: usize, limit: usize },
    #[error("blob is empty")]
    Empty,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct BlobStoreConfig {
    /// Directory for stored blobs; blobs stay in memory when unset.
    pub storage_dir: Option<PathBuf>,
    pub public_base_url: String,
    pub max_blob_bytes: usize,
}

impl Default for BlobStoreConfig {
    fn default() -> Self {
        Self {
            storage_dir: None,
            public_base_url: "http://localhost:8080/v1/media/chat".to_string(),
            max_blob_bytes: DEFAULT_MAX_BLOB_BYTES,
        }
    }
}

pub fn validate_config(cfg: &BlobStoreConfig) -> Result<()> {
    if cfg.public_base_url.trim().is_empty() {
        anyhow::bail!("media public_base_url must be provided");
    }
    if cfg.max_blob_bytes == 0 {
        anyhow::bail!("media max_blob_bytes must be positive");
    }
    Ok(())
}

/// Result of inspecting the leading bytes of a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sniffed {
    pub kind: MediaKind,
    pub extension: &'static str,
    pub mime: &'static str,
}

/// Classify a payload from its magic bytes. Client-declared metadata is
/// never consulted; unknown payloads are documents.
pub fn sniff(bytes: &[u8]) -> Sniffed {
    match infer::get(bytes) {
        Some(detected) => {
            let kind = match detected.matcher_type() {
                infer::MatcherType::Image => MediaKind::Image,
                infer::MatcherType::Video => MediaKind::Video,
                infer::MatcherType::Audio => MediaKind::Audio,
                _ => MediaKind::Document,
            };
            Sniffed {
                kind,
                extension: detected.extension(),
                mime: detected.mime_type(),
            }
        }
        None => Sniffed {
            kind: MediaKind::Document,
            extension: FALLBACK_EXTENSION,
            mime: FALLBACK_MIME,
        },
    }
}

/// Millisecond timestamp plus a random suffix, keeping the extension.
pub fn blob_name(extension: &str) -> String {
    let extension: String = extension
        .trim_start_matches('.')
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    let extension = if extension.is_empty() {
        FALLBACK_EXTENSION.to_string()
    } else {
        extension
    };
    format!(
        "{}-{}.{}",
        Utc::now().timestamp_millis(),
        Uuid::new_v4().simple(),
        extension
    )
}

fn is_safe_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.' || c == '_')
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub name: String,
    pub url: String,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` under a fresh name and return its retrieval URL.
    async fn put(&self, bytes: &[u8], extension: &str) -> Result<StoredBlob, BlobError>;
    async fn get(&self, name: &str) -> Result<Vec<u8>, BlobError>;
    /// Map a retrieval URL produced by `put` back to the blob name.
    fn name_from_url<'a>(&self, url: &'a str) -> Option<&'a str>;
}

#[derive(Debug, Clone)]
struct Locator {
    public_base_url: String,
    max_blob_bytes: usize,
}

impl Locator {
    fn from_config(cfg: &BlobStoreConfig) -> Self {
        Self {
            public_base_url: cfg.public_base_url.trim_end_matches('/').to_string(),
            max_blob_bytes: cfg.max_blob_bytes,
        }
    }

    fn check_size(&self, bytes: &[u8]) -> Result<(), BlobError> {
        if bytes.is_empty() {
            return Err(BlobError::Empty);
        }
        if bytes.len() > self.max_blob_bytes {
            return Err(BlobError::TooLarge {
                size: bytes.len(),
                limit: self.max_blob_bytes,
            });
        }
        Ok(())
    }

    fn stored(&self, name: String) -> StoredBlob {
        let url = format!("{}/{}", self.public_base_url, name);
        StoredBlob { name, url }
    }

    fn name_from_url<'a>(&self, url: &'a str) -> Option<&'a str> {
        url.strip_prefix(self.public_base_url.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .filter(|name| is_safe_name(name))
    }
}

pub struct FsBlobStore {
    root: PathBuf,
    locator: Locator,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>, cfg: &BlobStoreConfig) -> Self {
        Self {
            root: root.into(),
            locator: Locator::from_config(cfg),
        }
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn put(&self, bytes: &[u8], extension: &str) -> Result<StoredBlob, BlobError> {
        self.locator.check_size(bytes)?;
        fs::create_dir_all(&self.root).await?;

        let name = blob_name(extension);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.root.join(&name))
            .await?;
        file.write_all(bytes).await?;
        file.flush().await?;

        Ok(self.locator.stored(name))
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>, BlobError> {
        if !is_safe_name(name) {
            return Err(BlobError::NotFound(name.to_string()));
        }
        match fs::read(self.root.join(name)).await {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(BlobError::NotFound(name.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }

    fn name_from_url<'a>(&self, url: &'a str) -> Option<&'a str> {
        self.locator.name_from_url(url)
    }
}

pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<String, Vec<u8>>>,
    locator: Locator,
}

impl InMemoryBlobStore {
    pub fn new(cfg: &BlobStoreConfig) -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            locator: Locator::from_config(cfg),
        }
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn put(&self, bytes: &[u8], extension: &str) -> Result<StoredBlob, BlobError> {
        self.locator.check_size(bytes)?;
        let name = blob_name(extension);
        self.blobs.write().await.insert(name.clone(), bytes.to_vec());
        Ok(self.locator.stored(name))
    }

    async fn get(&self, name: &str) -> Result<Vec<u8>, BlobError> {
        self.blobs
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| BlobError::NotFound(name.to_string()))
    }

    fn name_from_url<'a>(&self, url: &'a str) -> Option<&'a str> {
        self.locator.name_from_url(url)
    }
}

pub fn blob_store_from_config(cfg: &BlobStoreConfig) -> Arc<dyn BlobStore> {
    match &cfg.storage_dir {
        Some(dir) => Arc::new(FsBlobStore::new(dir.clone(), cfg)),
        None => Arc::new(InMemoryBlobStore::new(cfg)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PNG: &[u8] = &[
        0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, b'I', b'H', b'D',
        b'R',
    ];

    #[test]
    fn sniffs_known_and_unknown_payloads() {
        let png = sniff(PNG);
        assert_eq!(png.kind, MediaKind::Image);
        assert_eq!(png.extension, "png");
        assert_eq!(png.mime, "image/png");

        let pdf = sniff(b"%PDF-1.7\n%....");
        assert_eq!(pdf.kind, MediaKind::Document);
        assert_eq!(pdf.extension, "pdf");

        let unknown = sniff(b"just some text");
        assert_eq!(unknown.kind, MediaKind::Document);
        assert_eq!(unknown.extension, "bin");
    }

    #[test]
    fn blob_names_are_unique_and_keep_extension() {
        let first = blob_name("png");
        let second = blob_name(".PNG");
        assert_ne!(first, second);
        assert!(first.ends_with(".png"));
        assert!(second.ends_with(".png"));
        assert!(blob_name("../").ends_with(".bin"));
    }

    #[tokio::test]
    async fn in_memory_store_round_trips_through_url() {
        let store = InMemoryBlobStore::new(&BlobStoreConfig::default());
        let stored = store.put(PNG, "png").await.expect("put succeeds");
        assert!(stored.url.starts_with("http://localhost:8080/v1/media/chat/"));

        let name = store.name_from_url(&stored.url).expect("url maps to name");
        assert_eq!(name, stored.name);
        assert_eq!(store.get(name).await.expect("blob exists"), PNG);
        assert!(matches!(
            store.get("missing.png").await,
            Err(BlobError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rejects_empty_and_oversized_blobs() {
        let cfg = BlobStoreConfig {
            max_blob_bytes: 4,
            ..BlobStoreConfig::default()
        };
        let store = InMemoryBlobStore::new(&cfg);
        assert!(matches!(store.put(&[], "bin").await, Err(BlobError::Empty)));
        assert!(matches!(
            store.put(PNG, "png").await,
            Err(BlobError::TooLarge { size: 16, limit: 4 })
        ));
    }

    #[tokio::test]
    async fn filesystem_store_writes_and_reads_blobs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FsBlobStore::new(dir.path().join("chat"), &BlobStoreConfig::default());

        let stored = store.put(PNG, "png").await.expect("put succeeds");
        assert!(dir.path().join("chat").join(&stored.name).exists());
        assert_eq!(store.get(&stored.name).await.unwrap(), PNG);
        assert!(matches!(
            store.get("../secrets").await,
            Err(BlobError::NotFound(_))
        ));
        assert!(store
            .name_from_url("http://elsewhere.example/v1/media/chat/x.png")
            .is_none());
    }

    #[test]
    fn config_validation_requires_base_url() {
        let cfg = BlobStoreConfig {
            public_base_url: "  ".into(),
            ..BlobStoreConfig::default()
        };
        assert!(validate_config(&cfg).is_err());
        assert!(validate_config(&BlobStoreConfig::default()).is_ok());
    }
}
