//! Blob storage for `file` fields.
//!
//! A `file` column holds only an opaque [`BlobRef`]; the bytes live in a
//! [`BlobStore`].

use crate::error::{Error, Result};
use dashmap::DashMap;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Opaque reference stored in a `file` column.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlobRef(String);

impl BlobRef {
    /// Wrap a stored reference.
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    /// The reference string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BlobRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a blob can be fetched from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobHandle {
    /// Retrieval location (URL or path).
    pub location: String,
    /// Original file name.
    pub filename: String,
    /// MIME type.
    pub content_type: String,
}

/// External blob storage.
pub trait BlobStore: Send + Sync {
    /// Store bytes and return a reference for a `file` column.
    fn store(&self, bytes: &[u8], filename: &str, content_type: &str) -> Result<BlobRef>;

    /// Resolve a reference to a retrievable handle.
    fn resolve(&self, reference: &BlobRef) -> Result<BlobHandle>;
}

struct StoredBlob {
    bytes: Vec<u8>,
    filename: String,
    content_type: String,
}

/// In-process blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: DashMap<String, StoredBlob>,
}

impl MemoryBlobStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read back stored bytes.
    pub fn get(&self, reference: &BlobRef) -> Option<Vec<u8>> {
        self.blobs.get(reference.as_str()).map(|b| b.bytes.clone())
    }

    /// Number of stored blobs.
    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    /// Check if the store is empty.
    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn store(&self, bytes: &[u8], filename: &str, content_type: &str) -> Result<BlobRef> {
        if filename.trim().is_empty() {
            return Err(Error::Validation("file name can't be blank".into()));
        }
        let mut id = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut id);
        let key = hex::encode(id);

        self.blobs.insert(
            key.clone(),
            StoredBlob {
                bytes: bytes.to_vec(),
                filename: filename.to_string(),
                content_type: content_type.to_string(),
            },
        );
        tracing::debug!(blob = %key, filename, size = bytes.len(), "stored blob");
        Ok(BlobRef(key))
    }

    fn resolve(&self, reference: &BlobRef) -> Result<BlobHandle> {
        let blob = self
            .blobs
            .get(reference.as_str())
            .ok_or_else(|| Error::not_found("blob", reference))?;
        Ok(BlobHandle {
            location: format!("memory://{}/{}", reference, blob.filename),
            filename: blob.filename.clone(),
            content_type: blob.content_type.clone(),
        })
    }
}
