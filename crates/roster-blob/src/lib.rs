//! Blob storage for employee photos.
//!
//! The [`BlobStore`] trait is the seam the daemon depends on: it issues
//! presigned upload credentials, accepts the direct client upload those
//! credentials authorize, serves stored objects and deletes them. Object keys
//! and their public addresses are converted through a single
//! [`BlobNamespace`] codec so the address handed out at upload time can always
//! be decoded back into the key at cleanup time.
//!
//! [`LocalBlobStore`] is the filesystem-backed implementation used by the
//! daemon and the tests.

mod error;
mod key;
mod local;
mod signer;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use error::BlobError;
pub use key::{BlobNamespace, ObjectKey, DEFAULT_FILE_NAME};
pub use local::LocalBlobStore;
pub use signer::{UploadSigner, UploadTicket};

/// Lifetime of an upload credential unless configured otherwise.
pub const DEFAULT_UPLOAD_TTL: Duration = Duration::from_secs(300);

const MAX_CONTENT_TYPE_LEN: usize = 255;

/// Everything a client needs to upload one object directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadGrant {
    pub upload_url: String,
    pub key: ObjectKey,
    pub public_url: String,
    pub expires_at: DateTime<Utc>,
}

/// Metadata kept next to every stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMetadata {
    pub content_type: String,
    pub size: u64,
    pub uploaded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub key: ObjectKey,
    pub metadata: ObjectMetadata,
    pub data: Vec<u8>,
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Codec between this store's keys and their public addresses.
    fn namespace(&self) -> &BlobNamespace;

    /// Issues a write-only credential for exactly `key` and `content_type`.
    async fn presign_upload(
        &self,
        key: &ObjectKey,
        content_type: &str,
        ttl: Duration,
    ) -> Result<UploadGrant, BlobError>;

    /// Stores an upload authorized by `ticket`. A key can only be written once.
    async fn complete_upload(
        &self,
        key: &ObjectKey,
        ticket: &UploadTicket,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<ObjectMetadata, BlobError>;

    async fn fetch_object(&self, key: &ObjectKey) -> Result<StoredObject, BlobError>;

    /// Removes an object; removing a missing object is not an error.
    async fn delete_object(&self, key: &ObjectKey) -> Result<(), BlobError>;
}

/// Accepts MIME-like values that are safe to echo back as a header.
pub fn validate_content_type(content_type: &str) -> Result<&str, BlobError> {
    let trimmed = content_type.trim();
    if trimmed.is_empty() {
        return Err(BlobError::InvalidContentType(
            "content type must not be empty".into(),
        ));
    }
    if trimmed.len() > MAX_CONTENT_TYPE_LEN {
        return Err(BlobError::InvalidContentType(format!(
            "content type longer than {MAX_CONTENT_TYPE_LEN} bytes"
        )));
    }
    if !trimmed.chars().all(|c| c.is_ascii_graphic() || c == ' ') {
        return Err(BlobError::InvalidContentType(format!(
            "'{trimmed}' contains non-printable characters"
        )));
    }
    Ok(trimmed)
}
