//! Blob store error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BlobError {
    #[error("invalid object key: {0}")]
    InvalidKey(String),

    #[error("invalid content type: {0}")]
    InvalidContentType(String),

    #[error("invalid blob namespace: {0}")]
    InvalidNamespace(String),

    #[error("upload signature does not match")]
    SignatureMismatch,

    #[error("upload credential expired")]
    Expired,

    #[error("object {0} already exists")]
    AlreadyExists(String),

    #[error("object {0} not found")]
    NotFound(String),

    #[error("signing key error: {0}")]
    SigningKey(String),

    #[error("corrupt object metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("blob storage I/O: {0}")]
    Io(#[from] std::io::Error),
}
