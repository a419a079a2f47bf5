use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::{BlobError, ObjectKey};

type HmacSha256 = Hmac<Sha256>;

/// Query parameters carried by a presigned upload URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTicket {
    /// Unix timestamp (seconds) after which the ticket is rejected.
    pub expires: i64,
    pub signature: String,
}

/// Signs and verifies upload tickets with a shared HMAC-SHA256 secret.
#[derive(Clone)]
pub struct UploadSigner {
    key: Vec<u8>,
}

impl std::fmt::Debug for UploadSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadSigner").finish_non_exhaustive()
    }
}

impl UploadSigner {
    pub fn new(key: impl Into<Vec<u8>>) -> Result<Self, BlobError> {
        let key = key.into();
        if key.is_empty() {
            return Err(BlobError::SigningKey("upload signing key is empty".into()));
        }
        Ok(Self { key })
    }

    pub fn sign(
        &self,
        key: &ObjectKey,
        content_type: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<UploadTicket, BlobError> {
        let expires = expires_at.timestamp();
        let mac = self.mac(key, content_type, expires)?;
        Ok(UploadTicket {
            expires,
            signature: URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()),
        })
    }

    /// Checks the signature first, then the expiry against `now`.
    pub fn verify(
        &self,
        key: &ObjectKey,
        content_type: &str,
        ticket: &UploadTicket,
        now: DateTime<Utc>,
    ) -> Result<(), BlobError> {
        let provided = URL_SAFE_NO_PAD
            .decode(ticket.signature.trim())
            .map_err(|_| BlobError::SignatureMismatch)?;

        self.mac(key, content_type, ticket.expires)?
            .verify_slice(&provided)
            .map_err(|_| BlobError::SignatureMismatch)?;

        if now.timestamp() > ticket.expires {
            return Err(BlobError::Expired);
        }
        Ok(())
    }

    fn mac(
        &self,
        key: &ObjectKey,
        content_type: &str,
        expires: i64,
    ) -> Result<HmacSha256, BlobError> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|err| BlobError::SigningKey(err.to_string()))?;
        mac.update(format!("PUT\n{key}\n{content_type}\n{expires}").as_bytes());
        Ok(mac)
    }
}
