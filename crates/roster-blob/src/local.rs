use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::{
    validate_content_type, BlobError, BlobNamespace, BlobStore, ObjectKey, ObjectMetadata,
    StoredObject, UploadGrant, UploadSigner, UploadTicket,
};

const OBJECTS_DIR: &str = "objects";
const META_DIR: &str = "meta";
const MAX_UPLOAD_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Filesystem-backed blob store.
///
/// Layout: `<root>/objects/<key>` holds the bytes, `<root>/meta/<key>.json`
/// the [`ObjectMetadata`]. Objects are created with create-new semantics, so
/// each key accepts exactly one upload.
#[derive(Debug, Clone)]
pub struct LocalBlobStore {
    root: PathBuf,
    namespace: BlobNamespace,
    signer: UploadSigner,
}

impl LocalBlobStore {
    pub async fn open(
        root: impl Into<PathBuf>,
        namespace: BlobNamespace,
        signer: UploadSigner,
    ) -> Result<Self, BlobError> {
        let root = root.into();
        fs::create_dir_all(root.join(OBJECTS_DIR)).await?;
        fs::create_dir_all(root.join(META_DIR)).await?;
        Ok(Self {
            root,
            namespace,
            signer,
        })
    }

    /// Verifies an upload ticket against an explicit clock.
    pub fn verify_upload(
        &self,
        key: &ObjectKey,
        content_type: &str,
        ticket: &UploadTicket,
        now: DateTime<Utc>,
    ) -> Result<(), BlobError> {
        self.signer.verify(key, content_type, ticket, now)
    }

    fn object_path(&self, key: &ObjectKey) -> PathBuf {
        self.root.join(OBJECTS_DIR).join(key.as_str())
    }

    fn meta_path(&self, key: &ObjectKey) -> PathBuf {
        self.root.join(META_DIR).join(format!("{key}.json"))
    }

    async fn write_new_object(&self, key: &ObjectKey, data: &[u8]) -> Result<(), BlobError> {
        let path = self.object_path(key);
        let mut file = match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(BlobError::AlreadyExists(key.to_string()))
            }
            Err(err) => return Err(err.into()),
        };

        let written = async {
            file.write_all(data).await?;
            file.sync_all().await
        }
        .await;

        if let Err(err) = written {
            if let Err(cleanup) = fs::remove_file(&path).await {
                warn!(key = %key, error = %cleanup, "failed to remove partial object");
            }
            return Err(err.into());
        }
        Ok(())
    }

    async fn write_metadata(
        &self,
        key: &ObjectKey,
        metadata: &ObjectMetadata,
    ) -> Result<(), BlobError> {
        fs::write(self.meta_path(key), serde_json::to_vec(metadata)?).await?;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    fn namespace(&self) -> &BlobNamespace {
        &self.namespace
    }

    async fn presign_upload(
        &self,
        key: &ObjectKey,
        content_type: &str,
        ttl: Duration,
    ) -> Result<UploadGrant, BlobError> {
        let content_type = validate_content_type(content_type)?;
        let ttl = ttl.min(MAX_UPLOAD_TTL);
        let expires_at = Utc::now() + ChronoDuration::seconds(ttl.as_secs() as i64);

        let ticket = self.signer.sign(key, content_type, expires_at)?;
        let public_url = self.namespace.public_url(key);
        let upload_url = format!(
            "{public_url}?expires={}&signature={}",
            ticket.expires, ticket.signature
        );

        debug!(key = %key, content_type, %expires_at, "issued upload credential");
        Ok(UploadGrant {
            upload_url,
            key: key.clone(),
            public_url,
            expires_at,
        })
    }

    async fn complete_upload(
        &self,
        key: &ObjectKey,
        ticket: &UploadTicket,
        content_type: &str,
        data: Vec<u8>,
    ) -> Result<ObjectMetadata, BlobError> {
        let content_type = validate_content_type(content_type)?;
        self.verify_upload(key, content_type, ticket, Utc::now())?;

        self.write_new_object(key, &data).await?;

        let metadata = ObjectMetadata {
            content_type: content_type.to_string(),
            size: data.len() as u64,
            uploaded_at: Utc::now(),
        };
        if let Err(err) = self.write_metadata(key, &metadata).await {
            // An object without metadata cannot be served and blocks retries.
            if let Err(cleanup) = fs::remove_file(self.object_path(key)).await {
                warn!(key = %key, error = %cleanup, "failed to remove object without metadata");
            }
            return Err(err);
        }

        info!(key = %key, size = metadata.size, "stored uploaded object");
        Ok(metadata)
    }

    async fn fetch_object(&self, key: &ObjectKey) -> Result<StoredObject, BlobError> {
        let raw_meta = read_existing(&self.meta_path(key), key).await?;
        let metadata: ObjectMetadata = serde_json::from_slice(&raw_meta)?;
        let data = read_existing(&self.object_path(key), key).await?;

        Ok(StoredObject {
            key: key.clone(),
            metadata,
            data,
        })
    }

    async fn delete_object(&self, key: &ObjectKey) -> Result<(), BlobError> {
        let removed = remove_if_present(&self.object_path(key)).await?;
        remove_if_present(&self.meta_path(key)).await?;

        debug!(key = %key, removed, "deleted object");
        Ok(())
    }
}

async fn read_existing(path: &Path, key: &ObjectKey) -> Result<Vec<u8>, BlobError> {
    match fs::read(path).await {
        Ok(bytes) => Ok(bytes),
        Err(err) if err.kind() == ErrorKind::NotFound => {
            Err(BlobError::NotFound(key.to_string()))
        }
        Err(err) => Err(err.into()),
    }
}

async fn remove_if_present(path: &Path) -> Result<bool, BlobError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (LocalBlobStore, TempDir) {
        let temp = TempDir::new().unwrap();
        let store = LocalBlobStore::open(
            temp.path().join("blobs"),
            BlobNamespace::new("http://localhost:8080/blobs").unwrap(),
            UploadSigner::new(b"local-secret".to_vec()).unwrap(),
        )
        .await
        .unwrap();
        (store, temp)
    }

    fn ticket_from(grant: &UploadGrant) -> UploadTicket {
        let (_, query) = grant.upload_url.split_once('?').unwrap();
        let mut expires = None;
        let mut signature = None;
        for pair in query.split('&') {
            match pair.split_once('=').unwrap() {
                ("expires", value) => expires = Some(value.parse().unwrap()),
                ("signature", value) => signature = Some(value.to_string()),
                _ => {}
            }
        }
        UploadTicket {
            expires: expires.unwrap(),
            signature: signature.unwrap(),
        }
    }

    #[tokio::test]
    async fn presigned_grant_points_into_the_namespace() {
        let (store, _tmp) = store().await;
        let key = ObjectKey::generate("face.png");
        let grant = store
            .presign_upload(&key, "image/png", Duration::from_secs(300))
            .await
            .unwrap();

        assert_eq!(grant.key, key);
        assert_eq!(
            grant.public_url,
            format!("http://localhost:8080/blobs/{key}")
        );
        assert!(grant.upload_url.starts_with(&grant.public_url));
        assert_eq!(store.namespace().key_from_url(&grant.public_url), Some(key));

        let remaining = grant.expires_at - Utc::now();
        assert!(remaining <= ChronoDuration::seconds(300));
        assert!(remaining > ChronoDuration::seconds(290));
    }

    #[tokio::test]
    async fn upload_fetch_and_delete() {
        let (store, _tmp) = store().await;
        let key = ObjectKey::generate("face.png");
        let grant = store
            .presign_upload(&key, "image/png", Duration::from_secs(60))
            .await
            .unwrap();

        let metadata = store
            .complete_upload(&key, &ticket_from(&grant), "image/png", b"png-bytes".to_vec())
            .await
            .unwrap();
        assert_eq!(metadata.size, 9);

        let object = store.fetch_object(&key).await.unwrap();
        assert_eq!(object.data, b"png-bytes");
        assert_eq!(object.metadata.content_type, "image/png");

        store.delete_object(&key).await.unwrap();
        assert!(matches!(
            store.fetch_object(&key).await,
            Err(BlobError::NotFound(_))
        ));
        store.delete_object(&key).await.unwrap();
    }

    #[tokio::test]
    async fn credential_is_single_use() {
        let (store, _tmp) = store().await;
        let key = ObjectKey::generate("face.png");
        let grant = store
            .presign_upload(&key, "image/png", Duration::from_secs(60))
            .await
            .unwrap();
        let ticket = ticket_from(&grant);

        store
            .complete_upload(&key, &ticket, "image/png", b"first".to_vec())
            .await
            .unwrap();
        let err = store
            .complete_upload(&key, &ticket, "image/png", b"second".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::AlreadyExists(_)));

        let object = store.fetch_object(&key).await.unwrap();
        assert_eq!(object.data, b"first");
    }

    #[tokio::test]
    async fn upload_with_wrong_content_type_is_rejected() {
        let (store, _tmp) = store().await;
        let key = ObjectKey::generate("face.png");
        let grant = store
            .presign_upload(&key, "image/png", Duration::from_secs(60))
            .await
            .unwrap();

        let err = store
            .complete_upload(&key, &ticket_from(&grant), "text/html", b"<p>".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::SignatureMismatch));
        assert!(!store.object_path(&key).exists());
    }

    #[tokio::test]
    async fn failed_metadata_write_leaves_the_key_uploadable() {
        let (store, tmp) = store().await;
        let key = ObjectKey::generate("face.png");
        let grant = store
            .presign_upload(&key, "image/png", Duration::from_secs(60))
            .await
            .unwrap();
        let ticket = ticket_from(&grant);

        let meta_dir = tmp.path().join("blobs").join(META_DIR);
        std::fs::remove_dir(&meta_dir).unwrap();
        std::fs::write(&meta_dir, b"not a directory").unwrap();

        let err = store
            .complete_upload(&key, &ticket, "image/png", b"first".to_vec())
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::Io(_)));
        assert!(!store.object_path(&key).exists());

        std::fs::remove_file(&meta_dir).unwrap();
        std::fs::create_dir(&meta_dir).unwrap();

        store
            .complete_upload(&key, &ticket, "image/png", b"retry".to_vec())
            .await
            .unwrap();
        let object = store.fetch_object(&key).await.unwrap();
        assert_eq!(object.data, b"retry");
    }

    #[tokio::test]
    async fn expired_ticket_is_rejected() {
        let (store, _tmp) = store().await;
        let key = ObjectKey::generate("face.png");
        let grant = store
            .presign_upload(&key, "image/png", Duration::from_secs(60))
            .await
            .unwrap();

        let later = Utc::now() + ChronoDuration::seconds(120);
        let err = store
            .verify_upload(&key, "image/png", &ticket_from(&grant), later)
            .unwrap_err();
        assert!(matches!(err, BlobError::Expired));
    }

    #[tokio::test]
    async fn presign_rejects_bad_content_type() {
        let (store, _tmp) = store().await;
        let key = ObjectKey::generate("face.png");
        let err = store
            .presign_upload(&key, "  ", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, BlobError::InvalidContentType(_)));
    }
}
