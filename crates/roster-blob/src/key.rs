use std::fmt;

use uuid::Uuid;

use crate::BlobError;

/// File name used when an upload request does not name its file.
pub const DEFAULT_FILE_NAME: &str = "photo.jpg";

const MAX_KEY_LEN: usize = 255;
const MAX_FILE_NAME_LEN: usize = 200;

/// A single path segment addressing one object in a blob store.
///
/// Keys only contain `[A-Za-z0-9._-]` and never start with a dot, so a key can
/// be embedded in a URL or a file path without escaping.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn parse(raw: &str) -> Result<Self, BlobError> {
        if raw.is_empty() || raw.len() > MAX_KEY_LEN {
            return Err(BlobError::InvalidKey(format!(
                "key length must be 1..={MAX_KEY_LEN}"
            )));
        }
        if raw.starts_with('.') {
            return Err(BlobError::InvalidKey(format!("'{raw}' starts with '.'")));
        }
        if let Some(bad) = raw.chars().find(|c| !is_key_char(*c)) {
            return Err(BlobError::InvalidKey(format!(
                "'{raw}' contains disallowed character {bad:?}"
            )));
        }
        Ok(Self(raw.to_string()))
    }

    /// Generates `<uuid>-<file name>`, unique on every call.
    pub fn generate(file_name: &str) -> Self {
        Self(format!("{}-{}", Uuid::new_v4(), sanitize_file_name(file_name)))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

/// Reduces a client supplied file name to the key alphabet.
fn sanitize_file_name(file_name: &str) -> String {
    let base = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();

    let cleaned: String = base
        .chars()
        .map(|c| if is_key_char(c) { c } else { '_' })
        .take(MAX_FILE_NAME_LEN)
        .collect();
    let cleaned = cleaned.trim_start_matches('.');

    if cleaned.is_empty() {
        DEFAULT_FILE_NAME.to_string()
    } else {
        cleaned.to_string()
    }
}

/// Maps object keys to their public addresses and back.
///
/// The base address is fixed per store, so `key_from_url(public_url(k)) == Some(k)`
/// for every key and any address outside the base decodes to `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobNamespace {
    base_url: String,
}

impl BlobNamespace {
    pub fn new(base_url: impl Into<String>) -> Result<Self, BlobError> {
        let base_url = base_url.into();
        let trimmed = base_url.trim().trim_end_matches('/');

        let authority = trimmed
            .strip_prefix("https://")
            .or_else(|| trimmed.strip_prefix("http://"))
            .ok_or_else(|| {
                BlobError::InvalidNamespace(format!("'{base_url}' must be an http(s) address"))
            })?;
        if authority.is_empty() || authority.starts_with('/') {
            return Err(BlobError::InvalidNamespace(format!(
                "'{base_url}' has no host"
            )));
        }
        if trimmed.contains(['?', '#']) {
            return Err(BlobError::InvalidNamespace(format!(
                "'{base_url}' must not carry a query or fragment"
            )));
        }

        Ok(Self {
            base_url: trimmed.to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn public_url(&self, key: &ObjectKey) -> String {
        format!("{}/{}", self.base_url, key)
    }

    pub fn key_from_url(&self, url: &str) -> Option<ObjectKey> {
        let rest = url.strip_prefix(self.base_url.as_str())?;
        let segment = rest.strip_prefix('/')?;
        ObjectKey::parse(segment).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn namespace() -> BlobNamespace {
        BlobNamespace::new("https://blobs.example.com/roster/").unwrap()
    }

    #[test]
    fn generated_keys_are_unique_and_keep_the_file_name() {
        let first = ObjectKey::generate("avatar.png");
        let second = ObjectKey::generate("avatar.png");

        assert_ne!(first, second);
        assert!(first.as_str().ends_with("-avatar.png"));
        assert!(second.as_str().ends_with("-avatar.png"));
        assert!(ObjectKey::parse(first.as_str()).is_ok());
    }

    #[test]
    fn file_names_are_reduced_to_the_key_alphabet() {
        let key = ObjectKey::generate("../../etc/My Photo (1).JPG");
        assert!(key.as_str().ends_with("-My_Photo__1_.JPG"), "{key}");

        let key = ObjectKey::generate("C:\\Users\\ann\\me.jpeg");
        assert!(key.as_str().ends_with("-me.jpeg"), "{key}");

        let key = ObjectKey::generate("   ");
        assert!(key.as_str().ends_with("-photo.jpg"), "{key}");

        let key = ObjectKey::generate(".hidden");
        assert!(key.as_str().ends_with("-hidden"), "{key}");
    }

    #[test]
    fn parse_rejects_path_like_keys() {
        assert!(ObjectKey::parse("").is_err());
        assert!(ObjectKey::parse("a/b").is_err());
        assert!(ObjectKey::parse("..").is_err());
        assert!(ObjectKey::parse("with space").is_err());
        assert!(ObjectKey::parse(&"k".repeat(MAX_KEY_LEN + 1)).is_err());
        assert!(ObjectKey::parse("123-photo.jpg").is_ok());
    }

    #[test]
    fn public_url_decodes_back_to_its_key() {
        let ns = namespace();
        let key = ObjectKey::generate("photo.jpg");
        let url = ns.public_url(&key);

        assert_eq!(url, format!("https://blobs.example.com/roster/{key}"));
        assert_eq!(ns.key_from_url(&url), Some(key));
    }

    #[test]
    fn foreign_addresses_do_not_decode() {
        let ns = namespace();
        assert_eq!(ns.key_from_url("https://via.placeholder.com/300"), None);
        assert_eq!(
            ns.key_from_url("https://blobs.example.com/rosterx/abc.jpg"),
            None
        );
        assert_eq!(
            ns.key_from_url("https://blobs.example.com/roster/nested/abc.jpg"),
            None
        );
        assert_eq!(ns.key_from_url("https://blobs.example.com/roster/"), None);
        assert_eq!(
            ns.key_from_url("https://blobs.example.com/roster/abc.jpg?x=1"),
            None
        );
    }

    #[test]
    fn namespace_requires_an_http_base() {
        assert!(BlobNamespace::new("ftp://example.com").is_err());
        assert!(BlobNamespace::new("https://").is_err());
        assert!(BlobNamespace::new("https://example.com/b?x=1").is_err());
        assert_eq!(
            BlobNamespace::new("http://127.0.0.1:8080/blobs")
                .unwrap()
                .base_url(),
            "http://127.0.0.1:8080/blobs"
        );
    }
}
