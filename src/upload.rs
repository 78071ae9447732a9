//! Spot image storage.
//!
//! Images are stored before the spot that uses them is created, under
//! `spots/<spot_id>-<unix_ms>.<ext>`. A create that fails afterwards leaves
//! the file behind.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use crate::limits::MAX_UPLOAD_BYTES;

pub const ALLOWED_CONTENT_TYPES: [&str; 4] = ["image/jpeg", "image/png", "image/gif", "image/webp"];

/// Where a stored image lives: public URL plus path relative to the store root.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Upload {
    pub url: String,
    pub path: String,
}

#[derive(Debug)]
pub enum UploadError {
    InvalidInput(String),
    UnsupportedType(String),
    TooLarge { size: usize, max: usize },
    /// The target path is taken. Uploads never overwrite.
    AlreadyExists(String),
    Io(io::Error),
}

impl std::fmt::Display for UploadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UploadError::InvalidInput(msg) => write!(f, "invalid upload: {msg}"),
            UploadError::UnsupportedType(t) => write!(f, "unsupported content type: {t}"),
            UploadError::TooLarge { size, max } => {
                write!(f, "upload is {size} bytes, limit is {max}")
            }
            UploadError::AlreadyExists(path) => write!(f, "{path} already exists"),
            UploadError::Io(e) => write!(f, "upload storage error: {e}"),
        }
    }
}

impl std::error::Error for UploadError {}

#[async_trait]
pub trait UploadStore: Send + Sync {
    async fn upload(
        &self,
        spot_id: &str,
        file_name: &str,
        content_type: &str,
        data: Bytes,
    ) -> Result<Upload, UploadError>;
}

/// Stores images on the local filesystem; the URL prefix is served elsewhere.
pub struct LocalUploadStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalUploadStore {
    pub fn new(root: PathBuf, public_base_url: String) -> Self {
        Self {
            root,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn upload_at(
        &self,
        spot_id: &str,
        file_name: &str,
        content_type: &str,
        data: Bytes,
        unix_ms: i64,
    ) -> Result<Upload, UploadError> {
        let ext = validate(spot_id, file_name, content_type, data.len())?;
        let path = format!("spots/{spot_id}-{unix_ms}.{ext}");
        let full = self.root.join(&path);
        if let Some(dir) = full.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(UploadError::Io)?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&full)
            .await
            .map_err(|e| match e.kind() {
                io::ErrorKind::AlreadyExists => UploadError::AlreadyExists(path.clone()),
                _ => UploadError::Io(e),
            })?;
        file.write_all(&data).await.map_err(UploadError::Io)?;
        file.sync_all().await.map_err(UploadError::Io)?;

        metrics::counter!(crate::observability::UPLOADS_TOTAL).increment(1);
        tracing::info!("stored {} bytes at {path}", data.len());
        Ok(Upload {
            url: format!("{}/{path}", self.public_base_url),
            path,
        })
    }
}

#[async_trait]
impl UploadStore for LocalUploadStore {
    async fn upload(
        &self,
        spot_id: &str,
        file_name: &str,
        content_type: &str,
        data: Bytes,
    ) -> Result<Upload, UploadError> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        self.upload_at(spot_id, file_name, content_type, data, now).await
    }
}

/// Check the request and pick the file extension.
fn validate(spot_id: &str, file_name: &str, content_type: &str, size: usize) -> Result<String, UploadError> {
    if spot_id.is_empty() || !spot_id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(UploadError::InvalidInput(format!("bad spot id {spot_id:?}")));
    }
    let content_type = content_type.trim().to_ascii_lowercase();
    if !ALLOWED_CONTENT_TYPES.contains(&content_type.as_str()) {
        return Err(UploadError::UnsupportedType(content_type));
    }
    if size == 0 {
        return Err(UploadError::InvalidInput("empty file".into()));
    }
    if size > MAX_UPLOAD_BYTES {
        return Err(UploadError::TooLarge { size, max: MAX_UPLOAD_BYTES });
    }
    Ok(extension(file_name).unwrap_or_else(|| default_extension(&content_type).to_string()))
}

/// Extension of the client's file name, if it is a plain short word.
fn extension(file_name: &str) -> Option<String> {
    let (_, ext) = file_name.rsplit_once('.')?;
    let ok = !ext.is_empty() && ext.len() <= 8 && ext.chars().all(|c| c.is_ascii_alphanumeric());
    ok.then(|| ext.to_ascii_lowercase())
}

fn default_extension(content_type: &str) -> &'static str {
    match content_type {
        "image/png" => "png",
        "image/gif" => "gif",
        "image/webp" => "webp",
        _ => "jpg",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(name: &str) -> (LocalUploadStore, PathBuf) {
        let dir = std::env::temp_dir().join("spotledger_test_upload").join(name);
        let _ = std::fs::remove_dir_all(&dir);
        (
            LocalUploadStore::new(dir.clone(), "https://cdn.example.com/spot-images/".into()),
            dir,
        )
    }

    #[tokio::test]
    async fn stores_file_and_builds_url() {
        let (store, root) = store("basic");
        let upload = store
            .upload_at("spot-1", "cat.PNG", "image/png", Bytes::from_static(b"\x89PNG"), 1700)
            .await
            .unwrap();
        assert_eq!(upload.path, "spots/spot-1-1700.png");
        assert_eq!(upload.url, "https://cdn.example.com/spot-images/spots/spot-1-1700.png");
        assert_eq!(std::fs::read(root.join(&upload.path)).unwrap(), b"\x89PNG");
    }

    #[tokio::test]
    async fn never_overwrites() {
        let (store, root) = store("no_overwrite");
        let data = Bytes::from_static(b"first");
        store.upload_at("s", "a.jpg", "image/jpeg", data, 5).await.unwrap();
        let err = store
            .upload_at("s", "a.jpg", "image/jpeg", Bytes::from_static(b"second"), 5)
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::AlreadyExists(p) if p == "spots/s-5.jpg"));
        assert_eq!(std::fs::read(root.join("spots/s-5.jpg")).unwrap(), b"first");
    }

    #[tokio::test]
    async fn rejects_bad_requests() {
        let (store, _) = store("rejects");
        let one = || Bytes::from_static(b"x");
        assert!(matches!(
            store.upload("s", "a.svg", "image/svg+xml", one()).await,
            Err(UploadError::UnsupportedType(_))
        ));
        assert!(matches!(
            store.upload("../etc", "a.png", "image/png", one()).await,
            Err(UploadError::InvalidInput(_))
        ));
        assert!(matches!(
            store.upload("s", "a.png", "image/png", Bytes::new()).await,
            Err(UploadError::InvalidInput(_))
        ));
        let big = Bytes::from(vec![0u8; MAX_UPLOAD_BYTES + 1]);
        assert!(matches!(
            store.upload("s", "a.png", "image/png", big).await,
            Err(UploadError::TooLarge { .. })
        ));
    }

    #[test]
    fn extension_falls_back_to_content_type() {
        assert_eq!(validate("s", "photo", "image/webp", 1).unwrap(), "webp");
        assert_eq!(validate("s", "photo.tar.GZ", "image/gif", 1).unwrap(), "gz");
        assert_eq!(validate("s", "weird.<>", "IMAGE/JPEG", 1).unwrap(), "jpg");
    }
}
