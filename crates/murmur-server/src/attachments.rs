//! Attachment storage.
//!
//! Uploads land in a transient local directory and are addressed as
//! `{base}/uploads/{name}`. Forwarding copies a local attachment into the
//! durable blob directory, addressed as `{base}/blob/{uuid}`, so the
//! forwarded copy survives cleanup of the upload directory.

use std::path::{Component, Path, PathBuf};

use chrono::Utc;
use tokio::fs;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ServerError;

/// Verify that a resolved path stays within the expected base directory.
fn ensure_within(base: &Path, target: &Path) -> Result<PathBuf, ServerError> {
    let canonical_base = base.canonicalize().unwrap_or_else(|_| base.to_path_buf());
    let mut resolved = canonical_base.clone();
    for component in target
        .strip_prefix(base)
        .unwrap_or(target)
        .components()
    {
        match component {
            Component::Normal(c) => resolved.push(c),
            Component::ParentDir => {
                return Err(ServerError::BadRequest("Path traversal detected".into()));
            }
            _ => {}
        }
    }
    if !resolved.starts_with(&canonical_base) {
        return Err(ServerError::BadRequest("Path traversal detected".into()));
    }
    Ok(resolved)
}

/// Keep `[A-Za-z0-9._-]`, replace the rest, and never start with a dot.
fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(100)
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct AttachmentStore {
    upload_dir: PathBuf,
    blob_dir: PathBuf,
    base_url: String,
    max_size: usize,
}

impl AttachmentStore {
    pub async fn new(
        upload_dir: PathBuf,
        blob_dir: PathBuf,
        base_url: impl Into<String>,
        max_size: usize,
    ) -> Result<Self, ServerError> {
        for dir in [&upload_dir, &blob_dir] {
            fs::create_dir_all(dir).await.map_err(|e| {
                ServerError::Internal(format!(
                    "Failed to create attachment directory '{}': {}",
                    dir.display(),
                    e
                ))
            })?;
        }

        info!(
            uploads = %upload_dir.display(),
            blobs = %blob_dir.display(),
            "Attachment store initialized"
        );

        Ok(Self {
            upload_dir,
            blob_dir,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_size,
        })
    }

    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    fn uploads_prefix(&self) -> String {
        format!("{}/uploads/", self.base_url)
    }

    /// Persist an upload and return its URI.
    pub async fn save_upload(&self, original_name: &str, data: &[u8]) -> Result<String, ServerError> {
        if data.is_empty() {
            return Err(ServerError::BadRequest("Empty attachment".into()));
        }
        if data.len() > self.max_size {
            return Err(ServerError::AttachmentTooLarge {
                size: data.len(),
                max: self.max_size,
            });
        }

        let name = format!(
            "{}-{}",
            Utc::now().timestamp_millis(),
            sanitize_file_name(original_name)
        );
        let path = ensure_within(&self.upload_dir, &self.upload_dir.join(&name))?;

        fs::write(&path, data)
            .await
            .map_err(|e| ServerError::Internal(format!("Failed to write upload {name}: {e}")))?;

        debug!(name = %name, size = data.len(), "Stored upload");
        Ok(format!("{}{}", self.uploads_prefix(), name))
    }

    /// Whether `uri` points at the transient upload directory.
    pub fn is_local(&self, uri: &str) -> bool {
        uri.starts_with(&self.uploads_prefix())
    }

    /// Copy a local upload into durable storage and return the durable URI.
    pub async fn migrate(&self, uri: &str) -> Result<String, ServerError> {
        let name = uri
            .strip_prefix(&self.uploads_prefix())
            .ok_or_else(|| ServerError::MigrationFailure(format!("{uri} is not a local upload")))?;

        let source = ensure_within(&self.upload_dir, &self.upload_dir.join(name))
            .map_err(|e| ServerError::MigrationFailure(e.to_string()))?;
        let data = fs::read(&source)
            .await
            .map_err(|e| ServerError::MigrationFailure(format!("read {name}: {e}")))?;

        let id = Uuid::new_v4();
        let target = self.blob_path(id)?;
        fs::write(&target, &data)
            .await
            .map_err(|e| ServerError::MigrationFailure(format!("write blob {id}: {e}")))?;

        info!(upload = %name, blob = %id, size = data.len(), "Migrated attachment");
        Ok(format!("{}/blob/{}", self.base_url, id))
    }

    pub async fn get_blob(&self, id: Uuid) -> Result<Vec<u8>, ServerError> {
        let path = self.blob_path(id)?;
        if !path.exists() {
            return Err(ServerError::NotFound(format!("blob {id}")));
        }

        let data = fs::read(&path)
            .await
            .map_err(|e| ServerError::Internal(format!("Failed to read blob {id}: {e}")))?;

        debug!(id = %id, size = data.len(), "Retrieved blob");
        Ok(data)
    }

    fn blob_path(&self, id: Uuid) -> Result<PathBuf, ServerError> {
        ensure_within(&self.blob_dir, &self.blob_dir.join(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store(dir: &TempDir) -> AttachmentStore {
        AttachmentStore::new(
            dir.path().join("uploads"),
            dir.path().join("blobs"),
            "http://localhost:5000/",
            1024,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_upload_then_migrate() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        let uri = store.save_upload("cat picture.png", b"meow").await.unwrap();
        assert!(uri.starts_with("http://localhost:5000/uploads/"));
        assert!(uri.ends_with("-cat_picture.png"));
        assert!(store.is_local(&uri));

        let durable = store.migrate(&uri).await.unwrap();
        assert!(durable.starts_with("http://localhost:5000/blob/"));
        assert!(!store.is_local(&durable));

        let id = Uuid::parse_str(durable.rsplit('/').next().unwrap()).unwrap();
        assert_eq!(store.get_blob(id).await.unwrap(), b"meow");
    }

    #[tokio::test]
    async fn test_migrate_failures() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;

        let missing = "http://localhost:5000/uploads/nothing-here.png";
        assert!(matches!(
            store.migrate(missing).await,
            Err(ServerError::MigrationFailure(_))
        ));
        assert!(matches!(
            store.migrate("https://cdn.example.org/a.png").await,
            Err(ServerError::MigrationFailure(_))
        ));
        assert!(matches!(
            store.migrate("http://localhost:5000/uploads/../secret").await,
            Err(ServerError::MigrationFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_size_limits() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        assert!(matches!(
            store.save_upload("big.bin", &[0u8; 2048]).await,
            Err(ServerError::AttachmentTooLarge { size: 2048, max: 1024 })
        ));
        assert!(store.save_upload("empty.bin", &[]).await.is_err());
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
        assert_eq!(sanitize_file_name("résumé v2.pdf"), "r_sum__v2.pdf");
        assert_eq!(sanitize_file_name(""), "file");
    }

    #[tokio::test]
    async fn test_missing_blob() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir).await;
        assert!(matches!(
            store.get_blob(Uuid::new_v4()).await,
            Err(ServerError::NotFound(_))
        ));
    }
}
