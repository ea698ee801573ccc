use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;

use crate::error::{BrokerError, BrokerResult};

/// Filesystem-backed `{storeId -> JSON document}` store used to park OAuth
/// state across browser redirects.
///
/// Ids are restricted to `[A-Za-z0-9_-]+` before ever touching a path, so a
/// store id can never traverse out of the root. Writes are atomic
/// (temp file + fsync + rename) and the final file is tightened to 0600 on
/// POSIX systems.
#[derive(Debug, Clone)]
pub struct KvStore {
    root: PathBuf,
}

impl KvStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Strict id check; anything else is rejected, never sanitized.
    pub fn is_valid_store_id(store_id: &str) -> bool {
        !store_id.is_empty()
            && store_id
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
    }

    fn validate(store_id: &str) -> BrokerResult<()> {
        if Self::is_valid_store_id(store_id) {
            Ok(())
        } else {
            Err(BrokerError::BadRequest(format!(
                "Invalid storage ID: must match [A-Za-z0-9_-]+, got {store_id:?}"
            )))
        }
    }

    fn document_path(&self, store_id: &str) -> PathBuf {
        self.root.join(format!("{store_id}.json"))
    }

    /// Reads the document; a missing file reads as the empty document `{}`.
    pub async fn read(&self, store_id: &str) -> BrokerResult<Value> {
        Self::validate(store_id)?;
        let path = self.document_path(store_id);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(json!({})),
            Err(err) => {
                return Err(BrokerError::Internal(format!(
                    "failed to read {}: {err}",
                    path.display()
                )))
            }
        };
        serde_json::from_slice(&bytes).map_err(|err| {
            BrokerError::Internal(format!("corrupt document {}: {err}", path.display()))
        })
    }

    /// Overwrites the document atomically: the bytes land in a sibling
    /// `.tmp` file, are fsynced, and renamed into place so concurrent reads
    /// never observe a partial write.
    pub async fn write(&self, store_id: &str, document: &Value) -> BrokerResult<()> {
        Self::validate(store_id)?;
        tokio::fs::create_dir_all(&self.root).await.map_err(|err| {
            BrokerError::Internal(format!(
                "failed to create storage directory {}: {err}",
                self.root.display()
            ))
        })?;

        let path = self.document_path(store_id);
        let tmp_path = self.root.join(format!("{store_id}.json.tmp"));
        let bytes = serde_json::to_vec(document)
            .map_err(|err| BrokerError::Internal(format!("failed to serialize document: {err}")))?;

        let write_result = async {
            let mut file = tokio::fs::File::create(&tmp_path).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            Ok::<(), std::io::Error>(())
        }
        .await;
        if let Err(err) = write_result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(BrokerError::Internal(format!(
                "failed to write {}: {err}",
                tmp_path.display()
            )));
        }

        tokio::fs::rename(&tmp_path, &path).await.map_err(|err| {
            BrokerError::Internal(format!("failed to rename into {}: {err}", path.display()))
        })?;

        // Best effort on systems without POSIX permissions.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(err) =
                tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).await
            {
                tracing::warn!("failed to chmod {}: {err}", path.display());
            }
        }

        Ok(())
    }

    /// Removes the document; removing an absent document is a no-op.
    pub async fn delete(&self, store_id: &str) -> BrokerResult<()> {
        Self::validate(store_id)?;
        let path = self.document_path(store_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(BrokerError::Internal(format!(
                "failed to delete {}: {err}",
                path.display()
            ))),
        }
    }
}
