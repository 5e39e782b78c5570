// Temporary upload storage.
// Each upload is written to its own uniquely named file under a shared directory
// and removed again once the request that created it is done with it.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

// Leaves room for the `<millis>-<nonce>-` prefix under the usual 255-byte NAME_MAX.
const MAX_NAME_BYTES: usize = 150;
const FALLBACK_NAME: &str = "upload";

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("failed to create upload directory {path:?}: {source}")]
    CreateDir { path: PathBuf, source: io::Error },
    #[error("failed to write temporary file {path:?}: {source}")]
    Write { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone)]
pub struct TempStorage {
    dir: Arc<PathBuf>,
}

impl TempStorage {
    /// Opens the upload directory, creating it if needed.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|source| StorageError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        Ok(Self { dir: Arc::new(dir) })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persists `data` under a collision-resistant name derived from `original_name`.
    pub async fn store(&self, original_name: &str, data: &[u8]) -> Result<TempAsset, StorageError> {
        let file_name = unique_file_name(original_name);
        let path = self.dir.join(&file_name);

        if let Err(source) = write_new_file(&path, data).await {
            // `create_new` may have succeeded before the write failed.
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != io::ErrorKind::NotFound {
                    warn!("Failed to remove partial upload {:?}: {}", path, e);
                }
            }
            return Err(StorageError::Write { path, source });
        }

        debug!("Stored upload as {:?} ({} bytes)", path, data.len());
        Ok(TempAsset {
            path,
            file_name,
            released: false,
        })
    }
}

async fn write_new_file(path: &Path, data: &[u8]) -> io::Result<()> {
    let mut file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await?;
    file.write_all(data).await?;
    file.flush().await?;
    Ok(())
}

/// A persisted upload, owned by the request that created it.
///
/// The file is deleted by [`TempAsset::release`]; if the handle is dropped without
/// being released (cancelled request, early return, panic) `Drop` deletes it instead.
#[derive(Debug)]
pub struct TempAsset {
    path: PathBuf,
    file_name: String,
    released: bool,
}

impl TempAsset {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Deletes the file. Failures are logged, never returned.
    pub async fn release(mut self) {
        let result = tokio::fs::remove_file(&self.path).await;
        self.released = true;
        match result {
            Ok(()) => debug!("Removed temporary file {:?}", self.path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("Temporary file {:?} was already gone", self.path)
            }
            Err(e) => warn!("Failed to remove temporary file {:?}: {}", self.path, e),
        }
    }
}

impl Drop for TempAsset {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed unreleased temporary file {:?}", self.path),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove unreleased temporary file {:?}: {}",
                self.path, e
            ),
        }
    }
}

fn unique_file_name(original_name: &str) -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    let nonce = Uuid::new_v4().simple().to_string();
    format!(
        "{}-{}-{}",
        millis,
        &nonce[..8],
        sanitize_file_name(&recover_utf8(original_name))
    )
}

/// Undoes the Latin-1 decoding some clients apply to UTF-8 file names.
/// Names that do not look like mangled UTF-8 are returned unchanged.
pub fn recover_utf8(name: &str) -> String {
    let mut bytes = Vec::with_capacity(name.len());
    let mut saw_high = false;
    for c in name.chars() {
        let code = c as u32;
        if code > 0xFF {
            return name.to_string();
        }
        saw_high |= code >= 0x80;
        bytes.push(code as u8);
    }
    if !saw_high {
        return name.to_string();
    }
    String::from_utf8(bytes).unwrap_or_else(|_| name.to_string())
}

/// Reduces a client-supplied name to a safe single path component.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let mut sanitized = String::new();
    for c in base.chars() {
        let c = if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
            c
        } else {
            '_'
        };
        if sanitized.len() + c.len_utf8() > MAX_NAME_BYTES {
            break;
        }
        sanitized.push(c);
    }

    if sanitized.trim_matches('.').is_empty() {
        FALLBACK_NAME.to_string()
    } else {
        sanitized
    }
}
