//! Temporary storage for chunk sessions and staged downloads.
//!
//! ```text
//! {root}/
//! ├── chunks/{cid}/{part}      chunk parts of one upload session
//! ├── merged-{uuid}.part       assembled upload waiting for commit
//! └── zipdl-{uuid}.zip         staged ZIP download
//! ```
//!
//! Nothing here lives under a volume root, so it never counts against a quota.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::codec::is_url_safe;
use crate::{ConnectorError, Result};

/// Key prefix of staged ZIP downloads.
pub const ZIPDL_PREFIX: &str = "zipdl-";
/// Key prefix of merged chunk uploads.
pub const MERGED_PREFIX: &str = "merged-";

const CHUNK_DIR: &str = "chunks";

/// Temp directory with TTL cleanup.
#[derive(Debug)]
pub struct TempStore {
    root: PathBuf,
    ttl: Duration,
}

impl TempStore {
    /// Create the store, creating `root` if needed.
    pub fn new(root: impl Into<PathBuf>, ttl: Duration) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(CHUNK_DIR))?;
        Ok(Self { root, ttl })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the parts of chunk session `cid`.
    pub fn chunk_dir(&self, cid: &str) -> Result<PathBuf> {
        if cid.is_empty() || !is_url_safe(cid) {
            return Err(ConnectorError::CommandParams("upload".to_string()));
        }
        Ok(self.root.join(CHUNK_DIR).join(cid))
    }

    /// Reserve a new staged file. Returns its key and path.
    pub fn stage(&self, prefix: &str, extension: &str) -> (String, PathBuf) {
        let key = format!("{prefix}{}", Uuid::new_v4().simple());
        let path = self.root.join(format!("{key}.{extension}"));
        (key, path)
    }

    /// Path of a staged file from its key, checking the key's shape.
    pub fn staged(&self, prefix: &str, key: &str, extension: &str) -> Result<PathBuf> {
        let valid = key
            .strip_prefix(prefix)
            .is_some_and(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_hexdigit()));
        if !valid {
            return Err(ConnectorError::FileNotFound);
        }
        let path = self.root.join(format!("{key}.{extension}"));
        if !path.is_file() {
            return Err(ConnectorError::FileNotFound);
        }
        Ok(path)
    }

    /// Remove a file or directory, ignoring a missing one.
    pub async fn remove(&self, path: &Path) {
        let result = match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(path).await,
            Ok(_) => tokio::fs::remove_file(path).await,
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Failed to remove temp entry");
        }
    }

    /// Remove staged files and chunk sessions older than the TTL.
    pub fn sweep(&self) -> Result<usize> {
        let cutoff = SystemTime::now()
            .checked_sub(self.ttl)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut removed = 0;

        for dir in [self.root.clone(), self.root.join(CHUNK_DIR)] {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.file_name().is_some_and(|n| n == CHUNK_DIR) && dir == self.root {
                    continue;
                }
                let Ok(meta) = entry.metadata() else {
                    continue;
                };
                let expired = meta.modified().map(|m| m < cutoff).unwrap_or(false);
                if !expired {
                    continue;
                }
                let result = if meta.is_dir() {
                    fs::remove_dir_all(&path)
                } else {
                    fs::remove_file(&path)
                };
                match result {
                    Ok(()) => removed += 1,
                    Err(e) => warn!(path = %path.display(), error = %e, "Failed to sweep temp entry"),
                }
            }
        }
        Ok(removed)
    }

    /// Start the background TTL sweep.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            interval.tick().await;

            loop {
                interval.tick().await;
                let Some(store) = weak.upgrade() else {
                    break;
                };
                match tokio::task::spawn_blocking(move || store.sweep()).await {
                    Ok(Ok(removed)) if removed > 0 => debug!(removed, "Temp sweep"),
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => warn!(error = %e, "Temp sweep failed"),
                    Err(e) => warn!(error = %e, "Temp sweep task failed"),
                }
            }
        })
    }
}
