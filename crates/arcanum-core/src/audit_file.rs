//! File-based audit backend for `Arcanum`.
//!
//! Appends JSON-lines audit events to a file. Each line is a complete JSON
//! object representing one [`AuditEvent`]. The file is opened in append-only
//! mode; no update or delete operations are ever performed.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::audit::{AuditBackend, AuditEvent};
use crate::error::AuditError;

/// Audit backend that writes JSON-lines to a file.
pub struct FileAuditBackend {
    path: PathBuf,
    /// Opened lazily on first write, then reused.
    writer: Mutex<Option<File>>,
}

impl FileAuditBackend {
    /// Create a new file audit backend writing to the given path.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: Mutex::new(None),
        }
    }

    fn failure(&self, reason: String) -> AuditError {
        AuditError::BackendFailure {
            name: format!("file:{}", self.path.display()),
            reason,
        }
    }
}

#[async_trait::async_trait]
impl AuditBackend for FileAuditBackend {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "file"
    }

    async fn log(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(event).map_err(|e| AuditError::Serialization {
            reason: e.to_string(),
        })?;
        line.push(b'\n');

        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| self.failure(format!("open failed: {e}")))?;
            *guard = Some(file);
        }
        let file = guard
            .as_mut()
            .ok_or_else(|| self.failure("file handle missing after open".to_owned()))?;

        file.write_all(&line)
            .await
            .map_err(|e| self.failure(format!("write failed: {e}")))?;
        file.flush()
            .await
            .map_err(|e| self.failure(format!("flush failed: {e}")))?;
        Ok(())
    }
}

impl std::fmt::Debug for FileAuditBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAuditBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}
