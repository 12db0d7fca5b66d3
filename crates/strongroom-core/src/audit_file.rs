//! File audit backend.
//!
//! Appends one JSON object per line. The file is opened lazily in append
//! mode on the first event and never rewritten.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};

use crate::audit::{AuditBackend, AuditEvent};
use crate::error::AuditError;

const NAME: &str = "file";

/// Audit backend that writes JSON lines to a file.
pub struct FileAuditBackend {
    path: PathBuf,
    writer: Mutex<Option<File>>,
}

impl FileAuditBackend {
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: Mutex::new(None),
        }
    }

    fn failure(reason: String) -> AuditError {
        AuditError::BackendFailure {
            name: NAME.to_owned(),
            reason,
        }
    }

    async fn writer(&self) -> Result<MutexGuard<'_, Option<File>>, AuditError> {
        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| {
                    Self::failure(format!(
                        "failed to open audit file '{}': {e}",
                        self.path.display()
                    ))
                })?;
            *guard = Some(file);
        }
        Ok(guard)
    }
}

#[async_trait::async_trait]
impl AuditBackend for FileAuditBackend {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        NAME
    }

    async fn log(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(event).map_err(|e| AuditError::Serialization {
            reason: e.to_string(),
        })?;
        line.push(b'\n');

        let mut guard = self.writer().await?;
        let Some(file) = guard.as_mut() else {
            return Err(Self::failure("file handle missing after open".to_owned()));
        };

        file.write_all(&line)
            .await
            .map_err(|e| Self::failure(format!("write failed: {e}")))?;
        file.flush()
            .await
            .map_err(|e| Self::failure(format!("flush failed: {e}")))?;
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

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::audit::EventKind;

    #[tokio::test]
    async fn appends_one_json_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let backend = FileAuditBackend::new(&path);

        backend
            .log(&AuditEvent::success(EventKind::VaultInitialized, "root"))
            .await
            .unwrap();
        backend
            .log(&AuditEvent::success(EventKind::SecretWritten, "alice").resource("db/creds"))
            .await
            .unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let second: AuditEvent = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(second.kind, EventKind::SecretWritten);
        assert_eq!(second.resource.as_deref(), Some("db/creds"));
    }

    #[tokio::test]
    async fn unopenable_path_reports_backend_failure() {
        let backend = FileAuditBackend::new("/nonexistent-dir/strongroom/audit.jsonl");
        let err = backend
            .log(&AuditEvent::success(EventKind::VaultSealed, "root"))
            .await
            .unwrap_err();
        assert!(matches!(err, AuditError::BackendFailure { .. }));
    }
}
