//! Scoped file writer.
//!
//! Writes exactly the bytes of an approved step to an already-resolved path.
//! Policy has been decided by the caller; this only guards against the
//! filesystem changing underneath between the decision and the write.

use crate::outcome::OperationOutcome;
use std::path::Path;
use tokio::fs;

/// Default maximum write size (10MB).
pub const DEFAULT_MAX_WRITE_BYTES: usize = 10 * 1024 * 1024;

/// Writer for path-class steps.
#[derive(Debug, Clone)]
pub struct ScopedFileWriter {
    max_write_bytes: usize,
}

impl Default for ScopedFileWriter {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_WRITE_BYTES)
    }
}

impl ScopedFileWriter {
    pub fn new(max_write_bytes: usize) -> Self {
        Self { max_write_bytes }
    }

    pub fn max_write_bytes(&self) -> usize {
        self.max_write_bytes
    }

    /// Check the content size without touching the filesystem.
    pub fn check_size(&self, content: &str) -> Result<(), String> {
        if content.len() > self.max_write_bytes {
            return Err(format!(
                "Content too large: {} bytes (max {} bytes)",
                content.len(),
                self.max_write_bytes
            ));
        }
        Ok(())
    }

    /// Write `content` to `resolved`, creating missing parent directories.
    ///
    /// `resolved` must be absolute and canonical up to its deepest existing
    /// ancestor. If the parent resolves elsewhere once created (a symlink
    /// appeared in between), nothing is written.
    pub async fn write(&self, resolved: &Path, content: &str) -> OperationOutcome {
        if let Err(e) = self.check_size(content) {
            return OperationOutcome::failed(e);
        }

        let Some(parent) = resolved.parent() else {
            return OperationOutcome::failed(format!(
                "Invalid path: {} has no parent",
                resolved.display()
            ));
        };

        if let Err(e) = fs::create_dir_all(parent).await {
            return OperationOutcome::failed(format!(
                "Failed to create directory {}: {e}",
                parent.display()
            ));
        }

        match fs::canonicalize(parent).await {
            Ok(actual) if actual == parent => {}
            Ok(actual) => {
                tracing::warn!(
                    expected = %parent.display(),
                    actual = %actual.display(),
                    "Parent directory moved before write"
                );
                return OperationOutcome::failed(format!(
                    "Path changed before write: {}",
                    resolved.display()
                ));
            }
            Err(e) => {
                return OperationOutcome::failed(format!(
                    "Cannot resolve {}: {e}",
                    parent.display()
                ))
            }
        }

        if let Ok(meta) = fs::symlink_metadata(resolved).await {
            if meta.file_type().is_symlink() {
                return OperationOutcome::failed(format!(
                    "Refusing to write through symlink: {}",
                    resolved.display()
                ));
            }
        }

        match fs::write(resolved, content.as_bytes()).await {
            Ok(()) => {
                tracing::debug!(path = %resolved.display(), bytes = content.len(), "File written");
                OperationOutcome::Wrote {
                    path: resolved.to_path_buf(),
                    bytes: content.len() as u64,
                }
            }
            Err(e) => OperationOutcome::failed(format!(
                "Failed to write {}: {e}",
                resolved.display()
            )),
        }
    }
}
