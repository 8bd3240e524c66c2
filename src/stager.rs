//! Local staging of attachments for the print spooler.
//!
//! Files are named by position in the selected attachment list
//! (`attach-00.pdf`, `attach-01.pdf`, ...), so a later message simply
//! overwrites leftovers with the same index.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{info, warn};

use crate::config::StagingConfig;
use crate::decoder::MessagePart;
use crate::error::StageError;

/// What happens to staged files after dispatch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RetentionPolicy {
    /// Remove them.
    #[default]
    Delete,
    /// Leave them on disk.
    Keep,
}

/// A staged attachment. Lives from staging until cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedAttachment {
    pub filename: String,
    pub path: PathBuf,
}

/// Writes attachments into the staging directory.
#[derive(Debug, Clone)]
pub struct AttachmentStager {
    dir: PathBuf,
    extension: String,
    retention: RetentionPolicy,
}

impl AttachmentStager {
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
            retention: RetentionPolicy::Delete,
        }
    }

    pub fn from_config(config: &StagingConfig) -> Self {
        let retention = if config.keep_attachments {
            RetentionPolicy::Keep
        } else {
            RetentionPolicy::Delete
        };
        Self::new(&config.dir, &config.extension).with_retention(retention)
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn retention(&self) -> RetentionPolicy {
        self.retention
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Deterministic file name for the attachment at `index`.
    pub fn file_name(&self, index: usize) -> String {
        format!("attach-{index:02}.{}", self.extension)
    }

    /// Write every part's payload to its own file.
    ///
    /// On failure, files already written by this call are removed before
    /// the error is returned.
    pub async fn stage(&self, parts: &[MessagePart]) -> Result<Vec<StagedAttachment>, StageError> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StageError::Io {
                path: self.dir.clone(),
                source,
            })?;

        let mut staged = Vec::with_capacity(parts.len());
        for (index, part) in parts.iter().enumerate() {
            let filename = self.file_name(index);
            let path = self.dir.join(&filename);
            info!(index, file = %path.display(), bytes = part.payload.len(), "Saving attachment");

            if let Err(source) = fs::write(&path, &part.payload).await {
                if let Err(e) = self.cleanup(&staged).await {
                    warn!("Cleanup after failed staging also failed: {e}");
                }
                return Err(StageError::Io { path, source });
            }
            staged.push(StagedAttachment { filename, path });
        }
        Ok(staged)
    }

    /// Remove every staged file.
    ///
    /// Keeps going past failures and reports the first one. A file that is
    /// already gone counts as removed.
    pub async fn cleanup(&self, staged: &[StagedAttachment]) -> Result<(), StageError> {
        let mut first_err = None;
        for attachment in staged {
            info!(file = %attachment.path.display(), "Deleting staged file");
            match fs::remove_file(&attachment.path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    warn!(file = %attachment.path.display(), "Failed to delete staged file: {source}");
                    first_err.get_or_insert(StageError::Io {
                        path: attachment.path.clone(),
                        source,
                    });
                }
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}
