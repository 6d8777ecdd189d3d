//! Durable persistence for the state blob.
//!
//! The engine checkpoints the whole [`TapState`] after each completed batch,
//! each pass completion, and at run end. Storage backends implement
//! [`StateStore`]; the filesystem backend writes atomically so an
//! interrupted run never leaves a torn blob behind.

use crate::state::TapState;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;

#[async_trait]
pub trait StateStore: Send + Sync {
    async fn persist(&self, state: &TapState) -> Result<()>;

    /// Load the previously persisted state, or `None` when nothing has been
    /// persisted yet.
    async fn load(&self) -> Result<Option<TapState>>;
}

/// Stores the state blob as a single JSON file, written via a temporary
/// file and rename so readers never observe a partial write.
pub struct FilesystemStore {
    path: PathBuf,
}

impl FilesystemStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FilesystemStore { path: path.into() }
    }
}

#[async_trait]
impl StateStore for FilesystemStore {
    async fn persist(&self, state: &TapState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("creating state directory {}", parent.display()))?;
            }
        }

        let blob = serde_json::to_string_pretty(state)?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, blob)
            .with_context(|| format!("writing state file {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("installing state file {}", self.path.display()))?;

        tracing::debug!(path = %self.path.display(), "persisted state blob");
        Ok(())
    }

    async fn load(&self) -> Result<Option<TapState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let blob = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading state file {}", self.path.display()))?;
        let state = serde_json::from_str(&blob)
            .with_context(|| format!("parsing state file {}", self.path.display()))?;
        Ok(Some(state))
    }
}

/// Discards every checkpoint. Used when the caller keeps state itself, and
/// by tests that only inspect emitted state messages.
pub struct NullStore;

#[async_trait]
impl StateStore for NullStore {
    async fn persist(&self, _state: &TapState) -> Result<()> {
        Ok(())
    }

    async fn load(&self) -> Result<Option<TapState>> {
        Ok(None)
    }
}
