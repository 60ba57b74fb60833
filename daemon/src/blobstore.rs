use anyhow::{Context, Result};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Written,
    AlreadyExists,
}

/// Destination for backed-up files. The backup runner only ever talks to this
/// trait, so swapping in a remote object store is a construction-time choice.
pub trait BlobStore: Send + Sync {
    /// Stores `data` under `name`. When `overwrite` is false and the blob is
    /// already present, nothing is written and `AlreadyExists` is returned.
    fn put(&self, name: &str, data: &[u8], overwrite: bool) -> Result<PutOutcome>;
}

/// Directory-backed store: each blob name becomes a path under the root.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl BlobStore for DirStore {
    fn put(&self, name: &str, data: &[u8], overwrite: bool) -> Result<PutOutcome> {
        let path = self.root.join(name.trim_start_matches('/'));
        if !overwrite && path.exists() {
            return Ok(PutOutcome::AlreadyExists);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating blob directory {}", parent.display()))?;
        }
        fs::write(&path, data).with_context(|| format!("writing blob {}", path.display()))?;
        Ok(PutOutcome::Written)
    }
}
