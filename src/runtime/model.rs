//! Loaded model handles

use chrono::{DateTime, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

use super::{ModelBackend, ModelInfo, ModelLoader};
use crate::error::Result;

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Immutable handle to a loaded model.
///
/// Cloning is cheap; every clone refers to the same weights. Two handles
/// compare equal only if they came from the same load call.
#[derive(Clone)]
pub struct ModelHandle {
    id: u64,
    path: PathBuf,
    loaded_at: DateTime<Utc>,
    backend: Arc<dyn ModelBackend>,
}

impl ModelHandle {
    /// Load a model through `loader`.
    ///
    /// Nothing is replaced here; callers keep their previous handle until
    /// this returns `Ok`.
    pub fn load(loader: &dyn ModelLoader, path: &Path) -> Result<Self> {
        let backend = loader.load(path)?;
        let handle = Self::from_backend(path, backend);
        info!(
            "Loaded model '{}' from {} (vocab {}, context {})",
            handle.info().name,
            path.display(),
            handle.info().vocab_size,
            handle.info().context_length
        );
        Ok(handle)
    }

    /// Wrap an already constructed backend.
    pub fn from_backend(path: impl Into<PathBuf>, backend: Arc<dyn ModelBackend>) -> Self {
        Self {
            id: NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed),
            path: path.into(),
            loaded_at: Utc::now(),
            backend,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    pub fn info(&self) -> &ModelInfo {
        self.backend.info()
    }

    pub fn backend(&self) -> &dyn ModelBackend {
        self.backend.as_ref()
    }
}

impl PartialEq for ModelHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ModelHandle {}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("id", &self.id)
            .field("path", &self.path)
            .field("name", &self.info().name)
            .finish()
    }
}
