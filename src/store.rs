//! Step output persistence.
//!
//! A [`StepStore`] lets a pipeline adopt a previously computed step output
//! instead of recomputing it. The store owns its key (typically a file
//! path); the pipeline only ever asks it to load or save. A missing or
//! failed load means "no cached data", never an error, and a failed save is
//! logged by the caller and tolerated.

use std::io::ErrorKind;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Durable storage for a single step's output.
#[async_trait]
pub trait StepStore<T>: Send + Sync {
    /// Load the previously saved output, or `None` if nothing was saved.
    async fn load(&self) -> anyhow::Result<Option<T>>;

    /// Save the output.
    async fn save(&self, data: &T) -> anyhow::Result<()>;
}

/// File-backed store that round-trips the output through JSON.
pub struct JsonFileStore<T> {
    path: PathBuf,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonFileStore<T> {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            _marker: PhantomData,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl<T> StepStore<T> for JsonFileStore<T>
where
    T: Serialize + DeserializeOwned + Send + Sync,
{
    async fn load(&self) -> anyhow::Result<Option<T>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(error.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    async fn save(&self, data: &T) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&self.path, serde_json::to_vec_pretty(data)?).await?;
        Ok(())
    }
}

/// In-memory store holding a single slot. Clones share the slot, so a fresh
/// step instance can be pointed at the same store. Useful for tests and
/// for pipelines that re-run within one process.
pub struct MemoryStore<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> MemoryStore<T> {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Whether the store currently holds a saved output.
    pub fn is_populated(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }
}

impl<T> Default for MemoryStore<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for MemoryStore<T> {
    fn clone(&self) -> Self {
        Self {
            slot: self.slot.clone(),
        }
    }
}

#[async_trait]
impl<T> StepStore<T> for MemoryStore<T>
where
    T: Clone + Send + Sync,
{
    async fn load(&self) -> anyhow::Result<Option<T>> {
        Ok(self.slot.lock().unwrap().clone())
    }

    async fn save(&self, data: &T) -> anyhow::Result<()> {
        *self.slot.lock().unwrap() = Some(data.clone());
        Ok(())
    }
}
