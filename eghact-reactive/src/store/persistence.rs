//! Persistence backends for stores.
//!
//! A store with a backend restores its value from `key = store name` when it
//! is created and saves after every local write that changed the value.
//! Restores coming from snapshots or time travel are never saved back.
//!
//! Backend failures never reach the caller of `set`: the store logs them and
//! keeps working in memory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{Result, StateError};

/// Largest value file `JsonFilePersistence` will read.
pub const MAX_PERSISTED_BYTES: u64 = 16 * 1024 * 1024;

/// Storage capability injected into stores.
pub trait Persistence: Send + Sync {
    /// Load the value saved under `key`, if any.
    fn restore(&self, key: &str) -> Result<Option<Value>>;

    /// Save `value` under `key`, replacing whatever was there.
    fn save(&self, key: &str, value: &Value) -> Result<()>;
}

/// In-process backend, mostly useful for tests and server-side rendering.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    entries: Mutex<HashMap<String, Value>>,
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read an entry without going through the trait.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.lock().get(key).cloned()
    }

    pub fn insert(&self, key: impl Into<String>, value: Value) {
        self.entries.lock().insert(key.into(), value);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Persistence for MemoryPersistence {
    fn restore(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.get(key))
    }

    fn save(&self, key: &str, value: &Value) -> Result<()> {
        self.insert(key, value.clone());
        Ok(())
    }
}

/// One `<key>.json` file per store inside a directory.
#[derive(Debug, Clone)]
pub struct JsonFilePersistence {
    dir: PathBuf,
}

impl JsonFilePersistence {
    /// Use `dir` for value files, creating it if needed.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File that holds `key`. Characters outside `[A-Za-z0-9._-]` become `_`.
    pub fn path_for(&self, key: &str) -> PathBuf {
        let file: String = key
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{file}.json"))
    }
}

impl Persistence for JsonFilePersistence {
    fn restore(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key);
        let len = match std::fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        if len > MAX_PERSISTED_BYTES {
            return Err(StateError::Persistence(format!(
                "{} is {len} bytes (limit {MAX_PERSISTED_BYTES})",
                path.display()
            )));
        }

        let text = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&text)?))
    }

    fn save(&self, key: &str, value: &Value) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec(value)?)?;
        std::fs::rename(&tmp, &path)?;
        debug!(key, path = %path.display(), "value saved");
        Ok(())
    }
}

/// Moves saves of another backend onto tokio's blocking pool.
///
/// `save` returns as soon as the job is spawned; the outcome is only logged.
/// `restore` stays synchronous because it runs once, at store creation.
pub struct BackgroundPersistence {
    inner: Arc<dyn Persistence>,
    handle: Handle,
    pending: Mutex<Vec<JoinHandle<()>>>,
}

impl BackgroundPersistence {
    pub fn new(inner: Arc<dyn Persistence>, handle: Handle) -> Self {
        Self {
            inner,
            handle,
            pending: Mutex::new(Vec::new()),
        }
    }

    /// Wrap `inner` using the tokio runtime of the calling context.
    pub fn current(inner: Arc<dyn Persistence>) -> Result<Self> {
        let handle = Handle::try_current()
            .map_err(|e| StateError::Persistence(format!("no tokio runtime: {e}")))?;
        Ok(Self::new(inner, handle))
    }

    /// Number of saves spawned and not yet awaited by [`flush`](Self::flush).
    pub fn pending(&self) -> usize {
        let mut pending = self.pending.lock();
        pending.retain(|job| !job.is_finished());
        pending.len()
    }

    /// Wait for every save spawned so far.
    pub async fn flush(&self) {
        let jobs = std::mem::take(&mut *self.pending.lock());
        for job in jobs {
            if let Err(err) = job.await {
                warn!(error = %err, "background save task failed");
            }
        }
    }
}

impl Persistence for BackgroundPersistence {
    fn restore(&self, key: &str) -> Result<Option<Value>> {
        self.inner.restore(key)
    }

    fn save(&self, key: &str, value: &Value) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        let value = value.clone();
        let job = self.handle.spawn_blocking(move || match inner.save(&key, &value) {
            Ok(()) => debug!(key = %key, "background save finished"),
            Err(err) => warn!(key = %key, error = %err, "background save failed"),
        });
        self.pending.lock().push(job);
        Ok(())
    }
}

impl std::fmt::Debug for BackgroundPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundPersistence")
            .field("pending", &self.pending.lock().len())
            .finish()
    }
}
