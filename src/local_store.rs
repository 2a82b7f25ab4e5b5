use std::{collections::HashMap, ffi::OsString, fmt, path::PathBuf, sync::Arc};

use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    fs,
    sync::{Mutex, RwLock},
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Prefix shared by every cache key.
pub const KEY_PREFIX: &str = "nitcat";

/// Cache entries, each addressed by a fixed name plus a user or device id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
    Devices(Uuid),
    ChartData(Uuid),
    /// Global thresholds of a user.
    Thresholds(Uuid),
    DeviceThresholds(Uuid),
    Profile(Uuid),
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (name, id) = match self {
            StorageKey::Devices(id) => ("devices", id),
            StorageKey::ChartData(id) => ("chart-data", id),
            StorageKey::Thresholds(id) => ("thresholds", id),
            StorageKey::DeviceThresholds(id) => ("device-thresholds", id),
            StorageKey::Profile(id) => ("profile", id),
        };
        write!(f, "{KEY_PREFIX}-{name}-{id}")
    }
}

/// Key-value cache of JSON documents, shared across tasks.
///
/// Values are kept as raw JSON text so a corrupt entry only fails at the
/// read site, where it is logged and treated as absent. When a snapshot path
/// is configured every write is mirrored to that file; snapshot failures are
/// logged and swallowed.
#[derive(Clone, Default)]
pub struct LocalStore {
    inner: Arc<RwLock<HashMap<String, String>>>,
    snapshot: Option<Arc<PathBuf>>,
    /// Held for the whole encode-write-rename of one snapshot.
    persist_lock: Arc<Mutex<()>>,
}

impl LocalStore {
    /// Memory-only store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store backed by a JSON snapshot at `path`, loading it if present.
    ///
    /// A missing or unreadable snapshot starts the cache empty.
    pub async fn with_snapshot(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, String>>(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "local_store: snapshot is malformed, starting empty");
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "local_store: failed to read snapshot, starting empty");
                HashMap::new()
            }
        };
        debug!(path = %path.display(), entries = entries.len(), "local_store: loaded");

        Self {
            inner: Arc::new(RwLock::new(entries)),
            snapshot: Some(Arc::new(path)),
            persist_lock: Arc::default(),
        }
    }

    /// Raw JSON text stored under `key`.
    pub async fn get_raw(&self, key: &StorageKey) -> Option<String> {
        self.inner.read().await.get(&key.to_string()).cloned()
    }

    /// Overwrite `key` with raw text. Used by tests to plant corrupt entries.
    pub async fn set_raw(&self, key: &StorageKey, raw: String) {
        self.inner.write().await.insert(key.to_string(), raw);
        self.persist().await;
    }

    /// Decode the value under `key`, or `None` when absent or malformed.
    pub async fn get<T: DeserializeOwned>(&self, key: &StorageKey) -> Option<T> {
        let raw = self.get_raw(key).await?;
        match serde_json::from_str(&raw) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(key = %key, error = %e, "local_store: ignoring malformed entry");
                None
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &StorageKey, value: &T) {
        match serde_json::to_string(value) {
            Ok(raw) => self.set_raw(key, raw).await,
            Err(e) => warn!(key = %key, error = %e, "local_store: failed to encode entry"),
        }
    }

    /// Read-modify-write `key` under one lock, so concurrent updates of the
    /// same entry never lose each other's changes. An absent or malformed
    /// entry starts from `T::default()`.
    pub async fn update<T, R>(&self, key: &StorageKey, f: impl FnOnce(&mut T) -> R) -> R
    where
        T: Serialize + DeserializeOwned + Default,
    {
        let out = {
            let mut guard = self.inner.write().await;
            let name = key.to_string();
            let mut value: T = match guard.get(&name).map(|raw| serde_json::from_str(raw)) {
                Some(Ok(v)) => v,
                Some(Err(e)) => {
                    warn!(key = %key, error = %e, "local_store: ignoring malformed entry");
                    T::default()
                }
                None => T::default(),
            };
            let out = f(&mut value);
            match serde_json::to_string(&value) {
                Ok(raw) => {
                    guard.insert(name, raw);
                }
                Err(e) => warn!(key = %key, error = %e, "local_store: failed to encode entry"),
            }
            out
        };
        self.persist().await;
        out
    }

    pub async fn remove(&self, key: &StorageKey) {
        self.inner.write().await.remove(&key.to_string());
        self.persist().await;
    }

    async fn persist(&self) {
        let Some(path) = &self.snapshot else {
            return;
        };
        // Encode under the lock: the last file written holds every earlier change.
        let _persisting = self.persist_lock.lock().await;

        let content = {
            let guard = self.inner.read().await;
            match serde_json::to_vec_pretty(&*guard) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "local_store: failed to encode snapshot");
                    return;
                }
            }
        };

        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            if let Err(e) = fs::create_dir_all(dir).await {
                warn!(path = %path.display(), error = %e, "local_store: failed to create directory");
                return;
            }
        }

        let mut tmp = OsString::from(path.as_os_str());
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        if let Err(e) = fs::write(&tmp, &content).await {
            warn!(path = %tmp.display(), error = %e, "local_store: failed to write snapshot");
            return;
        }
        if let Err(e) = fs::rename(&tmp, path.as_path()).await {
            warn!(path = %path.display(), error = %e, "local_store: failed to replace snapshot");
        }
    }
}
