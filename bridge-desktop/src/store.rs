//! Durable key-value storage backed by a JSON file

use bridge_traits::{
    error::{BridgeError, Result},
    storage::KeyValueStore,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

const DEFAULT_FILE_NAME: &str = "session-store.json";

/// File-backed [`KeyValueStore`] for desktop hosts.
///
/// The whole map is loaded once and written through on every mutation,
/// which mirrors the semantics of browser `localStorage`.
pub struct FileKeyValueStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileKeyValueStore {
    /// Open (or create) a store at `path`.
    ///
    /// A missing file starts empty. A corrupt file is logged and replaced on
    /// the next write rather than failing startup.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let entries = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!(path = ?path, error = %e, "Discarding unreadable session store");
                BTreeMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(BridgeError::Io(e)),
        };

        debug!(path = ?path, entries = entries.len(), "Opened session store");

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Open the store in the per-user data directory.
    pub fn open_default(app_name: &str) -> Result<Self> {
        Self::open(Self::default_path(app_name)?)
    }

    /// `<data dir>/<app_name>/session-store.json`
    pub fn default_path(app_name: &str) -> Result<PathBuf> {
        let base = dirs::data_dir().ok_or_else(|| {
            BridgeError::NotAvailable("No per-user data directory on this host".to_string())
        })?;
        Ok(base.join(app_name).join(DEFAULT_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self, entries: &BTreeMap<String, String>) -> Result<()> {
        let json = serde_json::to_vec_pretty(entries)
            .map_err(|e| BridgeError::Storage(format!("Failed to encode store: {}", e)))?;

        // Write to a sibling and rename so a crash never leaves a torn file.
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get_item(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(key).cloned())
    }

    fn set_item(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(key.to_string(), value.to_string());
        self.persist(&entries)
    }

    fn remove_item(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if entries.remove(key).is_some() {
            self.persist(&entries)?;
        }
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.keys().cloned().collect())
    }
}
