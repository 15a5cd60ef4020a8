//! Key-value storage with a `localStorage`-shaped contract.
//!
//! - [`MemoryStorage`]: in-memory, with a capacity ceiling and a switchable
//!   quota-exceeded flag for exercising failure paths
//! - [`FileStorage`]: the same contract persisted as a JSON object file
//!
//! Keys are kept sorted, so `key(index)` is stable between calls.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::StorageError;

/// Default ceiling, matching common browser `localStorage` quotas.
pub const DEFAULT_CAPACITY_BYTES: usize = 5 * 1024 * 1024;

pub trait Storage {
    fn get_item(&self, key: &str) -> Option<String>;
    fn set_item(&mut self, key: &str, value: &str) -> Result<(), StorageError>;
    fn remove_item(&mut self, key: &str);
    fn clear(&mut self);
    /// The key at `index` in key order.
    fn key(&self, index: usize) -> Option<String>;
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn entry_size(key: &str, value: &str) -> usize {
    key.len() + value.len()
}

#[derive(Debug, Clone)]
pub struct MemoryStorage {
    items: BTreeMap<String, String>,
    size: usize,
    capacity: usize,
    quota_exceeded: bool,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::with_capacity_limit(DEFAULT_CAPACITY_BYTES)
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity_limit(capacity: usize) -> Self {
        Self {
            items: BTreeMap::new(),
            size: 0,
            capacity,
            quota_exceeded: false,
        }
    }

    /// While set, every write fails with `QuotaExceeded`.
    pub fn set_quota_exceeded(&mut self, exceeded: bool) {
        self.quota_exceeded = exceeded;
    }

    /// Aggregate key + value bytes currently stored.
    pub fn size_bytes(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Storage for MemoryStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        self.items.get(key).cloned()
    }

    fn set_item(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        let replaced = self.items.get(key).map_or(0, |old| entry_size(key, old));
        let requested = self.size - replaced + entry_size(key, value);

        if self.quota_exceeded || requested > self.capacity {
            debug!("Rejecting write of '{key}': {requested} > {} bytes", self.capacity);
            return Err(StorageError::QuotaExceeded {
                requested,
                limit: self.capacity,
            });
        }

        self.items.insert(key.to_string(), value.to_string());
        self.size = requested;
        Ok(())
    }

    fn remove_item(&mut self, key: &str) {
        if let Some(old) = self.items.remove(key) {
            self.size -= entry_size(key, &old);
        }
    }

    fn clear(&mut self) {
        self.items.clear();
        self.size = 0;
    }

    fn key(&self, index: usize) -> Option<String> {
        self.items.keys().nth(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// JSON-file backed storage, rewritten after every mutation.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    items: BTreeMap<String, String>,
}

impl FileStorage {
    /// Open `path`, starting empty if it does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let path = path.into();
        let items = match fs::read_to_string(&path) {
            Ok(contents) if contents.trim().is_empty() => BTreeMap::new(),
            Ok(contents) => serde_json::from_str(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(io_error(&path, e)),
        };
        debug!("Opened storage {} ({} keys)", path.display(), items.len());
        Ok(Self { path, items })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<(), StorageError> {
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;
        }
        let json = serde_json::to_string_pretty(&self.items)?;
        fs::write(&self.path, json).map_err(|e| io_error(&self.path, e))
    }

    fn flush_or_warn(&self) {
        if let Err(e) = self.flush() {
            warn!("Failed to write storage {}: {e}", self.path.display());
        }
    }
}

fn io_error(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.display().to_string(),
        source,
    }
}

impl Storage for FileStorage {
    fn get_item(&self, key: &str) -> Option<String> {
        self.items.get(key).cloned()
    }

    fn set_item(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        let previous = self.items.insert(key.to_string(), value.to_string());
        if let Err(e) = self.flush() {
            // Keep memory and disk in step.
            match previous {
                Some(old) => self.items.insert(key.to_string(), old),
                None => self.items.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove_item(&mut self, key: &str) {
        if self.items.remove(key).is_some() {
            self.flush_or_warn();
        }
    }

    fn clear(&mut self) {
        self.items.clear();
        self.flush_or_warn();
    }

    fn key(&self, index: usize) -> Option<String> {
        self.items.keys().nth(index).cloned()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}
