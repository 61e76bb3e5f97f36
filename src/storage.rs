//! Durable client storage
//!
//! A string key/value store with the semantics of browser local storage:
//! synchronous, whole values, no transactions. Every read goes to the
//! backing medium, so two handles over the same file observe each other's
//! writes on their next read.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use crate::{Result, StorefrontError};

pub const GUEST_CART_KEY: &str = "storefront.cart";
pub const SESSION_KEY: &str = "storefront.session";
pub const SEARCH_HISTORY_KEY: &str = "storefront.searchHistory";

pub trait Storage: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

pub type SharedStorage = Arc<dyn Storage>;

/// JSON object on disk, one entry per key.
#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStorage {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StorefrontError::Storage(format!("create {}: {e}", parent.display())))?;
        }
        debug!(path = %path.display(), "Opened file storage");
        Ok(Self { path, lock: Mutex::new(()) })
    }

    pub fn path(&self) -> &Path { &self.path }

    fn read_all(&self) -> Result<BTreeMap<String, String>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(StorefrontError::Storage(format!("read {}: {e}", self.path.display()))),
        };
        match serde_json::from_str(&raw) {
            Ok(map) => Ok(map),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Storage file is corrupt, starting empty");
                Ok(BTreeMap::new())
            }
        }
    }

    fn write_all(&self, map: &BTreeMap<String, String>) -> Result<()> {
        let json = serde_json::to_string_pretty(map).map_err(|e| StorefrontError::Storage(e.to_string()))?;
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, json).map_err(|e| StorefrontError::Storage(format!("write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path).map_err(|e| StorefrontError::Storage(format!("replace {}: {e}", self.path.display())))
    }

    fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.lock.lock().map_err(|_| StorefrontError::Storage("storage lock poisoned".into()))
    }
}

impl Storage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.guard()?;
        Ok(self.read_all()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.guard()?;
        let mut map = self.read_all()?;
        map.insert(key.to_string(), value.to_string());
        self.write_all(&map)
    }

    fn remove(&self, key: &str) -> Result<()> {
        let _guard = self.guard()?;
        let mut map = self.read_all()?;
        if map.remove(key).is_some() { self.write_all(&map)?; }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self { Self::default() }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, String>>> {
        self.entries.lock().map_err(|_| StorefrontError::Storage("storage lock poisoned".into()))
    }
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<String>> { Ok(self.entries()?.get(key).cloned()) }
    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.entries()?.insert(key.to_string(), value.to_string());
        Ok(())
    }
    fn remove(&self, key: &str) -> Result<()> {
        self.entries()?.remove(key);
        Ok(())
    }
}

/// Recently submitted search terms, newest first.
#[derive(Clone)]
pub struct SearchHistory {
    storage: SharedStorage,
}

impl SearchHistory {
    pub const CAPACITY: usize = 6;

    pub fn new(storage: SharedStorage) -> Self { Self { storage } }

    pub fn terms(&self) -> Result<Vec<String>> {
        Ok(self
            .storage
            .get(SEARCH_HISTORY_KEY)?
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default())
    }

    /// Moves `term` to the front; blank terms are ignored.
    pub fn record(&self, term: &str) -> Result<Vec<String>> {
        let term = term.trim();
        if term.is_empty() { return self.terms(); }
        let mut terms: Vec<String> = self.terms()?.into_iter().filter(|t| t != term).collect();
        terms.insert(0, term.to_string());
        terms.truncate(Self::CAPACITY);
        let json = serde_json::to_string(&terms).map_err(|e| StorefrontError::Storage(e.to_string()))?;
        self.storage.set(SEARCH_HISTORY_KEY, &json)?;
        Ok(terms)
    }

    pub fn clear(&self) -> Result<()> { self.storage.remove(SEARCH_HISTORY_KEY) }
}
