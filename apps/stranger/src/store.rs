//! Single-key scratch storage for the interest list.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use directories::BaseDirs;
use parking_lot::Mutex;
use thiserror::Error;

pub const INTERESTS_KEY: &str = "chatInterests";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("unable to determine data directory")]
    NoDataDir,
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("store file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

pub trait ScratchStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

/// Keeps the scratch map as JSON in one file.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<data dir>/stranger/scratch.json`
    pub fn default_location() -> Result<Self, StoreError> {
        let base = BaseDirs::new().ok_or(StoreError::NoDataDir)?;
        Ok(Self::new(
            base.data_local_dir().join("stranger").join("scratch.json"),
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<HashMap<String, String>, StoreError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let raw = fs::read_to_string(&self.path)?;
        if raw.trim().is_empty() {
            return Ok(HashMap::new());
        }
        Ok(serde_json::from_str(&raw)?)
    }
}

impl ScratchStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.load()?.remove(key))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.load()?;
        entries.insert(key.to_string(), value.to_string());
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let serialized = serde_json::to_string_pretty(&entries)?;
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        file.write_all(serialized.as_bytes())?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl ScratchStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }
}

/// Splits a comma separated list, trimming entries and dropping empty ones.
/// Duplicates and order are kept.
pub fn parse_interests(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|interest| !interest.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn load_interests(store: &dyn ScratchStore) -> Result<Vec<String>, StoreError> {
    Ok(store
        .get(INTERESTS_KEY)?
        .map(|raw| parse_interests(&raw))
        .unwrap_or_default())
}

pub fn save_interests(store: &dyn ScratchStore, interests: &[String]) -> Result<(), StoreError> {
    store.set(INTERESTS_KEY, &interests.join(", "))
}
