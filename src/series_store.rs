// =============================================================================
// Series Store - durable per-key persistence of accumulated series
// =============================================================================
//
// One JSON record per series key:
//   { "open": [..], "high": [..], "low": [..], "close": [..], "labels": [..] }
//
// A missing record is an empty series; a record that fails to decode or
// validate is reset to empty on disk and reported as a warning. Only an
// unreadable backend makes `load` fail, and the caller must then keep the
// stored record untouched.
// Writes go through a tmp file + rename so a crash mid-write never leaves a
// half-written record behind.
// =============================================================================

use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::diagnostics::Diagnostics;
use crate::error::IngestError;
use crate::market_data::{Series, SeriesRecord};
use crate::types::SeriesKey;

// =============================================================================
// Storage backends
// =============================================================================

/// Process-wide key-value namespace holding serialized records.
pub trait Storage: Send + Sync {
    /// Raw record bytes, `Ok(None)` when no record exists under `name`.
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>>;
    fn write(&self, name: &str, value: &str) -> Result<()>;
}

/// One `<name>.json` file per record inside a directory.
pub struct DirStorage {
    dir: PathBuf,
}

impl DirStorage {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create series directory {}", dir.display()))?;
        info!(dir = %dir.display(), "series store opened");
        Ok(Self { dir })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{name}.json"))
    }
}

impl Storage for DirStorage {
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(name);
        match std::fs::read(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    fn write(&self, name: &str, value: &str) -> Result<()> {
        let path = self.path_for(name);
        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, value)
            .with_context(|| format!("failed to write tmp record to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &path)
            .with_context(|| format!("failed to rename tmp record to {}", path.display()))?;
        Ok(())
    }
}

/// Volatile backend for tests and `ephemeral` runs.
#[derive(Default)]
pub struct MemoryStorage {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn read(&self, name: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().get(name).cloned())
    }

    fn write(&self, name: &str, value: &str) -> Result<()> {
        self.entries.write().insert(name.to_string(), value.as_bytes().to_vec());
        Ok(())
    }
}

// =============================================================================
// SeriesStore
// =============================================================================

pub struct SeriesStore {
    storage: Arc<dyn Storage>,
    diagnostics: Arc<Diagnostics>,
}

impl SeriesStore {
    pub fn new(storage: Arc<dyn Storage>, diagnostics: Arc<Diagnostics>) -> Self {
        Self { storage, diagnostics }
    }

    /// Load the series for `key`.
    ///
    /// A corrupt record is reset so the corruption does not resurface on the
    /// next load, and an empty series is returned. `Err` means the backend
    /// could not be read at all; it is already logged and recorded.
    pub fn load(&self, key: &SeriesKey) -> Result<Series, IngestError> {
        match self.try_load(key) {
            Ok(series) => {
                debug!(key = %key, len = series.len(), "series loaded");
                Ok(series)
            }
            Err(e @ IngestError::CorruptPersistence { .. }) => {
                warn!(key = %key, error = %e, "stored series failed validation, resetting");
                self.diagnostics.record(&e);
                if let Err(reset_err) = self.reset(key) {
                    warn!(key = %key, error = %reset_err, "failed to reset corrupt series");
                    self.diagnostics.record(&reset_err);
                }
                Ok(Series::new())
            }
            Err(e) => {
                warn!(key = %key, error = %e, "failed to read stored series");
                self.diagnostics.record(&e);
                Err(e)
            }
        }
    }

    /// Strict variant of [`load`](Self::load): reports what went wrong and
    /// touches nothing.
    pub fn try_load(&self, key: &SeriesKey) -> Result<Series, IngestError> {
        let raw = self
            .storage
            .read(&key.storage_name())
            .map_err(|e| IngestError::Storage(format!("{e:#}")))?;

        let Some(raw) = raw else {
            return Ok(Series::new());
        };

        let corrupt = |reason: String| IngestError::CorruptPersistence {
            key: key.to_string(),
            reason,
        };
        let record: SeriesRecord = serde_json::from_slice(&raw).map_err(|e| corrupt(e.to_string()))?;
        Series::from_record(record).map_err(corrupt)
    }

    /// Overwrite the stored record for `key` with `series`.
    pub fn save(&self, key: &SeriesKey, series: &Series) -> Result<(), IngestError> {
        let content = serde_json::to_string(series)
            .map_err(|e| IngestError::Storage(format!("failed to serialise series: {e}")))?;
        self.storage
            .write(&key.storage_name(), &content)
            .map_err(|e| IngestError::Storage(format!("{e:#}")))?;
        debug!(key = %key, len = series.len(), "series saved");
        Ok(())
    }

    pub fn reset(&self, key: &SeriesKey) -> Result<(), IngestError> {
        self.save(key, &Series::new())
    }
}
