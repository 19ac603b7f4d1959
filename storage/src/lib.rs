use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use util::DeviceClass;

mod error;
pub mod json;

pub use error::StorageError;
pub use json::JsonFileBackend;

/// Key under which the run history is stored.
pub const HISTORY_KEY: &str = "benchmarks";

/// One benchmark run as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkRun {
    #[serde(rename = "peakGB")]
    pub peak_gb: f64,
    #[serde(rename = "osVersion")]
    pub os_version: String,
    #[serde(rename = "deviceRamGB")]
    pub device_ram_gb: f64,
    #[serde(rename = "deviceClass")]
    pub device_class: DeviceClass,
}

impl BenchmarkRun {
    /// A fresh run with no memory committed yet.
    pub fn started(
        os_version: impl Into<String>,
        device_ram_gb: f64,
        device_class: DeviceClass,
    ) -> Self {
        Self {
            peak_gb: 0.0,
            os_version: os_version.into(),
            device_ram_gb,
            device_class,
        }
    }
}

/// Chronological run history. The last entry is the one a running engine updates.
pub type BenchmarkHistory = Vec<BenchmarkRun>;

/// Whole-collection key-value persistence.
pub trait HistoryBackend: Send {
    /// Returns the stored history, or `None` when nothing was ever written.
    fn read(&self) -> Result<Option<BenchmarkHistory>, StorageError>;

    /// Replaces the stored history.
    fn write(&self, history: &BenchmarkHistory) -> Result<(), StorageError>;

    /// Removes the stored entry.
    fn remove(&self) -> Result<(), StorageError>;
}

/// In-process backend. Clones share the same slot.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    slot: Arc<Mutex<Option<BenchmarkHistory>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, Option<BenchmarkHistory>> {
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl HistoryBackend for MemoryBackend {
    fn read(&self) -> Result<Option<BenchmarkHistory>, StorageError> {
        Ok(self.slot().clone())
    }

    fn write(&self, history: &BenchmarkHistory) -> Result<(), StorageError> {
        *self.slot() = Some(history.clone());
        Ok(())
    }

    fn remove(&self) -> Result<(), StorageError> {
        *self.slot() = None;
        Ok(())
    }
}

/// Cached run history backed by a [`HistoryBackend`].
///
/// Every mutation updates the cache first and then rewrites the whole
/// collection. If the write fails the cache stays authoritative and the error
/// is returned for the caller to report; nothing is retried.
pub struct ResultStore {
    backend: Box<dyn HistoryBackend>,
    cache: BenchmarkHistory,
}

impl ResultStore {
    /// Creates a store and loads whatever the backend holds.
    ///
    /// An unreadable backend starts the store empty.
    pub fn open<B: HistoryBackend + 'static>(backend: B) -> Self {
        let mut store = Self {
            backend: Box::new(backend),
            cache: Vec::new(),
        };
        if let Err(err) = store.load() {
            tracing::warn!(%err, "could not load benchmark history; starting empty");
        }
        store
    }

    /// Reloads the history from the backend into the cache.
    pub fn load(&mut self) -> Result<BenchmarkHistory, StorageError> {
        self.cache = self.backend.read()?.unwrap_or_default();
        Ok(self.cache.clone())
    }

    /// Cached history.
    pub fn history(&self) -> &[BenchmarkRun] {
        &self.cache
    }

    pub fn overwrite(&mut self, history: BenchmarkHistory) -> Result<(), StorageError> {
        self.cache = history;
        self.persist()
    }

    /// Appends a run that becomes the active (last) entry.
    pub fn append_active(&mut self, run: BenchmarkRun) -> Result<(), StorageError> {
        self.cache.push(run);
        self.persist()
    }

    /// Sets the peak of the last entry.
    pub fn update_active_peak(&mut self, peak_gb: f64) -> Result<(), StorageError> {
        let active = self.cache.last_mut().ok_or(StorageError::NoActiveRun)?;
        active.peak_gb = peak_gb;
        self.persist()
    }

    /// Drops every stored run.
    pub fn clear(&mut self) -> Result<(), StorageError> {
        self.cache.clear();
        self.backend.remove()
    }

    fn persist(&self) -> Result<(), StorageError> {
        self.backend.write(&self.cache)
    }
}

impl std::fmt::Debug for ResultStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStore")
            .field("runs", &self.cache.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(peak_gb: f64) -> BenchmarkRun {
        BenchmarkRun {
            peak_gb,
            os_version: "linux 6.1.0".into(),
            device_ram_gb: 8.0,
            device_class: DeviceClass::Tablet,
        }
    }

    struct BrokenBackend;

    impl BrokenBackend {
        fn refuse() -> StorageError {
            StorageError::Io {
                path: "/read-only/benchmarks.json".into(),
                source: std::io::Error::from(std::io::ErrorKind::PermissionDenied),
            }
        }
    }

    impl HistoryBackend for BrokenBackend {
        fn read(&self) -> Result<Option<BenchmarkHistory>, StorageError> {
            Err(Self::refuse())
        }

        fn write(&self, _history: &BenchmarkHistory) -> Result<(), StorageError> {
            Err(Self::refuse())
        }

        fn remove(&self) -> Result<(), StorageError> {
            Err(Self::refuse())
        }
    }

    #[test]
    fn overwrite_then_load_round_trips() {
        let backend = MemoryBackend::new();
        let mut store = ResultStore::open(backend.clone());
        let history = vec![run(1.5), run(2.25)];
        store.overwrite(history.clone()).unwrap();

        let mut reopened = ResultStore::open(backend);
        assert_eq!(reopened.load().unwrap(), history);
    }

    #[test]
    fn updates_only_the_active_run() {
        let mut store = ResultStore::open(MemoryBackend::new());
        store.append_active(run(3.0)).unwrap();
        store.append_active(BenchmarkRun::started("linux", 8.0, DeviceClass::Tablet)).unwrap();
        store.update_active_peak(1.75).unwrap();

        assert_eq!(store.history()[0].peak_gb, 3.0);
        assert_eq!(store.history()[1].peak_gb, 1.75);
    }

    #[test]
    fn updating_empty_history_is_rejected() {
        let mut store = ResultStore::open(MemoryBackend::new());
        assert!(matches!(store.update_active_peak(1.0), Err(StorageError::NoActiveRun)));
        assert!(store.history().is_empty());
    }

    #[test]
    fn clear_empties_backend_and_cache() {
        let backend = MemoryBackend::new();
        let mut store = ResultStore::open(backend.clone());
        for peak in [1.0, 2.0, 3.0] {
            store.append_active(run(peak)).unwrap();
        }
        store.clear().unwrap();

        assert!(store.history().is_empty());
        assert_eq!(backend.read().unwrap(), None);
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn cache_survives_write_failures() {
        let mut store = ResultStore::open(BrokenBackend);
        let err = store.append_active(run(0.0)).unwrap_err();
        assert!(matches!(err, StorageError::Io { .. }));
        assert!(err.to_string().contains("/read-only/benchmarks.json"));
        assert!(store.update_active_peak(2.0).is_err());
        assert_eq!(store.history(), &[run(2.0)]);
    }
}
