use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use util::DeviceClass;

use crate::{BenchmarkHistory, BenchmarkRun, HistoryBackend, StorageError, HISTORY_KEY};

/// Stores the history as a JSON array in a single file.
///
/// Writes go to a sibling temp file that is renamed over the target, so a
/// reader never sees a half-written array.
#[derive(Debug, Clone)]
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Backend for the default history key inside `dir`.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(format!("{HISTORY_KEY}.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: io::Error) -> StorageError {
        StorageError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Entries as they may appear on disk. Early releases stored bare peak values.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredRun {
    Record(BenchmarkRun),
    Legacy(f64),
}

impl From<StoredRun> for BenchmarkRun {
    fn from(stored: StoredRun) -> Self {
        match stored {
            StoredRun::Record(run) => run,
            StoredRun::Legacy(peak_gb) => BenchmarkRun {
                peak_gb,
                os_version: String::new(),
                device_ram_gb: 0.0,
                device_class: DeviceClass::Phone,
            },
        }
    }
}

impl HistoryBackend for JsonFileBackend {
    fn read(&self) -> Result<Option<BenchmarkHistory>, StorageError> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(self.io_error(err)),
        };
        let stored: Vec<StoredRun> =
            serde_json::from_slice(&bytes).map_err(|source| StorageError::Malformed {
                path: self.path.clone(),
                source,
            })?;
        Ok(Some(stored.into_iter().map(BenchmarkRun::from).collect()))
    }

    fn write(&self, history: &BenchmarkHistory) -> Result<(), StorageError> {
        let encoded = serde_json::to_vec_pretty(history)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| self.io_error(err))?;
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = fs::File::create(&tmp).map_err(|err| self.io_error(err))?;
        file.write_all(&encoded).map_err(|err| self.io_error(err))?;
        file.sync_all().map_err(|err| self.io_error(err))?;
        drop(file);
        fs::rename(&tmp, &self.path).map_err(|err| self.io_error(err))
    }

    fn remove(&self) -> Result<(), StorageError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(self.io_error(err)),
        }
    }
}
