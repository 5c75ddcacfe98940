//! Append-only, file-backed time series store.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError, RwLock, RwLockReadGuard};
use thiserror::Error;

use super::models::*;

/// Storage error types.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode history: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("malformed history in {path}: {reason}")]
    Malformed { path: PathBuf, reason: String },
    #[error("entry at {got} precedes last stored entry at {last}")]
    OutOfOrder {
        last: DateTime<Utc>,
        got: DateTime<Utc>,
    },
}

/// Per-tick service check history.
pub type StatusStore = SeriesStore<StatusEntry>;

/// Connectivity probe history.
pub type ConnectivityStore = SeriesStore<ConnectivityStatus>;

/// Thread-safe append-only series persisted as a single JSON array.
///
/// Entries are kept sorted by timestamp. Every append rewrites the file
/// through a temporary sibling and an atomic rename, and only commits the
/// entry to memory once the rename succeeded. Reads never wait on disk I/O.
pub struct SeriesStore<T> {
    path: PathBuf,
    max_entries: Option<usize>,
    entries: RwLock<Vec<T>>,
    writer: Mutex<()>,
    version: AtomicU64,
}

impl<T> SeriesStore<T>
where
    T: Timestamped + Clone + Serialize + DeserializeOwned,
{
    /// Open the store at `path`, loading any existing history.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|source| StoreError::Io {
                path: dir.to_path_buf(),
                source,
            })?;
        }

        let entries = load_entries(&path)?;
        let version = entries.len() as u64;
        Ok(Self {
            path,
            max_entries: None,
            entries: RwLock::new(entries),
            writer: Mutex::new(()),
            version: AtomicU64::new(version),
        })
    }

    /// Cap the number of retained entries, dropping the oldest first.
    pub fn with_max_entries(mut self, max: usize) -> Self {
        let max = max.max(1);
        let entries = self.entries.get_mut().unwrap_or_else(PoisonError::into_inner);
        if entries.len() > max {
            let excess = entries.len() - max;
            entries.drain(..excess);
        }
        self.max_entries = Some(max);
        self
    }

    /// Path of the durable history file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist a new entry, then commit it to memory.
    pub fn append(&self, entry: T) -> Result<(), StoreError> {
        let _writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let (bytes, evict) = {
            let entries = self.read();
            if let Some(last) = entries.last() {
                if entry.timestamp() < last.timestamp() {
                    return Err(StoreError::OutOfOrder {
                        last: last.timestamp(),
                        got: entry.timestamp(),
                    });
                }
            }
            let evict = self
                .max_entries
                .map(|max| (entries.len() + 1).saturating_sub(max))
                .unwrap_or(0);
            let view: Vec<&T> = entries[evict..]
                .iter()
                .chain(std::iter::once(&entry))
                .collect();
            (serde_json::to_vec_pretty(&view)?, evict)
        };

        write_atomic(&self.path, &bytes)?;

        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.drain(..evict);
        entries.push(entry);
        self.version.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Most recent entry, if any.
    pub fn latest(&self) -> Option<T> {
        self.read().last().cloned()
    }

    /// Copy of the full series.
    pub fn history(&self) -> Vec<T> {
        self.read().clone()
    }

    /// Copy of all entries with a timestamp at or after `cutoff`.
    pub fn history_since(&self, cutoff: DateTime<Utc>) -> Vec<T> {
        let entries = self.read();
        let idx = entries.partition_point(|e| e.timestamp() < cutoff);
        entries[idx..].to_vec()
    }

    /// Copy of the most recent `n` entries, or all of them when `n == 0`.
    pub fn history_n(&self, n: usize) -> Vec<T> {
        let entries = self.read();
        let start = if n == 0 { 0 } else { entries.len().saturating_sub(n) };
        entries[start..].to_vec()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Monotonically increasing count of committed appends.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<T>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }
}

fn load_entries<T>(path: &Path) -> Result<Vec<T>, StoreError>
where
    T: Timestamped + DeserializeOwned,
{
    let data = match fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };

    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }

    let entries: Vec<T> = serde_json::from_slice(&data).map_err(|e| StoreError::Malformed {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    if let Some(pos) = entries
        .windows(2)
        .position(|pair| pair[1].timestamp() < pair[0].timestamp())
    {
        return Err(StoreError::Malformed {
            path: path.to_path_buf(),
            reason: format!("entry {} is older than the entry before it", pos + 1),
        });
    }

    Ok(entries)
}

/// Replace `path` with `bytes` via a temporary file and rename.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(format!(".{}.tmp", nanos));
    let tmp_path = PathBuf::from(tmp_name);

    let io_err = |source| StoreError::Io {
        path: tmp_path.clone(),
        source,
    };

    let result = fs::File::create(&tmp_path)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .map_err(io_err)
        .and_then(|_| {
            fs::rename(&tmp_path, path).map_err(|source| StoreError::Io {
                path: path.to_path_buf(),
                source,
            })
        });

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    result
}
