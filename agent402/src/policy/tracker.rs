//! Append-only payment records and windowed totals.
//!
//! Records are never pre-aggregated: [`windowed_total`] recomputes a sum from
//! a snapshot each time, so totals stay correct across window boundaries.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use serde_with::{DisplayFromStr, serde_as};

/// Whether value flowed to us or from us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Received.
    In,
    /// Paid.
    Out,
}

/// One settled payment, attributed to a policy group and scope.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRecord {
    /// Policy group the payment counted against.
    pub group_name: String,
    /// Limit scope, e.g. a recipient address or host.
    pub scope: String,
    /// Whether it was received or paid.
    pub direction: Direction,
    /// Atomic token units.
    #[serde_as(as = "DisplayFromStr")]
    pub amount: u128,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// Sums `amount` over records matching group, scope and direction.
///
/// With a window, only records strictly newer than `now_ms - window_ms` count.
/// Saturates instead of overflowing.
#[must_use]
pub fn windowed_total(
    records: &[PaymentRecord],
    group: &str,
    scope: &str,
    direction: Direction,
    window_ms: Option<u64>,
    now_ms: u64,
) -> u128 {
    let cutoff = window_ms.map(|w| now_ms.saturating_sub(w));
    records
        .iter()
        .filter(|r| r.group_name == group && r.scope == scope && r.direction == direction)
        .filter(|r| cutoff.is_none_or(|c| r.timestamp > c))
        .fold(0u128, |acc, r| acc.saturating_add(r.amount))
}

/// Errors from a persistent record store.
#[derive(Debug, thiserror::Error)]
pub enum RecordStoreError {
    /// Reading or writing the file failed.
    #[error("record store I/O: {0}")]
    Io(#[from] io::Error),
    /// A line is not a valid record.
    #[error("record store encoding: {0}")]
    Json(#[from] serde_json::Error),
}

/// Storage backend for payment records.
///
/// `append` must be safe under concurrent callers. `snapshot` returns a
/// consistent copy at call time.
pub trait RecordStore: Send + Sync {
    /// Stores one record.
    ///
    /// # Errors
    ///
    /// Returns an error if a persistent backend fails to write.
    fn append(&self, record: PaymentRecord) -> Result<(), RecordStoreError>;

    /// Returns every stored record.
    fn snapshot(&self) -> Vec<PaymentRecord>;

    /// Drops every record with a timestamp at or before `cutoff_ms`.
    ///
    /// Returns how many records were dropped.
    ///
    /// # Errors
    ///
    /// Returns an error if a persistent backend fails to rewrite its data.
    fn evict_before(&self, cutoff_ms: u64) -> Result<usize, RecordStoreError>;
}

impl<T: RecordStore + ?Sized> RecordStore for std::sync::Arc<T> {
    fn append(&self, record: PaymentRecord) -> Result<(), RecordStoreError> {
        (**self).append(record)
    }

    fn snapshot(&self) -> Vec<PaymentRecord> {
        (**self).snapshot()
    }

    fn evict_before(&self, cutoff_ms: u64) -> Result<usize, RecordStoreError> {
        (**self).evict_before(cutoff_ms)
    }
}

/// In-memory store; records are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<Vec<PaymentRecord>>,
}

impl MemoryRecordStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl RecordStore for MemoryRecordStore {
    fn append(&self, record: PaymentRecord) -> Result<(), RecordStoreError> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record);
        Ok(())
    }

    fn snapshot(&self) -> Vec<PaymentRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn evict_before(&self, cutoff_ms: u64) -> Result<usize, RecordStoreError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|r| r.timestamp > cutoff_ms);
        Ok(before - records.len())
    }
}

/// JSON-lines file store with an in-memory mirror.
///
/// Each append writes one line. [`FileRecordStore::compact`] and
/// [`RecordStore::evict_before`] rewrite the file through a temp file and a
/// rename; `compact` drops records older than the configured TTL.
#[derive(Debug)]
pub struct FileRecordStore {
    path: PathBuf,
    ttl_ms: Option<u64>,
    records: Mutex<Vec<PaymentRecord>>,
}

impl FileRecordStore {
    /// Opens `path`, loading any existing records. Unparseable lines are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RecordStoreError> {
        let path = path.as_ref().to_path_buf();
        let records = match File::open(&path) {
            Ok(file) => {
                let mut records = Vec::new();
                for line in BufReader::new(file).lines() {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    match serde_json::from_str::<PaymentRecord>(&line) {
                        Ok(record) => records.push(record),
                        #[cfg(feature = "telemetry")]
                        Err(err) => {
                            tracing::warn!(path = %path.display(), "skipping record: {err}");
                        }
                        #[cfg(not(feature = "telemetry"))]
                        Err(_) => {}
                    }
                }
                records
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            path,
            ttl_ms: None,
            records: Mutex::new(records),
        })
    }

    /// Drops records older than `ttl_ms` on the next compaction.
    #[must_use]
    pub const fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    /// The backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Rewrites the file atomically, evicting expired records.
    ///
    /// Returns how many records were evicted.
    ///
    /// # Errors
    ///
    /// Returns an error if the temp file cannot be written or renamed.
    pub fn compact(&self, now_ms: u64) -> Result<usize, RecordStoreError> {
        let cutoff = self.ttl_ms.map(|ttl| now_ms.saturating_sub(ttl));
        self.rewrite(cutoff)
    }

    fn rewrite(&self, cutoff_ms: Option<u64>) -> Result<usize, RecordStoreError> {
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        if let Some(cutoff) = cutoff_ms {
            records.retain(|r| r.timestamp > cutoff);
        }

        let temp_path = self.path.with_extension("tmp");
        {
            let mut writer = BufWriter::new(File::create(&temp_path)?);
            for record in records.iter() {
                serde_json::to_writer(&mut writer, record)?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }
        fs::rename(&temp_path, &self.path)?;
        Ok(before - records.len())
    }
}

impl RecordStore for FileRecordStore {
    fn append(&self, record: PaymentRecord) -> Result<(), RecordStoreError> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)?;
        records.push(record);
        Ok(())
    }

    fn snapshot(&self) -> Vec<PaymentRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Rewrites the file only when something was dropped.
    fn evict_before(&self, cutoff_ms: u64) -> Result<usize, RecordStoreError> {
        let stale = {
            let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            records.iter().any(|r| r.timestamp <= cutoff_ms)
        };
        if stale {
            self.rewrite(Some(cutoff_ms))
        } else {
            Ok(0)
        }
    }
}
