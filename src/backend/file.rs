//! Append-only, file-backed interval storage.
//!
//! A history directory holds:
//!
//! - `MANIFEST`: magic, format version, provider version, start time
//! - `intervals.log`: checksummed interval records, in insertion order
//! - `attributes.bin`: the serialized attribute tree, once building is done
//! - `meta.json`: ssid, time range and completion flag
//! - `LOCK`: exclusive lock held while the backend is alive

use super::HistoryBackend;
use crate::error::{Result, StateSystemError};
use crate::types::{Quark, StateInterval, StateValue};
use fs2::FileExt;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tracing::{debug, info};

/// Passing this as the expected provider version accepts any stored version.
pub const IGNORE_PROVIDER_VERSION: i32 = -42;

/// Magic bytes for the history manifest.
const HISTORY_MAGIC: &[u8; 4] = b"SHT\0";

/// Current on-disk format version.
const HISTORY_FORMAT_VERSION: u8 = 1;

/// Fixed part of an interval record: quark + start + end + payload length.
const RECORD_HEADER_SIZE: usize = 4 + 8 + 8 + 4;

const MANIFEST_FILE: &str = "MANIFEST";
const INTERVALS_FILE: &str = "intervals.log";
const ATTRIBUTES_FILE: &str = "attributes.bin";
const META_FILE: &str = "meta.json";
const LOCK_FILE: &str = "LOCK";

/// File backend configuration.
#[derive(Clone, Debug)]
pub struct FileBackendConfig {
    /// Directory holding the history files.
    pub path: PathBuf,

    /// Identifier of the state system.
    pub ssid: String,

    /// Version of the state provider building the history. Reopening a
    /// history built by another version fails unless
    /// [`IGNORE_PROVIDER_VERSION`] is given.
    pub provider_version: i32,

    /// Start time of a new history. Ignored when reopening.
    pub start_time: i64,

    /// Number of decoded intervals kept in the read cache.
    pub interval_cache_size: usize,

    /// Sync the interval file every N inserts (0 = only on finish).
    pub sync_interval: u64,
}

impl Default for FileBackendConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./history"),
            ssid: String::from("state-system"),
            provider_version: 0,
            start_time: 0,
            interval_cache_size: 4096,
            sync_interval: 0,
        }
    }
}

/// Human-readable summary written when building finishes.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct HistoryMeta {
    ssid: String,
    provider_version: i32,
    start_time: i64,
    end_time: i64,
    finished: bool,
}

/// Location of one interval in the log.
#[derive(Clone, Copy, Debug)]
struct IndexEntry {
    start: i64,
    end: i64,
    offset: u64,
}

/// Open interval log.
struct LogFile {
    file: File,
    size: u64,
    writes_since_sync: u64,
}

/// Interval storage in an append-only file.
///
/// Interval bounds are indexed in memory per attribute; values are read
/// back from disk on demand and kept in an LRU cache.
pub struct FileBackend {
    config: FileBackendConfig,
    start_time: i64,
    end_time: AtomicI64,

    /// Lock file, released on dispose.
    lock_file: Mutex<Option<File>>,

    /// Interval log, `None` once disposed.
    log: Mutex<Option<LogFile>>,

    /// Per-quark interval bounds, sorted by start time.
    index: RwLock<Vec<Vec<IndexEntry>>>,

    /// Decoded intervals by file offset.
    cache: Mutex<LruCache<u64, StateInterval>>,

    disposed: AtomicBool,
}

impl FileBackend {
    /// Open a finished history if one exists, otherwise start a new one.
    ///
    /// Returns the backend and whether it is new. An unreadable or
    /// mismatching history is deleted and rebuilt from scratch.
    pub fn open_or_create(config: FileBackendConfig) -> Result<(Self, bool)> {
        if config.path.join(MANIFEST_FILE).exists() {
            match Self::open(config.clone()) {
                Ok(backend) => return Ok((backend, false)),
                Err(StateSystemError::Locked) => return Err(StateSystemError::Locked),
                Err(e) => {
                    info!(path = %config.path.display(), error = %e, "discarding unusable history");
                    fs::remove_dir_all(&config.path)?;
                }
            }
        }
        Ok((Self::create(config)?, true))
    }

    /// Create a new, empty history.
    pub fn create(config: FileBackendConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        Self::write_manifest(&config.path, config.provider_version, config.start_time)?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(config.path.join(INTERVALS_FILE))?;

        // A stale meta file would make a half-built history look finished.
        let meta_path = config.path.join(META_FILE);
        if meta_path.exists() {
            fs::remove_file(meta_path)?;
        }

        debug!(ssid = %config.ssid, path = %config.path.display(), "created history file");

        let start_time = config.start_time;
        Ok(Self::assemble(config, start_time, start_time, lock_file, file, 0, Vec::new()))
    }

    /// Reopen a finished history.
    pub fn open(config: FileBackendConfig) -> Result<Self> {
        let lock_file = Self::acquire_lock(&config.path)?;

        let (stored_version, start_time) = Self::read_manifest(&config.path)?;
        if stored_version != config.provider_version
            && config.provider_version != IGNORE_PROVIDER_VERSION
        {
            return Err(StateSystemError::VersionMismatch {
                expected: config.provider_version,
                got: stored_version,
            });
        }

        let meta_bytes = fs::read(config.path.join(META_FILE))?;
        let meta: HistoryMeta = serde_json::from_slice(&meta_bytes)
            .map_err(|e| StateSystemError::Deserialization(e.to_string()))?;
        if !meta.finished {
            return Err(StateSystemError::InvalidFormat(
                "history was not finished".into(),
            ));
        }
        if meta.start_time != start_time {
            return Err(StateSystemError::InvalidFormat(
                "inconsistent start times in history".into(),
            ));
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(config.path.join(INTERVALS_FILE))?;
        let size = file.metadata()?.len();
        let index = Self::rebuild_index(&mut file, size)?;

        debug!(ssid = %meta.ssid, path = %config.path.display(), "reopened history file");

        Ok(Self::assemble(config, start_time, meta.end_time, lock_file, file, size, index))
    }

    fn assemble(
        config: FileBackendConfig,
        start_time: i64,
        end_time: i64,
        lock_file: File,
        file: File,
        size: u64,
        index: Vec<Vec<IndexEntry>>,
    ) -> Self {
        let cache_size = NonZeroUsize::new(config.interval_cache_size.max(1))
            .unwrap_or(NonZeroUsize::MIN);
        Self {
            config,
            start_time,
            end_time: AtomicI64::new(end_time),
            lock_file: Mutex::new(Some(lock_file)),
            log: Mutex::new(Some(LogFile {
                file,
                size,
                writes_since_sync: 0,
            })),
            index: RwLock::new(index),
            cache: Mutex::new(LruCache::new(cache_size)),
            disposed: AtomicBool::new(false),
        }
    }

    /// Directory holding the history.
    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Provider version this backend was configured with.
    pub fn provider_version(&self) -> i32 {
        self.config.provider_version
    }

    /// Size of the interval log in bytes.
    pub fn file_size(&self) -> u64 {
        self.log.lock().as_ref().map(|l| l.size).unwrap_or(0)
    }

    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(StateSystemError::Disposed)
        } else {
            Ok(())
        }
    }

    fn lookup(&self, t: i64, quark: Quark) -> Option<IndexEntry> {
        let index = self.index.read();
        let slot = index.get(quark.index())?;
        let idx = slot.partition_point(|e| e.end < t);
        slot.get(idx).filter(|e| e.start <= t && t <= e.end).copied()
    }

    fn read_interval(&self, offset: u64) -> Result<StateInterval> {
        if let Some(interval) = self.cache.lock().get(&offset).cloned() {
            return Ok(interval);
        }

        let interval = {
            let mut log = self.log.lock();
            let log = log.as_mut().ok_or(StateSystemError::Disposed)?;
            log.file.seek(SeekFrom::Start(offset))?;
            read_record(&mut log.file, log.size.saturating_sub(offset))?.0
        };

        self.cache.lock().put(offset, interval.clone());
        Ok(interval)
    }

    fn rebuild_index(file: &mut File, size: u64) -> Result<Vec<Vec<IndexEntry>>> {
        let mut index: Vec<Vec<IndexEntry>> = Vec::new();
        let mut offset = 0u64;
        file.seek(SeekFrom::Start(0))?;
        while offset < size {
            let (interval, len) = read_record(file, size - offset)?;
            let slot = interval.quark.index();
            if index.len() <= slot {
                index.resize_with(slot + 1, Vec::new);
            }
            index[slot].push(IndexEntry {
                start: interval.start,
                end: interval.end,
                offset,
            });
            offset += len;
        }
        Ok(index)
    }

    fn write_manifest(path: &Path, provider_version: i32, start_time: i64) -> Result<()> {
        let mut file = File::create(path.join(MANIFEST_FILE))?;

        file.write_all(HISTORY_MAGIC)?;
        file.write_all(&[HISTORY_FORMAT_VERSION])?;
        file.write_all(&provider_version.to_le_bytes())?;
        file.write_all(&start_time.to_le_bytes())?;
        file.sync_all()?;

        Ok(())
    }

    fn read_manifest(path: &Path) -> Result<(i32, i64)> {
        let mut file = File::open(path.join(MANIFEST_FILE))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != HISTORY_MAGIC {
            return Err(StateSystemError::InvalidFormat("Invalid history magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != HISTORY_FORMAT_VERSION {
            return Err(StateSystemError::InvalidFormat(format!(
                "Unsupported history format version: {}",
                version[0]
            )));
        }

        let mut provider_version = [0u8; 4];
        file.read_exact(&mut provider_version)?;
        let mut start_time = [0u8; 8];
        file.read_exact(&mut start_time)?;

        Ok((
            i32::from_le_bytes(provider_version),
            i64::from_le_bytes(start_time),
        ))
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join(LOCK_FILE))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StateSystemError::Locked)?;

        Ok(lock_file)
    }
}

impl HistoryBackend for FileBackend {
    fn ssid(&self) -> &str {
        &self.config.ssid
    }

    fn start_time(&self) -> i64 {
        self.start_time
    }

    fn end_time(&self) -> i64 {
        self.end_time.load(Ordering::Acquire)
    }

    fn insert_past_interval(
        &self,
        quark: Quark,
        start: i64,
        end: i64,
        value: StateValue,
    ) -> Result<()> {
        self.check_disposed()?;
        if start < self.start_time || end < start {
            return Err(StateSystemError::TimeRange {
                t: start,
                start: self.start_time,
                end,
            });
        }
        if let Some(last) = self
            .index
            .read()
            .get(quark.index())
            .and_then(|slot| slot.last().copied())
        {
            if start <= last.end {
                return Err(StateSystemError::NonMonotonicTime {
                    quark,
                    t: start,
                    ongoing_start: last.end + 1,
                });
            }
        }

        let interval = StateInterval::new(quark, start, end, value);
        let offset = {
            let mut log = self.log.lock();
            let log = log.as_mut().ok_or(StateSystemError::Disposed)?;
            let offset = log.size;
            log.file.seek(SeekFrom::Start(offset))?;
            log.size += write_record(&mut log.file, &interval)?;

            log.writes_since_sync += 1;
            if self.config.sync_interval > 0 && log.writes_since_sync >= self.config.sync_interval {
                log.file.sync_data()?;
                log.writes_since_sync = 0;
            }
            offset
        };

        {
            let mut index = self.index.write();
            if index.len() <= quark.index() {
                index.resize_with(quark.index() + 1, Vec::new);
            }
            index[quark.index()].push(IndexEntry { start, end, offset });
        }
        self.end_time.fetch_max(end, Ordering::AcqRel);
        Ok(())
    }

    fn query_point(&self, t: i64, quark: Quark) -> Result<Option<StateInterval>> {
        self.check_disposed()?;
        match self.lookup(t, quark) {
            Some(entry) => self.read_interval(entry.offset).map(Some),
            None => Ok(None),
        }
    }

    fn query_range(&self, quark: Quark, t1: i64, t2: i64) -> Result<Vec<StateInterval>> {
        self.check_disposed()?;
        let offsets: Vec<u64> = {
            let index = self.index.read();
            let Some(slot) = index.get(quark.index()) else {
                return Ok(Vec::new());
            };
            let first = slot.partition_point(|e| e.end < t1);
            slot[first..]
                .iter()
                .take_while(|e| e.start <= t2)
                .map(|e| e.offset)
                .collect()
        };
        offsets.into_iter().map(|o| self.read_interval(o)).collect()
    }

    fn finished_building(&self, end_time: i64) -> Result<()> {
        self.check_disposed()?;
        let end_time = self.end_time.fetch_max(end_time, Ordering::AcqRel).max(end_time);

        if let Some(log) = self.log.lock().as_mut() {
            log.file.sync_all()?;
            log.writes_since_sync = 0;
        }

        let meta = HistoryMeta {
            ssid: self.config.ssid.clone(),
            provider_version: self.config.provider_version,
            start_time: self.start_time,
            end_time,
            finished: true,
        };
        fs::write(
            self.config.path.join(META_FILE),
            serde_json::to_vec_pretty(&meta)?,
        )?;

        info!(ssid = %self.config.ssid, end_time, "history file finished");
        Ok(())
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(log) = self.log.lock().take() {
            // Best-effort flush, nothing to report to at this point.
            let _ = log.file.sync_all();
        }
        self.index.write().clear();
        self.cache.lock().clear();
        if let Some(lock_file) = self.lock_file.lock().take() {
            let _ = lock_file.unlock();
        }
        debug!(ssid = %self.config.ssid, "history file disposed");
    }

    fn remove_files(&self) -> Result<()> {
        self.dispose();
        if self.config.path.exists() {
            fs::remove_dir_all(&self.config.path)?;
        }
        Ok(())
    }

    fn store_attribute_tree(&self, encoded: &[u8]) -> Result<()> {
        self.check_disposed()?;
        let mut file = File::create(self.config.path.join(ATTRIBUTES_FILE))?;
        file.write_all(encoded)?;
        file.sync_all()?;
        Ok(())
    }

    fn load_attribute_tree(&self) -> Result<Option<Vec<u8>>> {
        self.check_disposed()?;
        let path = self.config.path.join(ATTRIBUTES_FILE);
        if path.exists() {
            Ok(Some(fs::read(path)?))
        } else {
            Ok(None)
        }
    }
}

impl Drop for FileBackend {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// Write one interval record, returning its length in bytes.
fn write_record(file: &mut File, interval: &StateInterval) -> Result<u64> {
    let payload = rmp_serde::to_vec(&interval.value)?;

    let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len() + 4);
    buf.extend_from_slice(&interval.quark.0.to_le_bytes());
    buf.extend_from_slice(&interval.start.to_le_bytes());
    buf.extend_from_slice(&interval.end.to_le_bytes());
    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&payload);
    buf.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());

    file.write_all(&buf)?;
    Ok(buf.len() as u64)
}

/// Read the record at the current position, returning it and its length.
///
/// `remaining` is the number of bytes left in the log from that position.
fn read_record(file: &mut File, remaining: u64) -> Result<(StateInterval, u64)> {
    let mut header = [0u8; RECORD_HEADER_SIZE];
    file.read_exact(&mut header)?;

    let quark = Quark(u32::from_le_bytes(slice_array(&header[0..4])));
    let start = i64::from_le_bytes(slice_array(&header[4..12]));
    let end = i64::from_le_bytes(slice_array(&header[12..20]));
    let payload_len = u32::from_le_bytes(slice_array(&header[20..24]));

    let record_len = RECORD_HEADER_SIZE as u64 + u64::from(payload_len) + 4;
    if record_len > remaining {
        return Err(StateSystemError::InvalidFormat(format!(
            "record of {} bytes overruns the log ({} bytes left)",
            record_len, remaining
        )));
    }

    let mut payload = vec![0u8; payload_len as usize];
    file.read_exact(&mut payload)?;

    let mut checksum_bytes = [0u8; 4];
    file.read_exact(&mut checksum_bytes)?;
    let stored_checksum = u32::from_le_bytes(checksum_bytes);
    let computed_checksum = crc32fast::hash(&payload);
    if stored_checksum != computed_checksum {
        return Err(StateSystemError::ChecksumMismatch {
            expected: stored_checksum,
            got: computed_checksum,
        });
    }

    let value: StateValue = rmp_serde::from_slice(&payload)?;
    Ok((StateInterval::new(quark, start, end, value), record_len))
}

fn slice_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut arr = [0u8; N];
    arr.copy_from_slice(bytes);
    arr
}
