//! In-memory interval storage.

use super::HistoryBackend;
use crate::error::{Result, StateSystemError};
use crate::types::{Quark, StateInterval, StateValue};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

/// Keeps every interval in memory, one sorted vector per attribute.
///
/// Point queries are a binary search on the attribute's vector.
pub struct InMemoryBackend {
    ssid: String,
    start_time: i64,
    end_time: AtomicI64,
    /// Intervals indexed by quark, sorted by start time.
    intervals: RwLock<Vec<Vec<StateInterval>>>,
    disposed: AtomicBool,
}

impl InMemoryBackend {
    /// Create an empty backend whose history begins at `start_time`.
    pub fn new(ssid: impl Into<String>, start_time: i64) -> Self {
        Self {
            ssid: ssid.into(),
            start_time,
            end_time: AtomicI64::new(start_time),
            intervals: RwLock::new(Vec::new()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Total number of stored intervals.
    pub fn interval_count(&self) -> usize {
        self.intervals.read().iter().map(Vec::len).sum()
    }

    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(StateSystemError::Disposed)
        } else {
            Ok(())
        }
    }
}

impl HistoryBackend for InMemoryBackend {
    fn ssid(&self) -> &str {
        &self.ssid
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

        let mut intervals = self.intervals.write();
        if intervals.len() <= quark.index() {
            intervals.resize_with(quark.index() + 1, Vec::new);
        }
        let slot = &mut intervals[quark.index()];
        if let Some(last) = slot.last() {
            if start <= last.end {
                return Err(StateSystemError::NonMonotonicTime {
                    quark,
                    t: start,
                    ongoing_start: last.end + 1,
                });
            }
        }
        slot.push(StateInterval::new(quark, start, end, value));
        self.end_time.fetch_max(end, Ordering::AcqRel);
        Ok(())
    }

    fn query_point(&self, t: i64, quark: Quark) -> Result<Option<StateInterval>> {
        self.check_disposed()?;
        let intervals = self.intervals.read();
        let Some(slot) = intervals.get(quark.index()) else {
            return Ok(None);
        };
        let idx = slot.partition_point(|i| i.end < t);
        Ok(slot.get(idx).filter(|i| i.contains(t)).cloned())
    }

    fn query_range(&self, quark: Quark, t1: i64, t2: i64) -> Result<Vec<StateInterval>> {
        self.check_disposed()?;
        let intervals = self.intervals.read();
        let Some(slot) = intervals.get(quark.index()) else {
            return Ok(Vec::new());
        };
        let first = slot.partition_point(|i| i.end < t1);
        Ok(slot[first..]
            .iter()
            .take_while(|i| i.start <= t2)
            .cloned()
            .collect())
    }

    fn finished_building(&self, end_time: i64) -> Result<()> {
        self.check_disposed()?;
        self.end_time.fetch_max(end_time, Ordering::AcqRel);
        Ok(())
    }

    fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::AcqRel) {
            self.intervals.write().clear();
        }
    }
}
