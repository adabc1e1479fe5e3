//! Transient state table.

use crate::backend::HistoryBackend;
use crate::error::{Result, StateSystemError};
use crate::types::{Quark, StateInterval, StateValue, ValueKind};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::trace;

/// Open interval of one attribute.
#[derive(Clone, Debug)]
struct OngoingEntry {
    value: StateValue,
    start: i64,
    /// Fixed by the first non-null value ever written.
    kind: Option<ValueKind>,
}

/// Current value and start time of every attribute.
///
/// Writes go through [`process_state_change`](Self::process_state_change),
/// which commits the interval being closed to the backend *before* the
/// entry is updated: a reader that sees the new start time always finds the
/// older interval in the backend.
pub struct TransientState {
    backend: Arc<dyn HistoryBackend>,
    entries: RwLock<Vec<OngoingEntry>>,
    /// Latest time seen by a state change.
    latest_time: AtomicI64,
    active: AtomicBool,
    /// Number of attributes tracked when the table went inactive.
    sealed_len: AtomicUsize,
}

impl TransientState {
    pub fn new(backend: Arc<dyn HistoryBackend>) -> Self {
        let start = backend.start_time();
        Self {
            backend,
            entries: RwLock::new(Vec::new()),
            latest_time: AtomicI64::new(start),
            active: AtomicBool::new(true),
            sealed_len: AtomicUsize::new(usize::MAX),
        }
    }

    /// Whether the table still accepts state changes.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn set_inactive(&self) {
        let len = self.entries.read().len();
        self.seal(len);
    }

    fn seal(&self, len: usize) {
        let _ = self
            .sealed_len
            .compare_exchange(usize::MAX, len, Ordering::AcqRel, Ordering::Acquire);
        self.active.store(false, Ordering::Release);
    }

    /// Whether `quark` was created once the table had gone inactive, and so
    /// never held a value.
    pub fn created_after_close(&self, quark: Quark) -> bool {
        quark.index() >= self.sealed_len.load(Ordering::Acquire)
    }

    /// Latest timestamp passed to a state change.
    pub fn latest_time(&self) -> i64 {
        self.latest_time.load(Ordering::Acquire)
    }

    /// Number of tracked attributes.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Track a freshly created attribute: Null since the history start.
    pub fn add_empty_entry(&self) {
        self.entries.write().push(OngoingEntry {
            value: StateValue::Null,
            start: self.backend.start_time(),
            kind: None,
        });
    }

    fn out_of_bounds(quark: Quark, count: usize) -> StateSystemError {
        StateSystemError::OutOfBounds { quark, count }
    }

    /// Current value of `quark`.
    pub fn ongoing_value(&self, quark: Quark) -> Result<StateValue> {
        let entries = self.entries.read();
        entries
            .get(quark.index())
            .map(|e| e.value.clone())
            .ok_or_else(|| Self::out_of_bounds(quark, entries.len()))
    }

    /// Start time of the open interval of `quark`.
    pub fn ongoing_start_time(&self, quark: Quark) -> Result<i64> {
        let entries = self.entries.read();
        entries
            .get(quark.index())
            .map(|e| e.start)
            .ok_or_else(|| Self::out_of_bounds(quark, entries.len()))
    }

    /// Replace the value of the open interval, keeping its start time.
    pub fn update_ongoing(&self, value: StateValue, quark: Quark) -> Result<()> {
        let mut entries = self.entries.write();
        let count = entries.len();
        let entry = entries
            .get_mut(quark.index())
            .ok_or_else(|| Self::out_of_bounds(quark, count))?;
        check_kind(entry, &value, quark)?;
        if !value.is_null() {
            entry.kind.get_or_insert(value.kind());
        }
        entry.value = value;
        Ok(())
    }

    /// Check that `value` may be written to `quark` at `t` without applying it.
    pub fn validate_change(&self, t: i64, value: &StateValue, quark: Quark) -> Result<()> {
        let entries = self.entries.read();
        let entry = entries
            .get(quark.index())
            .ok_or_else(|| Self::out_of_bounds(quark, entries.len()))?;
        validate(entry, t, value, quark)
    }

    /// Close the open interval of `quark` at `t - 1` and open a new one at
    /// `t` holding `value`.
    ///
    /// When `t` equals the ongoing start the old value is overwritten and
    /// nothing reaches the backend.
    pub fn process_state_change(&self, t: i64, value: StateValue, quark: Quark) -> Result<()> {
        let mut entries = self.entries.write();
        let count = entries.len();
        let entry = entries
            .get_mut(quark.index())
            .ok_or_else(|| Self::out_of_bounds(quark, count))?;
        validate(entry, t, &value, quark)?;

        if entry.start < t {
            self.backend
                .insert_past_interval(quark, entry.start, t - 1, entry.value.clone())?;
            trace!(quark = %quark, start = entry.start, end = t - 1, "closed interval");
        }

        if !value.is_null() {
            entry.kind.get_or_insert(value.kind());
        }
        entry.value = value;
        entry.start = t;
        self.latest_time.fetch_max(t, Ordering::AcqRel);
        Ok(())
    }

    /// Open interval of `quark` if it contains `t`, ending at `end`.
    pub fn interval_at(&self, t: i64, quark: Quark, end: i64) -> Result<Option<StateInterval>> {
        let entries = self.entries.read();
        let entry = entries
            .get(quark.index())
            .ok_or_else(|| Self::out_of_bounds(quark, entries.len()))?;
        if self.is_active() && entry.start <= t {
            Ok(Some(StateInterval::new(
                quark,
                entry.start,
                end.max(entry.start),
                entry.value.clone(),
            )))
        } else {
            Ok(None)
        }
    }

    /// Last interval of `quark` if it contains `t`, whether or not the table
    /// is still active.
    pub fn last_interval_at(
        &self,
        t: i64,
        quark: Quark,
        end: i64,
    ) -> Result<Option<StateInterval>> {
        let entries = self.entries.read();
        let entry = entries
            .get(quark.index())
            .ok_or_else(|| Self::out_of_bounds(quark, entries.len()))?;
        if entry.start <= t && t <= end {
            Ok(Some(StateInterval::new(
                quark,
                entry.start,
                end.max(entry.start),
                entry.value.clone(),
            )))
        } else {
            Ok(None)
        }
    }

    /// Fill `out[q]` with the open interval of every quark containing `t`.
    ///
    /// Slots of other quarks are left untouched.
    pub fn query_into(&self, t: i64, end: i64, out: &mut [Option<StateInterval>]) {
        if !self.is_active() {
            return;
        }
        let entries = self.entries.read();
        for (i, (entry, slot)) in entries.iter().zip(out.iter_mut()).enumerate() {
            if entry.start <= t {
                *slot = Some(StateInterval::new(
                    Quark(i as u32),
                    entry.start,
                    end.max(entry.start),
                    entry.value.clone(),
                ));
            }
        }
    }

    /// Commit every open interval to the backend, ending at `end`.
    ///
    /// Entries opened after `end` are skipped. The table becomes inactive.
    pub fn close(&self, end: i64) -> Result<()> {
        let entries = self.entries.read();
        for (i, entry) in entries.iter().enumerate() {
            if entry.start > end {
                continue;
            }
            self.backend
                .insert_past_interval(Quark(i as u32), entry.start, end, entry.value.clone())?;
        }
        self.seal(entries.len());
        Ok(())
    }

    /// Overwrite the whole table from one interval per quark, in quark order.
    ///
    /// Every interval is checked against the entry it replaces before any
    /// entry changes: it may not start before the current open interval nor
    /// change the value kind of the attribute.
    pub fn replace_ongoing_state(&self, intervals: &[StateInterval]) -> Result<()> {
        let mut entries = self.entries.write();
        if intervals.len() != entries.len() {
            return Err(StateSystemError::InvalidArgument(format!(
                "expected {} intervals, got {}",
                entries.len(),
                intervals.len()
            )));
        }
        for (i, interval) in intervals.iter().enumerate() {
            if interval.quark.index() != i {
                return Err(StateSystemError::InvalidArgument(format!(
                    "interval for quark {} found at position {}",
                    interval.quark, i
                )));
            }
        }
        for (entry, interval) in entries.iter().zip(intervals) {
            validate(entry, interval.start, &interval.value, interval.quark)?;
        }
        for (entry, interval) in entries.iter_mut().zip(intervals) {
            entry.value = interval.value.clone();
            entry.start = interval.start;
            if !interval.value.is_null() {
                entry.kind.get_or_insert(interval.value.kind());
            }
            self.latest_time.fetch_max(interval.start, Ordering::AcqRel);
        }
        Ok(())
    }
}

fn check_kind(entry: &OngoingEntry, value: &StateValue, quark: Quark) -> Result<()> {
    match entry.kind {
        Some(expected) if !value.is_null() && value.kind() != expected => {
            Err(StateSystemError::StateValueType {
                quark,
                expected,
                got: value.kind(),
            })
        }
        _ => Ok(()),
    }
}

fn validate(entry: &OngoingEntry, t: i64, value: &StateValue, quark: Quark) -> Result<()> {
    if t < entry.start {
        return Err(StateSystemError::NonMonotonicTime {
            quark,
            t,
            ongoing_start: entry.start,
        });
    }
    check_kind(entry, value, quark)
}
