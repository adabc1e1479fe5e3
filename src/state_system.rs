//! The state system facade.
//!
//! [`StateSystem`] ties the attribute tree, the transient table and a
//! history backend together. Read access goes through
//! [`StateSystemReader`], write access through [`StateSystemBuilder`].
//!
//! One writer builds the history while any number of readers query it.
//! Writes are validated up front and either apply fully or not at all.

use crate::attribute::{split_path, AttributeTree};
use crate::backend::{HistoryBackend, InMemoryBackend};
use crate::error::{Result, StateSystemError};
use crate::transient::TransientState;
use crate::types::{BuildState, Quark, StateInterval, StateValue, ValueKind};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Deepest a stack attribute may grow.
pub const MAX_STACK_DEPTH: i32 = 100_000;

/// Read-only access to a state system.
pub trait StateSystemReader: Send + Sync {
    /// Identifier of the state system.
    fn ssid(&self) -> &str;

    /// First timestamp covered by the history.
    fn start_time(&self) -> i64;

    /// Latest timestamp known to the state system.
    ///
    /// Grows while the history is being built.
    fn current_end_time(&self) -> i64;

    fn attribute_count(&self) -> usize;

    fn build_state(&self) -> BuildState;

    fn is_cancelled(&self) -> bool;

    /// Block until the history is built, cancelled or disposed.
    fn wait_until_built(&self);

    /// Like [`wait_until_built`](Self::wait_until_built) with a timeout.
    /// Returns whether the build finished in time.
    fn wait_until_built_timeout(&self, timeout: Duration) -> bool;

    /// Release every resource. Idempotent; later reads fail with `Disposed`.
    fn dispose(&self);

    fn get_absolute(&self, path: &[&str]) -> Result<Quark>;

    fn get_relative(&self, start: Quark, path: &[&str]) -> Result<Quark>;

    fn opt_absolute(&self, path: &[&str]) -> Option<Quark>;

    fn opt_relative(&self, start: Quark, path: &[&str]) -> Result<Option<Quark>>;

    /// Quark of a slash-separated absolute path.
    fn get_absolute_path(&self, path: &str) -> Result<Quark> {
        self.get_absolute(&split_path(path))
    }

    fn opt_absolute_path(&self, path: &str) -> Option<Quark> {
        self.opt_absolute(&split_path(path))
    }

    /// Children of `quark`, depth-first over the whole subtree when
    /// `recursive`. `Quark::ROOT` lists top-level attributes.
    fn sub_attributes(&self, quark: Quark, recursive: bool) -> Result<Vec<Quark>>;

    /// Sub-attributes whose name fully matches the regex `pattern`.
    fn sub_attributes_matching(
        &self,
        quark: Quark,
        recursive: bool,
        pattern: &str,
    ) -> Result<Vec<Quark>>;

    /// Quarks matching an absolute path pattern (`*` and `..` allowed).
    fn quarks_matching(&self, pattern: &[&str]) -> Result<Vec<Quark>> {
        self.quarks_matching_relative(Quark::ROOT, pattern)
    }

    fn quarks_matching_relative(&self, start: Quark, pattern: &[&str]) -> Result<Vec<Quark>>;

    fn attribute_name(&self, quark: Quark) -> Result<String>;

    fn full_path(&self, quark: Quark) -> Result<String>;

    fn full_path_elements(&self, quark: Quark) -> Result<Vec<String>>;

    /// Parent of `quark`; `Quark::ROOT` for top-level attributes.
    fn parent_attribute(&self, quark: Quark) -> Result<Quark>;

    /// Value of the open interval of `quark`.
    fn ongoing_value(&self, quark: Quark) -> Result<StateValue>;

    fn ongoing_start_time(&self, quark: Quark) -> Result<i64>;

    /// The interval of `quark` containing `t`.
    fn query_single_state(&self, t: i64, quark: Quark) -> Result<StateInterval>;

    /// One interval per attribute at `t`, in quark order.
    fn query_full_state(&self, t: i64) -> Result<Vec<StateInterval>>;

    /// Every interval of `quarks` intersecting `[t1, t2]`, grouped by quark.
    fn query_2d(&self, quarks: &[Quark], t1: i64, t2: i64) -> Result<Vec<StateInterval>>;
}

/// Write access to a state system, for the component building it.
pub trait StateSystemBuilder: StateSystemReader {
    /// Resolve an absolute path, creating missing attributes.
    fn get_or_create_absolute(&self, path: &[&str]) -> Result<Quark>;

    fn get_or_create_relative(&self, start: Quark, path: &[&str]) -> Result<Quark>;

    fn get_or_create_absolute_path(&self, path: &str) -> Result<Quark> {
        self.get_or_create_absolute(&split_path(path))
    }

    /// Set `quark` to `value` from `t` onwards.
    fn modify(&self, t: i64, value: StateValue, quark: Quark) -> Result<()>;

    /// Change the value of the open interval without closing it.
    fn update_ongoing(&self, value: StateValue, quark: Quark) -> Result<()>;

    /// Nullify `quark` and its whole subtree at `t`.
    fn remove_attribute(&self, t: i64, quark: Quark) -> Result<()>;

    /// Push `value` on the stack rooted at `quark`.
    fn push(&self, t: i64, value: StateValue, quark: Quark) -> Result<()>;

    /// Pop the top of the stack rooted at `quark`. `None` when empty.
    fn pop(&self, t: i64, quark: Quark) -> Result<Option<StateValue>>;

    /// Current top of the stack rooted at `quark`.
    fn peek_top(&self, quark: Quark) -> Result<Option<StateValue>>;

    /// Append `value` to the queue rooted at `quark`.
    fn offer(&self, t: i64, value: StateValue, quark: Quark) -> Result<()> {
        self.push(t, value, quark)
    }

    /// Remove and return the head of the queue rooted at `quark`.
    fn poll(&self, t: i64, quark: Quark) -> Result<Option<StateValue>>;

    fn peek_head(&self, quark: Quark) -> Result<Option<StateValue>>;

    /// Overwrite the ongoing state with one interval per attribute.
    fn replace_ongoing_state(&self, intervals: &[StateInterval]) -> Result<()>;

    /// Commit every open interval up to `end` and mark the history built.
    fn close_history(&self, end: i64) -> Result<()>;

    /// Flag the build as cancelled. Results become unreliable.
    fn cancel(&self);

    /// Delete the backend's on-disk artifacts.
    fn remove_files(&self) -> Result<()>;
}

/// Attribute tree, transient state and history under one roof.
pub struct StateSystem {
    ssid: String,
    tree: AttributeTree,
    transient: TransientState,
    backend: Arc<dyn HistoryBackend>,
    state: Mutex<BuildState>,
    built: Condvar,
    cancelled: AtomicBool,
    disposed: AtomicBool,
}

impl StateSystem {
    /// Create a state system over `backend`.
    ///
    /// With `new_file`, the history starts empty and is built from scratch.
    /// Otherwise the backend holds a finished history whose attribute tree
    /// is reloaded, and the state system starts out built.
    pub fn new(backend: Arc<dyn HistoryBackend>, new_file: bool) -> Result<Self> {
        let mut ss = Self::building(backend);

        if !new_file {
            let encoded = ss.backend.load_attribute_tree()?.ok_or_else(|| {
                StateSystemError::InvalidFormat("history has no attribute tree".into())
            })?;
            ss.tree = AttributeTree::decode(&encoded)?;
            for _ in 0..ss.tree.count() {
                ss.transient.add_empty_entry();
            }
            ss.transient.set_inactive();
            *ss.state.get_mut() = BuildState::Built;
        }

        debug!(ssid = %ss.ssid, new_file, attributes = ss.tree.count(), "state system created");
        Ok(ss)
    }

    /// New state system backed by an [`InMemoryBackend`].
    pub fn in_memory(ssid: impl Into<String>, start_time: i64) -> Self {
        let backend: Arc<dyn HistoryBackend> = Arc::new(InMemoryBackend::new(ssid, start_time));
        Self::building(backend)
    }

    fn building(backend: Arc<dyn HistoryBackend>) -> Self {
        Self {
            ssid: backend.ssid().to_string(),
            tree: AttributeTree::new(),
            transient: TransientState::new(backend.clone()),
            backend,
            state: Mutex::new(BuildState::Building),
            built: Condvar::new(),
            cancelled: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }

    /// The backend storing closed intervals.
    pub fn backend(&self) -> &Arc<dyn HistoryBackend> {
        &self.backend
    }

    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            Err(StateSystemError::Disposed)
        } else {
            Ok(())
        }
    }

    fn check_writable(&self) -> Result<()> {
        self.check_disposed()?;
        if !self.transient.is_active() {
            return Err(StateSystemError::InvalidArgument(format!(
                "history of {} is already closed",
                self.ssid
            )));
        }
        Ok(())
    }

    fn check_time(&self, t: i64) -> Result<i64> {
        let start = self.backend.start_time();
        let end = self.current_end_time();
        if t < start || t > end {
            return Err(StateSystemError::TimeRange { t, start, end });
        }
        Ok(end)
    }

    fn check_quark(&self, quark: Quark) -> Result<()> {
        let count = self.tree.count();
        if quark.is_root() || quark.index() >= count {
            return Err(StateSystemError::OutOfBounds { quark, count });
        }
        Ok(())
    }

    fn set_state(&self, state: BuildState) {
        let mut current = self.state.lock();
        let allowed = match (*current, state) {
            (BuildState::Disposed, _) => false,
            (_, BuildState::Disposed) => true,
            (BuildState::Building, _) => true,
            _ => false,
        };
        if allowed {
            *current = state;
        }
        self.built.notify_all();
    }

    /// Backend lookup for a time before the open interval of `quark`.
    fn query_history(&self, t: i64, quark: Quark, end: i64) -> Result<StateInterval> {
        let found = self.backend.query_point(t, quark)?;
        self.check_disposed()?;
        if let Some(interval) = found {
            return Ok(interval);
        }
        if self.transient.is_active() {
            return Err(StateSystemError::TimeRange {
                t,
                start: self.transient.ongoing_start_time(quark)?,
                end,
            });
        }

        // Closed history the backend could not answer from.
        if self.transient.created_after_close(quark) {
            return Ok(StateInterval::new(
                quark,
                self.backend.start_time(),
                end,
                StateValue::Null,
            ));
        }
        match self.transient.last_interval_at(t, quark, end)? {
            Some(interval) => Ok(interval),
            None => Err(StateSystemError::TimeRange {
                t,
                start: self.transient.ongoing_start_time(quark)?,
                end,
            }),
        }
    }

    /// Depth of the stack rooted at `quark`; Null counts as empty.
    fn stack_depth(&self, quark: Quark) -> Result<i32> {
        match self.transient.ongoing_value(quark)? {
            StateValue::Null => Ok(0),
            StateValue::Int(depth) if depth >= 0 => Ok(depth),
            StateValue::Int(_) => Err(StateSystemError::NotAStack(quark)),
            other => Err(StateSystemError::StateValueType {
                quark,
                expected: ValueKind::Int,
                got: other.kind(),
            }),
        }
    }

    fn stack_slot(&self, quark: Quark, index: i32) -> Result<Quark> {
        let name = index.to_string();
        self.tree
            .find(quark, &[name.as_str()])?
            .ok_or_else(|| StateSystemError::AttributeNotFound(format!("{}/{}", quark, name)))
    }

    /// Validate nullifying `quark` and its subtree at `t`.
    fn removal_targets(&self, t: i64, quark: Quark) -> Result<Vec<Quark>> {
        let mut targets = vec![quark];
        targets.extend(self.tree.sub_attributes(quark, true)?);
        for &target in &targets {
            self.transient
                .validate_change(t, &StateValue::Null, target)?;
        }
        Ok(targets)
    }
}

impl StateSystemReader for StateSystem {
    fn ssid(&self) -> &str {
        &self.ssid
    }

    fn start_time(&self) -> i64 {
        self.backend.start_time()
    }

    fn current_end_time(&self) -> i64 {
        self.backend.end_time().max(self.transient.latest_time())
    }

    fn attribute_count(&self) -> usize {
        self.tree.count()
    }

    fn build_state(&self) -> BuildState {
        *self.state.lock()
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn wait_until_built(&self) {
        let mut state = self.state.lock();
        while !state.is_finished() {
            self.built.wait(&mut state);
        }
    }

    fn wait_until_built_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while !state.is_finished() {
            if self.built.wait_until(&mut state, deadline).timed_out() {
                return state.is_finished();
            }
        }
        true
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancelled.store(true, Ordering::Release);
        self.transient.set_inactive();
        self.backend.dispose();
        self.set_state(BuildState::Disposed);
        info!(ssid = %self.ssid, "state system disposed");
    }

    fn get_absolute(&self, path: &[&str]) -> Result<Quark> {
        self.get_relative(Quark::ROOT, path)
    }

    fn get_relative(&self, start: Quark, path: &[&str]) -> Result<Quark> {
        self.tree
            .find(start, path)?
            .ok_or_else(|| StateSystemError::AttributeNotFound(path.join("/")))
    }

    fn opt_absolute(&self, path: &[&str]) -> Option<Quark> {
        self.tree.find(Quark::ROOT, path).ok().flatten()
    }

    fn opt_relative(&self, start: Quark, path: &[&str]) -> Result<Option<Quark>> {
        self.tree.find(start, path)
    }

    fn sub_attributes(&self, quark: Quark, recursive: bool) -> Result<Vec<Quark>> {
        self.tree.sub_attributes(quark, recursive)
    }

    fn sub_attributes_matching(
        &self,
        quark: Quark,
        recursive: bool,
        pattern: &str,
    ) -> Result<Vec<Quark>> {
        self.tree.sub_attributes_matching(quark, recursive, pattern)
    }

    fn quarks_matching_relative(&self, start: Quark, pattern: &[&str]) -> Result<Vec<Quark>> {
        self.tree.quarks_matching(start, pattern)
    }

    fn attribute_name(&self, quark: Quark) -> Result<String> {
        self.tree.name(quark)
    }

    fn full_path(&self, quark: Quark) -> Result<String> {
        self.tree.full_path(quark)
    }

    fn full_path_elements(&self, quark: Quark) -> Result<Vec<String>> {
        self.tree.full_path_elements(quark)
    }

    fn parent_attribute(&self, quark: Quark) -> Result<Quark> {
        self.tree.parent(quark)
    }

    fn ongoing_value(&self, quark: Quark) -> Result<StateValue> {
        self.check_disposed()?;
        self.transient.ongoing_value(quark)
    }

    fn ongoing_start_time(&self, quark: Quark) -> Result<i64> {
        self.check_disposed()?;
        self.transient.ongoing_start_time(quark)
    }

    fn query_single_state(&self, t: i64, quark: Quark) -> Result<StateInterval> {
        self.check_disposed()?;
        self.check_quark(quark)?;
        let end = self.check_time(t)?;

        if let Some(interval) = self.transient.interval_at(t, quark, end)? {
            return Ok(interval);
        }
        self.query_history(t, quark, end)
    }

    fn query_full_state(&self, t: i64) -> Result<Vec<StateInterval>> {
        self.check_disposed()?;
        let end = self.check_time(t)?;

        let count = self.tree.count();
        let mut slots = vec![None; count];
        self.transient.query_into(t, end, &mut slots);

        slots
            .into_iter()
            .enumerate()
            .map(|(i, slot)| match slot {
                Some(interval) => Ok(interval),
                None => self.query_history(t, Quark(i as u32), end),
            })
            .collect()
    }

    fn query_2d(&self, quarks: &[Quark], t1: i64, t2: i64) -> Result<Vec<StateInterval>> {
        self.check_disposed()?;
        if t1 > t2 {
            return Err(StateSystemError::InvalidArgument(format!(
                "inverted time range [{}, {}]",
                t1, t2
            )));
        }
        let start = self.backend.start_time();
        let end = self.current_end_time();
        if t2 < start || t1 > end {
            return Err(StateSystemError::TimeRange { t: t1, start, end });
        }
        let (t1, t2) = (t1.max(start), t2.min(end));

        let mut intervals = Vec::new();
        for &quark in quarks {
            self.check_quark(quark)?;
            let ongoing = self.transient.interval_at(t2, quark, end)?;
            let history_end = match &ongoing {
                Some(interval) => interval.start - 1,
                None => t2,
            };
            if ongoing.is_none() && self.transient.created_after_close(quark) {
                intervals.push(StateInterval::new(quark, start, end, StateValue::Null));
                continue;
            }
            if history_end >= t1 {
                intervals.extend(self.backend.query_range(quark, t1, history_end)?);
            }
            intervals.extend(ongoing);
        }
        Ok(intervals)
    }
}

impl StateSystemBuilder for StateSystem {
    fn get_or_create_absolute(&self, path: &[&str]) -> Result<Quark> {
        self.get_or_create_relative(Quark::ROOT, path)
    }

    fn get_or_create_relative(&self, start: Quark, path: &[&str]) -> Result<Quark> {
        self.check_disposed()?;
        self.tree
            .get_or_create(start, path, |_| self.transient.add_empty_entry())
    }

    fn modify(&self, t: i64, value: StateValue, quark: Quark) -> Result<()> {
        self.check_writable()?;
        self.transient.process_state_change(t, value, quark)
    }

    fn update_ongoing(&self, value: StateValue, quark: Quark) -> Result<()> {
        self.check_writable()?;
        self.transient.update_ongoing(value, quark)
    }

    fn remove_attribute(&self, t: i64, quark: Quark) -> Result<()> {
        self.check_writable()?;
        for target in self.removal_targets(t, quark)? {
            self.transient
                .process_state_change(t, StateValue::Null, target)?;
        }
        Ok(())
    }

    fn push(&self, t: i64, value: StateValue, quark: Quark) -> Result<()> {
        self.check_writable()?;
        let depth = self.stack_depth(quark)?;
        if depth >= MAX_STACK_DEPTH {
            return Err(StateSystemError::StackOverflow(quark));
        }

        let new_depth = depth + 1;
        self.transient
            .validate_change(t, &StateValue::Int(new_depth), quark)?;

        // A slot that does not exist yet accepts any value at or after the
        // depth change, so it is only created once that change is valid.
        let name = new_depth.to_string();
        let slot = match self.tree.find(quark, &[name.as_str()])? {
            Some(slot) => {
                self.transient.validate_change(t, &value, slot)?;
                slot
            }
            None => self.get_or_create_relative(quark, &[name.as_str()])?,
        };

        self.transient
            .process_state_change(t, StateValue::Int(new_depth), quark)?;
        self.transient.process_state_change(t, value, slot)
    }

    fn pop(&self, t: i64, quark: Quark) -> Result<Option<StateValue>> {
        self.check_writable()?;
        let depth = self.stack_depth(quark)?;
        if depth == 0 {
            return Ok(None);
        }

        let slot = self.stack_slot(quark, depth)?;
        let value = self.transient.ongoing_value(slot)?;

        self.transient
            .validate_change(t, &StateValue::Int(depth - 1), quark)?;
        let targets = self.removal_targets(t, slot)?;

        for target in targets {
            self.transient
                .process_state_change(t, StateValue::Null, target)?;
        }
        self.transient
            .process_state_change(t, StateValue::Int(depth - 1), quark)?;
        Ok(Some(value))
    }

    fn peek_top(&self, quark: Quark) -> Result<Option<StateValue>> {
        self.check_disposed()?;
        let depth = self.stack_depth(quark)?;
        if depth == 0 {
            return Ok(None);
        }
        let slot = self.stack_slot(quark, depth)?;
        self.transient.ongoing_value(slot).map(Some)
    }

    fn poll(&self, t: i64, quark: Quark) -> Result<Option<StateValue>> {
        self.check_writable()?;
        let depth = self.stack_depth(quark)?;
        match depth {
            0 => return Ok(None),
            1 => return self.pop(t, quark),
            _ => {}
        }

        let slots = (1..=depth)
            .map(|i| self.stack_slot(quark, i))
            .collect::<Result<Vec<_>>>()?;
        let values = slots
            .iter()
            .map(|&slot| self.transient.ongoing_value(slot))
            .collect::<Result<Vec<_>>>()?;

        for (i, window) in slots.windows(2).enumerate() {
            self.transient.validate_change(t, &values[i + 1], window[0])?;
        }
        self.transient
            .validate_change(t, &StateValue::Int(depth - 1), quark)?;
        self.removal_targets(t, slots[slots.len() - 1])?;

        let mut values = values.into_iter();
        let head = values.next().unwrap_or_default();
        for (&slot, value) in slots.iter().zip(values) {
            self.transient.process_state_change(t, value, slot)?;
        }
        self.pop(t, quark)?;
        Ok(Some(head))
    }

    fn peek_head(&self, quark: Quark) -> Result<Option<StateValue>> {
        self.check_disposed()?;
        if self.stack_depth(quark)? == 0 {
            return Ok(None);
        }
        let slot = self.stack_slot(quark, 1)?;
        self.transient.ongoing_value(slot).map(Some)
    }

    fn replace_ongoing_state(&self, intervals: &[StateInterval]) -> Result<()> {
        self.check_writable()?;
        self.transient.replace_ongoing_state(intervals)
    }

    fn close_history(&self, end: i64) -> Result<()> {
        self.check_disposed()?;
        if !self.transient.is_active() {
            return Ok(());
        }

        let end = end.max(self.current_end_time());
        self.transient.close(end)?;
        self.backend.store_attribute_tree(&self.tree.encode()?)?;
        self.backend.finished_building(end)?;
        self.set_state(BuildState::Built);

        info!(ssid = %self.ssid, end, attributes = self.tree.count(), "history closed");
        Ok(())
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.set_state(BuildState::Cancelled);
        debug!(ssid = %self.ssid, "state system cancelled");
    }

    fn remove_files(&self) -> Result<()> {
        self.backend.remove_files()
    }
}

impl fmt::Debug for StateSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateSystem")
            .field("ssid", &self.ssid)
            .field("attributes", &self.tree.count())
            .field("build_state", &self.build_state())
            .finish()
    }
}
