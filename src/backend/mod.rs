//! Storage backends for closed state intervals.
//!
//! The state system only ever talks to a backend through
//! [`HistoryBackend`], so the physical layout can change without touching
//! the query logic. Three implementations ship with the crate:
//!
//! - [`InMemoryBackend`]: sorted per-attribute vectors, for tests and small traces
//! - [`FileBackend`]: append-only interval file with an in-memory index
//! - [`NullBackend`]: keeps nothing, only the ongoing state is queryable

mod file;
mod memory;
mod null;

pub use file::{FileBackend, FileBackendConfig, IGNORE_PROVIDER_VERSION};
pub use memory::InMemoryBackend;
pub use null::NullBackend;

use crate::error::Result;
use crate::types::{Quark, StateInterval, StateValue};

/// Contract between the state system and its interval storage.
///
/// Implementations must be safe to call from one writer and many readers
/// at once. After [`dispose`](Self::dispose), queries must fail with
/// `StateSystemError::Disposed` rather than touch released resources.
pub trait HistoryBackend: Send + Sync {
    /// Identifier of the state system this backend stores.
    fn ssid(&self) -> &str;

    /// Earliest time covered by the history.
    fn start_time(&self) -> i64;

    /// Latest end time of any interval inserted so far.
    fn end_time(&self) -> i64;

    /// Store a closed interval. Intervals of one quark arrive in time order.
    fn insert_past_interval(
        &self,
        quark: Quark,
        start: i64,
        end: i64,
        value: StateValue,
    ) -> Result<()>;

    /// The stored interval of `quark` containing `t`, if any.
    fn query_point(&self, t: i64, quark: Quark) -> Result<Option<StateInterval>>;

    /// Every stored interval of `quark` intersecting `[t1, t2]`, in order.
    fn query_range(&self, quark: Quark, t1: i64, t2: i64) -> Result<Vec<StateInterval>> {
        let mut intervals = Vec::new();
        let mut t = t1;
        while t <= t2 {
            let Some(interval) = self.query_point(t, quark)? else {
                break;
            };
            let end = interval.end;
            intervals.push(interval);
            if end >= t2 {
                break;
            }
            t = end + 1;
        }
        Ok(intervals)
    }

    /// Mark the history as complete up to `end_time`.
    fn finished_building(&self, end_time: i64) -> Result<()>;

    /// Release every resource held by the backend. Idempotent.
    fn dispose(&self);

    /// Delete any on-disk artifacts. No-op for volatile backends.
    fn remove_files(&self) -> Result<()> {
        Ok(())
    }

    /// Persist the serialized attribute tree alongside the history.
    fn store_attribute_tree(&self, _encoded: &[u8]) -> Result<()> {
        Ok(())
    }

    /// Serialized attribute tree of a previously finished history.
    fn load_attribute_tree(&self) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}
