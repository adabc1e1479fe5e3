//! Backend that keeps no history.

use super::HistoryBackend;
use crate::error::Result;
use crate::types::{Quark, StateInterval, StateValue};
use std::sync::atomic::{AtomicI64, Ordering};

/// Discards every closed interval.
///
/// Useful when only the current state matters: queries at or after an
/// attribute's ongoing start time are answered by the state system, and
/// anything older is reported as out of range.
pub struct NullBackend {
    ssid: String,
    start_time: i64,
    end_time: AtomicI64,
}

impl NullBackend {
    pub fn new(ssid: impl Into<String>, start_time: i64) -> Self {
        Self {
            ssid: ssid.into(),
            start_time,
            end_time: AtomicI64::new(start_time),
        }
    }
}

impl HistoryBackend for NullBackend {
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
        _quark: Quark,
        _start: i64,
        end: i64,
        _value: StateValue,
    ) -> Result<()> {
        self.end_time.fetch_max(end, Ordering::AcqRel);
        Ok(())
    }

    fn query_point(&self, _t: i64, _quark: Quark) -> Result<Option<StateInterval>> {
        Ok(None)
    }

    fn finished_building(&self, end_time: i64) -> Result<()> {
        self.end_time.fetch_max(end_time, Ordering::AcqRel);
        Ok(())
    }

    fn dispose(&self) {}
}
