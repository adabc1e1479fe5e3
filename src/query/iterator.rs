//! Bidirectional iteration over the intervals of one attribute.

use crate::error::Result;
use crate::state_system::StateSystemReader;
use crate::types::{Quark, StateInterval};

/// Walks the intervals of a quark over `[t1, t2]`, forwards or backwards.
///
/// With a resolution above 1, query times are snapped to a grid anchored
/// at `t1`, so intervals falling between two grid points are skipped. The
/// history end is re-read on every step: iterating while the history is
/// still being built picks up new intervals as they appear.
///
/// One interval ahead and one behind the current position are cached.
pub struct QuarkIterator<'a, R: StateSystemReader + ?Sized> {
    ss: &'a R,
    quark: Quark,
    t1: i64,
    t2: i64,
    resolution: i64,
    current: Option<StateInterval>,
    next: Option<StateInterval>,
    previous: Option<StateInterval>,
}

impl<'a, R: StateSystemReader + ?Sized> QuarkIterator<'a, R> {
    /// Iterate over `quark` between `t1` and `t2` inclusive. A resolution
    /// below 1 is treated as 1.
    pub fn new(ss: &'a R, quark: Quark, t1: i64, t2: i64, resolution: i64) -> Self {
        Self {
            ss,
            quark,
            t1,
            t2,
            resolution: resolution.max(1),
            current: None,
            next: None,
            previous: None,
        }
    }

    /// Interval at the current position.
    pub fn current(&self) -> Option<&StateInterval> {
        self.current.as_ref()
    }

    fn bounds(&self) -> (i64, i64) {
        (
            self.t1.max(self.ss.start_time()),
            self.t2.min(self.ss.current_end_time()),
        )
    }

    fn next_query_time(&self) -> Option<i64> {
        let (lower, upper) = self.bounds();
        let t = match &self.current {
            None => lower,
            Some(current) => {
                let after = current.end.checked_add(1)?;
                if self.resolution > 1 {
                    let steps = (current.end - self.t1).max(0) / self.resolution + 1;
                    let grid = self.t1.saturating_add(steps.saturating_mul(self.resolution));
                    if grid > upper && after <= upper {
                        // Past the last grid point: still report the interval holding t2.
                        upper
                    } else {
                        grid.max(after)
                    }
                } else {
                    after
                }
            }
        };
        (lower <= t && t <= upper).then_some(t)
    }

    fn previous_query_time(&self) -> Option<i64> {
        let (lower, upper) = self.bounds();
        let t = match &self.current {
            None => upper,
            Some(current) => {
                let before = current.start.checked_sub(1)?;
                if self.resolution > 1 && before >= self.t1 {
                    let grid = self.t1 + (before - self.t1) / self.resolution * self.resolution;
                    grid.max(lower)
                } else {
                    before
                }
            }
        };
        (lower <= t && t <= upper).then_some(t)
    }

    /// Whether another interval follows the current one.
    pub fn has_next(&mut self) -> Result<bool> {
        if self.next.is_some() {
            return Ok(true);
        }
        while let Some(t) = self.next_query_time() {
            let interval = self.ss.query_single_state(t, self.quark)?;
            match &self.current {
                // The current interval was still open and has since grown.
                Some(current) if interval.start <= current.end => {
                    self.current = Some(interval);
                }
                _ => {
                    self.next = Some(interval);
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Whether another interval precedes the current one.
    pub fn has_previous(&mut self) -> Result<bool> {
        if self.previous.is_some() {
            return Ok(true);
        }
        match self.previous_query_time() {
            Some(t) => {
                self.previous = Some(self.ss.query_single_state(t, self.quark)?);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Step backwards and return the new current interval.
    pub fn previous(&mut self) -> Option<Result<StateInterval>> {
        match self.has_previous() {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => return Some(Err(e)),
        }
        let previous = self.previous.take()?;
        let old = self.current.replace(previous.clone());
        self.next = old.filter(|old| previous.end.checked_add(1) == Some(old.start));
        Some(Ok(previous))
    }
}

impl<R: StateSystemReader + ?Sized> Iterator for QuarkIterator<'_, R> {
    type Item = Result<StateInterval>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.has_next() {
            Ok(true) => {}
            Ok(false) => return None,
            Err(e) => return Some(Err(e)),
        }
        let next = self.next.take()?;
        let old = self.current.replace(next.clone());
        self.previous = old.filter(|old| old.end.checked_add(1) == Some(next.start));
        Some(Ok(next))
    }
}
