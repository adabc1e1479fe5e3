//! Range queries over the history of one attribute.

use super::CancelToken;
use crate::error::{Result, StateSystemError};
use crate::state_system::StateSystemReader;
use crate::types::{Quark, StateInterval};

/// Clamp `[t1, t2]` to the range covered by `ss`.
///
/// Fails when the range is inverted or lies entirely outside the history.
pub(crate) fn clamp_range<R>(ss: &R, t1: i64, t2: i64) -> Result<(i64, i64)>
where
    R: StateSystemReader + ?Sized,
{
    if t1 > t2 {
        return Err(StateSystemError::InvalidArgument(format!(
            "inverted time range [{}, {}]",
            t1, t2
        )));
    }
    let start = ss.start_time();
    let end = ss.current_end_time();
    if t2 < start || t1 > end {
        return Err(StateSystemError::TimeRange { t: t1, start, end });
    }
    Ok((t1.max(start), t2.min(end)))
}

/// Every interval of `quark` intersecting `[t1, t2]`, in time order.
///
/// The range is clipped to the history's bounds. The walk stops early once
/// the state system is cancelled, returning the intervals gathered so far.
pub fn query_history_range<R>(ss: &R, quark: Quark, t1: i64, t2: i64) -> Result<Vec<StateInterval>>
where
    R: StateSystemReader + ?Sized,
{
    let (t1, t2) = clamp_range(ss, t1, t2)?;

    let mut intervals: Vec<StateInterval> = Vec::new();
    let mut t = t1;
    while t <= t2 {
        if ss.is_cancelled() {
            break;
        }
        let interval = ss.query_single_state(t, quark)?;
        t = match interval.end.checked_add(1) {
            Some(next) => next,
            None => t2.saturating_add(1),
        };
        intervals.push(interval);
    }
    Ok(intervals)
}

/// Intervals of `quark` sampled every `resolution` time units over `[t1, t2]`.
///
/// Samples are taken on a grid anchored at `t1`; an interval spanning
/// several grid points is returned once, and intervals falling between
/// two grid points are skipped. The interval containing `t2` is always
/// included. At most `ceil((t2 - t1) / resolution) + 2` intervals are
/// returned. When `cancel` fires or the state system is cancelled, the
/// intervals gathered so far are returned.
pub fn query_history_range_sampled<R>(
    ss: &R,
    quark: Quark,
    t1: i64,
    t2: i64,
    resolution: i64,
    cancel: &CancelToken,
) -> Result<Vec<StateInterval>>
where
    R: StateSystemReader + ?Sized,
{
    if resolution <= 0 {
        return Err(StateSystemError::InvalidArgument(format!(
            "resolution must be positive, got {}",
            resolution
        )));
    }
    let (t1, t2) = clamp_range(ss, t1, t2)?;

    let mut intervals: Vec<StateInterval> = Vec::new();
    let mut ts = t1;
    while ts <= t2 {
        if cancel.is_cancelled() || ss.is_cancelled() {
            return Ok(intervals);
        }
        let interval = ss.query_single_state(ts, quark)?;
        let skip = ((interval.end - ts) / resolution + 1).saturating_mul(resolution);
        intervals.push(interval);
        ts = match ts.checked_add(skip) {
            Some(next) => next,
            None => break,
        };
    }

    let covered = intervals.last().map_or(false, |last| last.end >= t2);
    if !covered && !cancel.is_cancelled() && !ss.is_cancelled() {
        intervals.push(ss.query_single_state(t2, quark)?);
    }
    Ok(intervals)
}

/// First interval of `quark` within `[t1, t2]` holding a non-null value.
///
/// Returns `None` when every interval in the range is null, when the range
/// lies outside the history, or once the state system is cancelled.
pub fn query_until_non_null<R>(
    ss: &R,
    quark: Quark,
    t1: i64,
    t2: i64,
) -> Result<Option<StateInterval>>
where
    R: StateSystemReader + ?Sized,
{
    let (t1, t2) = match clamp_range(ss, t1, t2) {
        Ok(range) => range,
        Err(StateSystemError::TimeRange { .. }) => return Ok(None),
        Err(e) => return Err(e),
    };

    let mut t = t1;
    while !ss.is_cancelled() {
        let interval = ss.query_single_state(t, quark)?;
        if !interval.value.is_null() {
            return Ok(Some(interval));
        }
        if interval.end >= t2 {
            return Ok(None);
        }
        t = interval.end + 1;
    }
    Ok(None)
}
