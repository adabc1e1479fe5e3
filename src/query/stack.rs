//! Historical views of stack and queue attributes.

use crate::error::{Result, StateSystemError};
use crate::state_system::StateSystemReader;
use crate::types::{Quark, StateInterval, StateValue, ValueKind};

/// Depth of a stack attribute at `t`. `None` when it was null.
fn depth_at<R>(ss: &R, t: i64, quark: Quark) -> Result<Option<i32>>
where
    R: StateSystemReader + ?Sized,
{
    match ss.query_single_state(t, quark)?.value {
        StateValue::Null => Ok(None),
        StateValue::Int(depth) => Ok(Some(depth)),
        other => Err(StateSystemError::StateValueType {
            quark,
            expected: ValueKind::Int,
            got: other.kind(),
        }),
    }
}

/// Interval of the top element of the stack rooted at `quark`, at `t`.
///
/// Returns `None` if the stack attribute was null at `t`. A depth that
/// is not strictly positive is an error.
pub fn query_single_stack_top<R>(ss: &R, t: i64, quark: Quark) -> Result<Option<StateInterval>>
where
    R: StateSystemReader + ?Sized,
{
    let Some(depth) = depth_at(ss, t, quark)? else {
        return Ok(None);
    };
    if depth <= 0 {
        return Err(StateSystemError::NotAStack(quark));
    }
    let slot = ss.get_relative(quark, &[depth.to_string().as_str()])?;
    ss.query_single_state(t, slot).map(Some)
}

/// Interval of the head of the queue rooted at `quark`, at `t`.
///
/// Returns `None` when the queue was null or empty.
pub fn query_queue_head<R>(ss: &R, t: i64, quark: Quark) -> Result<Option<StateInterval>>
where
    R: StateSystemReader + ?Sized,
{
    match depth_at(ss, t, quark)? {
        None | Some(0) => Ok(None),
        Some(depth) if depth < 0 => Err(StateSystemError::NotAStack(quark)),
        Some(_) => {
            let slot = ss.get_relative(quark, &["1"])?;
            ss.query_single_state(t, slot).map(Some)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state_system::{StateSystem, StateSystemBuilder};

    #[test]
    fn test_stack_top_over_time() {
        let ss = StateSystem::in_memory("test", 0);
        let stack = ss.get_or_create_absolute(&["Threads", "1", "CallStack"]).unwrap();
        ss.push(10, StateValue::from("main"), stack).unwrap();
        ss.push(20, StateValue::from("foo"), stack).unwrap();
        ss.pop(30, stack).unwrap();
        ss.pop(40, stack).unwrap();
        ss.close_history(50).unwrap();

        assert!(query_single_stack_top(&ss, 5, stack).unwrap().is_none());

        let top = query_single_stack_top(&ss, 25, stack).unwrap().unwrap();
        assert_eq!(top.value, StateValue::from("foo"));
        assert_eq!((top.start, top.end), (20, 29));

        let top = query_single_stack_top(&ss, 35, stack).unwrap().unwrap();
        assert_eq!(top.value, StateValue::from("main"));

        // Emptied stacks hold depth 0, not null.
        assert!(matches!(
            query_single_stack_top(&ss, 45, stack),
            Err(StateSystemError::NotAStack(_))
        ));
    }

    #[test]
    fn test_stack_top_rejects_non_int() {
        let ss = StateSystem::in_memory("test", 0);
        let q = ss.get_or_create_absolute(&["name"]).unwrap();
        ss.modify(1, StateValue::from("x"), q).unwrap();

        let err = query_single_stack_top(&ss, 1, q).unwrap_err();
        assert!(err.is_value_type());
    }

    #[test]
    fn test_queue_head() {
        let ss = StateSystem::in_memory("test", 0);
        let queue = ss.get_or_create_absolute(&["queue"]).unwrap();
        ss.offer(10, StateValue::Long(1), queue).unwrap();
        ss.offer(20, StateValue::Long(2), queue).unwrap();
        ss.poll(30, queue).unwrap();
        ss.poll(40, queue).unwrap();

        assert!(query_queue_head(&ss, 5, queue).unwrap().is_none());
        assert_eq!(
            query_queue_head(&ss, 25, queue).unwrap().unwrap().value,
            StateValue::Long(1)
        );
        assert_eq!(
            query_queue_head(&ss, 35, queue).unwrap().unwrap().value,
            StateValue::Long(2)
        );
        assert!(query_queue_head(&ss, 40, queue).unwrap().is_none());
    }
}
