//! Query helpers built on [`StateSystemReader`](crate::StateSystemReader).
//!
//! Everything here works on any reader, so it can run against a history
//! that is still being built.

mod cancel;
mod history;
mod iterator;
mod stack;

pub use cancel::CancelToken;
pub use history::{query_history_range, query_history_range_sampled, query_until_non_null};
pub use iterator::QuarkIterator;
pub use stack::{query_queue_head, query_single_stack_top};
