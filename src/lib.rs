//! # Trace State System
//!
//! Builds and queries a time-versioned model of a traced system's state
//! (threads, CPUs, call stacks, counters) from an ordered stream of
//! timestamped events.
//!
//! ## Core Concepts
//!
//! - **Attributes**: hierarchical paths mapped to dense integer quarks
//! - **Intervals**: `[start, end]` spans during which an attribute holds one value
//! - **Transient state**: the still-open interval of every attribute
//! - **Backends**: pluggable storage for closed intervals (memory, file, none)
//!
//! One writer builds the history while readers query it concurrently.
//!
//! ## Example
//!
//! ```ignore
//! use tracestate::{StateSystem, StateSystemBuilder, StateSystemReader, StateValue};
//!
//! let ss = StateSystem::in_memory("kernel", 10);
//! let thread = ss.get_or_create_absolute_path("Threads/100")?;
//!
//! ss.modify(10, StateValue::from("running"), thread)?;
//! ss.modify(20, StateValue::from("blocked"), thread)?;
//! ss.close_history(30)?;
//!
//! let interval = ss.query_single_state(15, thread)?;
//! assert_eq!(interval.value, StateValue::from("running"));
//!
//! let history = tracestate::query::query_history_range(&ss, thread, 0, 30)?;
//! assert_eq!(history.len(), 2);
//! ```

pub mod attribute;
pub mod backend;
pub mod error;
pub mod provider;
pub mod query;
pub mod registry;
pub mod state_system;
pub mod transient;
pub mod types;

// Re-exports
pub use attribute::{split_path, AttributeTree};
pub use backend::{
    FileBackend, FileBackendConfig, HistoryBackend, InMemoryBackend, NullBackend,
    IGNORE_PROVIDER_VERSION,
};
pub use error::{Result, StateSystemError};
pub use provider::{open_file_history, EventProcessor, ProcessorConfig, StateProvider};
pub use query::{CancelToken, QuarkIterator};
pub use registry::StateSystemRegistry;
pub use state_system::{StateSystem, StateSystemBuilder, StateSystemReader, MAX_STACK_DEPTH};
pub use types::*;
