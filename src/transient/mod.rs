//! Ongoing (not yet closed) state of every attribute.
//!
//! Each attribute has exactly one open interval at any time: a value and
//! the time it started. Changing the value closes the open interval into
//! the history backend.

mod state;

pub use state::TransientState;
