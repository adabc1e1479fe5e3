//! Feeding events into a state system.
//!
//! A [`StateProvider`] turns one event into state changes. An
//! [`EventProcessor`] runs a provider on a dedicated writer thread fed by
//! a bounded channel, so the reading side (typically a trace parser) is
//! slowed down rather than buffering without limit.

mod processor;

pub use processor::{EventProcessor, ProcessorConfig};

use crate::backend::{FileBackend, FileBackendConfig};
use crate::error::Result;
use crate::state_system::StateSystem;
use std::sync::Arc;

/// Translates events into state system mutations.
pub trait StateProvider: Send + 'static {
    type Event: Send + 'static;

    /// Version of the provider logic. Histories built by another version
    /// are not reused by [`open_file_history`].
    fn version(&self) -> i32;

    /// Timestamp of an event. Events must arrive in non-decreasing order.
    fn event_time(&self, event: &Self::Event) -> i64;

    /// Apply one event to the state system.
    fn handle_event(&mut self, ss: &StateSystem, event: &Self::Event) -> Result<()>;

    /// Called once after the last event, before the history is closed.
    fn done(&mut self, _ss: &StateSystem) -> Result<()> {
        Ok(())
    }
}

/// Open the file history built by `provider` at `config.path`, or start a
/// new one.
///
/// `config.provider_version` is replaced by the provider's version, so a
/// history built by another version is deleted and rebuilt. Returns the
/// state system and whether it still has to be built.
pub fn open_file_history<P: StateProvider>(
    provider: &P,
    mut config: FileBackendConfig,
) -> Result<(Arc<StateSystem>, bool)> {
    config.provider_version = provider.version();
    let (backend, is_new) = FileBackend::open_or_create(config)?;
    let ss = StateSystem::new(Arc::new(backend), is_new)?;
    Ok((Arc::new(ss), is_new))
}
