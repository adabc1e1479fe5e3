//! Single-writer event processing thread.

use super::StateProvider;
use crate::error::{Result, StateSystemError};
use crate::state_system::{StateSystem, StateSystemBuilder, StateSystemReader};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Event processor configuration.
#[derive(Clone, Debug)]
pub struct ProcessorConfig {
    /// Capacity of the event channel. Senders block when it is full.
    pub queue_size: usize,

    /// Name of the writer thread.
    pub thread_name: String,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            queue_size: 127,
            thread_name: String::from("state-provider"),
        }
    }
}

enum Message<E> {
    Event(E),
    /// Acknowledged once every earlier message has been handled.
    Barrier(Sender<()>),
}

/// Counters shared with the writer thread.
struct Progress {
    latest_safe_time: AtomicI64,
    failures: AtomicU64,
}

/// Runs a [`StateProvider`] on its own thread.
///
/// Events are handled strictly in the order they were sent. A failing
/// event is logged and counted, and processing continues with the next.
pub struct EventProcessor<P: StateProvider> {
    sender: Option<Sender<Message<P::Event>>>,
    handle: Option<JoinHandle<Result<P>>>,
    progress: Arc<Progress>,
    ss: Arc<StateSystem>,
}

impl<P: StateProvider> EventProcessor<P> {
    /// Spawn the writer thread for `provider`, building into `ss`.
    pub fn start(provider: P, ss: Arc<StateSystem>, config: ProcessorConfig) -> Result<Self> {
        if config.queue_size == 0 {
            return Err(StateSystemError::InvalidArgument(
                "event queue size must be positive".into(),
            ));
        }

        let (sender, receiver) = bounded(config.queue_size);
        let progress = Arc::new(Progress {
            latest_safe_time: AtomicI64::new(ss.start_time() - 1),
            failures: AtomicU64::new(0),
        });

        let handle = {
            let ss = ss.clone();
            let progress = progress.clone();
            thread::Builder::new()
                .name(config.thread_name.clone())
                .spawn(move || run(provider, &ss, receiver, &progress))?
        };

        debug!(ssid = %ss.ssid(), thread = %config.thread_name, "event processor started");

        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
            progress,
            ss,
        })
    }

    /// Queue an event, blocking while the channel is full.
    pub fn process(&self, event: P::Event) -> Result<()> {
        let sender = self.sender.as_ref().ok_or_else(stopped)?;
        sender.send(Message::Event(event)).map_err(|_| stopped())
    }

    /// Block until every event sent so far has been handled.
    pub fn wait_for_empty_queue(&self) -> Result<()> {
        let sender = self.sender.as_ref().ok_or_else(stopped)?;
        let (ack_tx, ack_rx) = bounded(1);
        sender.send(Message::Barrier(ack_tx)).map_err(|_| stopped())?;
        ack_rx.recv().map_err(|_| stopped())
    }

    /// Latest time up to which the state system is known to be complete.
    pub fn latest_safe_time(&self) -> i64 {
        self.progress.latest_safe_time.load(Ordering::Acquire)
    }

    /// Number of events whose handling failed.
    pub fn failure_count(&self) -> u64 {
        self.progress.failures.load(Ordering::Acquire)
    }

    /// The state system being built.
    pub fn state_system(&self) -> &Arc<StateSystem> {
        &self.ss
    }

    /// Drain the queue, close the history at the last event time and stop
    /// the writer thread. Returns the provider.
    pub fn finish(mut self) -> Result<P> {
        self.sender.take();
        let handle = self.handle.take().ok_or_else(stopped)?;
        handle
            .join()
            .map_err(|_| StateSystemError::ProviderFailed("event handler panicked".into()))?
    }
}

impl<P: StateProvider> Drop for EventProcessor<P> {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn stopped() -> StateSystemError {
    StateSystemError::ProviderFailed("event handler has stopped".into())
}

fn run<P: StateProvider>(
    mut provider: P,
    ss: &StateSystem,
    receiver: Receiver<Message<P::Event>>,
    progress: &Progress,
) -> Result<P> {
    let mut last_time: Option<i64> = None;
    let mut handled = 0u64;

    for message in receiver.iter() {
        let event = match message {
            Message::Barrier(ack) => {
                let _ = ack.send(());
                continue;
            }
            Message::Event(event) => event,
        };
        if ss.is_cancelled() {
            debug!(ssid = %ss.ssid(), handled, "state system cancelled, stopping event processing");
            return Ok(provider);
        }

        let t = provider.event_time(&event);
        progress.latest_safe_time.store(t - 1, Ordering::Release);
        if let Err(e) = provider.handle_event(ss, &event) {
            progress.failures.fetch_add(1, Ordering::AcqRel);
            warn!(ssid = %ss.ssid(), t, error = %e, "failed to handle event");
        }
        last_time = Some(last_time.map_or(t, |last| last.max(t)));
        handled += 1;
    }

    if ss.is_cancelled() {
        return Ok(provider);
    }

    provider.done(ss)?;
    let end = last_time.unwrap_or_else(|| ss.current_end_time());
    ss.close_history(end)?;
    progress
        .latest_safe_time
        .store(ss.current_end_time(), Ordering::Release);

    info!(
        ssid = %ss.ssid(),
        handled,
        failures = progress.failures.load(Ordering::Acquire),
        "event processing finished"
    );
    Ok(provider)
}
