use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tracing::debug;

use crate::error::{Result, TransportError};
use crate::traits::{BusSink, Transport};

/// In-memory transport that records every frame written to it.
///
/// Completions are either signalled by the caller ([`complete_next`]) or,
/// with auto-completion enabled, immediately from inside `write`. The
/// transport also tracks how many writes are outstanding at once so tests
/// can assert single-writer discipline.
///
/// [`complete_next`]: MemoryTransport::complete_next
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
    sink: Mutex<Option<Arc<dyn BusSink>>>,
    auto_complete: bool,
}

#[derive(Default)]
struct MemoryState {
    written: Vec<Bytes>,
    pending: VecDeque<Bytes>,
    max_in_flight: usize,
    fail_next: Option<String>,
}

impl MemoryTransport {
    /// Create a transport whose completions are driven manually.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport that completes every write as soon as it starts.
    pub fn with_auto_complete() -> Self {
        Self {
            auto_complete: true,
            ..Self::default()
        }
    }

    /// Attach the sink that receives completions and injected bytes.
    pub fn connect(&self, sink: Arc<dyn BusSink>) {
        *lock(&self.sink) = Some(sink);
    }

    /// Every frame handed to `write`, in order.
    pub fn written(&self) -> Vec<Bytes> {
        lock(&self.state).written.clone()
    }

    /// Number of writes started but not yet completed.
    pub fn in_flight(&self) -> usize {
        lock(&self.state).pending.len()
    }

    /// Highest number of simultaneously outstanding writes observed.
    pub fn max_in_flight(&self) -> usize {
        lock(&self.state).max_in_flight
    }

    /// Make the next `write` call fail synchronously.
    pub fn fail_next_write(&self, reason: impl Into<String>) {
        lock(&self.state).fail_next = Some(reason.into());
    }

    /// Complete the oldest outstanding write with `result`.
    ///
    /// Returns the completed frame, or `None` when nothing was in flight.
    pub fn complete_next(&self, result: Result<()>) -> Option<Bytes> {
        let frame = lock(&self.state).pending.pop_front()?;
        if let Some(sink) = self.sink() {
            sink.on_write_complete(result);
        }
        Some(frame)
    }

    /// Deliver bytes to the sink as if they arrived from the remote.
    pub fn inject(&self, bytes: &[u8]) {
        if let Some(sink) = self.sink() {
            sink.on_bytes_received(bytes);
        }
    }

    fn sink(&self) -> Option<Arc<dyn BusSink>> {
        lock(&self.sink).clone()
    }
}

impl Transport for MemoryTransport {
    fn write(&self, frame: Bytes) -> Result<()> {
        {
            let mut state = lock(&self.state);
            if let Some(reason) = state.fail_next.take() {
                return Err(TransportError::Rejected(reason));
            }
            state.written.push(frame.clone());
            state.pending.push_back(frame);
            state.max_in_flight = state.max_in_flight.max(state.pending.len());
            debug!(in_flight = state.pending.len(), "memory transport write");
        }

        if self.auto_complete {
            self.complete_next(Ok(()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("MemoryTransport")
            .field("written", &state.written.len())
            .field("in_flight", &state.pending.len())
            .field("auto_complete", &self.auto_complete)
            .finish()
    }
}

// A poisoned lock only means another test thread panicked mid-update;
// the recorded frames are still meaningful.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
