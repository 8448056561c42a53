use std::sync::atomic::{AtomicU64, Ordering};

use sycamore_frame::DrtEntry;

/// Notifications for the layer above the bus core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// A routing table announced a new device; it is bound and usable.
    DeviceAdded(DrtEntry),
    /// The device in `slot` was torn down.
    DeviceRemoved { slot: u8 },
    /// The remote endpoint answered after being unknown or lost.
    LivenessConfirmed,
    /// The remote endpoint stopped answering; every device was torn down.
    LivenessLost,
    /// The remote raised an interrupt for `slot`.
    Interrupt { slot: u8 },
    /// The bus was detached.
    Detached,
}

/// Point-in-time bus counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BusStats {
    /// Frames discarded by reassembly or rejected at dispatch.
    pub protocol_errors: u64,
    /// Complete frames handed to the routing table or a device.
    pub frames_dispatched: u64,
    /// Data frames with no bound device or a full device queue.
    pub frames_dropped: u64,
    /// Writes the transport reported as finished.
    pub writes_completed: u64,
    /// Writes that failed in the transport or were aborted.
    pub writes_failed: u64,
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) protocol_errors: AtomicU64,
    pub(crate) frames_dispatched: AtomicU64,
    pub(crate) frames_dropped: AtomicU64,
    pub(crate) writes_completed: AtomicU64,
    pub(crate) writes_failed: AtomicU64,
}

impl Counters {
    pub(crate) fn bump(counter: &AtomicU64, by: u64) {
        counter.fetch_add(by, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> BusStats {
        BusStats {
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            frames_dispatched: self.frames_dispatched.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            writes_completed: self.writes_completed.load(Ordering::Relaxed),
            writes_failed: self.writes_failed.load(Ordering::Relaxed),
        }
    }
}
