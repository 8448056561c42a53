use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use bytes::Bytes;
use sycamore_frame::DrtEntry;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::bus::BusShared;
use crate::error::{BusError, Result};

/// A logical device reachable through one slot of the bus.
///
/// Handles stay valid after the device is torn down; every call on a
/// torn-down device fails with [`BusError::DeviceGone`].
pub struct VirtualDevice {
    entry: DrtEntry,
    bus: Weak<BusShared>,
    inbound_tx: mpsc::Sender<Bytes>,
    inbound: Mutex<Inbound>,
    gone: CancellationToken,
    interrupt_pending: AtomicBool,
    dropped: AtomicU64,
}

struct Inbound {
    rx: mpsc::Receiver<Bytes>,
    pending: Bytes,
}

impl VirtualDevice {
    pub(crate) fn new(entry: DrtEntry, bus: Weak<BusShared>, queue_depth: usize) -> Arc<Self> {
        let (inbound_tx, rx) = mpsc::channel(queue_depth);
        Arc::new(Self {
            entry,
            bus,
            inbound_tx,
            inbound: Mutex::new(Inbound {
                rx,
                pending: Bytes::new(),
            }),
            gone: CancellationToken::new(),
            interrupt_pending: AtomicBool::new(false),
            dropped: AtomicU64::new(0),
        })
    }

    pub fn slot(&self) -> u8 {
        self.entry.slot
    }

    /// Routing table entry the device was created from.
    pub fn entry(&self) -> &DrtEntry {
        &self.entry
    }

    pub fn is_gone(&self) -> bool {
        self.gone.is_cancelled()
    }

    /// Inbound frames discarded because the queue was full.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Returns and clears the pending-interrupt flag.
    pub fn take_interrupt(&self) -> bool {
        self.interrupt_pending.swap(false, Ordering::AcqRel)
    }

    /// Send `payload` to the device, waiting for the transport to finish.
    pub async fn write(&self, payload: &[u8]) -> Result<()> {
        let bus = self.bus.upgrade().ok_or(BusError::Detached)?;
        bus.write_device(self, payload).await
    }

    /// Read up to `max_len` bytes from the device.
    ///
    /// Returns as soon as any data is available. A frame longer than
    /// `max_len` is handed out across several reads.
    pub async fn read(&self, max_len: usize) -> Result<Bytes> {
        let (detached, timeout) = {
            let bus = self.bus.upgrade().ok_or(BusError::Detached)?;
            (bus.detached.clone(), bus.config.read_timeout)
        };
        if detached.is_cancelled() {
            return Err(BusError::Detached);
        }
        if self.is_gone() {
            return Err(BusError::DeviceGone(self.slot()));
        }

        let deadline = Instant::now() + timeout;
        let mut inbound = tokio::select! {
            biased;
            _ = detached.cancelled() => return Err(BusError::Detached),
            _ = self.gone.cancelled() => return Err(BusError::DeviceGone(self.slot())),
            _ = tokio::time::sleep_until(deadline) => return Err(BusError::Timeout(timeout)),
            guard = self.inbound.lock() => guard,
        };

        if inbound.pending.is_empty() {
            let next = tokio::select! {
                biased;
                _ = detached.cancelled() => return Err(BusError::Detached),
                _ = self.gone.cancelled() => return Err(BusError::DeviceGone(self.slot())),
                next = inbound.rx.recv() => next,
                _ = tokio::time::sleep_until(deadline) => return Err(BusError::Timeout(timeout)),
            };
            inbound.pending = next.ok_or(BusError::DeviceGone(self.slot()))?;
        }

        let take = max_len.min(inbound.pending.len());
        Ok(inbound.pending.split_to(take))
    }

    /// Queue an inbound payload. Returns false if it had to be dropped.
    pub(crate) fn deliver(&self, payload: Bytes) -> bool {
        match self.inbound_tx.try_send(payload) {
            Ok(()) => true,
            Err(_) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub(crate) fn raise_interrupt(&self) {
        self.interrupt_pending.store(true, Ordering::Release);
    }

    pub(crate) fn gone_token(&self) -> &CancellationToken {
        &self.gone
    }

    /// Tear the device down, waking every pending caller.
    pub(crate) fn invalidate(&self) {
        if !self.gone.is_cancelled() {
            debug!(slot = self.slot(), "device invalidated");
            self.gone.cancel();
        }
    }
}

impl std::fmt::Debug for VirtualDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualDevice")
            .field("slot", &self.entry.slot)
            .field("device_id", &format_args!("{:#06x}", self.entry.device_id))
            .field("sub_id", &self.entry.sub_id)
            .field("gone", &self.is_gone())
            .finish()
    }
}
