use std::time::Duration;

/// Errors surfaced by bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The slot has no device, or its device was torn down.
    #[error("device in slot {0} is gone")]
    DeviceGone(u8),

    /// The write does not fit in the staging buffer. Nothing was sent.
    #[error("write too large ({size} bytes, max {max})")]
    TooLarge { size: usize, max: usize },

    /// The transport failed to start or finish the write.
    #[error("transport failure: {0}")]
    Transport(#[from] sycamore_transport::TransportError),

    /// The remote endpoint stopped answering probes.
    #[error("remote endpoint stopped answering")]
    LivenessLost,

    /// No data arrived for the device before the read deadline.
    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    /// The bus was detached while the call was pending.
    #[error("bus detached")]
    Detached,

    /// The slot index is outside the device table.
    #[error("slot {slot} out of range (capacity {capacity})")]
    SlotOutOfRange { slot: usize, capacity: usize },

    /// A device is already bound to the slot.
    #[error("slot {0} already occupied")]
    SlotOccupied(u8),

    /// Nothing is bound to the slot.
    #[error("no device in slot {0}")]
    NotFound(u8),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] sycamore_frame::FrameError),

    /// The bus configuration is unusable.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

pub type Result<T> = std::result::Result<T, BusError>;
