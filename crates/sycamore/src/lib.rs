//! Virtual device channels over a single serial-style link.
//!
//! A remote bus master announces its devices in a Device Routing Table;
//! the host multiplexes reads and writes for every device over one byte
//! stream and watches the remote with periodic probes.
//!
//! # Crate Structure
//!
//! - [`transport`]: the physical transport seam (memory, tokio streams)
//! - [`frame`]: wire format, reassembly engine, routing table schema
//! - [`bus`]: the bus core: routing, write serialization, liveness
//! - [`remote`]: an in-process remote endpoint (behind `sim` feature)

/// Re-export transport types.
pub mod transport {
    pub use sycamore_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use sycamore_frame::*;
}

/// Re-export bus types.
pub mod bus {
    pub use sycamore_bus::*;
}

pub use sycamore_bus::{Bus, BusConfig, BusError, BusEvent, VirtualDevice};

/// In-process remote endpoint (requires `sim` feature).
#[cfg(feature = "sim")]
pub mod remote;
