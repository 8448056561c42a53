//! Physical transport seam for the sycamore bus.
//!
//! The bus core never owns the byte channel. It only consumes two things
//! from whatever drives the wire (a serial line, a pty bridge, a socket):
//! - a write primitive that starts transmitting a complete frame
//! - callbacks that deliver received bytes and signal write completion
//!
//! [`Transport`] is the first, [`BusSink`] is the second.

pub mod error;
pub mod memory;
#[cfg(feature = "async")]
pub mod stream;
pub mod traits;

pub use error::{Result, TransportError};
pub use memory::MemoryTransport;
#[cfg(feature = "async")]
pub use stream::{StreamPump, StreamTransport};
pub use traits::{BusSink, Transport};
