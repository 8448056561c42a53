//! Wire contract for the sycamore bus.
//!
//! Every frame on the physical channel is:
//! - a 1-byte start marker (`0xCD` host to remote, `0xDC` remote to host)
//! - a 4-byte header: kind, slot, big-endian payload length
//! - the payload
//!
//! Bytes may arrive one at a time; [`FrameAssembler`] turns any chunking of
//! the stream into the same sequence of complete frames.

pub mod assembler;
pub mod codec;
pub mod drt;
pub mod error;
pub mod kind;

pub use assembler::{FrameAssembler, ReadState};
pub use codec::{
    encode_frame, encoded_len, AssemblerConfig, Frame, Header, DEFAULT_MAX_PAYLOAD,
    FRAME_OVERHEAD, HEADER_SIZE, MAX_WIRE_PAYLOAD,
};
pub use drt::{
    DeviceRoutingTable, DrtEntry, DRT_ENTRY_SIZE, DRT_HEADER_SIZE, DRT_MAGIC, DRT_VERSION,
    FLAG_MEMORY_DEVICE, MAX_DRT_ENTRIES,
};
pub use error::{FrameError, Result};
pub use kind::{FrameKind, COMMAND_MARKER, RESPONSE_MARKER};
