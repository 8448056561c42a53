use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::kind::{FrameKind, RESPONSE_MARKER};

/// Frame header after the marker: kind (1) + slot (1) + length (2) = 4 bytes.
pub const HEADER_SIZE: usize = 4;

/// Marker plus header.
pub const FRAME_OVERHEAD: usize = 1 + HEADER_SIZE;

/// Largest payload the 16-bit length field can describe.
pub const MAX_WIRE_PAYLOAD: usize = u16::MAX as usize;

/// Default reassembly buffer capacity: 4 KiB.
pub const DEFAULT_MAX_PAYLOAD: usize = 4 * 1024;

/// A complete frame extracted from (or destined for) the byte stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// What the frame carries.
    pub kind: FrameKind,
    /// Addressed device slot. Zero for kinds that are not addressed.
    pub slot: u8,
    /// The frame payload.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(kind: FrameKind, slot: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            kind,
            slot,
            payload: payload.into(),
        }
    }

    /// Empty keepalive probe.
    pub fn ping() -> Self {
        Self::new(FrameKind::Ping, 0, Bytes::new())
    }

    /// Empty routing table request.
    pub fn discovery_request() -> Self {
        Self::new(FrameKind::Discovery, 0, Bytes::new())
    }

    /// Empty remote reset command.
    pub fn reset() -> Self {
        Self::new(FrameKind::Reset, 0, Bytes::new())
    }

    /// Payload addressed to a device slot.
    pub fn data(slot: u8, payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Data, slot, payload)
    }

    /// The total wire size of this frame (marker + header + payload).
    pub fn wire_size(&self) -> usize {
        encoded_len(self.payload.len())
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub kind: FrameKind,
    pub slot: u8,
    pub length: u16,
}

impl Header {
    /// Decode the 4 header bytes that follow the marker.
    pub fn decode(src: &[u8; HEADER_SIZE]) -> Result<Self> {
        let kind = FrameKind::try_from(src[0])?;
        Ok(Self {
            kind,
            slot: src[1],
            length: u16::from_be_bytes([src[2], src[3]]),
        })
    }

    /// Encode the header bytes.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let len = self.length.to_be_bytes();
        [self.kind as u8, self.slot, len[0], len[1]]
    }
}

/// Wire size of a frame carrying `payload_len` bytes.
pub fn encoded_len(payload_len: usize) -> usize {
    FRAME_OVERHEAD + payload_len
}

/// Encode a frame into the wire format.
///
/// Wire format:
/// ```text
/// ┌──────────┬──────────┬──────────┬────────────┬────────────────┐
/// │ Marker   │ Kind     │ Slot     │ Length     │ Payload        │
/// │ (1B)     │ (1B)     │ (1B)     │ (2B BE)    │ (Length bytes) │
/// │ CD / DC  │          │          │            │                │
/// └──────────┴──────────┴──────────┴────────────┴────────────────┘
/// ```
pub fn encode_frame(marker: u8, frame: &Frame, dst: &mut BytesMut) -> Result<()> {
    if frame.payload.len() > MAX_WIRE_PAYLOAD {
        return Err(FrameError::PayloadTooLarge {
            size: frame.payload.len(),
            max: MAX_WIRE_PAYLOAD,
        });
    }
    let header = Header {
        kind: frame.kind,
        slot: frame.slot,
        length: frame.payload.len() as u16,
    };
    dst.reserve(frame.wire_size());
    dst.put_u8(marker);
    dst.put_slice(&header.encode());
    dst.put_slice(&frame.payload);
    Ok(())
}

/// Configuration for the reassembly engine.
#[derive(Debug, Clone)]
pub struct AssemblerConfig {
    /// Marker that starts every frame the engine should accept.
    pub start_marker: u8,
    /// Reassembly buffer capacity. Longer frames are protocol errors.
    pub max_payload_size: usize,
}

impl Default for AssemblerConfig {
    fn default() -> Self {
        Self {
            start_marker: RESPONSE_MARKER,
            max_payload_size: DEFAULT_MAX_PAYLOAD,
        }
    }
}
