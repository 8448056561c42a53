use bytes::{Bytes, BytesMut};
use tracing::{trace, warn};

use crate::codec::{AssemblerConfig, Frame, Header, HEADER_SIZE};
use crate::error::FrameError;

/// Where the assembler is within the current frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadState {
    /// Hunting for the start marker. Other bytes are line noise.
    Idle,
    /// Marker seen, collecting the fixed-size header.
    ReadingHeader { collected: usize },
    /// Header accepted, collecting exactly `header.length` payload bytes.
    ReadingPayload { header: Header, received: usize },
}

/// Incremental frame reassembly.
///
/// Bytes may be fed one at a time or in bursts of any size; frame boundaries
/// never depend on call boundaries. A malformed or oversized frame is
/// discarded, counted, and the assembler resynchronizes on the next marker.
pub struct FrameAssembler {
    state: ReadState,
    header_buf: [u8; HEADER_SIZE],
    read_buffer: BytesMut,
    config: AssemblerConfig,
    protocol_errors: u64,
}

impl FrameAssembler {
    /// Create an assembler with default configuration.
    pub fn new() -> Self {
        Self::with_config(AssemblerConfig::default())
    }

    /// Create an assembler with explicit configuration.
    pub fn with_config(config: AssemblerConfig) -> Self {
        Self {
            state: ReadState::Idle,
            header_buf: [0; HEADER_SIZE],
            read_buffer: BytesMut::with_capacity(config.max_payload_size),
            config,
            protocol_errors: 0,
        }
    }

    /// Consume `data` and return every frame it completes, in arrival order.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Frame> {
        let mut frames = Vec::new();
        let mut offset = 0;

        while offset < data.len() {
            match self.state {
                ReadState::Idle => {
                    let rest = &data[offset..];
                    match rest.iter().position(|&b| b == self.config.start_marker) {
                        Some(pos) => {
                            if pos > 0 {
                                trace!(discarded = pos, "skipping bytes before start marker");
                            }
                            offset += pos + 1;
                            self.state = ReadState::ReadingHeader { collected: 0 };
                        }
                        None => {
                            trace!(discarded = rest.len(), "no start marker in chunk");
                            offset = data.len();
                        }
                    }
                }

                ReadState::ReadingHeader { collected } => {
                    let to_copy = (HEADER_SIZE - collected).min(data.len() - offset);
                    self.header_buf[collected..collected + to_copy]
                        .copy_from_slice(&data[offset..offset + to_copy]);
                    offset += to_copy;

                    let collected = collected + to_copy;
                    if collected < HEADER_SIZE {
                        self.state = ReadState::ReadingHeader { collected };
                        continue;
                    }

                    match self.accept_header() {
                        Ok(header) if header.length == 0 => {
                            frames.push(Frame::new(header.kind, header.slot, Bytes::new()));
                            self.state = ReadState::Idle;
                        }
                        Ok(header) => {
                            self.read_buffer.clear();
                            self.state = ReadState::ReadingPayload {
                                header,
                                received: 0,
                            };
                        }
                        Err(err) => self.reject(err),
                    }
                }

                ReadState::ReadingPayload { header, received } => {
                    let expected = header.length as usize;
                    let to_copy = (expected - received).min(data.len() - offset);
                    self.read_buffer
                        .extend_from_slice(&data[offset..offset + to_copy]);
                    offset += to_copy;

                    let received = received + to_copy;
                    if received < expected {
                        self.state = ReadState::ReadingPayload { header, received };
                        continue;
                    }

                    let payload = Bytes::copy_from_slice(&self.read_buffer);
                    self.read_buffer.clear();
                    self.state = ReadState::Idle;
                    frames.push(Frame::new(header.kind, header.slot, payload));
                }
            }
        }

        frames
    }

    fn accept_header(&self) -> Result<Header, FrameError> {
        let header = Header::decode(&self.header_buf)?;
        if header.length as usize > self.config.max_payload_size {
            return Err(FrameError::PayloadTooLarge {
                size: header.length as usize,
                max: self.config.max_payload_size,
            });
        }
        Ok(header)
    }

    fn reject(&mut self, err: FrameError) {
        self.protocol_errors += 1;
        warn!(error = %err, total = self.protocol_errors, "discarding malformed frame");
        self.read_buffer.clear();
        self.state = ReadState::Idle;
    }

    /// Current reassembly state.
    pub fn state(&self) -> ReadState {
        self.state
    }

    /// Number of frames discarded as malformed since creation.
    pub fn protocol_errors(&self) -> u64 {
        self.protocol_errors
    }

    /// Drop any partial frame and return to [`ReadState::Idle`].
    pub fn reset(&mut self) {
        self.read_buffer.clear();
        self.state = ReadState::Idle;
    }

    /// Current assembler configuration.
    pub fn config(&self) -> &AssemblerConfig {
        &self.config
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameAssembler")
            .field("state", &self.state)
            .field("buffered", &self.read_buffer.len())
            .field("protocol_errors", &self.protocol_errors)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::*;
    use crate::codec::encode_frame;
    use crate::kind::{FrameKind, COMMAND_MARKER, RESPONSE_MARKER};

    fn wire(frames: &[Frame]) -> Vec<u8> {
        let mut buf = BytesMut::new();
        for frame in frames {
            encode_frame(RESPONSE_MARKER, frame, &mut buf).unwrap();
        }
        buf.to_vec()
    }

    fn sample_stream() -> (Vec<Frame>, Vec<u8>) {
        let frames = vec![
            Frame::new(FrameKind::Discovery, 0, vec![0xAB; 96]),
            Frame::data(0, &b"ok"[..]),
            Frame::ping(),
            Frame::data(1, &b"second device"[..]),
            Frame::new(FrameKind::Interrupt, 0, vec![0, 0, 0, 3]),
        ];
        let bytes = wire(&frames);
        (frames, bytes)
    }

    #[test]
    fn single_frame_in_one_call() {
        let mut assembler = FrameAssembler::new();
        let frames = assembler.feed(&wire(&[Frame::data(2, &b"hello"[..])]));

        assert_eq!(frames, vec![Frame::data(2, &b"hello"[..])]);
        assert_eq!(assembler.state(), ReadState::Idle);
    }

    #[test]
    fn chunking_does_not_change_output() {
        let (expected, bytes) = sample_stream();

        for chunk_size in 1..=bytes.len() {
            let mut assembler = FrameAssembler::new();
            let mut got = Vec::new();
            for chunk in bytes.chunks(chunk_size) {
                got.extend(assembler.feed(chunk));
            }
            assert_eq!(got, expected, "chunk size {chunk_size}");
            assert_eq!(assembler.protocol_errors(), 0);
        }
    }

    #[test]
    fn byte_at_a_time_walks_through_states() {
        let mut assembler = FrameAssembler::new();
        let bytes = wire(&[Frame::data(5, &b"ab"[..])]);

        assert!(assembler.feed(&bytes[..1]).is_empty());
        assert_eq!(assembler.state(), ReadState::ReadingHeader { collected: 0 });

        assert!(assembler.feed(&bytes[1..3]).is_empty());
        assert_eq!(assembler.state(), ReadState::ReadingHeader { collected: 2 });

        assert!(assembler.feed(&bytes[3..5]).is_empty());
        assert!(matches!(
            assembler.state(),
            ReadState::ReadingPayload { received: 0, header }
                if header.slot == 5 && header.length == 2
        ));

        assert!(assembler.feed(&bytes[5..6]).is_empty());
        let frames = assembler.feed(&bytes[6..]);
        assert_eq!(frames, vec![Frame::data(5, &b"ab"[..])]);
        assert_eq!(assembler.state(), ReadState::Idle);
    }

    #[test]
    fn leading_noise_is_discarded() {
        let mut assembler = FrameAssembler::new();
        let mut bytes = vec![0x00, 0xFF, 0x13, 0x37];
        bytes.extend(wire(&[Frame::ping()]));

        let frames = assembler.feed(&bytes);
        assert_eq!(frames, vec![Frame::ping()]);
        assert_eq!(assembler.protocol_errors(), 0);
    }

    #[test]
    fn noise_only_stays_idle() {
        let mut assembler = FrameAssembler::new();
        assert!(assembler.feed(&[1, 2, 3, 4, 5]).is_empty());
        assert_eq!(assembler.state(), ReadState::Idle);
    }

    #[test]
    fn oversized_payload_is_protocol_error_and_resyncs() {
        let mut assembler = FrameAssembler::with_config(AssemblerConfig {
            max_payload_size: 8,
            ..AssemblerConfig::default()
        });

        let mut bytes = vec![RESPONSE_MARKER, 0x01, 0x00, 0x00, 0x20];
        bytes.extend(wire(&[Frame::data(1, &b"fits"[..])]));

        let frames = assembler.feed(&bytes);
        assert_eq!(frames, vec![Frame::data(1, &b"fits"[..])]);
        assert_eq!(assembler.protocol_errors(), 1);
        assert_eq!(assembler.state(), ReadState::Idle);
    }

    #[test]
    fn unknown_kind_is_protocol_error() {
        let mut assembler = FrameAssembler::new();
        let mut bytes = vec![RESPONSE_MARKER, 0x42, 0x00, 0x00, 0x00];
        bytes.extend(wire(&[Frame::ping()]));

        let frames = assembler.feed(&bytes);
        assert_eq!(frames, vec![Frame::ping()]);
        assert_eq!(assembler.protocol_errors(), 1);
    }

    #[test]
    fn marker_inside_payload_is_data() {
        let mut assembler = FrameAssembler::new();
        let payload = vec![RESPONSE_MARKER, RESPONSE_MARKER, 0x01];
        let frames = assembler.feed(&wire(&[Frame::data(0, payload.clone())]));

        assert_eq!(frames, vec![Frame::data(0, payload)]);
    }

    #[test]
    fn command_marker_config() {
        let mut assembler = FrameAssembler::with_config(AssemblerConfig {
            start_marker: COMMAND_MARKER,
            ..AssemblerConfig::default()
        });
        let mut buf = BytesMut::new();
        encode_frame(COMMAND_MARKER, &Frame::discovery_request(), &mut buf).unwrap();
        encode_frame(RESPONSE_MARKER, &Frame::ping(), &mut buf).unwrap();

        let frames = assembler.feed(&buf);
        assert_eq!(frames, vec![Frame::discovery_request()]);
    }

    #[test]
    fn reset_drops_partial_frame() {
        let mut assembler = FrameAssembler::new();
        let bytes = wire(&[Frame::data(0, &b"partial"[..])]);
        assembler.feed(&bytes[..7]);
        assert!(matches!(assembler.state(), ReadState::ReadingPayload { .. }));

        assembler.reset();
        assert_eq!(assembler.state(), ReadState::Idle);
        assert!(assembler.feed(&bytes[7..]).is_empty());
    }

    #[test]
    fn frames_straddling_calls_keep_order() {
        let (expected, bytes) = sample_stream();
        let mut assembler = FrameAssembler::new();
        let split = bytes.len() / 2;

        let mut got = assembler.feed(&bytes[..split]);
        got.extend(assembler.feed(&bytes[split..]));
        assert_eq!(got, expected);
    }
}
