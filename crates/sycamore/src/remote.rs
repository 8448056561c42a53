use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use sycamore_frame::{
    encode_frame, AssemblerConfig, DeviceRoutingTable, Frame, FrameAssembler, FrameKind,
    COMMAND_MARKER, RESPONSE_MARKER,
};
use sycamore_transport::{BusSink, Result, Transport, TransportError};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Transport half of a simulated remote bus master.
///
/// Frames written here are handled by the paired [`RemoteTask`], which
/// answers discovery requests with its routing table, pings with pongs,
/// and echoes data frames back to the slot they were sent to.
#[derive(Debug, Clone)]
pub struct SimulatedRemote {
    tx: mpsc::UnboundedSender<Bytes>,
}

/// Runs the simulated remote. Ends when every [`SimulatedRemote`] is dropped.
pub struct RemoteTask {
    rx: mpsc::UnboundedReceiver<Bytes>,
    table: DeviceRoutingTable,
    assembler: FrameAssembler,
    chunk_size: usize,
    answer_pings: bool,
}

impl SimulatedRemote {
    pub fn new(table: DeviceRoutingTable) -> (Self, RemoteTask) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = RemoteTask {
            rx,
            table,
            assembler: FrameAssembler::with_config(AssemblerConfig {
                start_marker: COMMAND_MARKER,
                ..AssemblerConfig::default()
            }),
            chunk_size: usize::MAX,
            answer_pings: true,
        };
        (Self { tx }, task)
    }
}

impl Transport for SimulatedRemote {
    fn write(&self, frame: Bytes) -> Result<()> {
        self.tx.send(frame).map_err(|_| TransportError::Shutdown)
    }
}

impl RemoteTask {
    /// Deliver replies in chunks of at most `size` bytes.
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    /// Stay silent on pings and discovery requests, like a dead link.
    pub fn unresponsive(mut self) -> Self {
        self.answer_pings = false;
        self
    }

    pub async fn run(mut self, sink: Arc<dyn BusSink>) {
        while let Some(wire) = self.rx.recv().await {
            sink.on_write_complete(Ok(()));

            let mut out = BytesMut::new();
            for frame in self.assembler.feed(&wire) {
                trace!(kind = %frame.kind, slot = frame.slot, "remote received frame");
                if let Some(reply) = self.answer(frame) {
                    if let Err(err) = encode_frame(RESPONSE_MARKER, &reply, &mut out) {
                        debug!(error = %err, "remote reply dropped");
                    }
                }
            }
            for chunk in out.chunks(self.chunk_size) {
                sink.on_bytes_received(chunk);
            }
        }
        debug!("simulated remote stopped");
    }

    fn answer(&self, frame: Frame) -> Option<Frame> {
        match frame.kind {
            FrameKind::Ping if self.answer_pings => Some(Frame::ping()),
            FrameKind::Discovery if self.answer_pings => Some(Frame::new(
                FrameKind::Discovery,
                0,
                self.table.encode(),
            )),
            FrameKind::Data if self.table.entry(frame.slot).is_some() => {
                Some(Frame::data(frame.slot, frame.payload))
            }
            _ => None,
        }
    }
}
