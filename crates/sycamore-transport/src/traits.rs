use bytes::Bytes;

use crate::error::Result;

/// The write primitive of a physical transport.
///
/// `write` only starts a transmission. The transport reports the outcome
/// later through [`BusSink::on_write_complete`], possibly from another
/// thread and possibly before `write` itself returns.
pub trait Transport: Send + Sync + 'static {
    /// Begin transmitting one complete frame.
    ///
    /// An `Err` means the transmission never started and no completion
    /// will follow.
    fn write(&self, frame: Bytes) -> Result<()>;
}

/// Entry points the transport calls back into.
///
/// Implemented by the bus handle; transports hold it as `Arc<dyn BusSink>`.
pub trait BusSink: Send + Sync {
    /// Bytes arrived from the remote endpoint. Chunking is arbitrary.
    fn on_bytes_received(&self, bytes: &[u8]);

    /// The write started by the last successful [`Transport::write`] finished.
    fn on_write_complete(&self, result: Result<()>);
}
