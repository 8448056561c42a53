use std::io::ErrorKind;
use std::sync::Arc;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{Result, TransportError};
use crate::traits::{BusSink, Transport};

const READ_CHUNK_SIZE: usize = 4 * 1024;

/// Transport over any tokio byte stream.
///
/// `write` only queues the frame; the paired [`StreamPump`] performs the
/// actual I/O and reports completion to the sink. A pty bridged to a serial
/// line and a Unix domain socket both fit here.
#[derive(Debug, Clone)]
pub struct StreamTransport {
    tx: mpsc::UnboundedSender<Bytes>,
}

/// Drives the I/O for a [`StreamTransport`].
///
/// Run it on a task after the bus is attached. It ends cleanly once every
/// `StreamTransport` clone is dropped, and with an error when the stream
/// fails or the remote closes it.
pub struct StreamPump<S> {
    stream: S,
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl StreamTransport {
    /// Split a byte stream into a transport handle and its I/O pump.
    pub fn new<S>(stream: S) -> (Self, StreamPump<S>)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, StreamPump { stream, rx })
    }
}

impl Transport for StreamTransport {
    fn write(&self, frame: Bytes) -> Result<()> {
        self.tx.send(frame).map_err(|_| TransportError::Shutdown)
    }
}

impl<S> StreamPump<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Pump bytes between the stream and `sink` until shutdown.
    pub async fn run(self, sink: Arc<dyn BusSink>) -> Result<()> {
        let (mut reader, mut writer) = tokio::io::split(self.stream);
        let mut rx = self.rx;
        let mut chunk = vec![0u8; READ_CHUNK_SIZE];

        loop {
            tokio::select! {
                read = reader.read(&mut chunk) => match read {
                    Ok(0) => {
                        debug!("stream closed by remote");
                        return Err(TransportError::Closed);
                    }
                    Ok(n) => {
                        trace!(size = n, "stream bytes received");
                        sink.on_bytes_received(&chunk[..n]);
                    }
                    Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                    Err(err) => return Err(TransportError::Io(err)),
                },
                next = rx.recv() => match next {
                    Some(frame) => {
                        let result = write_frame(&mut writer, &frame).await;
                        sink.on_write_complete(result);
                    }
                    None => {
                        debug!("stream transport dropped, pump exiting");
                        return Ok(());
                    }
                },
            }
        }
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::io::duplex;
    use tokio::sync::Notify;

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        received: Mutex<Vec<u8>>,
        completions: Mutex<Vec<bool>>,
        notify: Notify,
    }

    impl BusSink for RecordingSink {
        fn on_bytes_received(&self, bytes: &[u8]) {
            self.received.lock().unwrap().extend_from_slice(bytes);
            self.notify.notify_one();
        }

        fn on_write_complete(&self, result: Result<()>) {
            self.completions.lock().unwrap().push(result.is_ok());
            self.notify.notify_one();
        }
    }

    #[tokio::test]
    async fn writes_reach_the_stream_and_complete() {
        let (local, mut remote) = duplex(64);
        let (transport, pump) = StreamTransport::new(local);
        let sink = Arc::new(RecordingSink::default());
        let task = tokio::spawn(pump.run(sink.clone()));

        transport.write(Bytes::from_static(b"\xCD\x00\x00\x00\x00")).unwrap();

        let mut buf = [0u8; 5];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"\xCD\x00\x00\x00\x00");

        while sink.completions.lock().unwrap().is_empty() {
            sink.notify.notified().await;
        }
        assert_eq!(sink.completions.lock().unwrap().as_slice(), &[true]);

        drop(transport);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn received_bytes_reach_the_sink() {
        let (local, mut remote) = duplex(64);
        let (_transport, pump) = StreamTransport::new(local);
        let sink = Arc::new(RecordingSink::default());
        let _task = tokio::spawn(pump.run(sink.clone()));

        remote.write_all(b"\xDC\x00").await.unwrap();
        remote.write_all(b"\x00\x00\x00").await.unwrap();

        while sink.received.lock().unwrap().len() < 5 {
            sink.notify.notified().await;
        }
        assert_eq!(
            sink.received.lock().unwrap().as_slice(),
            b"\xDC\x00\x00\x00\x00"
        );
    }

    #[tokio::test]
    async fn remote_close_ends_pump_with_closed() {
        let (local, remote) = duplex(64);
        let (_transport, pump) = StreamTransport::new(local);
        let sink = Arc::new(RecordingSink::default());
        let task = tokio::spawn(pump.run(sink));

        drop(remote);
        let result = task.await.unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn write_after_pump_exit_is_shutdown() {
        let (local, _remote) = duplex(64);
        let (transport, pump) = StreamTransport::new(local);
        drop(pump);

        let err = transport.write(Bytes::from_static(b"x")).unwrap_err();
        assert!(matches!(err, TransportError::Shutdown));
    }
}
