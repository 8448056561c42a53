//! Single-writer discipline for the transport.
//!
//! The transport accepts one frame at a time and reports completion
//! asynchronously. Callers queue on a fair mutex that guards the staging
//! buffer, so the lock is granted in arrival order; the holder encodes its
//! frame, starts the transport write, and keeps the lock until the
//! completion for that write arrives.
//!
//! A write abandoned on liveness loss or detach is still on the transport.
//! Its slot stays marked until the late completion arrives; that completion
//! is swallowed, and no new transport write starts before it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::{Bytes, BytesMut};
use sycamore_frame::{encode_frame, Frame, COMMAND_MARKER, FRAME_OVERHEAD};
use sycamore_transport::{Transport, TransportError};
use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{BusError, Result};

/// Who started a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOwner {
    /// Probes and commands issued by the bus itself.
    Engine,
    /// A device write for the given slot.
    Device(u8),
}

/// Why an in-flight write is being abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LivenessLost,
    Detached,
}

impl AbortReason {
    fn error_for(self, owner: WriteOwner) -> BusError {
        match (self, owner) {
            (AbortReason::Detached, _) => BusError::Detached,
            (AbortReason::LivenessLost, WriteOwner::Device(slot)) => BusError::DeviceGone(slot),
            (AbortReason::LivenessLost, WriteOwner::Engine) => BusError::LivenessLost,
        }
    }
}

struct InFlight {
    owner: WriteOwner,
    done: oneshot::Sender<Result<()>>,
}

/// The transport's single write slot.
#[derive(Default)]
enum Channel {
    #[default]
    Idle,
    Active(InFlight),
    /// The writer gave up; the transport has not reported completion yet.
    Abandoned(WriteOwner),
}

impl Channel {
    fn abandon(&mut self) -> Option<InFlight> {
        match std::mem::take(self) {
            Channel::Active(in_flight) => {
                *self = Channel::Abandoned(in_flight.owner);
                Some(in_flight)
            }
            other => {
                *self = other;
                None
            }
        }
    }
}

/// Serializes frame writes onto a single transport.
pub struct WriteSerializer {
    transport: Arc<dyn Transport>,
    write_buffer: tokio::sync::Mutex<BytesMut>,
    channel: Mutex<Channel>,
    settled: Notify,
    capacity: usize,
    waiters: AtomicUsize,
}

impl WriteSerializer {
    /// `capacity` bounds the encoded frame, overhead included.
    pub fn new(transport: Arc<dyn Transport>, capacity: usize) -> Self {
        Self {
            transport,
            write_buffer: tokio::sync::Mutex::new(BytesMut::with_capacity(capacity)),
            channel: Mutex::new(Channel::Idle),
            settled: Notify::new(),
            capacity,
            waiters: AtomicUsize::new(0),
        }
    }

    /// Largest payload a single write can carry.
    pub fn max_payload(&self) -> usize {
        self.capacity.saturating_sub(FRAME_OVERHEAD)
    }

    /// Reject payloads that cannot fit, before touching any state.
    pub fn check_size(&self, payload_len: usize) -> Result<()> {
        if payload_len > self.max_payload() {
            return Err(BusError::TooLarge {
                size: payload_len,
                max: self.max_payload(),
            });
        }
        Ok(())
    }

    /// Write `frame` once every earlier caller has finished.
    ///
    /// `gone` is the owning device's teardown signal, if any. `detached`
    /// ends the wait when the bus goes away.
    pub async fn enqueue_write(
        &self,
        owner: WriteOwner,
        frame: &Frame,
        gone: Option<&CancellationToken>,
        detached: &CancellationToken,
    ) -> Result<()> {
        self.check_size(frame.payload.len())?;

        self.waiters.fetch_add(1, Ordering::Relaxed);
        let acquired = tokio::select! {
            biased;
            _ = detached.cancelled() => Err(BusError::Detached),
            _ = cancelled(gone) => Err(gone_error(owner)),
            guard = self.write_buffer.lock() => Ok(guard),
        };
        self.waiters.fetch_sub(1, Ordering::Relaxed);
        let mut buffer = acquired?;

        self.wait_for_abandoned(owner, gone, detached).await?;
        if detached.is_cancelled() {
            return Err(BusError::Detached);
        }
        if gone.is_some_and(CancellationToken::is_cancelled) {
            return Err(gone_error(owner));
        }

        buffer.clear();
        encode_frame(COMMAND_MARKER, frame, &mut buffer)?;
        let wire = Bytes::copy_from_slice(&buffer);

        let (done, completion) = oneshot::channel();
        *lock(&self.channel) = Channel::Active(InFlight { owner, done });

        trace!(?owner, kind = %frame.kind, len = wire.len(), "starting transport write");
        if let Err(err) = self.transport.write(wire) {
            *lock(&self.channel) = Channel::Idle;
            return Err(BusError::Transport(err));
        }

        let outcome = tokio::select! {
            biased;
            result = completion => result.unwrap_or(Err(BusError::Detached)),
            _ = detached.cancelled() => {
                lock(&self.channel).abandon();
                Err(BusError::Detached)
            }
        };
        drop(buffer);
        outcome
    }

    /// Hold the lock holder back while an abandoned write is still on the transport.
    async fn wait_for_abandoned(
        &self,
        owner: WriteOwner,
        gone: Option<&CancellationToken>,
        detached: &CancellationToken,
    ) -> Result<()> {
        loop {
            let settled = self.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            let abandoned = matches!(*lock(&self.channel), Channel::Abandoned(_));
            if !abandoned {
                return Ok(());
            }
            trace!(?owner, "waiting for abandoned write to drain");
            tokio::select! {
                biased;
                _ = detached.cancelled() => return Err(BusError::Detached),
                _ = cancelled(gone) => return Err(gone_error(owner)),
                _ = &mut settled => {}
            }
        }
    }

    /// Deliver the transport's completion to the in-flight writer.
    ///
    /// The completion of an abandoned write only frees the channel.
    pub fn complete(&self, result: std::result::Result<(), TransportError>) {
        let finished = std::mem::take(&mut *lock(&self.channel));
        match finished {
            Channel::Active(in_flight) => {
                trace!(owner = ?in_flight.owner, ok = result.is_ok(), "write completed");
                let _ = in_flight.done.send(result.map_err(BusError::Transport));
            }
            Channel::Abandoned(owner) => {
                debug!(?owner, ok = result.is_ok(), "late completion for abandoned write");
                self.settled.notify_waiters();
            }
            Channel::Idle => debug!("write completion with nothing in flight"),
        }
    }

    /// Fail the in-flight write, if any.
    ///
    /// The channel stays closed to new transport writes until the
    /// transport reports the abandoned write finished. Returns true if a
    /// writer was waiting on a completion.
    pub fn abort_in_flight(&self, reason: AbortReason) -> bool {
        let aborted = lock(&self.channel).abandon();
        match aborted {
            Some(in_flight) => {
                debug!(owner = ?in_flight.owner, ?reason, "aborting in-flight write");
                let _ = in_flight.done.send(Err(reason.error_for(in_flight.owner)));
                true
            }
            None => false,
        }
    }

    /// A write has been started and the transport has not reported it finished.
    pub fn is_busy(&self) -> bool {
        !matches!(*lock(&self.channel), Channel::Idle)
    }

    /// A write was abandoned and its completion is still outstanding.
    pub fn is_draining(&self) -> bool {
        matches!(*lock(&self.channel), Channel::Abandoned(_))
    }

    /// Callers queued for the write channel.
    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for WriteSerializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteSerializer")
            .field("capacity", &self.capacity)
            .field("busy", &self.is_busy())
            .field("draining", &self.is_draining())
            .field("waiters", &self.waiters())
            .finish()
    }
}

async fn cancelled(token: Option<&CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

fn gone_error(owner: WriteOwner) -> BusError {
    match owner {
        WriteOwner::Device(slot) => BusError::DeviceGone(slot),
        WriteOwner::Engine => BusError::Detached,
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use sycamore_transport::{BusSink, MemoryTransport};

    use super::*;

    struct Completions(Arc<WriteSerializer>);

    impl BusSink for Completions {
        fn on_bytes_received(&self, _bytes: &[u8]) {}

        fn on_write_complete(&self, result: std::result::Result<(), TransportError>) {
            self.0.complete(result);
        }
    }

    fn setup(auto_complete: bool, capacity: usize) -> (Arc<MemoryTransport>, Arc<WriteSerializer>) {
        let transport = Arc::new(if auto_complete {
            MemoryTransport::with_auto_complete()
        } else {
            MemoryTransport::new()
        });
        let serializer = Arc::new(WriteSerializer::new(transport.clone(), capacity));
        transport.connect(Arc::new(Completions(serializer.clone())));
        (transport, serializer)
    }

    #[tokio::test]
    async fn synchronous_completion_finishes_write() {
        let (transport, serializer) = setup(true, 64);
        let detached = CancellationToken::new();

        serializer
            .enqueue_write(WriteOwner::Device(1), &Frame::data(1, &b"hi"[..]), None, &detached)
            .await
            .unwrap();

        assert_eq!(
            transport.written(),
            vec![Bytes::from_static(&[0xCD, 0x01, 0x01, 0x00, 0x02, b'h', b'i'])]
        );
        assert!(!serializer.is_busy());
    }

    #[tokio::test]
    async fn oversize_write_is_rejected_without_side_effects() {
        let (transport, serializer) = setup(true, 16);
        let detached = CancellationToken::new();

        let result = serializer
            .enqueue_write(WriteOwner::Device(0), &Frame::data(0, vec![0u8; 12]), None, &detached)
            .await;

        assert!(matches!(result, Err(BusError::TooLarge { size: 12, max: 11 })));
        assert!(transport.written().is_empty());
        assert!(!serializer.is_busy());
    }

    #[tokio::test]
    async fn payload_filling_capacity_exactly_is_accepted() {
        let (transport, serializer) = setup(true, 16);
        let detached = CancellationToken::new();

        serializer
            .enqueue_write(WriteOwner::Device(0), &Frame::data(0, vec![7u8; 11]), None, &detached)
            .await
            .unwrap();
        assert_eq!(transport.written()[0].len(), 16);
    }

    #[tokio::test]
    async fn synchronous_transport_failure_releases_channel() {
        let (transport, serializer) = setup(true, 64);
        let detached = CancellationToken::new();
        transport.fail_next_write("link down");

        let result = serializer
            .enqueue_write(WriteOwner::Engine, &Frame::ping(), None, &detached)
            .await;
        assert!(matches!(result, Err(BusError::Transport(TransportError::Rejected(_)))));

        serializer
            .enqueue_write(WriteOwner::Engine, &Frame::ping(), None, &detached)
            .await
            .unwrap();
        assert_eq!(transport.written().len(), 1);
    }

    #[tokio::test]
    async fn asynchronous_failure_is_reported_to_writer() {
        let (transport, serializer) = setup(false, 64);
        let detached = CancellationToken::new();

        let writer = {
            let serializer = serializer.clone();
            let detached = detached.clone();
            tokio::spawn(async move {
                let frame = Frame::data(2, &b"x"[..]);
                serializer
                    .enqueue_write(WriteOwner::Device(2), &frame, None, &detached)
                    .await
            })
        };
        while transport.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        transport.complete_next(Err(TransportError::Closed));

        let result = writer.await.unwrap();
        assert!(matches!(result, Err(BusError::Transport(TransportError::Closed))));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn writers_are_served_in_arrival_order() {
        let (transport, serializer) = setup(false, 64);
        let detached = CancellationToken::new();

        let mut writers = Vec::new();
        for slot in 0..4u8 {
            let serializer = serializer.clone();
            let detached = detached.clone();
            writers.push(tokio::spawn(async move {
                let frame = Frame::data(slot, vec![slot]);
                serializer
                    .enqueue_write(WriteOwner::Device(slot), &frame, None, &detached)
                    .await
            }));
            tokio::task::yield_now().await;
        }

        for _ in 0..4 {
            while transport.in_flight() == 0 {
                tokio::task::yield_now().await;
            }
            assert_eq!(transport.in_flight(), 1);
            transport.complete_next(Ok(()));
        }
        for writer in writers {
            writer.await.unwrap().unwrap();
        }

        let slots: Vec<u8> = transport.written().iter().map(|frame| frame[2]).collect();
        assert_eq!(slots, vec![0, 1, 2, 3]);
        assert_eq!(transport.max_in_flight(), 1);
    }

    #[tokio::test]
    async fn gone_device_leaves_queue() {
        let (transport, serializer) = setup(false, 64);
        let detached = CancellationToken::new();
        let gone = CancellationToken::new();

        let holder = {
            let serializer = serializer.clone();
            let detached = detached.clone();
            tokio::spawn(async move {
                serializer
                    .enqueue_write(WriteOwner::Engine, &Frame::ping(), None, &detached)
                    .await
            })
        };
        while transport.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        let queued = {
            let serializer = serializer.clone();
            let detached = detached.clone();
            let gone = gone.clone();
            tokio::spawn(async move {
                let frame = Frame::data(3, &b"z"[..]);
                serializer
                    .enqueue_write(WriteOwner::Device(3), &frame, Some(&gone), &detached)
                    .await
            })
        };
        while serializer.waiters() == 0 {
            tokio::task::yield_now().await;
        }
        gone.cancel();

        assert!(matches!(queued.await.unwrap(), Err(BusError::DeviceGone(3))));
        transport.complete_next(Ok(()));
        holder.await.unwrap().unwrap();
        assert_eq!(transport.written().len(), 1);
    }

    #[tokio::test]
    async fn abort_wakes_in_flight_writer() {
        let (transport, serializer) = setup(false, 64);
        let detached = CancellationToken::new();

        let writer = {
            let serializer = serializer.clone();
            let detached = detached.clone();
            tokio::spawn(async move {
                let frame = Frame::data(4, &b"q"[..]);
                serializer
                    .enqueue_write(WriteOwner::Device(4), &frame, None, &detached)
                    .await
            })
        };
        while transport.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(serializer.abort_in_flight(AbortReason::LivenessLost));
        assert!(matches!(writer.await.unwrap(), Err(BusError::DeviceGone(4))));
        assert!(!serializer.abort_in_flight(AbortReason::LivenessLost));
        assert!(serializer.is_draining());

        transport.complete_next(Ok(()));
        assert!(!serializer.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn late_completion_is_not_credited_to_next_writer() {
        let (transport, serializer) = setup(false, 64);
        let detached = CancellationToken::new();

        let spawn_write = |slot: u8| {
            let serializer = serializer.clone();
            let detached = detached.clone();
            tokio::spawn(async move {
                let frame = Frame::data(slot, vec![slot]);
                serializer
                    .enqueue_write(WriteOwner::Device(slot), &frame, None, &detached)
                    .await
            })
        };

        let hung = spawn_write(5);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.in_flight(), 1);
        assert!(serializer.abort_in_flight(AbortReason::LivenessLost));
        assert!(matches!(hung.await.unwrap(), Err(BusError::DeviceGone(5))));

        let next = spawn_write(6);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.written().len(), 1);
        assert!(!next.is_finished());

        // The hung write finally finishes; only now does the next one start.
        let drained = transport.complete_next(Ok(())).unwrap();
        assert_eq!(drained[2], 5);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.written().len(), 2);
        assert!(!next.is_finished());

        transport.complete_next(Err(TransportError::Closed));
        let result = next.await.unwrap();
        assert!(matches!(result, Err(BusError::Transport(TransportError::Closed))));
        assert_eq!(transport.max_in_flight(), 1);
        assert!(!serializer.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn gone_device_leaves_while_channel_drains() {
        let (transport, serializer) = setup(false, 64);
        let detached = CancellationToken::new();
        let gone = CancellationToken::new();

        let hung = {
            let serializer = serializer.clone();
            let detached = detached.clone();
            tokio::spawn(async move {
                serializer
                    .enqueue_write(WriteOwner::Engine, &Frame::ping(), None, &detached)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        serializer.abort_in_flight(AbortReason::LivenessLost);
        assert!(matches!(hung.await.unwrap(), Err(BusError::LivenessLost)));

        let queued = {
            let serializer = serializer.clone();
            let detached = detached.clone();
            let gone = gone.clone();
            tokio::spawn(async move {
                let frame = Frame::data(3, &b"z"[..]);
                serializer
                    .enqueue_write(WriteOwner::Device(3), &frame, Some(&gone), &detached)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        gone.cancel();

        assert!(matches!(queued.await.unwrap(), Err(BusError::DeviceGone(3))));
        assert_eq!(transport.written().len(), 1);
        assert!(serializer.is_draining());
    }

    #[tokio::test(start_paused = true)]
    async fn detach_wakes_waiters() {
        let (transport, serializer) = setup(false, 64);
        let detached = CancellationToken::new();

        let mut writers = Vec::new();
        for _ in 0..2 {
            let serializer = serializer.clone();
            let detached = detached.clone();
            writers.push(tokio::spawn(async move {
                serializer
                    .enqueue_write(WriteOwner::Engine, &Frame::ping(), None, &detached)
                    .await
            }));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(transport.in_flight(), 1);

        detached.cancel();
        for writer in writers {
            assert!(matches!(writer.await.unwrap(), Err(BusError::Detached)));
        }
        assert_eq!(transport.written().len(), 1);
    }

    #[test]
    fn completion_without_write_is_ignored() {
        let (_transport, serializer) = setup(false, 64);
        serializer.complete(Ok(()));
        assert!(!serializer.is_busy());
    }
}
