use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use sycamore_frame::{
    AssemblerConfig, DeviceRoutingTable, Frame, FrameAssembler, FrameKind, ReadState,
    RESPONSE_MARKER,
};
use sycamore_transport::{BusSink, Transport, TransportError};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::BusConfig;
use crate::device::VirtualDevice;
use crate::drt::{DrtManager, DrtState};
use crate::error::{BusError, Result};
use crate::event::{BusEvent, BusStats, Counters};
use crate::ping::{spawn_supervisor, Liveness, PingState, Probe};
use crate::registry::DeviceRegistry;
use crate::serializer::{lock, AbortReason, WriteOwner, WriteSerializer};

/// A bus attached to one transport.
///
/// Owns the reassembly engine, the routing table, the device registry,
/// the write serializer and the ping supervisor. Dropping the bus without
/// calling [`Bus::detach`] performs the same teardown but cannot wait for
/// the supervisor task to stop.
pub struct Bus {
    shared: Arc<BusShared>,
    supervisor: Option<JoinHandle<()>>,
    ping_cancel: CancellationToken,
}

// Lock order: assembler, liveness, drt, registry. None is held across an await.
pub(crate) struct BusShared {
    pub(crate) config: BusConfig,
    self_ref: Weak<BusShared>,
    assembler: Mutex<FrameAssembler>,
    liveness: Mutex<Liveness>,
    drt: Mutex<DrtManager>,
    registry: Mutex<DeviceRegistry>,
    serializer: WriteSerializer,
    pub(crate) detached: CancellationToken,
    events: broadcast::Sender<BusEvent>,
    counters: Counters,
}

/// Callback entry points handed to the transport.
///
/// Holds the bus weakly; callbacks arriving after the bus is gone are ignored.
#[derive(Debug, Clone)]
pub struct BusHandle {
    shared: Weak<BusShared>,
}

impl Bus {
    /// Attach a bus to `transport` and start the ping supervisor.
    ///
    /// Must be called from within a tokio runtime. Connect the transport's
    /// callbacks to [`Bus::sink`] afterwards.
    pub fn attach(transport: Arc<dyn Transport>, config: BusConfig) -> Result<Self> {
        config.validate()?;

        let (events, _) = broadcast::channel(config.event_capacity);
        let max_devices = config.max_devices;
        let ping_interval = config.ping_interval;
        let shared = Arc::new_cyclic(|self_ref| BusShared {
            self_ref: self_ref.clone(),
            assembler: Mutex::new(FrameAssembler::with_config(AssemblerConfig {
                start_marker: RESPONSE_MARKER,
                max_payload_size: config.read_buffer_size,
            })),
            liveness: Mutex::new(Liveness::new(config.ping_enabled, config.max_missed_pings)),
            drt: Mutex::new(DrtManager::new(config.max_devices)),
            registry: Mutex::new(DeviceRegistry::new(config.max_devices)),
            serializer: WriteSerializer::new(transport, config.write_buffer_size),
            detached: CancellationToken::new(),
            events,
            counters: Counters::default(),
            config,
        });

        let ping_cancel = CancellationToken::new();
        let supervisor = spawn_supervisor(shared.clone(), ping_cancel.clone());
        info!(max_devices, ?ping_interval, "bus attached");

        Ok(Self {
            shared,
            supervisor: Some(supervisor),
            ping_cancel,
        })
    }

    /// Callback handle for the transport.
    pub fn handle(&self) -> BusHandle {
        BusHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// [`Bus::handle`] as a trait object, ready for `Transport::connect`-style APIs.
    pub fn sink(&self) -> Arc<dyn BusSink> {
        Arc::new(self.handle())
    }

    pub fn config(&self) -> &BusConfig {
        &self.shared.config
    }

    /// Write `payload` to the device in `slot`.
    ///
    /// Returns once the transport reports the write finished. An empty
    /// slot answers [`BusError::DeviceGone`].
    pub async fn device_write(&self, slot: u8, payload: &[u8]) -> Result<()> {
        self.shared.serializer.check_size(payload.len())?;
        let device = self.lookup(slot)?;
        self.shared.write_device(&device, payload).await
    }

    /// Read up to `max_len` bytes from the device in `slot`.
    pub async fn device_read(&self, slot: u8, max_len: usize) -> Result<Bytes> {
        self.lookup(slot)?.read(max_len).await
    }

    /// The device bound to `slot`.
    pub fn device(&self, slot: u8) -> Result<Arc<VirtualDevice>> {
        lock(&self.shared.registry).lookup(slot)
    }

    /// Every bound device, in slot order.
    pub fn devices(&self) -> Vec<Arc<VirtualDevice>> {
        lock(&self.shared.registry).devices()
    }

    /// Snapshot of the installed routing table.
    pub fn drt(&self) -> Option<DeviceRoutingTable> {
        lock(&self.shared.drt).table().cloned()
    }

    pub fn drt_state(&self) -> DrtState {
        lock(&self.shared.drt).state()
    }

    /// Byte length of the installed routing table.
    pub fn size_of_drt(&self) -> usize {
        lock(&self.shared.drt).size_of_drt()
    }

    /// A discovery request is outstanding.
    pub fn is_drt_waiting(&self) -> bool {
        lock(&self.shared.drt).is_waiting()
    }

    /// The remote endpoint has answered since it was last declared lost.
    pub fn is_remote_found(&self) -> bool {
        lock(&self.shared.liveness).is_found()
    }

    pub fn ping_state(&self) -> PingState {
        lock(&self.shared.liveness).state()
    }

    /// Consecutive unanswered probes.
    pub fn missed_pings(&self) -> u32 {
        lock(&self.shared.liveness).missed()
    }

    /// Resume or suspend the ping supervisor.
    pub fn set_ping_enabled(&self, enabled: bool) {
        lock(&self.shared.liveness).set_enabled(enabled);
    }

    /// Reassembly state of the inbound byte stream.
    pub fn read_state(&self) -> ReadState {
        lock(&self.shared.assembler).state()
    }

    /// Ask the remote for its routing table now.
    ///
    /// Returns `Ok(false)` without writing if a request is already outstanding.
    pub async fn request_discovery(&self) -> Result<bool> {
        let Some(request) = lock(&self.shared.drt).request() else {
            return Ok(false);
        };
        if let Err(err) = self.shared.send_engine_frame(&Frame::discovery_request()).await {
            lock(&self.shared.drt).clear_waiting(request);
            return Err(err);
        }
        Ok(true)
    }

    /// Command the remote to reset, then drop the routing table.
    ///
    /// Every device is torn down; the supervisor rediscovers on its next tick.
    pub async fn reset_remote(&self) -> Result<()> {
        self.shared.send_engine_frame(&Frame::reset()).await?;

        let removed = {
            let mut liveness = lock(&self.shared.liveness);
            liveness.clear();
            let mut drt = lock(&self.shared.drt);
            drt.invalidate();
            lock(&self.shared.registry).unbind_all()
        };
        info!(devices = removed.len(), "remote reset, routing table invalidated");
        self.shared.retire(removed);
        Ok(())
    }

    /// Subscribe to bus events.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.shared.events.subscribe()
    }

    pub fn stats(&self) -> BusStats {
        self.shared.counters.snapshot()
    }

    /// Stop the supervisor, wake every pending caller with
    /// [`BusError::Detached`], and release all bus state.
    pub async fn detach(mut self) {
        self.shutdown();
        if let Some(supervisor) = self.supervisor.take() {
            if let Err(err) = supervisor.await {
                warn!(error = %err, "ping supervisor ended abnormally");
            }
        }
        self.shared.release();
    }

    fn shutdown(&self) {
        lock(&self.shared.liveness).set_enabled(false);
        self.ping_cancel.cancel();
        self.shared.detached.cancel();
        self.shared.serializer.abort_in_flight(AbortReason::Detached);
    }

    fn lookup(&self, slot: u8) -> Result<Arc<VirtualDevice>> {
        self.device(slot).map_err(|err| match err {
            BusError::NotFound(slot) => BusError::DeviceGone(slot),
            BusError::SlotOutOfRange { .. } => BusError::DeviceGone(slot),
            other => other,
        })
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        if self.shared.detached.is_cancelled() {
            return;
        }
        self.shutdown();
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.abort();
        }
        self.shared.release();
    }
}

impl std::fmt::Debug for Bus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bus")
            .field("drt_state", &self.drt_state())
            .field("devices", &self.devices().len())
            .field("remote_found", &self.is_remote_found())
            .field("serializer", &self.shared.serializer)
            .finish()
    }
}

impl BusShared {
    fn receive(&self, bytes: &[u8]) {
        if self.detached.is_cancelled() {
            trace!(len = bytes.len(), "bytes after detach ignored");
            return;
        }

        let mut assembler = lock(&self.assembler);
        let errors_before = assembler.protocol_errors();
        let frames = assembler.feed(bytes);
        let errors = assembler.protocol_errors() - errors_before;
        if errors > 0 {
            Counters::bump(&self.counters.protocol_errors, errors);
        }

        for frame in frames {
            self.dispatch(frame);
        }
        lock(&self.drt).observe(assembler.state());
    }

    fn dispatch(&self, frame: Frame) {
        Counters::bump(&self.counters.frames_dispatched, 1);
        match frame.kind {
            FrameKind::Discovery => self.install_drt(frame.payload),
            FrameKind::Ping => self.confirm_liveness(),
            FrameKind::Data => self.route_data(frame.slot, frame.payload),
            FrameKind::Interrupt => self.raise_interrupts(&frame.payload),
            FrameKind::Reset => debug!("ignoring reset frame from remote"),
        }
    }

    fn install_drt(&self, payload: Bytes) {
        let (removed, added, confirmed) = {
            let mut liveness = lock(&self.liveness);
            let mut drt = lock(&self.drt);
            let plan = match drt.install(payload) {
                Ok(plan) => plan,
                Err(err) => {
                    Counters::bump(&self.counters.protocol_errors, 1);
                    warn!(error = %err, "rejecting routing table");
                    return;
                }
            };
            let device_count = drt.table().map_or(0, DeviceRoutingTable::device_count);

            let mut registry = lock(&self.registry);
            let removed: Vec<_> = plan
                .removed
                .iter()
                .filter_map(|slot| registry.unbind(*slot))
                .collect();
            let mut added = Vec::with_capacity(plan.added.len());
            for entry in plan.added {
                let device = VirtualDevice::new(
                    entry,
                    self.self_ref.clone(),
                    self.config.inbound_queue_depth,
                );
                match registry.bind(device) {
                    Ok(()) => added.push(entry),
                    Err(err) => warn!(slot = entry.slot, error = %err, "could not bind device"),
                }
            }

            info!(
                devices = device_count,
                added = added.len(),
                removed = removed.len(),
                "routing table installed"
            );
            (removed, added, liveness.confirm())
        };

        self.retire(removed);
        for entry in added {
            self.emit(BusEvent::DeviceAdded(entry));
        }
        if confirmed {
            info!("remote endpoint found");
            self.emit(BusEvent::LivenessConfirmed);
        }
    }

    fn confirm_liveness(&self) {
        if lock(&self.liveness).confirm() {
            info!("remote endpoint found");
            self.emit(BusEvent::LivenessConfirmed);
        }
    }

    fn route_data(&self, slot: u8, payload: Bytes) {
        let device = match lock(&self.registry).lookup(slot) {
            Ok(device) => device,
            Err(_) => {
                Counters::bump(&self.counters.frames_dropped, 1);
                warn!(slot, size = payload.len(), "data frame for unbound slot dropped");
                return;
            }
        };
        if !device.deliver(payload) {
            Counters::bump(&self.counters.frames_dropped, 1);
            warn!(slot, "device inbound queue full, frame dropped");
        }
    }

    fn raise_interrupts(&self, payload: &[u8]) {
        let Ok(mask) = <[u8; 4]>::try_from(payload).map(u32::from_be_bytes) else {
            Counters::bump(&self.counters.protocol_errors, 1);
            warn!(size = payload.len(), "malformed interrupt frame");
            return;
        };

        let devices: Vec<_> = {
            let registry = lock(&self.registry);
            (0..32u8)
                .filter(|bit| mask & (1u32 << *bit) != 0)
                .filter_map(|slot| registry.lookup(slot).ok())
                .collect()
        };
        for device in devices {
            trace!(slot = device.slot(), "interrupt raised");
            device.raise_interrupt();
            self.emit(BusEvent::Interrupt { slot: device.slot() });
        }
    }

    /// One supervisor tick. Returns the probe to send, if any.
    pub(crate) fn ping_tick(&self) -> Option<Probe> {
        if self.detached.is_cancelled() {
            return None;
        }

        let mut torn_down = Vec::new();
        let (lost, probe) = {
            let mut liveness = lock(&self.liveness);
            if liveness.state() == PingState::Suspended {
                return None;
            }
            let was_found = liveness.is_found();
            let exhausted = liveness.record_tick();

            let mut drt = lock(&self.drt);
            if exhausted {
                drt.invalidate();
                torn_down = lock(&self.registry).unbind_all();
            }

            let probe = if drt.is_ready() {
                Some(Probe::Ping)
            } else {
                drt.request().map(Probe::Discovery)
            };
            liveness.await_response();
            (exhausted.then_some(was_found), probe)
        };

        if let Some(was_found) = lost {
            self.serializer.abort_in_flight(AbortReason::LivenessLost);
            let devices = torn_down.len();
            self.retire(torn_down);
            if was_found {
                warn!(devices, "remote endpoint stopped answering");
                self.emit(BusEvent::LivenessLost);
            } else {
                debug!("remote endpoint still not answering");
            }
        }
        probe
    }

    pub(crate) async fn send_probe(&self, probe: Probe) {
        let frame = match probe {
            Probe::Discovery(_) => Frame::discovery_request(),
            Probe::Ping => Frame::ping(),
        };
        trace!(?probe, "sending probe");
        if let Err(err) = self.send_engine_frame(&frame).await {
            debug!(?probe, error = %err, "probe write failed");
            if let Probe::Discovery(request) = probe {
                lock(&self.drt).clear_waiting(request);
            }
        }
    }

    pub(crate) async fn write_device(&self, device: &VirtualDevice, payload: &[u8]) -> Result<()> {
        self.serializer.check_size(payload.len())?;
        if self.detached.is_cancelled() {
            return Err(BusError::Detached);
        }
        if device.is_gone() {
            return Err(BusError::DeviceGone(device.slot()));
        }

        let frame = Frame::data(device.slot(), Bytes::copy_from_slice(payload));
        let owner = WriteOwner::Device(device.slot());
        let result = self
            .serializer
            .enqueue_write(owner, &frame, Some(device.gone_token()), &self.detached)
            .await;
        self.count_write(&result);
        result
    }

    async fn send_engine_frame(&self, frame: &Frame) -> Result<()> {
        let result = self
            .serializer
            .enqueue_write(WriteOwner::Engine, frame, None, &self.detached)
            .await;
        self.count_write(&result);
        result
    }

    fn count_write(&self, result: &Result<()>) {
        match result {
            Ok(()) => Counters::bump(&self.counters.writes_completed, 1),
            Err(BusError::TooLarge { .. }) => {}
            Err(_) => Counters::bump(&self.counters.writes_failed, 1),
        }
    }

    /// Wake everything waiting on devices already removed from the registry.
    fn retire(&self, devices: Vec<Arc<VirtualDevice>>) {
        for device in devices {
            device.invalidate();
            self.emit(BusEvent::DeviceRemoved {
                slot: device.slot(),
            });
        }
    }

    fn release(&self) {
        let devices = {
            let mut drt = lock(&self.drt);
            drt.invalidate();
            lock(&self.registry).unbind_all()
        };
        lock(&self.assembler).reset();
        for device in &devices {
            device.invalidate();
        }
        info!(devices = devices.len(), "bus detached");
        self.emit(BusEvent::Detached);
    }

    fn emit(&self, event: BusEvent) {
        if self.events.send(event).is_err() {
            trace!("no event subscribers");
        }
    }
}

impl BusSink for BusHandle {
    fn on_bytes_received(&self, bytes: &[u8]) {
        if let Some(shared) = self.shared.upgrade() {
            shared.receive(bytes);
        }
    }

    fn on_write_complete(&self, result: std::result::Result<(), TransportError>) {
        match self.shared.upgrade() {
            Some(shared) => shared.serializer.complete(result),
            None => trace!("write completion after bus dropped"),
        }
    }
}
