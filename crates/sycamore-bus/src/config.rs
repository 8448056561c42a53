use std::time::Duration;

use sycamore_frame::{
    DRT_ENTRY_SIZE, DRT_HEADER_SIZE, FRAME_OVERHEAD, MAX_DRT_ENTRIES, MAX_WIRE_PAYLOAD,
};

use crate::error::{BusError, Result};

/// Default number of virtual device slots.
pub const DEFAULT_MAX_DEVICES: usize = 16;

/// Hard limit on device slots: slot identities are one byte on the wire.
pub const MAX_DEVICE_SLOTS: usize = MAX_DRT_ENTRIES;

/// Default keepalive period.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of consecutive unanswered probes before the remote is declared lost.
pub const DEFAULT_MAX_MISSED_PINGS: u32 = 3;

/// Configuration for one bus instance.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Capacity of the device slot table.
    pub max_devices: usize,
    /// Largest inbound payload the reassembly buffer accepts.
    pub read_buffer_size: usize,
    /// Capacity of the outbound staging buffer, frame overhead included.
    pub write_buffer_size: usize,
    /// Period of the liveness supervisor.
    pub ping_interval: Duration,
    /// Consecutive unanswered probes tolerated before liveness is lost.
    pub max_missed_pings: u32,
    /// Whether the supervisor starts in the active state.
    pub ping_enabled: bool,
    /// How long `device_read` waits for data.
    pub read_timeout: Duration,
    /// Inbound frames buffered per device before new ones are dropped.
    pub inbound_queue_depth: usize,
    /// Capacity of the bus event broadcast channel.
    pub event_capacity: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_devices: DEFAULT_MAX_DEVICES,
            read_buffer_size: 4 * 1024,
            write_buffer_size: 4 * 1024,
            ping_interval: DEFAULT_PING_INTERVAL,
            max_missed_pings: DEFAULT_MAX_MISSED_PINGS,
            ping_enabled: true,
            read_timeout: Duration::from_secs(5),
            inbound_queue_depth: 32,
            event_capacity: 64,
        }
    }
}

impl BusConfig {
    /// Size of a discovery payload announcing every slot.
    pub fn full_drt_size(&self) -> usize {
        DRT_HEADER_SIZE + DRT_ENTRY_SIZE * self.max_devices
    }

    /// Reject configurations the bus cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_devices == 0 || self.max_devices > MAX_DEVICE_SLOTS {
            return Err(BusError::InvalidConfig(format!(
                "max_devices must be 1..={MAX_DEVICE_SLOTS}, got {}",
                self.max_devices
            )));
        }
        if self.read_buffer_size == 0 || self.read_buffer_size > MAX_WIRE_PAYLOAD {
            return Err(BusError::InvalidConfig(format!(
                "read_buffer_size must be 1..={MAX_WIRE_PAYLOAD}, got {}",
                self.read_buffer_size
            )));
        }
        if self.full_drt_size() > self.read_buffer_size {
            return Err(BusError::InvalidConfig(format!(
                "read_buffer_size {} cannot hold a {}-byte routing table for {} devices",
                self.read_buffer_size,
                self.full_drt_size(),
                self.max_devices
            )));
        }
        if self.write_buffer_size <= FRAME_OVERHEAD {
            return Err(BusError::InvalidConfig(format!(
                "write_buffer_size must exceed the {FRAME_OVERHEAD}-byte frame overhead, got {}",
                self.write_buffer_size
            )));
        }
        if self.ping_interval.is_zero() {
            return Err(BusError::InvalidConfig(
                "ping_interval must be greater than zero".to_string(),
            ));
        }
        if self.max_missed_pings == 0 {
            return Err(BusError::InvalidConfig(
                "max_missed_pings must be at least 1".to_string(),
            ));
        }
        if self.inbound_queue_depth == 0 || self.event_capacity == 0 {
            return Err(BusError::InvalidConfig(
                "queue capacities must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
