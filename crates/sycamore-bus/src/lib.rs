//! Multiplexing bus core.
//!
//! Turns one byte-oriented transport into several virtual device channels.
//! Inbound bytes are reassembled into frames and routed by the remote's
//! Device Routing Table; outbound writes from devices and from the bus
//! itself are serialized onto the transport one at a time; a periodic
//! supervisor probes the remote and tears everything down when it stops
//! answering.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use sycamore_bus::{Bus, BusConfig};
//! use sycamore_transport::MemoryTransport;
//!
//! # async fn run() -> sycamore_bus::Result<()> {
//! let transport = Arc::new(MemoryTransport::new());
//! let bus = Bus::attach(transport.clone(), BusConfig::default())?;
//! transport.connect(bus.sink());
//!
//! bus.device_write(0, b"hello").await?;
//! let reply = bus.device_read(0, 64).await?;
//! # let _ = reply;
//! bus.detach().await;
//! # Ok(())
//! # }
//! ```

mod bus;
pub mod config;
mod device;
pub mod drt;
pub mod error;
pub mod event;
pub mod ping;
pub mod registry;
pub mod serializer;

pub use bus::{Bus, BusHandle};
pub use config::BusConfig;
pub use device::VirtualDevice;
pub use drt::{DiscoveryRequest, DrtManager, DrtState, Reconciliation};
pub use error::{BusError, Result};
pub use event::{BusEvent, BusStats};
pub use ping::{Liveness, PingState, Probe};
pub use registry::DeviceRegistry;
pub use serializer::{AbortReason, WriteOwner, WriteSerializer};
