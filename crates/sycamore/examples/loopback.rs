//! Attach a bus to an in-process remote, discover its devices and echo a
//! payload through each one.
//!
//! ```text
//! cargo run -p sycamore --features sim --example loopback
//! ```

use std::sync::Arc;

use sycamore::bus::{Bus, BusConfig, BusEvent};
use sycamore::frame::{DeviceRoutingTable, DrtEntry};
use sycamore::remote::SimulatedRemote;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let table = DeviceRoutingTable::new((0u8..3).map(|slot| DrtEntry {
        slot,
        device_id: 0x0100 + u16::from(slot),
        sub_id: 0,
        flags: 0,
        address: 0,
        size: 0,
    }));
    let (remote, task) = SimulatedRemote::new(table);
    let bus = Bus::attach(Arc::new(remote), BusConfig::default())?;
    let mut events = bus.subscribe();
    let runner = tokio::spawn(task.with_chunk_size(3).run(bus.sink()));

    bus.request_discovery().await?;
    let mut added = 0;
    while added < 3 {
        if let BusEvent::DeviceAdded(entry) = events.recv().await? {
            println!("device {:#06x} in slot {}", entry.device_id, entry.slot);
            added += 1;
        }
    }

    for device in bus.devices() {
        let message = format!("hello slot {}", device.slot());
        device.write(message.as_bytes()).await?;
        let reply = device.read(64).await?;
        println!("slot {} -> {}", device.slot(), String::from_utf8_lossy(&reply));
    }

    println!("{:?}", bus.stats());
    bus.detach().await;
    runner.abort();
    Ok(())
}
