use std::sync::Arc;
use std::time::Duration;

use sycamore::remote::SimulatedRemote;
use sycamore_bus::config::DEFAULT_MAX_DEVICES;
use sycamore_bus::{Bus, BusConfig, BusEvent};
use sycamore_frame::{DeviceRoutingTable, DrtEntry, MAX_DRT_ENTRIES};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info};

use crate::cmd::{build_runtime, parse_device_id, parse_duration, SimulateArgs};
use crate::exit::{bus_error, CliError, CliResult, DATA_INVALID, FAILURE, SUCCESS, TIMEOUT, USAGE};
use crate::output::{print_exchange, Exchange, OutputFormat};

pub fn run(args: SimulateArgs, format: OutputFormat) -> CliResult<i32> {
    let table = build_table(&args.devices)?;
    let device_id = table
        .entry(args.slot)
        .map(|entry| entry.device_id)
        .ok_or_else(|| {
            CliError::new(
                USAGE,
                format!(
                    "slot {} is not announced ({} device(s) configured)",
                    args.slot,
                    table.device_count()
                ),
            )
        })?;
    let ping_interval = parse_duration(&args.ping_interval)?;
    let timeout = parse_duration(&args.timeout)?;
    let chunk_size = usize::try_from(args.chunk_size).unwrap_or(usize::MAX);
    let config = bus_config(&table, ping_interval, timeout);

    let runtime = build_runtime()?;
    let (received, stats) = runtime.block_on(async {
        let (remote, task) = SimulatedRemote::new(table);
        let bus = Bus::attach(Arc::new(remote), config)
            .map_err(|err| bus_error("attach failed", err))?;
        let events = bus.subscribe();
        let runner = tokio::spawn(task.with_chunk_size(chunk_size).run(bus.sink()));

        let outcome =
            tokio::time::timeout(timeout, exchange(&bus, events, args.slot, args.data.as_bytes()))
                .await
                .unwrap_or_else(|_| {
                    Err(CliError::new(
                        TIMEOUT,
                        format!("exchange did not finish within {timeout:?}"),
                    ))
                });
        let stats = bus.stats();
        bus.detach().await;
        runner.abort();
        Ok::<_, CliError>((outcome?, stats))
    })?;

    let sent = args.data.as_bytes();
    print_exchange(
        &Exchange {
            slot: args.slot,
            device_id,
            sent,
            received: &received,
            stats,
        },
        format,
    );

    if received != sent {
        return Ok(DATA_INVALID);
    }
    Ok(SUCCESS)
}

/// Size the slot table and read buffer for the announced devices.
fn bus_config(
    table: &DeviceRoutingTable,
    ping_interval: Duration,
    timeout: Duration,
) -> BusConfig {
    let mut config = BusConfig {
        max_devices: table.device_count().max(DEFAULT_MAX_DEVICES),
        ping_interval,
        read_timeout: timeout,
        ..BusConfig::default()
    };
    config.read_buffer_size = config.read_buffer_size.max(config.full_drt_size());
    config
}

fn build_table(devices: &[String]) -> CliResult<DeviceRoutingTable> {
    if devices.len() > MAX_DRT_ENTRIES {
        return Err(CliError::new(
            USAGE,
            format!("at most {MAX_DRT_ENTRIES} devices, got {}", devices.len()),
        ));
    }
    let mut entries = Vec::with_capacity(devices.len());
    for (slot, id) in (0..=u8::MAX).zip(devices) {
        entries.push(DrtEntry {
            slot,
            device_id: parse_device_id(id)?,
            sub_id: 0,
            flags: 0,
            address: 0,
            size: 0,
        });
    }
    Ok(DeviceRoutingTable::new(entries))
}

async fn exchange(
    bus: &Bus,
    mut events: broadcast::Receiver<BusEvent>,
    slot: u8,
    payload: &[u8],
) -> CliResult<Vec<u8>> {
    bus.request_discovery()
        .await
        .map_err(|err| bus_error("discovery request failed", err))?;
    wait_for_device(&mut events, slot).await?;
    info!(slot, "device bound");

    bus.device_write(slot, payload)
        .await
        .map_err(|err| bus_error("device write failed", err))?;

    let mut received = Vec::with_capacity(payload.len());
    while received.len() < payload.len() {
        let chunk = bus
            .device_read(slot, payload.len() - received.len())
            .await
            .map_err(|err| bus_error("device read failed", err))?;
        debug!(size = chunk.len(), "device read");
        received.extend_from_slice(&chunk);
    }
    Ok(received)
}

async fn wait_for_device(events: &mut broadcast::Receiver<BusEvent>, slot: u8) -> CliResult<()> {
    loop {
        match events.recv().await {
            Ok(BusEvent::DeviceAdded(entry)) if entry.slot == slot => return Ok(()),
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => debug!(skipped, "event stream lagged"),
            Err(RecvError::Closed) => {
                return Err(CliError::new(FAILURE, "bus closed before discovery finished"))
            }
        }
    }
}
