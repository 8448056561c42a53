use std::io::{IsTerminal, Write};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use sycamore_bus::{BusEvent, BusStats};
use sycamore_frame::{DeviceRoutingTable, DrtEntry, Frame};

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct FrameOutput<'a> {
    kind: &'a str,
    slot: u8,
    payload_size: usize,
    payload: String,
}

impl<'a> FrameOutput<'a> {
    fn new(frame: &'a Frame) -> Self {
        Self {
            kind: frame.kind.name(),
            slot: frame.slot,
            payload_size: frame.payload.len(),
            payload: payload_preview(&frame.payload),
        }
    }
}

#[derive(Serialize)]
struct EntryOutput {
    slot: u8,
    device_id: String,
    sub_id: u16,
    flags: String,
    address: String,
    size: u32,
    memory: bool,
}

impl From<&DrtEntry> for EntryOutput {
    fn from(entry: &DrtEntry) -> Self {
        Self {
            slot: entry.slot,
            device_id: format!("{:#06x}", entry.device_id),
            sub_id: entry.sub_id,
            flags: format!("{:#010x}", entry.flags),
            address: format!("{:#010x}", entry.address),
            size: entry.size,
            memory: entry.is_memory_device(),
        }
    }
}

#[derive(Serialize)]
struct DrtOutput {
    version: u16,
    device_count: usize,
    total_memory_size: u64,
    devices: Vec<EntryOutput>,
}

#[derive(Serialize)]
struct EventOutput {
    event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    slot: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    device: Option<EntryOutput>,
}

impl From<&BusEvent> for EventOutput {
    fn from(event: &BusEvent) -> Self {
        let (name, slot, device) = match event {
            BusEvent::DeviceAdded(entry) => (
                "device-added",
                Some(entry.slot),
                Some(EntryOutput::from(entry)),
            ),
            BusEvent::DeviceRemoved { slot } => ("device-removed", Some(*slot), None),
            BusEvent::LivenessConfirmed => ("liveness-confirmed", None, None),
            BusEvent::LivenessLost => ("liveness-lost", None, None),
            BusEvent::Interrupt { slot } => ("interrupt", Some(*slot), None),
            BusEvent::Detached => ("detached", None, None),
        };
        Self {
            event: name,
            slot,
            device,
        }
    }
}

#[derive(Serialize)]
struct StatsOutput {
    protocol_errors: u64,
    frames_dispatched: u64,
    frames_dropped: u64,
    writes_completed: u64,
    writes_failed: u64,
}

impl From<BusStats> for StatsOutput {
    fn from(stats: BusStats) -> Self {
        Self {
            protocol_errors: stats.protocol_errors,
            frames_dispatched: stats.frames_dispatched,
            frames_dropped: stats.frames_dropped,
            writes_completed: stats.writes_completed,
            writes_failed: stats.writes_failed,
        }
    }
}

/// Outcome of a `simulate` session.
pub struct Exchange<'a> {
    pub slot: u8,
    pub device_id: u16,
    pub sent: &'a [u8],
    pub received: &'a [u8],
    pub stats: BusStats,
}

#[derive(Serialize)]
struct ExchangeOutput {
    slot: u8,
    device_id: String,
    sent: String,
    received: String,
    echoed: bool,
    stats: StatsOutput,
}

fn print_json<T: Serialize>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn new_table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

pub fn print_frames(frames: &[Frame], format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            for frame in frames {
                print_json(&FrameOutput::new(frame));
            }
        }
        OutputFormat::Table => {
            let mut table = new_table(vec!["#", "KIND", "SLOT", "SIZE", "PAYLOAD"]);
            for (index, frame) in frames.iter().enumerate() {
                table.add_row(vec![
                    index.to_string(),
                    frame.kind.name().to_string(),
                    frame.slot.to_string(),
                    frame.payload.len().to_string(),
                    payload_preview(&frame.payload),
                ]);
            }
            println!("{table}");
        }
        OutputFormat::Pretty => {
            for frame in frames {
                println!(
                    "kind={} slot={} size={} payload={}",
                    frame.kind,
                    frame.slot,
                    frame.payload.len(),
                    payload_preview(&frame.payload)
                );
            }
        }
        OutputFormat::Raw => {
            for frame in frames {
                print_raw(&frame.payload);
            }
        }
    }
}

pub fn print_drt(table: &DeviceRoutingTable, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(&DrtOutput {
            version: table.version(),
            device_count: table.device_count(),
            total_memory_size: table.total_memory_size(),
            devices: table.entries().iter().map(EntryOutput::from).collect(),
        }),
        OutputFormat::Table => {
            let mut out = new_table(vec![
                "SLOT", "DEVICE", "SUB", "FLAGS", "ADDRESS", "SIZE", "MEMORY",
            ]);
            for entry in table.entries() {
                let row = EntryOutput::from(entry);
                out.add_row(vec![
                    row.slot.to_string(),
                    row.device_id,
                    row.sub_id.to_string(),
                    row.flags,
                    row.address,
                    row.size.to_string(),
                    row.memory.to_string(),
                ]);
            }
            println!("{out}");
        }
        OutputFormat::Pretty => {
            println!(
                "version={} devices={} memory_size={}",
                table.version(),
                table.device_count(),
                table.total_memory_size()
            );
            for entry in table.entries() {
                println!(
                    "  slot={} device={:#06x} sub={} flags={:#010x} address={:#010x} size={}",
                    entry.slot,
                    entry.device_id,
                    entry.sub_id,
                    entry.flags,
                    entry.address,
                    entry.size
                );
            }
        }
        OutputFormat::Raw => print_raw(table.raw()),
    }
}

pub fn print_event(event: &BusEvent, format: OutputFormat) {
    let out = EventOutput::from(event);
    match format {
        OutputFormat::Json => print_json(&out),
        OutputFormat::Table | OutputFormat::Pretty | OutputFormat::Raw => match &out.device {
            Some(device) => println!(
                "{} slot={} device={} sub={}",
                out.event, device.slot, device.device_id, device.sub_id
            ),
            None => match out.slot {
                Some(slot) => println!("{} slot={slot}", out.event),
                None => println!("{}", out.event),
            },
        },
    }
}

pub fn print_exchange(exchange: &Exchange<'_>, format: OutputFormat) {
    let out = ExchangeOutput {
        slot: exchange.slot,
        device_id: format!("{:#06x}", exchange.device_id),
        sent: payload_preview(exchange.sent),
        received: payload_preview(exchange.received),
        echoed: exchange.sent == exchange.received,
        stats: exchange.stats.into(),
    };
    match format {
        OutputFormat::Json => print_json(&out),
        OutputFormat::Table => {
            let mut table = new_table(vec!["SLOT", "DEVICE", "SENT", "RECEIVED", "ECHOED"]);
            table.add_row(vec![
                out.slot.to_string(),
                out.device_id.clone(),
                out.sent.clone(),
                out.received.clone(),
                out.echoed.to_string(),
            ]);
            println!("{table}");

            let mut stats = new_table(vec!["COUNTER", "VALUE"]);
            for (name, value) in [
                ("protocol_errors", out.stats.protocol_errors),
                ("frames_dispatched", out.stats.frames_dispatched),
                ("frames_dropped", out.stats.frames_dropped),
                ("writes_completed", out.stats.writes_completed),
                ("writes_failed", out.stats.writes_failed),
            ] {
                stats.add_row(vec![name.to_string(), value.to_string()]);
            }
            println!("{stats}");
        }
        OutputFormat::Pretty => {
            println!(
                "slot={} device={} sent={} received={} echoed={}",
                out.slot, out.device_id, out.sent, out.received, out.echoed
            );
        }
        OutputFormat::Raw => print_raw(exchange.received),
    }
}

pub fn print_raw(data: &[u8]) {
    let mut out = std::io::stdout();
    let _ = out.write_all(data);
    let _ = out.flush();
}

fn payload_preview(payload: &[u8]) -> String {
    match std::str::from_utf8(payload) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<binary {} bytes>", payload.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_marks_binary_payloads() {
        assert_eq!(payload_preview(b"hello"), "hello");
        assert_eq!(payload_preview(&[0xFF, 0xFE]), "<binary 2 bytes>");
    }

    #[test]
    fn events_serialize_with_slot() {
        let json = serde_json::to_string(&EventOutput::from(&BusEvent::Interrupt { slot: 3 }))
            .unwrap();
        assert_eq!(json, r#"{"event":"interrupt","slot":3}"#);

        let json = serde_json::to_string(&EventOutput::from(&BusEvent::Detached)).unwrap();
        assert_eq!(json, r#"{"event":"detached"}"#);
    }
}
