use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Subcommand};

use crate::exit::{io_error, CliError, CliResult, USAGE};
use crate::output::OutputFormat;

pub mod attach;
pub mod decode;
pub mod drt;
pub mod simulate;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Decode a captured byte stream into frames.
    Decode(DecodeArgs),
    /// Parse a raw Device Routing Table payload.
    Drt(DrtArgs),
    /// Run a bus against an in-process remote and exchange one payload.
    Simulate(SimulateArgs),
    /// Attach to a remote over a Unix socket and print bus events.
    Attach(AttachArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Decode(args) => decode::run(args, format),
        Command::Drt(args) => drt::run(args, format),
        Command::Simulate(args) => simulate::run(args, format),
        Command::Attach(args) => attach::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

/// Which side of the link produced a capture.
#[derive(clap::ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Frames sent by the host (0xCD marker).
    Command,
    /// Frames sent by the remote (0xDC marker).
    Response,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Capture file holding raw link bytes.
    pub path: PathBuf,
    /// Feed the reassembly engine this many bytes at a time.
    #[arg(long, default_value_t = 4096, value_parser = clap::value_parser!(u64).range(1..))]
    pub chunk_size: u64,
    /// Direction of the captured traffic.
    #[arg(long, value_enum, default_value = "response")]
    pub direction: Direction,
    /// Largest payload accepted before a frame counts as malformed.
    #[arg(long, default_value_t = sycamore_frame::MAX_WIRE_PAYLOAD)]
    pub max_payload: usize,
}

#[derive(Args, Debug)]
pub struct DrtArgs {
    /// File holding a routing table payload (without frame header).
    pub path: PathBuf,
    /// Reject tables announcing more devices than this.
    #[arg(long, default_value_t = 256)]
    pub max_devices: usize,
}

#[derive(Args, Debug)]
pub struct SimulateArgs {
    /// Device ids announced by the simulated remote, one per slot.
    /// Comma-separated, hex or decimal.
    #[arg(long, value_delimiter = ',', default_value = "0x0001")]
    pub devices: Vec<String>,
    /// Slot to exchange data with.
    #[arg(long, default_value_t = 0)]
    pub slot: u8,
    /// Payload written to the device.
    #[arg(long, default_value = "ping")]
    pub data: String,
    /// Deliver remote replies in chunks of this many bytes.
    #[arg(long, default_value_t = 4096, value_parser = clap::value_parser!(u64).range(1..))]
    pub chunk_size: u64,
    /// Supervisor probe interval (e.g. 1s, 250ms).
    #[arg(long, default_value = "1s")]
    pub ping_interval: String,
    /// Give up if the exchange has not finished in time (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub timeout: String,
}

#[derive(Args, Debug)]
pub struct AttachArgs {
    /// Unix socket bridged to the remote link.
    pub path: PathBuf,
    /// Stop after this long (e.g. 30s). Default: run until interrupted.
    #[arg(long)]
    pub duration: Option<String>,
    /// Write this payload to `--slot` once the device appears.
    #[arg(long)]
    pub data: Option<String>,
    /// Slot for `--data`.
    #[arg(long, default_value_t = 0)]
    pub slot: u8,
    /// Supervisor probe interval (e.g. 1s, 250ms).
    #[arg(long, default_value = "1s")]
    pub ping_interval: String,
    /// Unanswered probes before the remote is declared lost.
    #[arg(long, default_value_t = sycamore_bus::config::DEFAULT_MAX_MISSED_PINGS)]
    pub max_missed: u32,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn read_input(path: &std::path::Path) -> CliResult<Vec<u8>> {
    std::fs::read(path).map_err(|err| io_error(&format!("read {}", path.display()), err))
}

pub(crate) fn build_runtime() -> CliResult<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| io_error("start runtime", err))
}

/// Parse `250ms`, `2s` or a bare number of seconds.
pub(crate) fn parse_duration(input: &str) -> CliResult<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CliError::new(USAGE, "duration must not be empty"));
    }

    let (number, millis) = match input.strip_suffix("ms") {
        Some(number) => (number, true),
        None => (input.strip_suffix('s').unwrap_or(input), false),
    };
    let value: u64 = number
        .trim()
        .parse()
        .map_err(|_| CliError::new(USAGE, format!("invalid duration value: {input}")))?;
    if value == 0 {
        return Err(CliError::new(USAGE, "duration must be greater than zero"));
    }

    Ok(if millis {
        Duration::from_millis(value)
    } else {
        Duration::from_secs(value)
    })
}

/// Parse a device id written as `0x0005` or `5`.
pub(crate) fn parse_device_id(input: &str) -> CliResult<u16> {
    let input = input.trim();
    let parsed = match input
        .strip_prefix("0x")
        .or_else(|| input.strip_prefix("0X"))
    {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => input.parse(),
    };
    parsed.map_err(|_| CliError::new(USAGE, format!("invalid device id: {input}")))
}
