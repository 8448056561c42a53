use bytes::Bytes;
use sycamore_frame::DeviceRoutingTable;

use crate::cmd::{read_input, DrtArgs};
use crate::exit::{frame_error, CliResult, SUCCESS};
use crate::output::{print_drt, OutputFormat};

pub fn run(args: DrtArgs, format: OutputFormat) -> CliResult<i32> {
    let raw = Bytes::from(read_input(&args.path)?);
    let table = DeviceRoutingTable::parse(raw, args.max_devices)
        .map_err(|err| frame_error("invalid routing table", err))?;
    print_drt(&table, format);
    Ok(SUCCESS)
}
