use sycamore_frame::{AssemblerConfig, FrameAssembler, ReadState, COMMAND_MARKER, RESPONSE_MARKER};
use tracing::{debug, warn};

use crate::cmd::{read_input, DecodeArgs, Direction};
use crate::exit::{CliResult, DATA_INVALID, SUCCESS};
use crate::output::{print_frames, OutputFormat};

pub fn run(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let capture = read_input(&args.path)?;
    let start_marker = match args.direction {
        Direction::Command => COMMAND_MARKER,
        Direction::Response => RESPONSE_MARKER,
    };
    let mut assembler = FrameAssembler::with_config(AssemblerConfig {
        start_marker,
        max_payload_size: args.max_payload,
    });

    let chunk_size = usize::try_from(args.chunk_size).unwrap_or(usize::MAX);
    let mut frames = Vec::new();
    for chunk in capture.chunks(chunk_size) {
        frames.extend(assembler.feed(chunk));
    }
    debug!(
        bytes = capture.len(),
        frames = frames.len(),
        errors = assembler.protocol_errors(),
        "capture decoded"
    );

    print_frames(&frames, format);

    let truncated = assembler.state() != ReadState::Idle;
    if truncated {
        warn!(state = ?assembler.state(), "capture ends inside a frame");
    }
    if assembler.protocol_errors() > 0 || truncated {
        eprintln!(
            "warning: {} malformed frame(s){}",
            assembler.protocol_errors(),
            if truncated { ", trailing partial frame" } else { "" }
        );
        return Ok(DATA_INVALID);
    }
    Ok(SUCCESS)
}
