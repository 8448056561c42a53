use std::fmt;
use std::io;

use sycamore_bus::BusError;
use sycamore_frame::FrameError;
use sycamore_transport::TransportError;

// Exit codes follow the sysexits-style layout the tools share.
pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
pub const HEALTH_CHECK_FAILED: i32 = 30;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Io(source) => io_error(context, source),
        other => CliError::new(TRANSPORT_ERROR, format!("{context}: {other}")),
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    CliError::new(DATA_INVALID, format!("{context}: {err}"))
}

pub fn bus_error(context: &str, err: BusError) -> CliError {
    match err {
        BusError::Transport(err) => transport_error(context, err),
        BusError::Frame(err) => frame_error(context, err),
        BusError::TooLarge { .. } => CliError::new(DATA_INVALID, format!("{context}: {err}")),
        BusError::Timeout(_) => CliError::new(TIMEOUT, format!("{context}: {err}")),
        BusError::LivenessLost => {
            CliError::new(HEALTH_CHECK_FAILED, format!("{context}: {err}"))
        }
        BusError::InvalidConfig(_)
        | BusError::SlotOutOfRange { .. }
        | BusError::SlotOccupied(_)
        | BusError::NotFound(_) => CliError::new(USAGE, format!("{context}: {err}")),
        BusError::DeviceGone(_) | BusError::Detached => {
            CliError::new(FAILURE, format!("{context}: {err}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn bus_errors_map_to_exit_codes() {
        assert_eq!(bus_error("x", BusError::Timeout(Duration::from_secs(1))).code, TIMEOUT);
        assert_eq!(bus_error("x", BusError::LivenessLost).code, HEALTH_CHECK_FAILED);
        assert_eq!(bus_error("x", BusError::TooLarge { size: 9, max: 8 }).code, DATA_INVALID);
        assert_eq!(bus_error("x", BusError::DeviceGone(0)).code, FAILURE);
        assert_eq!(
            bus_error("x", BusError::Transport(TransportError::Closed)).code,
            TRANSPORT_ERROR
        );
    }

    #[test]
    fn io_errors_keep_context() {
        let err = io_error(
            "open capture",
            io::Error::new(io::ErrorKind::PermissionDenied, "nope"),
        );
        assert_eq!(err.code, PERMISSION_DENIED);
        assert_eq!(err.to_string(), "open capture: nope");
    }
}
