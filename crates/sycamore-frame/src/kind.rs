//! Frame kinds and start markers.

use crate::error::FrameError;

/// Start marker on frames the host sends to the remote endpoint.
pub const COMMAND_MARKER: u8 = 0xCD;

/// Start marker on frames the remote endpoint sends to the host.
pub const RESPONSE_MARKER: u8 = 0xDC;

/// What a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    /// Keepalive probe (host to remote) or its answer (remote to host).
    Ping = 0x00,
    /// Payload for one virtual device slot.
    Data = 0x01,
    /// Routing table request (host to remote) or the table itself.
    Discovery = 0x02,
    /// Soft reset of the remote bus master.
    Reset = 0x03,
    /// Interrupt bitmask, one bit per slot.
    Interrupt = 0x04,
}

impl FrameKind {
    /// Human-readable name, used in logs and CLI output.
    pub fn name(self) -> &'static str {
        match self {
            FrameKind::Ping => "PING",
            FrameKind::Data => "DATA",
            FrameKind::Discovery => "DISCOVERY",
            FrameKind::Reset => "RESET",
            FrameKind::Interrupt => "INTERRUPT",
        }
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(FrameKind::Ping),
            0x01 => Ok(FrameKind::Data),
            0x02 => Ok(FrameKind::Discovery),
            0x03 => Ok(FrameKind::Reset),
            0x04 => Ok(FrameKind::Interrupt),
            other => Err(FrameError::UnknownKind(other)),
        }
    }
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_bytes_roundtrip() {
        for kind in [
            FrameKind::Ping,
            FrameKind::Data,
            FrameKind::Discovery,
            FrameKind::Reset,
            FrameKind::Interrupt,
        ] {
            assert_eq!(FrameKind::try_from(kind as u8), Ok(kind));
        }
    }

    #[test]
    fn unknown_kind_rejected() {
        assert_eq!(FrameKind::try_from(0x7F), Err(FrameError::UnknownKind(0x7F)));
    }
}
