/// Errors raised while encoding, decoding or parsing frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The header carries a kind byte outside the wire contract.
    #[error("unknown frame kind 0x{0:02X}")]
    UnknownKind(u8),

    /// The payload exceeds the configured maximum size.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A routing table payload is shorter than its fixed header.
    #[error("routing table truncated ({len} bytes, need at least {min})")]
    DrtTruncated { len: usize, min: usize },

    /// A routing table payload does not start with the expected magic.
    #[error("invalid routing table magic 0x{found:04X} (expected 0xC594)")]
    DrtMagic { found: u16 },

    /// The device count disagrees with the payload length.
    #[error("routing table length mismatch ({actual} bytes, {expected} expected)")]
    DrtLength { expected: usize, actual: usize },

    /// The table announces more devices than the bus can hold.
    #[error("routing table lists {count} devices, max {max}")]
    TooManyDevices { count: usize, max: usize },
}

pub type Result<T> = std::result::Result<T, FrameError>;
