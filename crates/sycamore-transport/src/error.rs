/// Errors reported by a physical transport.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// An I/O error occurred on the underlying byte stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport refused to start a write.
    #[error("write rejected: {0}")]
    Rejected(String),

    /// The remote side closed the byte stream.
    #[error("transport closed by remote")]
    Closed,

    /// The transport has been shut down.
    #[error("transport shut down")]
    Shutdown,
}

pub type Result<T> = std::result::Result<T, TransportError>;
