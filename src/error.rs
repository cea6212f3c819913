use std::fmt;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, OscError>;

/// Error kinds surfaced by the transport, bundler, ID allocators, and
/// server façade. Decode/callback failures on worker threads are logged
/// and swallowed rather than returned here (see the `transport` and
/// `timedqueue` modules); this enum only covers failures reported
/// synchronously to a caller.
#[derive(Debug, Clone, PartialEq)]
pub enum OscError {
    /// Decoding failed: misaligned strings, truncated elements, or an
    /// unknown type tag.
    MalformedPacket(String),
    /// Encoded datagram exceeds the configured MTU.
    PacketTooLarge { len: usize, mtu: usize },
    /// A blob or string argument would overflow a 32-bit length prefix.
    ArgumentTooLarge,
    /// A blocking call exceeded its deadline.
    TimedOut,
    /// The transport or timed queue is closing.
    Shutdown,
    /// An ID allocator could not satisfy the request.
    Exhausted,
    /// `free` targeted an ID not currently allocated.
    InvalidId(i32),
    /// Mutation attempted on a bundler past its flatten point.
    Finalized,
    /// A handshake reply did not parse as expected.
    ProtocolMismatch(String),
    /// Socket-level failure.
    Io(String),
}

impl fmt::Display for OscError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OscError::MalformedPacket(msg) => write!(f, "malformed OSC packet: {msg}"),
            OscError::PacketTooLarge { len, mtu } => {
                write!(f, "encoded packet ({len} bytes) exceeds MTU ({mtu} bytes)")
            }
            OscError::ArgumentTooLarge => write!(f, "argument too large to encode"),
            OscError::TimedOut => write!(f, "timed out"),
            OscError::Shutdown => write!(f, "shutting down"),
            OscError::Exhausted => write!(f, "ID allocator exhausted"),
            OscError::InvalidId(id) => write!(f, "id {id} is not currently allocated"),
            OscError::Finalized => write!(f, "bundler already flattened"),
            OscError::ProtocolMismatch(msg) => write!(f, "protocol mismatch: {msg}"),
            OscError::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

impl std::error::Error for OscError {}

impl From<std::io::Error> for OscError {
    fn from(e: std::io::Error) -> Self {
        OscError::Io(e.to_string())
    }
}
