use thiserror::Error;

/// Top-level error type for the `nicos-proto` crate.
///
/// Covers every failure mode of the cache wire layer: literal decoding,
/// line framing, and the TCP transport. `nicos-core` maps these into
/// `CommunicationError`s.
#[derive(Debug, Error)]
pub enum Error {
    // ── Transport ───────────────────────────────────────────────────
    /// Socket-level I/O failure.
    #[error("Cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Could not establish the TCP connection.
    #[error("Cannot connect to cache at {addr}: {reason}")]
    Connect { addr: String, reason: String },

    /// Connect or request did not complete in time.
    #[error("Cache request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// The peer closed the connection.
    #[error("Cache connection closed")]
    ConnectionClosed,

    // ── Framing ─────────────────────────────────────────────────────
    /// A line did not match the `[time] [+|-] [ttl] [@] key op [value]` grammar.
    #[error("Garbled cache line: {line:?}")]
    Garbled { line: String },

    /// A line exceeded the decoder's maximum length.
    #[error("Cache line exceeds {max} bytes")]
    LineTooLong { max: usize },

    // ── Data ────────────────────────────────────────────────────────
    /// A value string is not a valid literal.
    #[error("Invalid value literal at offset {offset}: {message}")]
    Value { message: String, offset: usize },
}

impl Error {
    /// Returns `true` if this is a transient error worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::Connect { .. } | Self::Timeout { .. } | Self::ConnectionClosed
        )
    }
}
