//! Error types for the call-intake service.

/// Top-level error type for the intake system.
#[derive(Debug, thiserror::Error)]
pub enum SirenError {
    /// Telephony control frame that could not be decoded.
    #[error("malformed media frame: {0}")]
    MalformedFrame(String),

    /// Speech service connection failure (dial, TLS, protocol upgrade).
    #[error("speech connection error: {0}")]
    Connection(String),

    /// Speech service handshake did not complete in time.
    #[error("speech handshake timed out after {0}s")]
    HandshakeTimeout(u64),

    /// Error reported by an external service (speech session event,
    /// interpreter, synthesis backend).
    #[error("service error: {0}")]
    Service(String),

    /// Interpreter output that could not be decoded into an intake decision.
    #[error("intake decision parse failure: {0}")]
    DecisionParse(String),

    /// Voice synthesis error.
    #[error("synthesis error: {0}")]
    Synthesis(String),

    /// Call record storage error.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Call identifier not present in the store.
    #[error("unknown call: {0}")]
    UnknownCall(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Channel send/receive error.
    #[error("channel error: {0}")]
    Channel(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, SirenError>;
