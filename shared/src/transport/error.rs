use thiserror::Error;

/// Errors reported by a datagram transport
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The datagram could not be handed to the underlying socket
    #[error("Failed to send datagram of {size} bytes: {reason}")]
    SendFailed { size: usize, reason: String },

    /// The datagram exceeds what the transport can carry
    #[error("Datagram of {size} bytes exceeds the transport limit of {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    /// The transport has been shut down
    #[error("Transport is closed")]
    Closed,
}
