use thiserror::Error;

use crate::types::SequenceNumber;

/// Reasons an inbound datagram was dropped. None of these end the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// The datagram is shorter than its kind requires (SECURITY: truncated or malicious packet)
    #[error("Packet of {length} bytes is shorter than the {required} bytes its kind requires")]
    TooShort { length: usize, required: usize },

    /// The first byte does not map to any packet kind
    #[error("Unknown header byte {byte:#04x}. The peer may be running a different protocol version")]
    UnknownHeader { byte: u8 },

    /// The sequence number lies too far ahead of the next expected one
    #[error("Sequence {seq} is outside the receive window (next expected {expected})")]
    OutOfWindow {
        seq: SequenceNumber,
        expected: SequenceNumber,
    },

    /// The sequence number was already processed or skipped
    #[error("Sequence {seq} arrived late or twice (next expected {expected})")]
    Duplicate {
        seq: SequenceNumber,
        expected: SequenceNumber,
    },

    /// The packet was coded against state this side no longer holds
    #[error("Sequence {seq} was coded against basis {basis} which is not available")]
    BasisMismatch {
        seq: SequenceNumber,
        basis: SequenceNumber,
    },

    /// The quick hash or signing key did not match (SECURITY: corrupted or forged packet)
    #[error("Integrity check failed for sequence {seq}")]
    HashMismatch { seq: SequenceNumber },

    /// Authenticated decryption failed (SECURITY: corrupted or forged packet)
    #[error("Failed to decrypt sequence {seq}")]
    DecryptFailed { seq: SequenceNumber },

    /// The bit stream could not be decoded
    #[error("Malformed body in sequence {seq}: {reason}")]
    Malformed {
        seq: SequenceNumber,
        reason: String,
    },

    /// More messages than a single packet may carry (SECURITY: potentially malicious packet)
    #[error("Sequence {seq} carries more than {limit} messages")]
    TooManyMessages { seq: SequenceNumber, limit: u32 },

    /// Sequenced data arrived while the connection is shutting down
    #[error("Sequenced packet received while the connection is closing")]
    NotConnected,
}

/// Why a connection ended. Surfaced to the owner through
/// `EndpointEvent::Disconnected` and carried on the wire as a one byte code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DisconnectReason {
    /// Nothing was received for longer than the inactivity timeout
    #[error("Connection timed out after {seconds} seconds without traffic")]
    Timeout { seconds: u64 },

    /// The endpoint stayed in back-off for longer than allowed
    #[error("Connection spent more than {seconds} seconds backing off")]
    BackOffTimeout { seconds: u64 },

    /// The peer broke the protocol
    #[error("Protocol error: {description}")]
    ProtocolError { description: String },

    /// A reliable message could not be delivered within its retry budget
    #[error("Reliable message could not be delivered: {description}")]
    RetriesExhausted { description: String },

    /// The peer closed the connection and told us why
    #[error("Remote peer disconnected (reason code {code})")]
    RemoteDisconnect { code: u8 },

    /// The owner closed the connection
    #[error("Connection closed locally")]
    LocalDisconnect,

    /// The peer speaks a different protocol version
    #[error("Protocol version mismatch: local {local}, remote {remote}")]
    VersionMismatch { local: u32, remote: u32 },
}

impl DisconnectReason {
    /// Code sent to the peer in a Disconnect packet
    pub fn code(&self) -> u8 {
        match self {
            DisconnectReason::Timeout { .. } => 1,
            DisconnectReason::BackOffTimeout { .. } => 2,
            DisconnectReason::ProtocolError { .. } => 3,
            DisconnectReason::RetriesExhausted { .. } => 4,
            DisconnectReason::RemoteDisconnect { code } => *code,
            DisconnectReason::LocalDisconnect => 5,
            DisconnectReason::VersionMismatch { .. } => 6,
        }
    }

    pub fn protocol_error(description: impl Into<String>) -> Self {
        DisconnectReason::ProtocolError {
            description: description.into(),
        }
    }
}

/// Errors raised by a `PacketCipher`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CipherError {
    /// The configured key has the wrong length
    #[error("Cipher key must be {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Encryption failed
    #[error("Failed to encrypt a payload of {length} bytes")]
    EncryptFailed { length: usize },

    /// Tag verification failed (SECURITY: corrupted or forged payload)
    #[error("Failed to decrypt a payload of {length} bytes")]
    DecryptFailed { length: usize },

    /// A key was configured but the crate was built without the `encryption` feature
    #[error("Encryption requested but the `encryption` feature is disabled")]
    Unavailable,
}

/// Errors returned by endpoint operations invoked by the owner
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    /// The operation needs an open connection
    #[error("Endpoint is {state} and cannot {operation}")]
    InvalidState {
        state: &'static str,
        operation: &'static str,
    },

    /// The configured cipher could not be created
    #[error("Cipher error: {0}")]
    Cipher(#[from] CipherError),

    /// The configuration is inconsistent
    #[error("Invalid endpoint configuration: {reason}")]
    InvalidConfig { reason: String },
}
