use crate::{connection::error::DisconnectReason, types::SequenceNumber};

/// Notifications for the endpoint's owner, drained with `Endpoint::take_events`
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EndpointEvent {
    /// The handshake completed
    Connected,
    /// A message that wakes the connection was queued on an idle endpoint
    BecomeAlerted,
    /// Every state changing message has been delivered
    NoBlockingMessages,
    /// A sequenced packet was handed to the transport
    SendingPacket { seq: SequenceNumber, bytes: usize },
    /// No packet has arrived for a long time while backing off
    BackoffTooLong,
    Disconnected(DisconnectReason),
}
