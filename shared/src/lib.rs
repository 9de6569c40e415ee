//! # Skein Shared
//! A reliable, ordered or unordered, bandwidth and latency aware message
//! transport between two endpoints over an unreliable datagram socket.
//!
//! An [`Endpoint`] runs the connection protocol: handshake, sequencing,
//! acknowledgement, reordering, back-off and disconnect. Its [`MessageQueue`]
//! decides which queued [`Sendable`]s go into each packet.

#![deny(trivial_numeric_casts, unstable_features, unused_import_braces)]

#[macro_use]
extern crate cfg_if;

pub use skein_serde::{
    BitCounter, BitReader, BitWrite, BitWriter, Serde, SerdeErr, UnsignedInteger,
    UnsignedVariableInteger,
};

mod connection;
mod constants;
mod messages;
mod queue;
mod sequence_list;
mod transport;
mod types;
mod wrapping_number;

pub use connection::{
    ack_block::{AckBlock, PendingAck, MAX_ACKS_PER_PACKET},
    big_state::{BigState, IdTable},
    big_state_pool::BigStatePool,
    cipher::{cipher_for_key, packet_nonce, PacketCipher, NONCE_BYTES},
    endpoint::{quick_hash, ConnectionState, Endpoint, EndpointStats, Witness},
    endpoint_config::EndpointConfig,
    error::{CipherError, DisconnectReason, EndpointError, PacketError},
    events::EndpointEvent,
    header_table::HeaderTable,
    heartbeat::Heartbeat,
    message_sink::{BytesSink, MessageSink, ReceivedMessage},
    packet_type::PacketKind,
    packet_writer::{PacketContents, PacketWriter},
    sequence_state::{InputSequenceState, OutputSequenceState, SequenceCounters, SequenceWindow},
};
pub use constants::{
    MAX_MESSAGES_PER_PACKET, MIN_SEQUENCED_PACKET_BYTES, MTU_SIZE_BYTES, PROTOCOL_VERSION,
    SEQUENCE_HEADER_BYTES, TRAILER_BYTES, WINDOW_SIZE,
};
pub use messages::{
    bytes_sendable::{read_bytes_body, BytesSendable, DeliveryLog},
    error::MessageKindsError,
    handle::SendableHandle,
    message_kinds::{MessageDef, MessageFlags, MessageKind, MessageKinds, MAX_MESSAGE_IDS},
    sendable::{
        MessageOutput, ParallelFlags, PositionInfo, PriorityPulse, SendResult, Sendable,
        SendableStateUpdate, WriteOutcome,
    },
};
pub use queue::{
    accounting::{
        AccountingGroup, AccountingGroupPolicy, DirectionScaler, DistanceScaler, GroupStats,
        PulseScaler, BANDWIDTH_WINDOW,
    },
    message_queue::{
        AddOutcome, MessageQueue, QueueError, QueueStats, SchedulingParams, WriteSummary,
    },
    ordering::LatencyClass,
    queue_config::{QueueConfig, QueueConfigSource, QueueSettings, SharedQueueConfig},
    slot_pool::{SlotError, SlotPool, SlotState},
};
pub use sequence_list::{SequenceError, SequenceList};
pub use transport::{error::TransportError, Transport};
pub use types::{
    GroupKey, HostType, MessageId, ObjectKey, Reliability, SequenceNumber, SlotIndex, Vec3,
};
pub use wrapping_number::{
    narrow_sequence, try_widen_sequence, widen_sequence, WrappingNumberError,
};

cfg_if! {
    if #[cfg(feature = "encryption")] {
        pub use connection::cipher::{AesGcmCipher, KEY_BYTES};
    }
}
