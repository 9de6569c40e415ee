use skein_serde::{BitReader, SerdeErr};

use crate::{
    messages::{bytes_sendable::read_bytes_body, message_kinds::MessageKind},
    types::SequenceNumber,
};

/// Receives the application messages decoded from inbound packets.
///
/// Decoding happens before the packet is accepted, dispatch only once it has
/// passed every check, so a rejected packet never reaches the application.
pub trait MessageSink {
    type Message;

    /// Reads one message body. The id has already been read.
    fn decode(
        &mut self,
        kind: MessageKind,
        reader: &mut BitReader,
    ) -> Result<Self::Message, SerdeErr>;

    fn dispatch(&mut self, seq: SequenceNumber, kind: MessageKind, message: Self::Message);
}

/// A message collected by `BytesSink`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReceivedMessage {
    pub seq: SequenceNumber,
    pub kind: MessageKind,
    pub payload: Vec<u8>,
}

/// Collects bodies written by `BytesSendable`
#[derive(Default)]
pub struct BytesSink {
    received: Vec<ReceivedMessage>,
}

impl BytesSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_received(&mut self) -> Vec<ReceivedMessage> {
        std::mem::take(&mut self.received)
    }
}

impl MessageSink for BytesSink {
    type Message = Vec<u8>;

    fn decode(&mut self, _kind: MessageKind, reader: &mut BitReader) -> Result<Vec<u8>, SerdeErr> {
        read_bytes_body(reader)
    }

    fn dispatch(&mut self, seq: SequenceNumber, kind: MessageKind, payload: Vec<u8>) {
        self.received.push(ReceivedMessage { seq, kind, payload });
    }
}
