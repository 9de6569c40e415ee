use std::sync::{Arc, Mutex};

use skein_serde::{BitReader, BitWrite, Serde, SerdeErr, UnsignedVariableInteger};

use crate::{
    messages::{
        message_kinds::MessageKind,
        sendable::{ParallelFlags, PositionInfo, SendResult, Sendable, SendableStateUpdate},
    },
    types::{GroupKey, Reliability, SequenceNumber},
};

/// Shared record of the delivery notifications a sendable received
pub type DeliveryLog = Arc<Mutex<Vec<(SequenceNumber, SendableStateUpdate)>>>;

/// SECURITY: length prefixes come from the wire; bound what we will allocate
const MAX_BODY_BYTES: u64 = 1 << 16;

/// A sendable carrying an opaque byte payload, written as a variable
/// length prefix followed by the bytes
pub struct BytesSendable {
    kind: MessageKind,
    reliability: Reliability,
    flags: ParallelFlags,
    group: GroupKey,
    priority_delta: f32,
    position: PositionInfo,
    payload: Vec<u8>,
    deliveries: Option<DeliveryLog>,
}

impl BytesSendable {
    pub fn new(kind: MessageKind, reliability: Reliability, payload: Vec<u8>) -> Self {
        Self {
            kind,
            reliability,
            flags: ParallelFlags::empty(),
            group: GroupKey::NONE,
            priority_delta: 0.0,
            position: PositionInfo::default(),
            payload,
            deliveries: None,
        }
    }

    pub fn with_flags(mut self, flags: ParallelFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_group(mut self, group: GroupKey) -> Self {
        self.group = group;
        self
    }

    pub fn with_priority_delta(mut self, delta: f32) -> Self {
        self.priority_delta = delta;
        self
    }

    pub fn with_position(mut self, position: PositionInfo) -> Self {
        self.position = position;
        self
    }

    pub fn with_delivery_log(mut self, log: DeliveryLog) -> Self {
        self.deliveries = Some(log);
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

impl Sendable for BytesSendable {
    fn kind(&self) -> MessageKind {
        self.kind
    }

    fn reliability(&self) -> Reliability {
        self.reliability
    }

    fn parallel_flags(&self) -> ParallelFlags {
        self.flags
    }

    fn group(&self) -> GroupKey {
        self.group
    }

    fn priority_delta(&self) -> f32 {
        self.priority_delta
    }

    fn position_info(&self) -> PositionInfo {
        self.position
    }

    fn description(&self) -> String {
        format!(
            "bytes {}:{} ({} bytes)",
            self.kind.protocol,
            self.kind.index,
            self.payload.len()
        )
    }

    fn write(&mut self, writer: &mut dyn BitWrite) -> SendResult {
        if self.payload.len() as u64 > MAX_BODY_BYTES {
            return SendResult::FailedMessage;
        }
        UnsignedVariableInteger::<7>::new(self.payload.len() as u64).ser(writer);
        for byte in &self.payload {
            writer.write_byte(*byte);
        }
        SendResult::Ok
    }

    fn update_state(&mut self, seq: SequenceNumber, update: SendableStateUpdate) {
        if let Some(log) = &self.deliveries {
            if let Ok(mut log) = log.lock() {
                log.push((seq, update));
            }
        }
    }
}

/// Reads a body written by `BytesSendable`
pub fn read_bytes_body(reader: &mut BitReader) -> Result<Vec<u8>, SerdeErr> {
    let length = UnsignedVariableInteger::<7>::de(reader)?.get();
    if length > MAX_BODY_BYTES {
        return Err(SerdeErr::InvalidValue {
            value: length,
            type_name: "message body length",
        });
    }
    let mut bytes = Vec::with_capacity(length as usize);
    for _ in 0..length {
        bytes.push(reader.read_byte()?);
    }
    Ok(bytes)
}
