use skein_serde::BitWrite;

use crate::{
    messages::{
        message_kinds::MessageKind,
        sendable::{ParallelFlags, SendResult, Sendable},
    },
    types::Reliability,
};

/// Empty message queued on a quiet connection so acks keep flowing
pub struct Heartbeat;

impl Sendable for Heartbeat {
    fn kind(&self) -> MessageKind {
        MessageKind::HEARTBEAT
    }

    fn reliability(&self) -> Reliability {
        Reliability::Unreliable
    }

    fn parallel_flags(&self) -> ParallelFlags {
        ParallelFlags::DONT_AWAKE
    }

    fn description(&self) -> String {
        "heartbeat".to_string()
    }

    fn write(&mut self, _writer: &mut dyn BitWrite) -> SendResult {
        SendResult::Ok
    }
}
