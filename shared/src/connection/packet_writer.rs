use log::warn;
use skein_serde::BitWriter;

use crate::{
    connection::big_state::BigState,
    messages::{
        handle::SendableHandle,
        message_kinds::{MessageFlags, MessageKind, MessageKinds},
        sendable::{MessageOutput, ParallelFlags, SendResult, Sendable, WriteOutcome},
    },
};

/// Codes the messages the queue selects into one sequenced packet.
///
/// Every message is written against a checkpoint of the bit stream and the
/// id coder, so a message that fails or does not fit leaves no trace.
pub struct PacketWriter<'a> {
    kinds: &'a MessageKinds,
    big_state: &'a mut BigState,
    writer: BitWriter,
    checkpoint_writer: BitWriter,
    checkpoint_state: BigState,
    limit_bits: u32,
    sent: Vec<SendableHandle>,
    state_blockers: u32,
    in_sync: bool,
    urgent: bool,
    connection_failed: bool,
    messages: usize,
}

impl<'a> PacketWriter<'a> {
    /// `writer` already holds the packet prefix; nothing may be written past
    /// `limit_bits`
    pub fn new(
        kinds: &'a MessageKinds,
        big_state: &'a mut BigState,
        writer: BitWriter,
        limit_bits: u32,
    ) -> Self {
        let checkpoint_state = big_state.clone();
        Self {
            kinds,
            big_state,
            checkpoint_writer: writer.clone(),
            writer,
            checkpoint_state,
            limit_bits,
            sent: Vec::new(),
            state_blockers: 0,
            in_sync: false,
            urgent: false,
            connection_failed: false,
            messages: 0,
        }
    }

    fn checkpoint(&mut self) {
        self.checkpoint_writer.clone_from(&self.writer);
        self.checkpoint_state.clone_from(self.big_state);
    }

    fn rollback(&mut self) {
        self.writer.clone_from(&self.checkpoint_writer);
        self.big_state.clone_from(&self.checkpoint_state);
    }

    /// Writes a bare id, used for the end of stream marker when no message
    /// was written
    pub fn write_end_of_stream(&mut self) {
        self.write_id(MessageKind::END_OF_STREAM);
    }

    fn write_id(&mut self, kind: MessageKind) -> Option<MessageFlags> {
        let id = match self.kinds.id_for(&kind) {
            Ok(id) => id,
            Err(error) => {
                warn!("cannot write message: {}", error);
                return None;
            }
        };
        let flags = self.kinds.flags(id);
        self.big_state
            .write_id(&mut self.writer, id, self.kinds.id_bits());
        self.big_state.after_message(id, flags);
        Some(flags)
    }

    /// The finished bit stream
    pub fn into_parts(self) -> PacketContents {
        PacketContents {
            writer: self.writer,
            sent: self.sent,
            state_blockers: self.state_blockers,
            in_sync: self.in_sync,
            urgent: self.urgent,
            connection_failed: self.connection_failed,
        }
    }
}

/// What a `PacketWriter` produced
pub struct PacketContents {
    pub writer: BitWriter,
    pub sent: Vec<SendableHandle>,
    pub state_blockers: u32,
    /// The receiver must process the packet in arrival order
    pub in_sync: bool,
    pub urgent: bool,
    /// A message reported the connection as unusable
    pub connection_failed: bool,
}

impl MessageOutput for PacketWriter<'_> {
    fn write_header(&mut self) -> WriteOutcome {
        WriteOutcome::OkContinue
    }

    fn write_message(
        &mut self,
        sendable: &mut dyn Sendable,
        handle: SendableHandle,
    ) -> WriteOutcome {
        self.checkpoint();
        let Some(flags) = self.write_id(sendable.kind()) else {
            self.rollback();
            return WriteOutcome::FailContinue;
        };

        let outcome = match sendable.write(&mut self.writer) {
            SendResult::Ok if self.writer.bits_written() > self.limit_bits => {
                if self.messages == 0 {
                    warn!(
                        "{} does not fit in an empty packet, dropping it",
                        sendable.description()
                    );
                    WriteOutcome::FailContinue
                } else {
                    WriteOutcome::Delay
                }
            }
            SendResult::Ok => WriteOutcome::OkContinue,
            SendResult::NotReady => WriteOutcome::Delay,
            SendResult::FailedMessage => WriteOutcome::FailContinue,
            SendResult::FailedPacket => WriteOutcome::FailFinish,
            SendResult::FailedConnection => {
                self.connection_failed = true;
                WriteOutcome::FailFinish
            }
        };

        if outcome != WriteOutcome::OkContinue {
            self.rollback();
            return outcome;
        }

        self.messages += 1;
        self.sent.push(handle);
        if flags.contains(MessageFlags::BLOCKS_STATE_CHANGE) {
            self.state_blockers += 1;
        }
        if flags.contains(MessageFlags::DECODE_IN_SYNC) {
            self.in_sync = true;
        }
        if !sendable
            .parallel_flags()
            .contains(ParallelFlags::DONT_AWAKE)
        {
            self.urgent = true;
        }
        outcome
    }

    fn write_footer(&mut self) {
        self.write_end_of_stream();
    }

    fn approximate_size(&self) -> usize {
        self.writer.byte_len()
    }
}
