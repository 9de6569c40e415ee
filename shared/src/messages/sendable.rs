use std::time::Instant;

use bitflags::bitflags;
use skein_serde::BitWrite;

use crate::{
    messages::{handle::SendableHandle, message_kinds::MessageKind},
    types::{GroupKey, ObjectKey, Reliability, SequenceNumber, Vec3},
};

bitflags! {
    /// Per-sendable scheduling flags
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct ParallelFlags: u8 {
        /// Counts against `is_blocking_state_change` while queued
        const BLOCKS_STATE_CHANGE = 1 << 0;
        /// Does not wake the connection or make the packet urgent
        const DONT_AWAKE = 1 << 1;
        /// Held back until the queue is told spawning has finished
        const AFTER_SPAWNING = 1 << 2;
        /// Every message queued afterwards depends on this one
        const STATE_CHANGE = 1 << 3;
    }
}

/// Delivery notifications passed back to a sendable
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SendableStateUpdate {
    /// Written into the packet with the given sequence number
    Sent,
    Acked,
    Nacked,
    /// Dropped without delivery: removed, discarded, failed or out of retries
    Rejected,
    /// Nacked and put back in the queue
    Requeued,
}

/// Result of serializing a sendable's body
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SendResult {
    Ok,
    /// Try again in a later packet
    NotReady,
    /// This message can never be written
    FailedMessage,
    /// The packet is unusable
    FailedPacket,
    /// The connection is unusable
    FailedConnection,
}

/// Result of handing one message to a `MessageOutput`
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WriteOutcome {
    OkContinue,
    OkFinish,
    /// Nothing was written; the message stays queued for a later packet
    Delay,
    FailContinue,
    FailFinish,
}

impl WriteOutcome {
    pub fn is_finish(&self) -> bool {
        matches!(self, WriteOutcome::OkFinish | WriteOutcome::FailFinish)
    }
}

/// Where a message's subject lives, used for distance and direction priority bumps
#[derive(Clone, Copy, Debug, PartialEq, Default)]
pub struct PositionInfo {
    pub position: Option<Vec3>,
    pub draw_distance: Option<f32>,
    pub object: Option<ObjectKey>,
}

/// A recent event that raises the priority of a message for a short while
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct PriorityPulse {
    pub key: GroupKey,
    pub time: Instant,
}

/// An application message waiting in the outbound queue
pub trait Sendable: Send {
    fn kind(&self) -> MessageKind;

    fn reliability(&self) -> Reliability;

    fn parallel_flags(&self) -> ParallelFlags {
        ParallelFlags::empty()
    }

    /// Accounting group, or `GroupKey::NONE`
    fn group(&self) -> GroupKey {
        GroupKey::NONE
    }

    fn priority_delta(&self) -> f32 {
        0.0
    }

    fn position_info(&self) -> PositionInfo {
        PositionInfo::default()
    }

    /// Pulses sorted by key
    fn pulses(&self) -> Vec<PriorityPulse> {
        Vec::new()
    }

    fn description(&self) -> String;

    /// Writes the message body. The id has already been written.
    fn write(&mut self, writer: &mut dyn BitWrite) -> SendResult;

    fn update_state(&mut self, _seq: SequenceNumber, _update: SendableStateUpdate) {}

    /// Messages this one wants queued in response to being written, acked or
    /// nacked. Drained right after `write` and after delivery updates.
    fn take_follow_ups(&mut self) -> Vec<Box<dyn Sendable>> {
        Vec::new()
    }
}

/// Destination of the messages the queue selects for one packet
pub trait MessageOutput {
    fn write_header(&mut self) -> WriteOutcome;

    fn write_message(
        &mut self,
        sendable: &mut dyn Sendable,
        handle: SendableHandle,
    ) -> WriteOutcome;

    fn write_footer(&mut self);

    /// Bytes the packet would occupy if finished now
    fn approximate_size(&self) -> usize;
}
