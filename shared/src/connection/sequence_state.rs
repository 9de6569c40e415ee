use std::time::Instant;

use crate::{
    connection::{big_state::BigState, big_state_pool::BigStatePool},
    constants::WINDOW_SIZE,
    messages::handle::SendableHandle,
    types::SequenceNumber,
};

/// Running totals carried from a basis slot into every slot coded against it
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SequenceCounters {
    /// Positive verdicts carried so far
    pub acks: u32,
    /// Verdicts of either kind carried so far. The next verdict resolves
    /// sequence `acked_or_nacked + 1`.
    pub acked_or_nacked: u32,
    pub packets: u32,
}

/// A packet we sent, kept until the peer's verdict arrives
#[derive(Default)]
pub struct OutputSequenceState {
    pub big_state: Option<BigState>,
    pub counters: SequenceCounters,
    /// Handles written into this packet, for ack fan out
    pub sent: Vec<SendableHandle>,
    /// State changing messages in this packet still holding later ones back
    pub state_blockers: u32,
    pub sent_at: Option<Instant>,
}

impl OutputSequenceState {
    /// No packet occupies the slot
    pub fn is_available(&self) -> bool {
        self.big_state.is_none()
    }

    pub fn release(&mut self, pool: &mut BigStatePool) {
        if let Some(state) = self.big_state.take() {
            pool.release(state);
        }
        self.sent.clear();
        self.state_blockers = 0;
        self.sent_at = None;
    }
}

/// A packet we received, kept while the peer may still code against it
#[derive(Default)]
pub struct InputSequenceState {
    pub big_state: Option<BigState>,
    pub counters: SequenceCounters,
    /// The sequence whose state the slot holds
    pub last_valid: Option<SequenceNumber>,
}

impl InputSequenceState {
    pub fn release(&mut self, pool: &mut BigStatePool) {
        if let Some(state) = self.big_state.take() {
            pool.release(state);
        }
        self.last_valid = None;
    }

    /// Holds the state of exactly `seq`
    pub fn is_valid_for(&self, seq: SequenceNumber) -> bool {
        self.last_valid == Some(seq) && self.big_state.is_some()
    }
}

/// Fixed ring of sequence slots indexed by `seq % WINDOW_SIZE`
pub struct SequenceWindow<T> {
    slots: Vec<T>,
}

impl<T: Default> SequenceWindow<T> {
    pub fn new() -> Self {
        Self {
            slots: (0..WINDOW_SIZE).map(|_| T::default()).collect(),
        }
    }
}

impl<T: Default> Default for SequenceWindow<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SequenceWindow<T> {
    pub fn get(&self, seq: SequenceNumber) -> &T {
        &self.slots[(seq % WINDOW_SIZE) as usize]
    }

    pub fn get_mut(&mut self, seq: SequenceNumber) -> &mut T {
        &mut self.slots[(seq % WINDOW_SIZE) as usize]
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots.iter_mut()
    }
}
