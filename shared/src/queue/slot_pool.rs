use log::warn;
use thiserror::Error;

use crate::{messages::handle::SendableHandle, types::SlotIndex};

/// Free slots are kept in bins of `1 << LOG2_SLOTS_PER_BIN` consecutive indices,
/// so allocation prefers low indices without sorting a free list
pub const LOG2_SLOTS_PER_BIN: u32 = 6;

/// Lifecycle state of a slot
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SlotState {
    /// Queued and eligible for scheduling
    Active,
    /// Written into a packet, waiting for its ack or nack
    Waiting,
    /// Queued while a packet was being written; promoted to Active at frame end
    JustQueued,
    /// Removed while in flight; freed once its packet resolves
    Limbo,
    /// Finished; reclaimed at the end of the frame
    Dead,
    Free,
    /// Sentinel head of a per-state list
    Root,
}

const LIVE_STATES: [SlotState; 5] = [
    SlotState::Active,
    SlotState::Waiting,
    SlotState::JustQueued,
    SlotState::Limbo,
    SlotState::Dead,
];

impl SlotState {
    fn list_index(self) -> Option<usize> {
        LIVE_STATES.iter().position(|state| *state == self)
    }

    pub fn is_live(self) -> bool {
        self.list_index().is_some()
    }
}

/// Errors that can occur when resolving or allocating slots
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SlotError {
    /// The handle points past the end of the pool
    #[error("Slot index {index} is out of range for a pool of {len} slots")]
    OutOfRange { index: SlotIndex, len: usize },

    /// The slot has been reused since the handle was issued
    #[error("Handle {handle} is stale: slot {index} now carries salt {current_salt}")]
    StaleHandle {
        handle: SendableHandle,
        index: SlotIndex,
        current_salt: u32,
    },

    /// The slot holds no message
    #[error("Slot {index} is not in use")]
    Free { index: SlotIndex },

    /// The pool could not grow
    #[error("Failed to grow the slot pool beyond {len} slots")]
    AllocationFailed { len: usize },

    /// Slots may only be allocated into a live state
    #[error("Cannot allocate a slot in state {state:?}")]
    InvalidInitialState { state: SlotState },
}

#[derive(Clone, Copy)]
struct SlotLinks {
    prev: SlotIndex,
    next: SlotIndex,
    state: SlotState,
}

/// Arena of salted slots. Every live slot sits in a doubly linked list for
/// its state, threaded through index links and anchored at a root sentinel,
/// so moving between states is O(1).
pub struct SlotPool<T> {
    values: Vec<Option<T>>,
    links: Vec<SlotLinks>,
    salts: Vec<u32>,
    free_bins: Vec<Vec<SlotIndex>>,
    counts: [usize; LIVE_STATES.len()],
}

impl<T> Default for SlotPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SlotPool<T> {
    pub fn new() -> Self {
        let mut pool = Self {
            values: Vec::new(),
            links: Vec::new(),
            salts: Vec::new(),
            free_bins: Vec::new(),
            counts: [0; LIVE_STATES.len()],
        };
        for index in 0..LIVE_STATES.len() as SlotIndex {
            pool.values.push(None);
            pool.links.push(SlotLinks {
                prev: index,
                next: index,
                state: SlotState::Root,
            });
            pool.salts.push(1);
        }
        pool
    }

    fn root_of(state: SlotState) -> Option<SlotIndex> {
        state.list_index().map(|index| index as SlotIndex)
    }

    /// Total slots, including root sentinels and free slots
    pub fn capacity(&self) -> usize {
        self.values.len()
    }

    pub fn count(&self, state: SlotState) -> usize {
        state
            .list_index()
            .map(|index| self.counts[index])
            .unwrap_or(0)
    }

    /// Number of slots holding a message
    pub fn live_count(&self) -> usize {
        self.counts.iter().sum()
    }

    /// Places `value` in a free slot (growing the pool if none is free) and
    /// links it into `state`'s list
    pub fn allocate(
        &mut self,
        state: SlotState,
        value: T,
    ) -> Result<(SlotIndex, SendableHandle), SlotError> {
        let Some(root) = Self::root_of(state) else {
            return Err(SlotError::InvalidInitialState { state });
        };

        let index = match self.take_free() {
            Some(index) => index,
            None => self.grow()?,
        };

        self.values[index as usize] = Some(value);
        self.link(index, root, state);

        let salt = &mut self.salts[index as usize];
        *salt = salt.wrapping_add(1);
        if *salt == 0 {
            *salt = 1;
        }

        Ok((index, SendableHandle::new(index, *salt)))
    }

    fn take_free(&mut self) -> Option<SlotIndex> {
        self.free_bins.iter_mut().find_map(|bin| bin.pop())
    }

    fn grow(&mut self) -> Result<SlotIndex, SlotError> {
        let len = self.values.len();
        if len >= SlotIndex::MAX as usize {
            return Err(SlotError::AllocationFailed { len });
        }
        if self.values.try_reserve(1).is_err()
            || self.links.try_reserve(1).is_err()
            || self.salts.try_reserve(1).is_err()
        {
            return Err(SlotError::AllocationFailed { len });
        }
        self.values.push(None);
        self.links.push(SlotLinks {
            prev: len as SlotIndex,
            next: len as SlotIndex,
            state: SlotState::Free,
        });
        self.salts.push(0);
        Ok(len as SlotIndex)
    }

    fn link(&mut self, index: SlotIndex, root: SlotIndex, state: SlotState) {
        let tail = self.links[root as usize].prev;
        self.links[index as usize] = SlotLinks {
            prev: tail,
            next: root,
            state,
        };
        self.links[tail as usize].next = index;
        self.links[root as usize].prev = index;
        if let Some(list) = state.list_index() {
            self.counts[list] += 1;
        }
    }

    fn unlink(&mut self, index: SlotIndex) {
        let SlotLinks { prev, next, state } = self.links[index as usize];
        self.links[prev as usize].next = next;
        self.links[next as usize].prev = prev;
        if let Some(list) = state.list_index() {
            self.counts[list] -= 1;
        }
    }

    fn validate(&self, handle: SendableHandle) -> Result<usize, SlotError> {
        let index = handle.index as usize;
        if index >= self.values.len() {
            return Err(SlotError::OutOfRange {
                index: handle.index,
                len: self.values.len(),
            });
        }
        let current_salt = self.salts[index];
        if current_salt != handle.salt {
            return Err(SlotError::StaleHandle {
                handle,
                index: handle.index,
                current_salt,
            });
        }
        if !self.links[index].state.is_live() {
            return Err(SlotError::Free {
                index: handle.index,
            });
        }
        Ok(index)
    }

    /// SECURITY: handles may be stale or forged; every failure is an error, never a panic
    pub fn try_get(&self, handle: SendableHandle) -> Result<&T, SlotError> {
        let index = self.validate(handle)?;
        self.values[index].as_ref().ok_or(SlotError::Free {
            index: handle.index,
        })
    }

    pub fn get(&self, handle: SendableHandle) -> Option<&T> {
        self.try_get(handle).ok()
    }

    pub fn get_mut(&mut self, handle: SendableHandle) -> Option<&mut T> {
        let index = self.validate(handle).ok()?;
        self.values[index].as_mut()
    }

    /// Current state behind a handle, `None` if the handle no longer resolves
    pub fn state_of(&self, handle: SendableHandle) -> Option<SlotState> {
        self.validate(handle)
            .ok()
            .map(|index| self.links[index].state)
    }

    pub fn state(&self, index: SlotIndex) -> SlotState {
        self.links
            .get(index as usize)
            .map(|links| links.state)
            .unwrap_or(SlotState::Free)
    }

    pub fn handle_for(&self, index: SlotIndex) -> SendableHandle {
        let salt = self.salts.get(index as usize).copied().unwrap_or(0);
        SendableHandle::new(index, salt)
    }

    pub fn value(&self, index: SlotIndex) -> Option<&T> {
        self.values.get(index as usize).and_then(Option::as_ref)
    }

    pub fn value_mut(&mut self, index: SlotIndex) -> Option<&mut T> {
        self.values.get_mut(index as usize).and_then(Option::as_mut)
    }

    /// Moves a live slot to the tail of another live state's list.
    /// Returns false, leaving the slot untouched, if either state is not live.
    pub fn set_state(&mut self, index: SlotIndex, state: SlotState) -> bool {
        let current = self.state(index);
        let Some(root) = Self::root_of(state) else {
            warn!("refusing to move slot {} into {:?}", index, state);
            return false;
        };
        if !current.is_live() {
            warn!("refusing to move slot {} out of {:?}", index, current);
            return false;
        }
        if current != state {
            self.unlink(index);
            self.link(index, root, state);
        }
        true
    }

    /// Unlinks a live slot, returns it to the free bins and hands back its value.
    /// The salt is kept, so the next allocation of this index invalidates old handles.
    pub fn free(&mut self, index: SlotIndex) -> Option<T> {
        if !self.state(index).is_live() {
            return None;
        }
        self.unlink(index);
        self.links[index as usize] = SlotLinks {
            prev: index,
            next: index,
            state: SlotState::Free,
        };
        let bin = (index >> LOG2_SLOTS_PER_BIN) as usize;
        if bin >= self.free_bins.len() {
            self.free_bins.resize_with(bin + 1, Vec::new);
        }
        self.free_bins[bin].push(index);
        self.values[index as usize].take()
    }

    /// Slot indices currently in `state`, in list order
    pub fn indices(&self, state: SlotState) -> Vec<SlotIndex> {
        self.iter(state).collect()
    }

    pub fn iter(&self, state: SlotState) -> SlotIter<'_, T> {
        let root = Self::root_of(state);
        SlotIter {
            pool: self,
            root,
            current: root.map(|root| self.links[root as usize].next),
        }
    }
}

/// Walks one state's list from its root sentinel
pub struct SlotIter<'a, T> {
    pool: &'a SlotPool<T>,
    root: Option<SlotIndex>,
    current: Option<SlotIndex>,
}

impl<'a, T> Iterator for SlotIter<'a, T> {
    type Item = SlotIndex;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.current?;
        if Some(current) == self.root {
            self.current = None;
            return None;
        }
        self.current = Some(self.pool.links[current as usize].next);
        Some(current)
    }
}

#[cfg(test)]
mod slot_pool_tests {
    use super::*;

    #[test]
    fn allocate_and_resolve() {
        let mut pool = SlotPool::new();
        let (index, handle) = pool.allocate(SlotState::Active, "a").unwrap();
        assert_eq!(handle.index, index);
        assert_eq!(pool.get(handle), Some(&"a"));
        assert_eq!(pool.state_of(handle), Some(SlotState::Active));
        assert_eq!(pool.count(SlotState::Active), 1);
    }

    #[test]
    fn lists_keep_insertion_order() {
        let mut pool = SlotPool::new();
        let (a, _) = pool.allocate(SlotState::Active, 1).unwrap();
        let (b, _) = pool.allocate(SlotState::Active, 2).unwrap();
        let (c, _) = pool.allocate(SlotState::Active, 3).unwrap();
        assert_eq!(pool.indices(SlotState::Active), vec![a, b, c]);

        assert!(pool.set_state(b, SlotState::Waiting));
        assert_eq!(pool.indices(SlotState::Active), vec![a, c]);
        assert_eq!(pool.indices(SlotState::Waiting), vec![b]);

        assert!(pool.set_state(b, SlotState::Active));
        assert_eq!(pool.indices(SlotState::Active), vec![a, c, b]);
        assert_eq!(pool.count(SlotState::Waiting), 0);
    }

    #[test]
    fn freed_slot_rejects_old_handle() {
        let mut pool = SlotPool::new();
        let (index, old) = pool.allocate(SlotState::Active, 'x').unwrap();
        assert_eq!(pool.free(index), Some('x'));
        assert!(pool.get(old).is_none());
        assert_eq!(pool.try_get(old), Err(SlotError::Free { index }));

        let (reused, new) = pool.allocate(SlotState::Active, 'y').unwrap();
        assert_eq!(reused, index);
        assert_ne!(new.salt, old.salt);
        assert!(matches!(
            pool.try_get(old),
            Err(SlotError::StaleHandle { .. })
        ));
        assert_eq!(pool.get(new), Some(&'y'));
    }

    #[test]
    fn out_of_range_and_null_handles_fail() {
        let pool: SlotPool<u8> = SlotPool::new();
        assert!(matches!(
            pool.try_get(SendableHandle::new(900, 1)),
            Err(SlotError::OutOfRange { index: 900, .. })
        ));
        assert!(pool.get(SendableHandle::default()).is_none());
        // root sentinels never resolve
        assert!(pool.get(SendableHandle::new(0, 1)).is_none());
    }

    #[test]
    fn special_states_are_refused() {
        let mut pool = SlotPool::new();
        assert!(matches!(
            pool.allocate(SlotState::Free, 0),
            Err(SlotError::InvalidInitialState { .. })
        ));
        let (index, _) = pool.allocate(SlotState::Active, 0).unwrap();
        assert!(!pool.set_state(index, SlotState::Root));
        assert_eq!(pool.state(index), SlotState::Active);
        pool.free(index);
        assert!(!pool.set_state(index, SlotState::Active));
        assert!(pool.free(index).is_none());
    }

    #[test]
    fn free_bins_prefer_low_indices() {
        let mut pool = SlotPool::new();
        let mut indices = Vec::new();
        for value in 0..200 {
            indices.push(pool.allocate(SlotState::Active, value).unwrap().0);
        }
        pool.free(indices[150]);
        pool.free(indices[3]);
        let (first, _) = pool.allocate(SlotState::Active, 0).unwrap();
        assert_eq!(first, indices[3]);
        let (second, _) = pool.allocate(SlotState::Active, 0).unwrap();
        assert_eq!(second, indices[150]);
    }
}
