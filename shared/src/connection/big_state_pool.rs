use log::trace;

use crate::connection::big_state::BigState;

/// Recycles retired big states so opening a sequence slot does not allocate.
/// Owned by one endpoint direction.
#[derive(Default)]
pub struct BigStatePool {
    free: Vec<BigState>,
    peak: usize,
}

impl BigStatePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of `source`, reusing a retired instance when one is available
    pub fn acquire_clone(&mut self, source: &BigState) -> BigState {
        match self.free.pop() {
            Some(mut state) => {
                state.clone_from(source);
                state
            }
            None => source.clone(),
        }
    }

    /// Retires a state, simplifying it against the most recently retired one
    pub fn release(&mut self, mut state: BigState) {
        if let Some(newest) = self.free.last() {
            state.simplify(newest);
        }
        self.free.push(state);
        self.peak = self.peak.max(self.free.len());
    }

    /// Trims the free list to half of its peak since the previous cleanup
    pub fn perform_regular_cleanup(&mut self) {
        let keep = self.peak / 2;
        if self.free.len() > keep {
            trace!("big state pool trimmed from {} to {}", self.free.len(), keep);
            self.free.truncate(keep);
        }
        self.peak = self.free.len();
    }

    pub fn free_count(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod big_state_pool_tests {
    use super::*;
    use crate::messages::message_kinds::MessageFlags;

    #[test]
    fn acquire_reuses_released_state() {
        let mut pool = BigStatePool::new();
        let mut source = BigState::new(None);
        source.after_message(4, MessageFlags::BEGIN_OBJECT_UPDATE);

        pool.release(BigState::new(None));
        assert_eq!(pool.free_count(), 1);
        let copy = pool.acquire_clone(&source);
        assert_eq!(pool.free_count(), 0);
        assert_eq!(copy.table(), source.table());
    }

    #[test]
    fn cleanup_trims_to_half_the_peak() {
        let mut pool = BigStatePool::new();
        for _ in 0..8 {
            pool.release(BigState::new(None));
        }
        pool.perform_regular_cleanup();
        assert_eq!(pool.free_count(), 4);
        pool.perform_regular_cleanup();
        assert_eq!(pool.free_count(), 2);
    }
}
