use thiserror::Error;

use crate::types::SequenceNumber;

/// Errors that can occur during SequenceList operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SequenceError {
    /// Attempted to insert a duplicate sequence number into the list
    #[error("Duplicate sequence number {seq} not allowed in SequenceList")]
    DuplicateId { seq: SequenceNumber },
}

/// A list of items kept sorted by sequence number. Arrivals are mostly in
/// order, so lookups and inserts scan from the back.
pub struct SequenceList<T> {
    list: Vec<(SequenceNumber, T)>,
}

impl<T> Default for SequenceList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SequenceList<T> {
    pub fn new() -> Self {
        Self { list: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn front(&self) -> Option<&(SequenceNumber, T)> {
        self.list.first()
    }

    pub fn pop_front(&mut self) -> Option<(SequenceNumber, T)> {
        if self.list.is_empty() {
            return None;
        }
        Some(self.list.remove(0))
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &(SequenceNumber, T)> {
        self.list.iter()
    }

    pub fn clear(&mut self) {
        self.list.clear();
    }

    pub fn contains_scan_from_back(&self, seq: SequenceNumber) -> bool {
        for (old_seq, _) in self.list.iter().rev() {
            if *old_seq == seq {
                return true;
            }
            if *old_seq < seq {
                return false;
            }
        }
        false
    }

    /// Attempts to insert an item with the given sequence number, scanning from
    /// the back. Returns an error if the sequence number is already present.
    pub fn try_insert_scan_from_back(
        &mut self,
        seq: SequenceNumber,
        item: T,
    ) -> Result<(), SequenceError> {
        let mut index = self.list.len();
        while index > 0 {
            let old_seq = self.list[index - 1].0;
            if old_seq == seq {
                return Err(SequenceError::DuplicateId { seq });
            }
            if old_seq < seq {
                break;
            }
            index -= 1;
        }
        self.list.insert(index, (seq, item));
        Ok(())
    }

    /// Inserts an item with the given sequence number, scanning from the back.
    ///
    /// # Panics
    ///
    /// Panics if the sequence number already exists in the list.
    pub fn insert_scan_from_back(&mut self, seq: SequenceNumber, item: T) {
        self.try_insert_scan_from_back(seq, item)
            .expect("duplicates are not allowed in SequenceList")
    }
}
