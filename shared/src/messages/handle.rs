use std::fmt;

use crate::types::SlotIndex;

/// Names one occupant of a queue slot. The salt changes every time the slot
/// is reused, so a handle kept past its message's lifetime stops resolving.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct SendableHandle {
    pub index: SlotIndex,
    pub salt: u32,
}

impl SendableHandle {
    pub const fn new(index: SlotIndex, salt: u32) -> Self {
        Self { index, salt }
    }

    /// A zero salt is never handed out, so the default handle never resolves
    pub fn is_null(&self) -> bool {
        self.salt == 0
    }
}

impl fmt::Display for SendableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.index, self.salt)
    }
}
