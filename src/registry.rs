//======================================================================================================================
// Imports
//======================================================================================================================

use ::std::collections::HashSet;

//======================================================================================================================
// Structures
//======================================================================================================================

/// Operation identifier.
///
/// This is used to uniquely identify every operation registered on a reactor: timers, deferred items, stream watchers
/// and coroutine tasks all draw from the same counter. An identifier is never reused within the lifetime of a reactor
/// instance.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct OpId(u64);

/// Issues operation identifiers and tracks which ones have been cancelled.
pub struct IdRegistry {
    /// Next identifier to be issued.
    next_id: u64,
    /// Identifiers marked as cancelled.
    cancelled: HashSet<OpId>,
}

//======================================================================================================================
// Associate Functions
//======================================================================================================================

impl IdRegistry {
    /// Issues a fresh identifier. Identifiers are strictly increasing.
    pub fn issue(&mut self) -> OpId {
        let id: OpId = OpId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Marks an identifier as cancelled. Cancelling an unknown or already-cancelled identifier is a no-op.
    pub fn cancel(&mut self, id: OpId) {
        self.cancelled.insert(id);
    }

    /// Checks whether an identifier has been cancelled. This is consulted before any execution attempt.
    pub fn is_cancelled(&self, id: &OpId) -> bool {
        self.cancelled.contains(id)
    }
}

//======================================================================================================================
// Trait Implementations
//======================================================================================================================

impl Default for IdRegistry {
    fn default() -> Self {
        Self {
            next_id: 1,
            cancelled: HashSet::<OpId>::new(),
        }
    }
}

impl From<u64> for OpId {
    fn from(value: u64) -> Self {
        OpId(value)
    }
}

impl From<OpId> for u64 {
    fn from(value: OpId) -> Self {
        value.0
    }
}

//======================================================================================================================
// Unit Tests
//======================================================================================================================
