// Command queue: codec, byte-arena queues and the interpreter
//
// Provides:
// - Command encoding with precondition classes in the opcode
// - Fixed-capacity queues (live queue + named macro queues)
// - The precondition-gated interpreter run once per scheduler tick

pub mod codec;
mod engine;
pub mod queue;

pub use codec::{Command, Precondition};
pub use engine::{CommandState, Engine, MotorSnapshot};
pub use queue::{LIVE, Queue, QueueSet};

/// Command identifier; 0 means "no identifier"
pub type Id = u32;

/// Process-wide monotonically increasing identifier source
#[derive(Debug)]
pub struct IdAllocator {
    next: Id,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Allocate an identifier; wraps back to 1, never yields 0
    pub fn allocate(&mut self) -> Id {
        let id = self.next;
        self.next = match self.next.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        id
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic_and_skip_zero() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.allocate(), 1);
        assert_eq!(ids.allocate(), 2);

        ids.next = u32::MAX;
        assert_eq!(ids.allocate(), u32::MAX);
        assert_eq!(ids.allocate(), 1);
    }
}
