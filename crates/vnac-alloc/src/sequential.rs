//! Monotonic bump allocator.

use vnac_graph::ElementType;

use crate::{tensor_bytes, AllocError, Allocator, Placement};

/// Places tensors back to back and never reclaims space.
///
/// Useful when reuse is undesired or lifetimes are assumed to overlap;
/// `memory_used` and `memory_needed` both report the high-water mark.
#[derive(Debug, Default)]
pub struct SequentialAllocator {
    next: u64,
}

impl SequentialAllocator {
    /// Creates an empty bump allocator.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Allocator for SequentialAllocator {
    fn allocate(
        &mut self,
        _name: &str,
        shape: &[usize],
        element: ElementType,
    ) -> Result<Placement, AllocError> {
        let size = tensor_bytes(shape, element);
        let offset = self.next;
        self.next += size;
        Ok(Placement { zone: 0, offset })
    }

    fn release(&mut self, _name: &str) -> Result<(), AllocError> {
        // Space is never reclaimed.
        Ok(())
    }

    fn memory_used(&self) -> u64 {
        self.next
    }

    fn memory_needed(&self) -> u64 {
        self.next
    }
}
