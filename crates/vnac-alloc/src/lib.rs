//! Static memory-plan allocators for the VNA compiler.
//!
//! Tensors are placed at compile time into a single contiguous memory zone;
//! the generated code never allocates at run time. Two interchangeable
//! strategies implement the same [`Allocator`] contract: a sequential bump
//! allocator that never reuses space, and a greedy best-fit allocator that
//! recycles released regions, coalescing adjacent free blocks.

mod greedy;
mod report;
mod sequential;

pub use greedy::GreedyAllocator;
pub use report::{format_byte_size, MemoryReport};
pub use sequential::SequentialAllocator;

use std::fmt;

use vnac_graph::ElementType;

/// Errors raised by the allocators.
#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    /// No free block is large enough for the request.
    #[error(
        "not enough memory to place tensor '{name}' \
         ({request} bytes requested, largest free block {largest})"
    )]
    OutOfMemory {
        name: String,
        request: u64,
        largest: u64,
    },

    /// The tensor already holds a placement.
    #[error("tensor '{0}' is already allocated")]
    AlreadyAllocated(String),

    /// The tensor has no placement on record.
    #[error("unknown tensor '{0}'")]
    UnknownTensor(String),
}

/// Where a tensor landed: a memory zone id and a byte offset within it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Placement {
    pub zone: u32,
    pub offset: u64,
}

/// The common allocate/release/usage-reporting contract.
pub trait Allocator {
    /// Places a tensor and returns its zone and offset. The placed size is
    /// the element byte-width times the shape product, rounded up to a
    /// multiple of 8 bytes.
    fn allocate(
        &mut self,
        name: &str,
        shape: &[usize],
        element: ElementType,
    ) -> Result<Placement, AllocError>;

    /// Marks a tensor's region as reusable. Strategies without reuse treat
    /// this as a no-op.
    fn release(&mut self, name: &str) -> Result<(), AllocError>;

    /// Bytes currently occupied by live placements.
    fn memory_used(&self) -> u64;

    /// Peak requirement: the maximum (offset + size) ever placed. Monotone
    /// through a run, independent of releases.
    fn memory_needed(&self) -> u64;
}

/// Bytes required to store a tensor, rounded up to a multiple of 8.
pub fn tensor_bytes(shape: &[usize], element: ElementType) -> u64 {
    let elements: u64 = shape.iter().map(|&d| d as u64).product();
    let raw = element.byte_width() * elements;
    raw.div_ceil(8) * 8
}

/// Allocation strategy selector.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum AllocatorKind {
    /// Bump allocation, no reuse.
    #[default]
    Sequential,
    /// Best-fit allocation with free-block coalescing.
    Greedy,
}

impl AllocatorKind {
    /// Resolves a configuration-surface name. Unknown names fall back to
    /// the default strategy with a warning rather than failing the run.
    pub fn from_name(name: &str) -> Self {
        match name {
            "sequential" => Self::Sequential,
            "greedy" => Self::Greedy,
            other => {
                log::warn!(
                    "unknown allocator '{other}', falling back to sequential"
                );
                Self::Sequential
            }
        }
    }

    /// Instantiates the selected strategy for a zone of `zone_size` bytes.
    pub fn create(self, zone_size: u64) -> Box<dyn Allocator> {
        match self {
            Self::Sequential => Box::new(SequentialAllocator::new()),
            Self::Greedy => Box::new(GreedyAllocator::new(zone_size)),
        }
    }
}

impl fmt::Display for AllocatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Sequential => "sequential",
            Self::Greedy => "greedy",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_are_rounded_to_eight_bytes() {
        assert_eq!(tensor_bytes(&[1], ElementType::UFixed8), 8);
        assert_eq!(tensor_bytes(&[8], ElementType::UFixed8), 8);
        assert_eq!(tensor_bytes(&[9], ElementType::UFixed8), 16);
        assert_eq!(tensor_bytes(&[1, 3, 5, 5], ElementType::Float32), 304);
        assert_eq!(tensor_bytes(&[2, 2], ElementType::SFixed16), 8);
    }

    #[test]
    fn kind_from_name_resolves_known_strategies() {
        assert_eq!(AllocatorKind::from_name("sequential"), AllocatorKind::Sequential);
        assert_eq!(AllocatorKind::from_name("greedy"), AllocatorKind::Greedy);
    }

    // The fallback is a deliberate policy of the configuration surface:
    // an unrecognized allocator name selects the default strategy (with a
    // warning) instead of aborting the run.
    #[test]
    fn kind_from_name_is_permissive() {
        assert_eq!(AllocatorKind::from_name("quadratic"), AllocatorKind::Sequential);
        assert_eq!(AllocatorKind::from_name(""), AllocatorKind::Sequential);
        assert_eq!(AllocatorKind::from_name("GREEDY"), AllocatorKind::Sequential);
    }

    #[test]
    fn create_dispatches_by_kind() {
        let mut seq = AllocatorKind::Sequential.create(0);
        assert!(seq.allocate("t", &[1024], ElementType::Float32).is_ok());

        let mut greedy = AllocatorKind::Greedy.create(64);
        assert!(greedy.allocate("t", &[1024], ElementType::Float32).is_err());
    }
}
