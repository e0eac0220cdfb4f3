//! Property tests for the greedy allocator.
//!
//! For any interleaving of allocations and releases the free list must
//! account for every byte exactly once, free blocks must never overlap,
//! and the reported peak must be the maximum end offset ever placed.

use proptest::prelude::*;

use vnac_alloc::{AllocError, Allocator, GreedyAllocator, SequentialAllocator};
use vnac_graph::ElementType;

const ZONE: u64 = 4096;

#[derive(Clone, Debug)]
enum Action {
    /// Allocate a tensor of this many bytes (UFixed8: one byte/element).
    Alloc(usize),
    /// Release the n-th oldest live tensor, if any.
    Release(usize),
}

fn action_strategy() -> impl Strategy<Value = Action> {
    prop_oneof![
        (1usize..512).prop_map(Action::Alloc),
        (0usize..8).prop_map(Action::Release),
    ]
}

/// Mirror of the allocator's live set, tracked independently.
struct Mirror {
    live: Vec<(String, u64, u64)>, // name, offset, size
    peak: u64,
    next_id: usize,
}

impl Mirror {
    fn new() -> Self {
        Self {
            live: Vec::new(),
            peak: 0,
            next_id: 0,
        }
    }

    fn live_bytes(&self) -> u64 {
        self.live.iter().map(|(_, _, s)| s).sum()
    }
}

fn check_invariants(alloc: &GreedyAllocator, mirror: &Mirror) {
    // Conservation: live + free == zone.
    let free = ZONE - alloc.memory_used();
    assert_eq!(
        mirror.live_bytes() + free,
        ZONE,
        "live + free must equal the zone size"
    );

    // Free blocks never overlap, stay inside the zone, and account for
    // every free byte.
    let mut free_sum = 0;
    let mut last_end = 0;
    for (offset, size) in alloc.free_regions() {
        assert!(offset >= last_end, "free blocks out of order or overlapping");
        assert!(offset + size <= ZONE);
        last_end = offset + size;
        free_sum += size;
    }
    assert_eq!(free_sum, free);

    // Live placements never overlap each other and stay inside the zone.
    let mut spans: Vec<(u64, u64)> = mirror
        .live
        .iter()
        .map(|&(_, offset, size)| (offset, size))
        .collect();
    spans.sort_unstable();
    for pair in spans.windows(2) {
        assert!(
            pair[0].0 + pair[0].1 <= pair[1].0,
            "placements {pair:?} overlap"
        );
    }
    if let Some(&(offset, size)) = spans.last() {
        assert!(offset + size <= ZONE);
    }

    // Peak is the max end offset ever placed, regardless of releases.
    assert_eq!(alloc.memory_needed(), mirror.peak);
}

proptest! {
    #[test]
    fn conservation_and_peak(actions in proptest::collection::vec(action_strategy(), 1..64)) {
        let mut alloc = GreedyAllocator::new(ZONE);
        let mut mirror = Mirror::new();
        let mut last_needed = 0;

        for action in actions {
            match action {
                Action::Alloc(size) => {
                    let name = format!("t{}", mirror.next_id);
                    mirror.next_id += 1;
                    match alloc.allocate(&name, &[size], ElementType::UFixed8) {
                        Ok(placement) => {
                            let rounded = (size as u64).div_ceil(8) * 8;
                            mirror.live.push((name, placement.offset, rounded));
                            mirror.peak = mirror.peak.max(placement.offset + rounded);
                        }
                        Err(AllocError::OutOfMemory { .. }) => {
                            // Exhaustion is legal; state must be unchanged.
                        }
                        Err(other) => panic!("unexpected error: {other}"),
                    }
                }
                Action::Release(nth) => {
                    if !mirror.live.is_empty() {
                        let (name, _, _) = mirror.live.remove(nth % mirror.live.len());
                        alloc.release(&name).unwrap();
                    }
                }
            }

            // memory_needed is monotone through the run.
            prop_assert!(alloc.memory_needed() >= last_needed);
            last_needed = alloc.memory_needed();

            check_invariants(&alloc, &mirror);
        }
    }

    /// With no releases in between, the bump and best-fit strategies agree
    /// on the peak requirement: identical back-to-back placement.
    #[test]
    fn strategies_agree_without_reuse(sizes in proptest::collection::vec(1usize..256, 1..16)) {
        let mut seq = SequentialAllocator::new();
        let mut greedy = GreedyAllocator::new(ZONE * 16);
        for (i, size) in sizes.iter().enumerate() {
            let name = format!("t{i}");
            let a = seq.allocate(&name, &[*size], ElementType::UFixed8).unwrap();
            let b = greedy.allocate(&name, &[*size], ElementType::UFixed8).unwrap();
            prop_assert_eq!(a.offset, b.offset);
        }
        prop_assert_eq!(seq.memory_needed(), greedy.memory_needed());
    }
}
