//! Property tests for TLAB bump allocation and heap refill.

use ember_core::ClassId;
use ember_gc::{GcConfig, Heap, Tlab};
use proptest::prelude::*;

proptest! {
    #[test]
    fn tlab_bounds_hold_for_any_sequence(
        sizes in prop::collection::vec(0usize..200, 1..64),
        grow in prop::collection::vec(0usize..100, 1..64),
    ) {
        let mut tlab = Tlab::new(0, 64, 1024);
        for (size, extra) in sizes.iter().zip(grow.iter().cycle()) {
            let before = tlab.pos();
            match tlab.alloc(*size) {
                Some(addr) => {
                    prop_assert_eq!(addr, before);
                    prop_assert_eq!(tlab.pos(), before + size);
                }
                None => {
                    prop_assert_eq!(tlab.pos(), before);
                    tlab.expand(*extra);
                }
            }
            prop_assert!(tlab.start() <= tlab.pos());
            prop_assert!(tlab.pos() <= tlab.end());
            prop_assert!(tlab.end() <= tlab.limit());
        }
    }

    #[test]
    fn heap_addresses_never_overlap(slots in prop::collection::vec((0usize..8, 0usize..8), 1..100)) {
        let heap = Heap::new(GcConfig::testing()).unwrap();
        let mut tlab = Tlab::EMPTY;
        let mut spans = Vec::new();
        for (prims, refs) in slots {
            let obj = heap.alloc_object(&mut tlab, ClassId(1), prims, refs).unwrap();
            spans.push((heap.address_of(obj), heap.object_size(obj)));
        }
        spans.sort_unstable();
        for pair in spans.windows(2) {
            prop_assert!(pair[0].0 + pair[0].1 <= pair[1].0);
        }
    }
}

#[test]
fn refill_records_waste() {
    let config = GcConfig {
        tlab_size: 1024,
        ..GcConfig::testing()
    };
    let heap = Heap::new(config).unwrap();
    let mut tlab = Tlab::EMPTY;
    // 48-byte objects overflow several buffers.
    for _ in 0..100 {
        heap.alloc_object(&mut tlab, ClassId(1), 5, 0).unwrap();
    }
    let stats = heap.stats().snapshot();
    assert_eq!(stats.objects_allocated, 100);
    assert_eq!(stats.tlab_allocations, 100);
    assert!(stats.tlab_refills >= 2);
}
