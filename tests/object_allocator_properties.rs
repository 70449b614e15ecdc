// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Handle allocation under arbitrary create/release sequences.

use gpu_wire::{ObjectAllocator, ObjectHandle};
use proptest::prelude::*;
use std::collections::HashSet;

#[derive(Debug, Clone)]
enum Op {
    New,
    Free(prop::sample::Index),
    FreeStale(prop::sample::Index),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => Just(Op::New),
        2 => any::<prop::sample::Index>().prop_map(Op::Free),
        1 => any::<prop::sample::Index>().prop_map(Op::FreeStale),
    ]
}

proptest! {
    #[test]
    fn handles_are_never_reissued(ops in prop::collection::vec(op(), 1..200)) {
        let mut allocator = ObjectAllocator::new();
        let mut live: Vec<ObjectHandle> = Vec::new();
        let mut freed: Vec<ObjectHandle> = Vec::new();
        let mut issued: HashSet<ObjectHandle> = HashSet::new();
        let mut peak = 0;

        for op in ops {
            match op {
                Op::New => {
                    let handle = allocator.new_object(|handle| handle).unwrap();
                    prop_assert!(!handle.is_null());
                    prop_assert!(issued.insert(handle), "{handle} issued twice");
                    live.push(handle);
                }
                Op::Free(index) if !live.is_empty() => {
                    let handle = live.swap_remove(index.index(live.len()));
                    prop_assert_eq!(allocator.free(handle), Some(handle));
                    freed.push(handle);
                }
                Op::FreeStale(index) if !freed.is_empty() => {
                    let handle = freed[index.index(freed.len())];
                    prop_assert_eq!(allocator.free(handle), None);
                }
                Op::Free(_) | Op::FreeStale(_) => {}
            }
            peak = peak.max(live.len());

            prop_assert_eq!(allocator.len(), live.len());
            // Freed ids are recycled before the table grows.
            prop_assert!(allocator.table_len() <= peak + 1);
            for handle in &live {
                prop_assert_eq!(allocator.get_handle(*handle), Some(handle));
            }
            for handle in &freed {
                prop_assert!(allocator.get_handle(*handle).is_none());
            }
        }
        let ids: HashSet<_> = live.iter().map(|handle| handle.id).collect();
        prop_assert_eq!(ids.len(), live.len());
    }
}
