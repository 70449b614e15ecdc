// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Scratch memory for decoding variable-length command payloads.

Most payloads only need to live while their command is being handled.  Those come from
*scratch* space: first a fixed inline buffer, then overflow blocks that double in size.  All
scratch space is reclaimed together by [`DeserializeAllocator::reset`], which the decode loop
calls between commands.

Some payloads must outlive their command, e.g. the bytes of a buffer mapping that the client
hands to a callback which runs later.  Those are *tracked* against one or more [`FutureId`]s
and stay alive until [`DeserializeAllocator::free_future`] has been called for every one of
them.  `reset` never touches tracked space.

Allocations are returned as [`Allocation`] tokens rather than slices so that the decoder can
keep several of them at once.  A scratch token stops resolving after the next `reset`.
*/

use crate::handle::FutureId;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Location {
    Scratch {
        epoch: u64,
        // 0 is the inline buffer, n is overflow block n - 1
        block: usize,
        offset: usize,
    },
    Tracked {
        key: u64,
    },
}

/// Token for a region handed out by [`DeserializeAllocator::get_space`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    location: Location,
    len: usize,
}

impl Allocation {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_tracked(&self) -> bool {
        matches!(self.location, Location::Tracked { .. })
    }
}

#[derive(Debug)]
struct OverflowBlock {
    data: Box<[u8]>,
    used: usize,
}

#[derive(Debug)]
struct TrackedAllocation {
    data: Box<[u8]>,
    futures: Vec<FutureId>,
}

#[derive(Debug)]
pub struct DeserializeAllocator {
    inline: Box<[u8]>,
    inline_used: usize,
    overflow: Vec<OverflowBlock>,
    next_block_size: usize,
    epoch: u64,
    tracked: HashMap<u64, TrackedAllocation>,
    by_future: HashMap<FutureId, Vec<u64>>,
    next_key: u64,
    tracked_bytes: usize,
    max_tracked_bytes: usize,
}

fn zeroed(size: usize) -> Option<Box<[u8]>> {
    let mut data = Vec::new();
    data.try_reserve_exact(size).ok()?;
    data.resize(size, 0);
    Some(data.into_boxed_slice())
}

impl DeserializeAllocator {
    pub fn new(inline_size: usize, max_tracked_bytes: usize) -> Self {
        DeserializeAllocator {
            inline: vec![0; inline_size].into_boxed_slice(),
            inline_used: 0,
            overflow: Vec::new(),
            next_block_size: inline_size.max(64) * 2,
            epoch: 0,
            tracked: HashMap::new(),
            by_future: HashMap::new(),
            next_key: 0,
            tracked_bytes: 0,
            max_tracked_bytes,
        }
    }

    /// Returns `size` zeroed bytes.
    ///
    /// With an empty `futures` slice the space is scratch and dies at the next [`reset`](Self::reset).
    /// Otherwise it lives until every listed future has been freed.  `None` means the memory
    /// could not be found.
    pub fn get_space(&mut self, size: usize, futures: &[FutureId]) -> Option<Allocation> {
        if futures.is_empty() {
            self.get_scratch(size)
        } else {
            self.get_tracked(size, futures)
        }
    }

    fn get_scratch(&mut self, size: usize) -> Option<Allocation> {
        if self.overflow.is_empty() && self.inline.len() - self.inline_used >= size {
            let offset = self.inline_used;
            self.inline_used += size;
            return Some(self.scratch(0, offset, size));
        }
        if let Some(last) = self.overflow.last_mut() {
            if last.data.len() - last.used >= size {
                let offset = last.used;
                last.used += size;
                let block = self.overflow.len();
                return Some(self.scratch(block, offset, size));
            }
        }
        let block_size = self.next_block_size.max(size);
        let data = zeroed(block_size)?;
        self.next_block_size = block_size.checked_mul(2).unwrap_or(block_size);
        tracing::trace!(block_size, "deserialize allocator overflow block");
        self.overflow.push(OverflowBlock { data, used: size });
        let block = self.overflow.len();
        Some(self.scratch(block, 0, size))
    }

    fn scratch(&self, block: usize, offset: usize, len: usize) -> Allocation {
        Allocation {
            location: Location::Scratch {
                epoch: self.epoch,
                block,
                offset,
            },
            len,
        }
    }

    fn get_tracked(&mut self, size: usize, futures: &[FutureId]) -> Option<Allocation> {
        if self.tracked_bytes.saturating_add(size) > self.max_tracked_bytes {
            tracing::warn!(
                size,
                tracked = self.tracked_bytes,
                "future-tracked deserialize space exhausted"
            );
            return None;
        }
        let data = zeroed(size)?;
        let key = self.next_key;
        self.next_key += 1;

        let mut owners: Vec<FutureId> = futures.to_vec();
        owners.sort();
        owners.dedup();
        for future in &owners {
            self.by_future.entry(*future).or_default().push(key);
        }
        self.tracked.insert(
            key,
            TrackedAllocation {
                data,
                futures: owners,
            },
        );
        self.tracked_bytes += size;
        Some(Allocation {
            location: Location::Tracked { key },
            len: size,
        })
    }

    pub fn bytes(&self, allocation: &Allocation) -> Option<&[u8]> {
        match allocation.location {
            Location::Scratch {
                epoch,
                block,
                offset,
            } => {
                if epoch != self.epoch {
                    return None;
                }
                let data: &[u8] = if block == 0 {
                    &self.inline
                } else {
                    &self.overflow.get(block - 1)?.data
                };
                data.get(offset..offset + allocation.len)
            }
            Location::Tracked { key } => Some(&self.tracked.get(&key)?.data[..]),
        }
    }

    pub fn bytes_mut(&mut self, allocation: &Allocation) -> Option<&mut [u8]> {
        match allocation.location {
            Location::Scratch {
                epoch,
                block,
                offset,
            } => {
                if epoch != self.epoch {
                    return None;
                }
                let data: &mut [u8] = if block == 0 {
                    &mut self.inline
                } else {
                    &mut self.overflow.get_mut(block - 1)?.data
                };
                data.get_mut(offset..offset + allocation.len)
            }
            Location::Tracked { key } => Some(&mut self.tracked.get_mut(&key)?.data[..]),
        }
    }

    /// Drops `future`'s claim on its tracked allocations.  Allocations with no remaining
    /// claims are released.
    pub fn free_future(&mut self, future: FutureId) {
        let Some(keys) = self.by_future.remove(&future) else {
            return;
        };
        for key in keys {
            let Some(entry) = self.tracked.get_mut(&key) else {
                continue;
            };
            entry.futures.retain(|f| *f != future);
            if entry.futures.is_empty() {
                if let Some(entry) = self.tracked.remove(&key) {
                    self.tracked_bytes -= entry.data.len();
                }
            }
        }
    }

    /// Releases all scratch space.  Tracked space is untouched.
    pub fn reset(&mut self) {
        self.inline_used = 0;
        self.overflow.clear();
        self.next_block_size = self.inline.len().max(64) * 2;
        self.epoch += 1;
    }

    /// Bytes currently held for futures.
    pub fn tracked_bytes(&self) -> usize {
        self.tracked_bytes
    }

    /// Whether any allocation is still held for `future`.
    pub fn holds_future(&self, future: FutureId) -> bool {
        self.by_future.contains_key(&future)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> DeserializeAllocator {
        DeserializeAllocator::new(128, 1 << 20)
    }

    #[test]
    fn test_small_allocations_use_inline_buffer() {
        let mut allocator = allocator();
        let a = allocator.get_space(100, &[]).unwrap();
        let b = allocator.get_space(28, &[]).unwrap();
        assert!(allocator.overflow.is_empty());
        allocator.bytes_mut(&a).unwrap().fill(1);
        allocator.bytes_mut(&b).unwrap().fill(2);
        assert!(allocator.bytes(&a).unwrap().iter().all(|b| *b == 1));
        assert!(allocator.bytes(&b).unwrap().iter().all(|b| *b == 2));
    }

    #[test]
    fn test_overflow_blocks_grow() {
        let mut allocator = allocator();
        allocator.get_space(200, &[]).unwrap();
        allocator.get_space(200, &[]).unwrap();
        allocator.get_space(200, &[]).unwrap();
        let sizes: Vec<usize> = allocator.overflow.iter().map(|b| b.data.len()).collect();
        assert!(sizes.windows(2).all(|w| w[1] >= w[0] * 2));
        // One oversized request gets a block of its own size.
        let big = allocator.get_space(100_000, &[]).unwrap();
        assert_eq!(allocator.bytes(&big).unwrap().len(), 100_000);
    }

    #[test]
    fn test_reset_invalidates_scratch_only() {
        let mut allocator = allocator();
        let scratch = allocator.get_space(16, &[]).unwrap();
        let overflow = allocator.get_space(4096, &[]).unwrap();
        let tracked = allocator.get_space(16, &[FutureId::new(9)]).unwrap();
        allocator.bytes_mut(&tracked).unwrap().copy_from_slice(&[7; 16]);

        allocator.reset();
        assert!(allocator.bytes(&scratch).is_none());
        assert!(allocator.bytes(&overflow).is_none());
        assert_eq!(allocator.bytes(&tracked).unwrap(), &[7; 16]);
        assert!(allocator.overflow.is_empty());
    }

    #[test]
    fn test_shared_allocation_outlives_first_future() {
        let mut allocator = allocator();
        let one = FutureId::new(1);
        let two = FutureId::new(2);
        let shared = allocator.get_space(8, &[one, two]).unwrap();
        allocator.bytes_mut(&shared).unwrap().copy_from_slice(b"mappings");

        allocator.free_future(one);
        assert_eq!(allocator.bytes(&shared).unwrap(), b"mappings");
        assert!(allocator.holds_future(two));

        allocator.free_future(two);
        assert!(allocator.bytes(&shared).is_none());
        assert_eq!(allocator.tracked_bytes(), 0);
    }

    #[test]
    fn test_free_future_leaves_other_futures_alone() {
        let mut allocator = allocator();
        let a = allocator.get_space(4, &[FutureId::new(1)]).unwrap();
        let b = allocator.get_space(4, &[FutureId::new(2)]).unwrap();
        allocator.free_future(FutureId::new(1));
        assert!(allocator.bytes(&a).is_none());
        assert!(allocator.bytes(&b).is_some());
        // Freeing an unknown future is harmless.
        allocator.free_future(FutureId::new(77));
    }

    #[test]
    fn test_tracked_limit() {
        let mut allocator = DeserializeAllocator::new(16, 100);
        assert!(allocator.get_space(60, &[FutureId::new(1)]).is_some());
        assert!(allocator.get_space(60, &[FutureId::new(2)]).is_none());
        allocator.free_future(FutureId::new(1));
        assert!(allocator.get_space(60, &[FutureId::new(2)]).is_some());
    }

    #[test]
    fn test_zero_sized_allocation() {
        let mut allocator = allocator();
        let empty = allocator.get_space(0, &[]).unwrap();
        assert!(empty.is_empty());
        assert_eq!(allocator.bytes(&empty).unwrap(), &[] as &[u8]);
    }
}
