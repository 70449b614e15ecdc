// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Atomic reference counting for wire objects.
//!
//! Client proxies are cheap to clone, but the wire needs to know the exact moment the last
//! proxy goes away so it can tell the server to destroy its copy.  `Arc` hides that moment,
//! so proxies carry a [`RefCount`] alongside the `Arc` and finalize when
//! [`RefCount::release`] says so.

use std::sync::atomic::{AtomicUsize, Ordering, fence};

/// A reference count that starts at 1.
///
/// `reference` and `release` are lock-free.  The release that takes the count from 1 to 0
/// returns `true` and is ordered after every mutation made before any earlier release.
#[derive(Debug)]
pub struct RefCount {
    count: AtomicUsize,
}

impl RefCount {
    pub fn new() -> Self {
        RefCount {
            count: AtomicUsize::new(1),
        }
    }

    /// Adds a reference.  The caller must already hold one.
    pub fn reference(&self) {
        let previous = self.count.fetch_add(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "reference() on a released object");
    }

    /// Drops a reference.  Returns `true` when this was the last one and the caller must
    /// finalize the object.
    pub fn release(&self) -> bool {
        let previous = self.count.fetch_sub(1, Ordering::Release);
        debug_assert!(previous > 0, "release() on a released object");
        if previous == 1 {
            // Pairs with the Release decrements of every other holder.
            fence(Ordering::Acquire);
            true
        } else {
            false
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }
}

impl Default for RefCount {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::RefCount;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_single_owner() {
        let count = RefCount::new();
        assert_eq!(count.count(), 1);
        assert!(count.release());
    }

    #[test]
    fn test_reference_keeps_alive() {
        let count = RefCount::new();
        count.reference();
        assert!(!count.release());
        assert!(count.release());
    }

    #[test]
    fn test_threads_reference_then_release() {
        const THREADS: usize = 16;
        let count = Arc::new(RefCount::new());
        let finalized = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let count = count.clone();
                let finalized = finalized.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        count.reference();
                        if count.release() {
                            finalized.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Still held by the initial reference.
        assert_eq!(finalized.load(Ordering::Relaxed), 0);
        assert_eq!(count.count(), 1);
        assert!(count.release());
    }

    #[test]
    fn test_exactly_one_final_release_under_contention() {
        const THREADS: usize = 8;
        for _ in 0..50 {
            let count = Arc::new(RefCount::new());
            for _ in 0..THREADS {
                count.reference();
            }
            // Every holder writes before releasing; whoever finalizes must see all writes.
            let writes = Arc::new((0..=THREADS).map(|_| AtomicUsize::new(0)).collect::<Vec<_>>());
            let finalized = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = (0..=THREADS)
                .map(|slot| {
                    let count = count.clone();
                    let writes = writes.clone();
                    let finalized = finalized.clone();
                    std::thread::spawn(move || {
                        writes[slot].store(slot + 1, Ordering::Relaxed);
                        if count.release() {
                            for (i, w) in writes.iter().enumerate() {
                                assert_eq!(w.load(Ordering::Relaxed), i + 1);
                            }
                            finalized.fetch_add(1, Ordering::Relaxed);
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
            assert_eq!(finalized.load(Ordering::Relaxed), 1);
        }
    }
}
