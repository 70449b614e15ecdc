// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Client-side id and generation table.

The client picks every id.  Fresh ids are appended to a dense table, freed ids go on a free
list with their generation bumped, and the next allocation pops the free list first.  The
server mirrors the table (see [`crate::server`]), so the generation carried in each command
is enough for it to notice a reference to a slot that has since been recycled.

An id whose generation has reached `u32::MAX` is retired when freed instead of being recycled.
The table gives up one slot forever rather than ever letting two objects share a handle.
*/

use crate::handle::{ObjectGeneration, ObjectHandle, ObjectId};

#[derive(Debug)]
struct Slot<T> {
    generation: ObjectGeneration,
    object: Option<T>,
}

/// Arena of objects indexed by [`ObjectId`].  Slot 0 is the null object and never allocated.
#[derive(Debug)]
pub struct ObjectAllocator<T> {
    slots: Vec<Slot<T>>,
    free: Vec<ObjectHandle>,
    live: usize,
}

impl<T> ObjectAllocator<T> {
    pub fn new() -> Self {
        ObjectAllocator {
            slots: vec![Slot {
                generation: 0,
                object: None,
            }],
            free: Vec::new(),
            live: 0,
        }
    }

    /// Allocates a handle and stores the object built for it.
    ///
    /// Returns `None` only when the id space is exhausted.
    pub fn new_object(&mut self, make: impl FnOnce(ObjectHandle) -> T) -> Option<ObjectHandle> {
        let handle = match self.free.pop() {
            Some(handle) => handle,
            None => {
                let id = ObjectId::try_from(self.slots.len()).ok()?;
                self.slots.push(Slot {
                    generation: 0,
                    object: None,
                });
                ObjectHandle::new(id, 0)
            }
        };
        let slot = &mut self.slots[handle.id as usize];
        slot.generation = handle.generation;
        slot.object = Some(make(handle));
        self.live += 1;
        Some(handle)
    }

    /// Removes the object named by `handle`, returning it.
    ///
    /// A handle that does not name a live object is ignored.
    pub fn free(&mut self, handle: ObjectHandle) -> Option<T> {
        if handle.is_null() {
            return None;
        }
        let slot = self.slots.get_mut(handle.id as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let object = slot.object.take()?;
        self.live -= 1;
        match handle.generation.checked_add(1) {
            Some(next) => self.free.push(ObjectHandle::new(handle.id, next)),
            None => {
                tracing::debug!(id = handle.id, "retiring object id at maximum generation");
            }
        }
        Some(object)
    }

    /// Looks up a live object by id alone.  Out-of-range ids and id 0 give `None`.
    pub fn get(&self, id: ObjectId) -> Option<&T> {
        if id == 0 {
            return None;
        }
        self.slots.get(id as usize)?.object.as_ref()
    }

    /// Looks up a live object, requiring the generation to match as well.
    pub fn get_handle(&self, handle: ObjectHandle) -> Option<&T> {
        if handle.is_null() {
            return None;
        }
        let slot = self.slots.get(handle.id as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.object.as_ref()
    }

    /// Current generation stored at `id`, if the id was ever allocated.
    pub fn generation_of(&self, id: ObjectId) -> Option<ObjectGeneration> {
        if id == 0 {
            return None;
        }
        self.slots.get(id as usize).map(|s| s.generation)
    }

    /// Number of slots in the table, including the reserved null slot.
    pub fn table_len(&self) -> usize {
        self.slots.len()
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjectHandle, &T)> {
        self.slots.iter().enumerate().filter_map(|(id, slot)| {
            slot.object
                .as_ref()
                .map(|object| (ObjectHandle::new(id as ObjectId, slot.generation), object))
        })
    }

    /// Frees every live object, returning them in id order.
    pub fn free_all(&mut self) -> Vec<(ObjectHandle, T)> {
        let handles: Vec<ObjectHandle> = self.iter().map(|(handle, _)| handle).collect();
        handles
            .into_iter()
            .filter_map(|handle| self.free(handle).map(|object| (handle, object)))
            .collect()
    }
}

impl<T> Default for ObjectAllocator<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_zero_is_reserved() {
        let mut allocator = ObjectAllocator::new();
        let handle = allocator.new_object(|_| "a").unwrap();
        assert_eq!(handle, ObjectHandle::new(1, 0));
        assert!(allocator.get(0).is_none());
        assert!(allocator.free(ObjectHandle::NULL).is_none());
    }

    #[test]
    fn test_free_then_reuse_bumps_generation() {
        let mut allocator = ObjectAllocator::new();
        let first = allocator.new_object(|h| h).unwrap();
        let second = allocator.new_object(|h| h).unwrap();
        assert_eq!(allocator.free(first), Some(first));
        assert!(allocator.get_handle(first).is_none());
        assert!(allocator.get(first.id).is_none());

        let reused = allocator.new_object(|h| h).unwrap();
        assert_eq!(reused, ObjectHandle::new(first.id, 1));
        // The stale handle does not resolve to the new occupant.
        assert!(allocator.get_handle(first).is_none());
        assert_eq!(allocator.get_handle(reused), Some(&reused));
        assert_eq!(allocator.get_handle(second), Some(&second));
        assert_eq!(allocator.len(), 2);
    }

    #[test]
    fn test_double_free_is_ignored() {
        let mut allocator = ObjectAllocator::new();
        let handle = allocator.new_object(|_| 5u8).unwrap();
        assert_eq!(allocator.free(handle), Some(5));
        assert_eq!(allocator.free(handle), None);
        // Only one recycled entry was produced.
        let a = allocator.new_object(|_| 1u8).unwrap();
        let b = allocator.new_object(|_| 2u8).unwrap();
        assert_eq!(a.id, handle.id);
        assert_ne!(b.id, handle.id);
    }

    #[test]
    fn test_out_of_range_lookup() {
        let allocator: ObjectAllocator<u32> = ObjectAllocator::new();
        assert!(allocator.get(1).is_none());
        assert!(allocator.get(u32::MAX).is_none());
        assert!(allocator.get_handle(ObjectHandle::new(99, 0)).is_none());
    }

    #[test]
    fn test_max_generation_retires_id() {
        let mut allocator = ObjectAllocator::new();
        let handle = allocator.new_object(|_| ()).unwrap();
        allocator.free(handle);
        // Pretend the slot has been recycled until its generation counter is exhausted.
        allocator.free.clear();
        allocator.free.push(ObjectHandle::new(handle.id, ObjectGeneration::MAX));

        let last = allocator.new_object(|_| ()).unwrap();
        assert_eq!(last, ObjectHandle::new(handle.id, ObjectGeneration::MAX));
        allocator.free(last);

        for _ in 0..8 {
            let next = allocator.new_object(|_| ()).unwrap();
            assert_ne!(next.id, handle.id);
        }
        assert!(allocator.get(handle.id).is_none());
    }

    #[test]
    fn test_free_all_empties_table() {
        let mut allocator = ObjectAllocator::new();
        for i in 0..4 {
            allocator.new_object(|_| i);
        }
        let freed = allocator.free_all();
        assert_eq!(freed.iter().map(|(_, v)| *v).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert!(allocator.is_empty());
        assert_eq!(allocator.iter().count(), 0);
    }
}
