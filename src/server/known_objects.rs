// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! The server's view of the client's object ids.
//!
//! The client picks every handle; the server only checks that each one is a legal next step.
//! An allocation is accepted at the end of the table or in a free slot whose last generation
//! is strictly lower, which is exactly what the client's own allocator produces.

use crate::error::WireError;
use crate::handle::{ObjectGeneration, ObjectHandle, ObjectId, ObjectType};

#[derive(Debug)]
struct Slot<T> {
    generation: ObjectGeneration,
    object: Option<T>,
}

#[derive(Debug)]
pub(crate) struct KnownObjects<T> {
    object_type: ObjectType,
    slots: Vec<Slot<T>>,
}

impl<T> KnownObjects<T> {
    pub(crate) fn new(object_type: ObjectType) -> Self {
        KnownObjects {
            object_type,
            slots: vec![Slot {
                generation: 0,
                object: None,
            }],
        }
    }

    pub(crate) fn allocate(&mut self, handle: ObjectHandle, object: T) -> Result<&mut T, WireError> {
        let invalid = WireError::InvalidAllocation {
            object_type: self.object_type,
            handle,
        };
        if handle.is_null() {
            return Err(invalid);
        }
        let id = handle.id as usize;
        if id == self.slots.len() {
            self.slots.push(Slot {
                generation: handle.generation,
                object: None,
            });
        } else {
            match self.slots.get(id) {
                Some(slot) if slot.object.is_none() && handle.generation > slot.generation => {}
                _ => return Err(invalid),
            }
        }
        let slot = &mut self.slots[id];
        slot.generation = handle.generation;
        Ok(slot.object.insert(object))
    }

    fn lookup_error(&self, id: ObjectId) -> WireError {
        if id == 0 {
            WireError::NullObject(self.object_type)
        } else {
            WireError::UnknownObject {
                object_type: self.object_type,
                id,
            }
        }
    }

    pub(crate) fn get(&self, id: ObjectId) -> Result<&T, WireError> {
        if id != 0 {
            if let Some(object) = self.slots.get(id as usize).and_then(|s| s.object.as_ref()) {
                return Ok(object);
            }
        }
        Err(self.lookup_error(id))
    }

    pub(crate) fn get_mut(&mut self, id: ObjectId) -> Result<&mut T, WireError> {
        let error = self.lookup_error(id);
        if id == 0 {
            return Err(error);
        }
        self.slots
            .get_mut(id as usize)
            .and_then(|s| s.object.as_mut())
            .ok_or(error)
    }

    /// Like [`get_mut`](Self::get_mut) but also requires the generation to match.  Used by
    /// completions, which may outlive the object they were issued for.
    pub(crate) fn get_handle_mut(&mut self, handle: ObjectHandle) -> Option<&mut T> {
        if handle.is_null() {
            return None;
        }
        let slot = self.slots.get_mut(handle.id as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        slot.object.as_mut()
    }

    pub(crate) fn free(&mut self, handle: ObjectHandle) -> Result<T, WireError> {
        let error = self.lookup_error(handle.id);
        if handle.is_null() {
            return Err(error);
        }
        let Some(slot) = self.slots.get_mut(handle.id as usize) else {
            return Err(error);
        };
        if slot.object.is_none() {
            return Err(error);
        }
        if slot.generation != handle.generation {
            return Err(WireError::StaleHandle {
                object_type: self.object_type,
                handle,
            });
        }
        slot.object.take().ok_or(error)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.object.is_some()).count()
    }

    pub(crate) fn drain(&mut self) -> Vec<T> {
        self.slots.iter_mut().filter_map(|s| s.object.take()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> KnownObjects<&'static str> {
        KnownObjects::new(ObjectType::Buffer)
    }

    #[test]
    fn test_allocate_appends_in_order() {
        let mut objects = table();
        objects.allocate(ObjectHandle::new(1, 0), "a").unwrap();
        objects.allocate(ObjectHandle::new(2, 0), "b").unwrap();
        assert_eq!(*objects.get(2).unwrap(), "b");
        // Skipping ahead is not something a well-behaved client does.
        assert!(matches!(
            objects.allocate(ObjectHandle::new(4, 0), "c"),
            Err(WireError::InvalidAllocation { .. })
        ));
    }

    #[test]
    fn test_reuse_needs_higher_generation() {
        let mut objects = table();
        objects.allocate(ObjectHandle::new(1, 3), "a").unwrap();
        assert!(objects.allocate(ObjectHandle::new(1, 4), "live").is_err());
        objects.free(ObjectHandle::new(1, 3)).unwrap();
        assert!(objects.allocate(ObjectHandle::new(1, 3), "same").is_err());
        assert!(objects.allocate(ObjectHandle::new(1, 2), "lower").is_err());
        objects.allocate(ObjectHandle::new(1, 4), "b").unwrap();
        assert_eq!(*objects.get(1).unwrap(), "b");
    }

    #[test]
    fn test_lookup_errors() {
        let mut objects = table();
        assert_eq!(objects.get(0), Err(WireError::NullObject(ObjectType::Buffer)));
        assert_eq!(
            objects.get(7),
            Err(WireError::UnknownObject {
                object_type: ObjectType::Buffer,
                id: 7
            })
        );
        assert!(objects.allocate(ObjectHandle::NULL, "null").is_err());
    }

    #[test]
    fn test_free_checks_generation() {
        let mut objects = table();
        objects.allocate(ObjectHandle::new(1, 0), "a").unwrap();
        assert_eq!(
            objects.free(ObjectHandle::new(1, 1)),
            Err(WireError::StaleHandle {
                object_type: ObjectType::Buffer,
                handle: ObjectHandle::new(1, 1)
            })
        );
        assert_eq!(objects.free(ObjectHandle::new(1, 0)), Ok("a"));
        assert!(objects.free(ObjectHandle::new(1, 0)).is_err());
        assert!(objects.get_handle_mut(ObjectHandle::new(1, 0)).is_none());
    }

    #[test]
    fn test_drain_empties() {
        let mut objects = table();
        objects.allocate(ObjectHandle::new(1, 0), "a").unwrap();
        objects.allocate(ObjectHandle::new(2, 0), "b").unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects.drain(), vec!["a", "b"]);
        assert_eq!(objects.len(), 0);
    }
}
