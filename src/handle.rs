// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Identifiers shared by both ends of the wire.

Objects never cross the wire as pointers.  Instead each side keeps its own slot table and
refers to objects by an [`ObjectHandle`]: a slot index plus a generation counter.  The
generation is bumped every time a slot is recycled, so a reference to a freed object can be
told apart from a reference to whatever lives in that slot now.
*/

use std::fmt::Display;

/// Index of a slot in an object table.  Id 0 always means "no object".
pub type ObjectId = u32;

/// Reuse counter for a slot.
pub type ObjectGeneration = u32;

/// An `(id, generation)` pair naming one object on one side of the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ObjectHandle {
    pub id: ObjectId,
    pub generation: ObjectGeneration,
}

impl ObjectHandle {
    /// The null handle.
    pub const NULL: ObjectHandle = ObjectHandle {
        id: 0,
        generation: 0,
    };

    pub const fn new(id: ObjectId, generation: ObjectGeneration) -> Self {
        ObjectHandle { id, generation }
    }

    pub const fn is_null(&self) -> bool {
        self.id == 0
    }
}

impl Display for ObjectHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.generation)
    }
}

/// The kinds of object the wire knows how to track.
///
/// The discriminants are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectType {
    Instance = 0,
    Adapter = 1,
    Device = 2,
    Queue = 3,
    Buffer = 4,
    CommandEncoder = 5,
    CommandBuffer = 6,
}

impl ObjectType {
    pub const ALL: [ObjectType; 7] = [
        ObjectType::Instance,
        ObjectType::Adapter,
        ObjectType::Device,
        ObjectType::Queue,
        ObjectType::Buffer,
        ObjectType::CommandEncoder,
        ObjectType::CommandBuffer,
    ];

    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        ObjectType::ALL.get(value as usize).copied()
    }
}

impl Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ObjectType::Instance => "instance",
            ObjectType::Adapter => "adapter",
            ObjectType::Device => "device",
            ObjectType::Queue => "queue",
            ObjectType::Buffer => "buffer",
            ObjectType::CommandEncoder => "command encoder",
            ObjectType::CommandBuffer => "command buffer",
        };
        f.write_str(name)
    }
}

/// Correlates an asynchronous request with its completion.
///
/// Serials are handed out per connection in increasing order and are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FutureId(u64);

impl FutureId {
    pub const fn new(serial: u64) -> Self {
        FutureId(serial)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl Display for FutureId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "future#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_handle() {
        assert!(ObjectHandle::NULL.is_null());
        assert!(!ObjectHandle::new(1, 0).is_null());
        assert_eq!(ObjectHandle::default(), ObjectHandle::NULL);
    }

    #[test]
    fn test_object_type_wire_values() {
        for ty in ObjectType::ALL {
            assert_eq!(ObjectType::from_wire(ty as u8), Some(ty));
        }
        assert_eq!(ObjectType::from_wire(ObjectType::ALL.len() as u8), None);
    }
}
