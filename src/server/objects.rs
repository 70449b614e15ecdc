// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Per-type server bookkeeping.

use super::known_objects::KnownObjects;
use crate::error::{BackendError, ErrorType, WireError};
use crate::handle::{FutureId, ObjectHandle, ObjectId, ObjectType};
use crate::procs::NativeHandle;
use crate::types::MapMode;

/// One client object as the server tracks it.
#[derive(Debug)]
pub(crate) struct ServerObject<D = ()> {
    pub(crate) handle: ObjectHandle,
    /// `None` for an error object: the backend refused to create it, so every later use
    /// is skipped or reported instead of reaching the backend.
    pub(crate) native: Option<NativeHandle>,
    /// Device that owns this object.  Null for instances and adapters.
    pub(crate) device: ObjectHandle,
    pub(crate) data: D,
}

impl<D: Default> ServerObject<D> {
    pub(crate) fn new(handle: ObjectHandle, device: ObjectHandle) -> Self {
        ServerObject {
            handle,
            native: None,
            device,
            data: D::default(),
        }
    }
}

#[derive(Debug)]
struct ErrorScope {
    filter: ErrorType,
    error: Option<BackendError>,
}

#[derive(Debug, Default)]
pub(crate) struct DeviceData {
    error_scopes: Vec<ErrorScope>,
}

impl DeviceData {
    pub(crate) fn push_error_scope(&mut self, filter: ErrorType) {
        self.error_scopes.push(ErrorScope {
            filter,
            error: None,
        });
    }

    /// `None` when the stack is empty, otherwise the first error the scope captured.
    pub(crate) fn pop_error_scope(&mut self) -> Option<Option<BackendError>> {
        self.error_scopes.pop().map(|scope| scope.error)
    }

    /// Offers `error` to the innermost scope with a matching filter.  Returns it back if no
    /// scope takes it.  A scope keeps only the first error it sees.
    pub(crate) fn capture(&mut self, error: BackendError) -> Option<BackendError> {
        match self
            .error_scopes
            .iter_mut()
            .rev()
            .find(|scope| scope.filter == error.error_type)
        {
            Some(scope) => {
                if scope.error.is_none() {
                    scope.error = Some(error);
                }
                None
            }
            None => Some(error),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum MapState {
    #[default]
    Unmapped,
    AtCreation,
    Mapped {
        mode: MapMode,
        offset: u64,
        size: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct PendingMap {
    pub(crate) future: FutureId,
    pub(crate) mode: MapMode,
    pub(crate) offset: u64,
    pub(crate) size: u64,
}

#[derive(Debug, Default)]
pub(crate) struct BufferData {
    pub(crate) size: u64,
    pub(crate) map: MapState,
    pub(crate) pending: Option<PendingMap>,
    pub(crate) destroyed: bool,
}

impl BufferData {
    /// Range the client may write through `BufferUpdateMappedData`.
    pub(crate) fn writable_range(&self) -> Option<(u64, u64)> {
        match self.map {
            MapState::AtCreation => Some((0, self.size)),
            MapState::Mapped {
                mode: MapMode::Write,
                offset,
                size,
            } => Some((offset, size)),
            _ => None,
        }
    }

    /// Whether `len` bytes written at `offset` fall inside the writable range.
    pub(crate) fn accepts_write(&self, offset: u64, len: u64) -> bool {
        let Some((start, size)) = self.writable_range() else {
            return false;
        };
        match (offset.checked_add(len), start.checked_add(size)) {
            (Some(end), Some(limit)) => offset >= start && end <= limit,
            _ => false,
        }
    }

    /// Runs before the backend sees an unmap or destroy, so a map completion that lands
    /// afterwards finds nothing pending.
    pub(crate) fn clear_mapping(&mut self) {
        self.map = MapState::Unmapped;
        self.pending = None;
    }
}

#[derive(Debug)]
pub(crate) struct ServerObjects {
    pub(crate) instances: KnownObjects<ServerObject>,
    pub(crate) adapters: KnownObjects<ServerObject>,
    pub(crate) devices: KnownObjects<ServerObject<DeviceData>>,
    pub(crate) queues: KnownObjects<ServerObject>,
    pub(crate) buffers: KnownObjects<ServerObject<BufferData>>,
    pub(crate) encoders: KnownObjects<ServerObject>,
    pub(crate) command_buffers: KnownObjects<ServerObject>,
}

fn native_of<D>(table: &KnownObjects<ServerObject<D>>, id: ObjectId) -> Option<NativeHandle> {
    table.get(id).ok().and_then(|object| object.native)
}

fn free_from<D>(
    table: &mut KnownObjects<ServerObject<D>>,
    handle: ObjectHandle,
) -> Result<Option<NativeHandle>, WireError> {
    table.free(handle).map(|object| object.native)
}

impl ServerObjects {
    pub(crate) fn new() -> Self {
        ServerObjects {
            instances: KnownObjects::new(ObjectType::Instance),
            adapters: KnownObjects::new(ObjectType::Adapter),
            devices: KnownObjects::new(ObjectType::Device),
            queues: KnownObjects::new(ObjectType::Queue),
            buffers: KnownObjects::new(ObjectType::Buffer),
            encoders: KnownObjects::new(ObjectType::CommandEncoder),
            command_buffers: KnownObjects::new(ObjectType::CommandBuffer),
        }
    }

    pub(crate) fn native(&self, object_type: ObjectType, id: ObjectId) -> Option<NativeHandle> {
        match object_type {
            ObjectType::Instance => native_of(&self.instances, id),
            ObjectType::Adapter => native_of(&self.adapters, id),
            ObjectType::Device => native_of(&self.devices, id),
            ObjectType::Queue => native_of(&self.queues, id),
            ObjectType::Buffer => native_of(&self.buffers, id),
            ObjectType::CommandEncoder => native_of(&self.encoders, id),
            ObjectType::CommandBuffer => native_of(&self.command_buffers, id),
        }
    }

    pub(crate) fn count(&self, object_type: ObjectType) -> usize {
        match object_type {
            ObjectType::Instance => self.instances.len(),
            ObjectType::Adapter => self.adapters.len(),
            ObjectType::Device => self.devices.len(),
            ObjectType::Queue => self.queues.len(),
            ObjectType::Buffer => self.buffers.len(),
            ObjectType::CommandEncoder => self.encoders.len(),
            ObjectType::CommandBuffer => self.command_buffers.len(),
        }
    }

    /// Forgets the object named by `handle`, returning its native handle for release.
    pub(crate) fn destroy(
        &mut self,
        object_type: ObjectType,
        handle: ObjectHandle,
    ) -> Result<Option<NativeHandle>, WireError> {
        match object_type {
            ObjectType::Instance => free_from(&mut self.instances, handle),
            ObjectType::Adapter => free_from(&mut self.adapters, handle),
            ObjectType::Device => free_from(&mut self.devices, handle),
            ObjectType::Queue => free_from(&mut self.queues, handle),
            ObjectType::Buffer => free_from(&mut self.buffers, handle),
            ObjectType::CommandEncoder => free_from(&mut self.encoders, handle),
            ObjectType::CommandBuffer => free_from(&mut self.command_buffers, handle),
        }
    }

    /// Empties every table, dependents before the objects they hang off.
    pub(crate) fn drain_natives(&mut self) -> Vec<(ObjectType, NativeHandle)> {
        fn take<D>(
            out: &mut Vec<(ObjectType, NativeHandle)>,
            object_type: ObjectType,
            table: &mut KnownObjects<ServerObject<D>>,
        ) {
            out.extend(
                table
                    .drain()
                    .into_iter()
                    .filter_map(|object| object.native.map(|native| (object_type, native))),
            );
        }
        let mut out = Vec::new();
        take(&mut out, ObjectType::CommandBuffer, &mut self.command_buffers);
        take(&mut out, ObjectType::CommandEncoder, &mut self.encoders);
        take(&mut out, ObjectType::Buffer, &mut self.buffers);
        take(&mut out, ObjectType::Queue, &mut self.queues);
        take(&mut out, ObjectType::Device, &mut self.devices);
        take(&mut out, ObjectType::Adapter, &mut self.adapters);
        take(&mut out, ObjectType::Instance, &mut self.instances);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_innermost_matching_scope_captures() {
        let mut device = DeviceData::default();
        device.push_error_scope(ErrorType::Validation);
        device.push_error_scope(ErrorType::OutOfMemory);
        assert!(device.capture(BackendError::validation("first")).is_none());
        assert!(device.capture(BackendError::validation("second")).is_none());
        let uncaptured = device.capture(BackendError::internal("nobody wants this"));
        assert_eq!(uncaptured.map(|e| e.error_type), Some(ErrorType::Internal));

        assert_eq!(device.pop_error_scope(), Some(None));
        assert_eq!(
            device.pop_error_scope(),
            Some(Some(BackendError::validation("first")))
        );
        assert_eq!(device.pop_error_scope(), None);
    }

    #[test]
    fn test_writable_range() {
        let mut buffer = BufferData {
            size: 64,
            ..BufferData::default()
        };
        assert_eq!(buffer.writable_range(), None);
        buffer.map = MapState::AtCreation;
        assert_eq!(buffer.writable_range(), Some((0, 64)));
        buffer.map = MapState::Mapped {
            mode: MapMode::Read,
            offset: 8,
            size: 8,
        };
        assert_eq!(buffer.writable_range(), None);
        buffer.pending = Some(PendingMap {
            future: FutureId::new(1),
            mode: MapMode::Write,
            offset: 0,
            size: 4,
        });
        buffer.clear_mapping();
        assert_eq!(buffer.map, MapState::Unmapped);
        assert!(buffer.pending.is_none());
    }

    #[test]
    fn test_accepts_write_near_the_top_of_the_range() {
        let mut buffer = BufferData {
            size: 64,
            map: MapState::AtCreation,
            ..BufferData::default()
        };
        assert!(buffer.accepts_write(60, 4));
        assert!(!buffer.accepts_write(60, 8));
        assert!(!buffer.accepts_write(u64::MAX, 2));

        buffer.map = MapState::Mapped {
            mode: MapMode::Write,
            offset: u64::MAX - 4,
            size: 16,
        };
        assert!(!buffer.accepts_write(u64::MAX - 4, 4));
        buffer.map = MapState::Unmapped;
        assert!(!buffer.accepts_write(0, 0));
    }
}
