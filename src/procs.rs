// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The backend seam.

The server never talks to a graphics API directly.  It calls a [`Procs`] implementation,
which owns the real objects and names them with opaque [`NativeHandle`]s.  A D3D12, Vulkan,
Metal or GL backend lives behind this trait; this crate ships only an in-memory one
([`crate::imp::SoftwareProcs`]).

Which backend is active is decided by whoever builds the server, through a [`ProcTable`].
The table is an ordinary value rather than process-wide state.  Code that wants a per-thread
backend keeps its own `ProcTable` and passes it along.  [`ProcTable::reset`] installs
[`NullProcs`], which fails every operation.

Asynchronous operations take a boxed callback.  A backend may call it from inside the
operation or at any later point (typically from [`Procs::process_events`]); the server queues
the result either way and acts on it only after its own locks are released.
*/

use crate::error::{BackendError, RequestError};
use crate::handle::ObjectType;
use crate::types::{
    AdapterInfo, BufferDescriptor, DeviceDescriptor, DeviceLostReason, LoggingType,
    MapAsyncStatus, MapMode, RequestAdapterOptions, RequestStatus,
};
use parking_lot::RwLock;
use std::fmt::Debug;
use std::sync::Arc;

/// Backend-assigned name for an object.
pub type NativeHandle = u64;

pub type MapCallback = Box<dyn FnOnce(MapAsyncStatus, String) + Send>;
pub type WorkDoneCallback = Box<dyn FnOnce(RequestStatus) + Send>;
pub type DeviceLostCallback = Box<dyn FnOnce(DeviceLostReason, String) + Send>;
/// Called once per message, possibly from several threads.
pub type DeviceLoggingCallback = Arc<dyn Fn(LoggingType, String) + Send + Sync>;

/// Native operations the server dispatches to.
pub trait Procs: Send + Sync {
    fn instance_request_adapter(
        &self,
        instance: NativeHandle,
        options: &RequestAdapterOptions,
    ) -> Result<(NativeHandle, AdapterInfo), RequestError>;

    /// Creates a device and its default queue.  `lost` is called at most once, when the
    /// device stops working.
    fn adapter_request_device(
        &self,
        adapter: NativeHandle,
        descriptor: &DeviceDescriptor,
        lost: DeviceLostCallback,
    ) -> Result<(NativeHandle, NativeHandle), RequestError>;

    fn device_create_buffer(
        &self,
        device: NativeHandle,
        descriptor: &BufferDescriptor,
    ) -> Result<NativeHandle, BackendError>;

    fn device_create_command_encoder(
        &self,
        device: NativeHandle,
        label: &str,
    ) -> Result<NativeHandle, BackendError>;

    fn device_destroy(&self, device: NativeHandle);

    /// Routes `device`'s log messages to `callback`, replacing any earlier one.  Backends
    /// that never log may ignore it.
    fn device_set_logging_callback(&self, device: NativeHandle, callback: DeviceLoggingCallback) {
        let _ = (device, callback);
    }

    fn command_encoder_copy_buffer_to_buffer(
        &self,
        encoder: NativeHandle,
        source: NativeHandle,
        source_offset: u64,
        destination: NativeHandle,
        destination_offset: u64,
        size: u64,
    ) -> Result<(), BackendError>;

    fn command_encoder_finish(&self, encoder: NativeHandle) -> Result<NativeHandle, BackendError>;

    fn queue_submit(
        &self,
        queue: NativeHandle,
        command_buffers: &[NativeHandle],
    ) -> Result<(), BackendError>;

    fn queue_write_buffer(
        &self,
        queue: NativeHandle,
        buffer: NativeHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError>;

    fn queue_on_submitted_work_done(&self, queue: NativeHandle, callback: WorkDoneCallback);

    fn buffer_map_async(
        &self,
        buffer: NativeHandle,
        mode: MapMode,
        offset: u64,
        size: u64,
        callback: MapCallback,
    );

    /// Copy of a mapped range, or `None` if the range is not mapped.
    fn buffer_mapped_range(&self, buffer: NativeHandle, offset: u64, size: u64) -> Option<Vec<u8>>;

    fn buffer_write_mapped_range(
        &self,
        buffer: NativeHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError>;

    fn buffer_unmap(&self, buffer: NativeHandle) -> Result<(), BackendError>;

    fn buffer_destroy(&self, buffer: NativeHandle);

    /// Drops the server's reference to `handle`.
    fn release(&self, object_type: ObjectType, handle: NativeHandle);

    /// Delivers whatever asynchronous work has finished.
    fn process_events(&self);
}

/// The backend used when none is installed.
#[derive(Debug, Default)]
pub struct NullProcs;

const NO_BACKEND: &str = "no backend installed";

impl Procs for NullProcs {
    fn instance_request_adapter(
        &self,
        _instance: NativeHandle,
        _options: &RequestAdapterOptions,
    ) -> Result<(NativeHandle, AdapterInfo), RequestError> {
        Err(RequestError::Unavailable(NO_BACKEND.to_owned()))
    }

    fn adapter_request_device(
        &self,
        _adapter: NativeHandle,
        _descriptor: &DeviceDescriptor,
        _lost: DeviceLostCallback,
    ) -> Result<(NativeHandle, NativeHandle), RequestError> {
        Err(RequestError::Unavailable(NO_BACKEND.to_owned()))
    }

    fn device_create_buffer(
        &self,
        _device: NativeHandle,
        _descriptor: &BufferDescriptor,
    ) -> Result<NativeHandle, BackendError> {
        Err(BackendError::internal(NO_BACKEND))
    }

    fn device_create_command_encoder(
        &self,
        _device: NativeHandle,
        _label: &str,
    ) -> Result<NativeHandle, BackendError> {
        Err(BackendError::internal(NO_BACKEND))
    }

    fn device_destroy(&self, _device: NativeHandle) {}

    fn command_encoder_copy_buffer_to_buffer(
        &self,
        _encoder: NativeHandle,
        _source: NativeHandle,
        _source_offset: u64,
        _destination: NativeHandle,
        _destination_offset: u64,
        _size: u64,
    ) -> Result<(), BackendError> {
        Err(BackendError::internal(NO_BACKEND))
    }

    fn command_encoder_finish(&self, _encoder: NativeHandle) -> Result<NativeHandle, BackendError> {
        Err(BackendError::internal(NO_BACKEND))
    }

    fn queue_submit(
        &self,
        _queue: NativeHandle,
        _command_buffers: &[NativeHandle],
    ) -> Result<(), BackendError> {
        Err(BackendError::internal(NO_BACKEND))
    }

    fn queue_write_buffer(
        &self,
        _queue: NativeHandle,
        _buffer: NativeHandle,
        _offset: u64,
        _data: &[u8],
    ) -> Result<(), BackendError> {
        Err(BackendError::internal(NO_BACKEND))
    }

    fn queue_on_submitted_work_done(&self, _queue: NativeHandle, callback: WorkDoneCallback) {
        callback(RequestStatus::Error);
    }

    fn buffer_map_async(
        &self,
        _buffer: NativeHandle,
        _mode: MapMode,
        _offset: u64,
        _size: u64,
        callback: MapCallback,
    ) {
        callback(MapAsyncStatus::ValidationError, NO_BACKEND.to_owned());
    }

    fn buffer_mapped_range(
        &self,
        _buffer: NativeHandle,
        _offset: u64,
        _size: u64,
    ) -> Option<Vec<u8>> {
        None
    }

    fn buffer_write_mapped_range(
        &self,
        _buffer: NativeHandle,
        _offset: u64,
        _data: &[u8],
    ) -> Result<(), BackendError> {
        Err(BackendError::internal(NO_BACKEND))
    }

    fn buffer_unmap(&self, _buffer: NativeHandle) -> Result<(), BackendError> {
        Err(BackendError::internal(NO_BACKEND))
    }

    fn buffer_destroy(&self, _buffer: NativeHandle) {}

    fn release(&self, _object_type: ObjectType, _handle: NativeHandle) {}

    fn process_events(&self) {}
}

/// The swappable slot holding the active backend.
pub struct ProcTable {
    procs: RwLock<Arc<dyn Procs>>,
}

impl ProcTable {
    pub fn new(procs: Arc<dyn Procs>) -> Self {
        ProcTable {
            procs: RwLock::new(procs),
        }
    }

    /// A table with [`NullProcs`] installed.
    pub fn null() -> Self {
        Self::new(Arc::new(NullProcs))
    }

    /// The active backend.  Callers hold the returned `Arc`, not the table's lock, while
    /// they call into it.
    pub fn get(&self) -> Arc<dyn Procs> {
        self.procs.read().clone()
    }

    /// Installs `procs`, returning the previous backend.
    pub fn set_procs(&self, procs: Arc<dyn Procs>) -> Arc<dyn Procs> {
        std::mem::replace(&mut *self.procs.write(), procs)
    }

    /// Installs [`NullProcs`].
    pub fn reset(&self) {
        tracing::debug!("resetting procedure table");
        self.set_procs(Arc::new(NullProcs));
    }
}

impl Debug for ProcTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcTable").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_null_procs_fail() {
        let table = ProcTable::null();
        let procs = table.get();
        assert!(matches!(
            procs.instance_request_adapter(1, &RequestAdapterOptions::default()),
            Err(RequestError::Unavailable(_))
        ));
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        procs.buffer_map_async(
            1,
            MapMode::Read,
            0,
            4,
            Box::new(move |status, _| {
                assert_eq!(status, MapAsyncStatus::ValidationError);
                flag.store(true, Ordering::SeqCst);
            }),
        );
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_set_and_reset() {
        let table = ProcTable::null();
        let software: Arc<dyn Procs> = Arc::new(crate::imp::SoftwareProcs::new());
        table.set_procs(software);
        let instance = 0;
        // The software backend rejects an unknown instance rather than reporting no backend.
        assert!(matches!(
            table.get().instance_request_adapter(instance, &RequestAdapterOptions::default()),
            Err(RequestError::Backend(_))
        ));
        table.reset();
        assert!(matches!(
            table.get().instance_request_adapter(instance, &RequestAdapterOptions::default()),
            Err(RequestError::Unavailable(_))
        ));
    }
}
