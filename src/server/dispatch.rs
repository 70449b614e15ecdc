// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Command replay.
//!
//! One exhaustive match over [`Command`].  Handlers resolve ids through [`ServerObjects`]
//! (returning protocol errors with `?`), call the backend, and route backend failures to
//! the owning device.

use super::objects::{MapState, PendingMap, ServerObject, ServerObjects};
use super::{ServerInner, request_status};
use crate::deserialize_allocator::{Allocation, DeserializeAllocator};
use crate::error::{BackendError, RequestError, WireError};
use crate::handle::{FutureId, ObjectHandle};
use crate::procs::NativeHandle;
use crate::protocol::{Command, ReturnCommand};
use crate::types::{
    AdapterInfo, DeviceLostReason, LoggingType, MapAsyncStatus, PopErrorScopeStatus,
    RequestStatus,
};
use std::sync::Arc;

/// State changes that must be visible before the handler runs.
fn pre_dispatch(objects: &mut ServerObjects, command: &Command<Allocation>) -> Result<(), WireError> {
    match command {
        Command::BufferUnmap { buffer } => {
            objects.buffers.get_mut(*buffer)?.data.clear_mapping();
        }
        Command::BufferDestroy { buffer } => {
            let data = &mut objects.buffers.get_mut(*buffer)?.data;
            data.clear_mapping();
            data.destroyed = true;
        }
        _ => {}
    }
    Ok(())
}

fn payload<'a>(
    allocator: &'a DeserializeAllocator,
    data: &Allocation,
) -> Result<&'a [u8], WireError> {
    allocator
        .bytes(data)
        .ok_or(WireError::InvalidState("payload is no longer available"))
}

impl ServerInner {
    /// Hands `error` to `device`'s error scopes, or reports it as uncaptured.
    fn report(&self, objects: &mut ServerObjects, device: ObjectHandle, error: BackendError) {
        let Some(target) = objects.devices.get_handle_mut(device) else {
            tracing::debug!(%device, %error, "error for a device that no longer exists");
            return;
        };
        if let Some(error) = target.data.capture(error) {
            tracing::debug!(%device, %error, "uncaptured device error");
            self.send(&ReturnCommand::DeviceUncapturedErrorCallback {
                device,
                error_type: error.error_type,
                message: error.message,
            });
        }
    }

    fn report_result(
        &self,
        objects: &mut ServerObjects,
        device: ObjectHandle,
        result: Result<(), BackendError>,
    ) {
        if let Err(error) = result {
            self.report(objects, device, error);
        }
    }

    pub(super) fn execute(
        self: &Arc<Self>,
        allocator: &DeserializeAllocator,
        objects: &mut ServerObjects,
        command: Command<Allocation>,
    ) -> Result<(), WireError> {
        pre_dispatch(objects, &command)?;
        let procs = self.procs.get();
        match command {
            Command::DestroyObject {
                object_type,
                object,
            } => {
                if let Some(native) = objects.destroy(object_type, object)? {
                    procs.release(object_type, native);
                }
            }
            Command::InstanceRequestAdapter {
                instance,
                future,
                adapter,
                options,
            } => {
                let native_instance = objects.instances.get(instance)?.native;
                let slot = objects
                    .adapters
                    .allocate(adapter, ServerObject::new(adapter, ObjectHandle::NULL))?;
                let result = match native_instance {
                    Some(native) => procs.instance_request_adapter(native, &options),
                    None => Err(RequestError::Backend("invalid instance".to_owned())),
                };
                let reply = match result {
                    Ok((native, info)) => {
                        slot.native = Some(native);
                        ReturnCommand::InstanceRequestAdapterCallback {
                            future,
                            status: RequestStatus::Success,
                            message: String::new(),
                            info,
                        }
                    }
                    Err(error) => {
                        let (status, message) = request_status(error);
                        ReturnCommand::InstanceRequestAdapterCallback {
                            future,
                            status,
                            message,
                            info: AdapterInfo::default(),
                        }
                    }
                };
                self.send(&reply);
            }
            Command::InstanceProcessEvents { instance } => {
                objects.instances.get(instance)?;
                procs.process_events();
            }
            Command::AdapterRequestDevice {
                adapter,
                future,
                device,
                queue,
                descriptor,
            } => {
                let native_adapter = objects.adapters.get(adapter)?.native;
                objects
                    .devices
                    .allocate(device, ServerObject::new(device, device))?;
                objects
                    .queues
                    .allocate(queue, ServerObject::new(queue, device))?;
                let lost = self.deferred(
                    move |inner: &ServerInner, (reason, message): (DeviceLostReason, String)| {
                        tracing::debug!(%device, ?reason, "forwarding device loss");
                        inner.send(&ReturnCommand::DeviceLostCallback {
                            device,
                            reason,
                            message,
                        });
                    },
                );
                let result = match native_adapter {
                    Some(native) => procs.adapter_request_device(
                        native,
                        &descriptor,
                        Box::new(move |reason, message| lost((reason, message))),
                    ),
                    None => Err(RequestError::Backend("invalid adapter".to_owned())),
                };
                let (status, message) = match result {
                    Ok((native_device, native_queue)) => {
                        objects.devices.get_mut(device.id)?.native = Some(native_device);
                        objects.queues.get_mut(queue.id)?.native = Some(native_queue);
                        let log = self.deferred_each(
                            move |inner: &ServerInner,
                                  (logging_type, message): (LoggingType, String)| {
                                inner.send(&ReturnCommand::DeviceLoggingCallback {
                                    device,
                                    logging_type,
                                    message,
                                });
                            },
                        );
                        procs.device_set_logging_callback(
                            native_device,
                            Arc::new(move |logging_type, message| log((logging_type, message))),
                        );
                        (RequestStatus::Success, String::new())
                    }
                    Err(error) => request_status(error),
                };
                self.send(&ReturnCommand::AdapterRequestDeviceCallback {
                    future,
                    status,
                    message,
                });
            }
            Command::DeviceCreateBuffer {
                device,
                buffer,
                descriptor,
            } => {
                let parent = objects.devices.get(device)?;
                let (owner, native_device) = (parent.handle, parent.native);
                let slot = objects
                    .buffers
                    .allocate(buffer, ServerObject::new(buffer, owner))?;
                slot.data.size = descriptor.size;
                if descriptor.mapped_at_creation {
                    slot.data.map = MapState::AtCreation;
                }
                if let Some(native_device) = native_device {
                    match procs.device_create_buffer(native_device, &descriptor) {
                        Ok(native) => slot.native = Some(native),
                        Err(error) => self.report(objects, owner, error),
                    }
                }
            }
            Command::DeviceCreateCommandEncoder {
                device,
                encoder,
                label,
            } => {
                let parent = objects.devices.get(device)?;
                let (owner, native_device) = (parent.handle, parent.native);
                let slot = objects
                    .encoders
                    .allocate(encoder, ServerObject::new(encoder, owner))?;
                if let Some(native_device) = native_device {
                    match procs.device_create_command_encoder(native_device, &label) {
                        Ok(native) => slot.native = Some(native),
                        Err(error) => self.report(objects, owner, error),
                    }
                }
            }
            Command::DevicePushErrorScope { device, filter } => {
                objects.devices.get_mut(device)?.data.push_error_scope(filter);
            }
            Command::DevicePopErrorScope { device, future } => {
                let (status, error_type, message) =
                    match objects.devices.get_mut(device)?.data.pop_error_scope() {
                        None => (PopErrorScopeStatus::EmptyStack, None, String::new()),
                        Some(None) => (PopErrorScopeStatus::Success, None, String::new()),
                        Some(Some(error)) => (
                            PopErrorScopeStatus::Success,
                            Some(error.error_type),
                            error.message,
                        ),
                    };
                self.send(&ReturnCommand::DevicePopErrorScopeCallback {
                    future,
                    status,
                    error_type,
                    message,
                });
            }
            Command::DeviceDestroy { device } => {
                if let Some(native) = objects.devices.get(device)?.native {
                    procs.device_destroy(native);
                }
            }
            Command::CommandEncoderCopyBufferToBuffer {
                encoder,
                source,
                source_offset,
                destination,
                destination_offset,
                size,
            } => {
                let target = objects.encoders.get(encoder)?;
                let (owner, native_encoder) = (target.device, target.native);
                let source = objects.buffers.get(source)?.native;
                let destination = objects.buffers.get(destination)?.native;
                // An error encoder was already reported when it was created.
                let Some(native_encoder) = native_encoder else {
                    return Ok(());
                };
                let result = match (source, destination) {
                    (Some(source), Some(destination)) => procs.command_encoder_copy_buffer_to_buffer(
                        native_encoder,
                        source,
                        source_offset,
                        destination,
                        destination_offset,
                        size,
                    ),
                    _ => Err(BackendError::validation("invalid buffer used in a copy")),
                };
                self.report_result(objects, owner, result);
            }
            Command::CommandEncoderFinish {
                encoder,
                command_buffer,
            } => {
                let target = objects.encoders.get(encoder)?;
                let (owner, native_encoder) = (target.device, target.native);
                let slot = objects
                    .command_buffers
                    .allocate(command_buffer, ServerObject::new(command_buffer, owner))?;
                if let Some(native_encoder) = native_encoder {
                    match procs.command_encoder_finish(native_encoder) {
                        Ok(native) => slot.native = Some(native),
                        Err(error) => self.report(objects, owner, error),
                    }
                }
            }
            Command::QueueSubmit {
                queue,
                command_buffers,
            } => {
                let target = objects.queues.get(queue)?;
                let (owner, native_queue) = (target.device, target.native);
                let natives = command_buffers
                    .iter()
                    .map(|id| objects.command_buffers.get(*id).map(|cb| cb.native))
                    .collect::<Result<Vec<Option<NativeHandle>>, WireError>>()?;
                let Some(native_queue) = native_queue else {
                    return Ok(());
                };
                let result = match natives.into_iter().collect::<Option<Vec<NativeHandle>>>() {
                    Some(natives) => procs.queue_submit(native_queue, &natives),
                    None => Err(BackendError::validation("invalid command buffer submitted")),
                };
                self.report_result(objects, owner, result);
            }
            Command::QueueWriteBuffer {
                queue,
                buffer,
                offset,
                data,
            } => {
                let target = objects.queues.get(queue)?;
                let (owner, native_queue) = (target.device, target.native);
                let native_buffer = objects.buffers.get(buffer)?.native;
                let bytes = payload(allocator, &data)?;
                let Some(native_queue) = native_queue else {
                    return Ok(());
                };
                let result = match native_buffer {
                    Some(native_buffer) => {
                        procs.queue_write_buffer(native_queue, native_buffer, offset, bytes)
                    }
                    None => Err(BackendError::validation("invalid buffer written")),
                };
                self.report_result(objects, owner, result);
            }
            Command::QueueOnSubmittedWorkDone { queue, future } => {
                match objects.queues.get(queue)?.native {
                    Some(native) => {
                        let done = self.deferred(move |inner: &ServerInner, status: RequestStatus| {
                            inner.send(&ReturnCommand::QueueWorkDoneCallback { future, status });
                        });
                        procs.queue_on_submitted_work_done(native, Box::new(done));
                    }
                    None => self.send(&ReturnCommand::QueueWorkDoneCallback {
                        future,
                        status: RequestStatus::Error,
                    }),
                }
            }
            Command::BufferMapAsync {
                buffer,
                future,
                mode,
                offset,
                size,
            } => {
                let target = objects.buffers.get_mut(buffer)?;
                let handle = target.handle;
                let rejection = match (target.data.pending, target.native) {
                    (Some(_), _) => Some("a mapping is already pending"),
                    (None, None) => Some("invalid buffer"),
                    (None, Some(native)) => {
                        target.data.pending = Some(PendingMap {
                            future,
                            mode,
                            offset,
                            size,
                        });
                        let done = self.deferred(
                            move |inner: &ServerInner,
                                  (status, message): (MapAsyncStatus, String)| {
                                inner.finish_map(handle, future, status, message);
                            },
                        );
                        procs.buffer_map_async(
                            native,
                            mode,
                            offset,
                            size,
                            Box::new(move |status, message| done((status, message))),
                        );
                        None
                    }
                };
                if let Some(message) = rejection {
                    self.send(&ReturnCommand::BufferMapAsyncCallback {
                        buffer: handle,
                        future,
                        status: MapAsyncStatus::ValidationError,
                        message: message.to_owned(),
                        data: &[] as &[u8],
                    });
                }
            }
            Command::BufferUpdateMappedData {
                buffer,
                offset,
                data,
            } => {
                let target = objects.buffers.get(buffer)?;
                let bytes = payload(allocator, &data)?;
                if target.data.writable_range().is_none() {
                    return Err(WireError::InvalidState("buffer is not mapped for writing"));
                }
                if !target.data.accepts_write(offset, bytes.len() as u64) {
                    return Err(WireError::InvalidState(
                        "mapped data is outside the mapped range",
                    ));
                }
                if let Some(native) = target.native {
                    let owner = target.device;
                    let result = procs.buffer_write_mapped_range(native, offset, bytes);
                    self.report_result(objects, owner, result);
                }
            }
            Command::BufferUnmap { buffer } => {
                let target = objects.buffers.get(buffer)?;
                if let Some(native) = target.native {
                    let owner = target.device;
                    let result = procs.buffer_unmap(native);
                    self.report_result(objects, owner, result);
                }
            }
            Command::BufferDestroy { buffer } => {
                if let Some(native) = objects.buffers.get(buffer)?.native {
                    procs.buffer_destroy(native);
                }
            }
        }
        Ok(())
    }

    /// Answers a map request once the backend has.  Runs with no lock held.
    fn finish_map(
        &self,
        buffer: ObjectHandle,
        future: FutureId,
        status: MapAsyncStatus,
        message: String,
    ) {
        let procs = self.procs.get();
        let (status, message, data) = {
            let mut state = self.state.lock();
            match state.objects.buffers.get_handle_mut(buffer) {
                None => (
                    MapAsyncStatus::DestroyedBeforeCallback,
                    "buffer was released before the mapping completed".to_owned(),
                    Vec::new(),
                ),
                Some(target) => match target.data.pending {
                    Some(pending) if pending.future == future => {
                        target.data.pending = None;
                        if status != MapAsyncStatus::Success {
                            (status, message, Vec::new())
                        } else {
                            let range = target.native.and_then(|native| {
                                procs.buffer_mapped_range(native, pending.offset, pending.size)
                            });
                            match range {
                                Some(data) => {
                                    target.data.map = MapState::Mapped {
                                        mode: pending.mode,
                                        offset: pending.offset,
                                        size: pending.size,
                                    };
                                    (status, message, data)
                                }
                                None => (
                                    MapAsyncStatus::ValidationError,
                                    "mapped range is unavailable".to_owned(),
                                    Vec::new(),
                                ),
                            }
                        }
                    }
                    _ if target.data.destroyed => (
                        MapAsyncStatus::DestroyedBeforeCallback,
                        "buffer was destroyed before the mapping completed".to_owned(),
                        Vec::new(),
                    ),
                    _ => (
                        MapAsyncStatus::UnmappedBeforeCallback,
                        "buffer was unmapped before the mapping completed".to_owned(),
                        Vec::new(),
                    ),
                },
            }
        };
        self.send(&ReturnCommand::BufferMapAsyncCallback {
            buffer,
            future,
            status,
            message,
            data: &data[..],
        });
    }
}
