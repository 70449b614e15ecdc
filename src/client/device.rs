// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Devices and the objects that hang off them.

use super::buffer::Buffer;
use super::event_manager::EventKind;
use super::future::WireFuture;
use super::objects::{ObjectBase, PlainInner, ProxyInner, Tracked, finalize_locked, proxy};
use super::{ClientInner, ClientState};
use crate::error::{BackendError, ErrorType, RequestError};
use crate::handle::{FutureId, ObjectHandle, ObjectType};
use crate::protocol::Command;
use crate::types::{BufferDescriptor, DeviceLostReason, LoggingType};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

type LostCallback = Box<dyn FnOnce(DeviceLostReason, String) + Send>;
type ErrorCallback = Box<dyn FnMut(BackendError) + Send>;
type LoggingCallback = Box<dyn FnMut(LoggingType, String) + Send>;

pub(super) struct DeviceInner {
    base: ObjectBase,
    /// Holds one reference on the queue, released when the device goes.
    queue: Arc<PlainInner>,
    lost: AtomicBool,
    lost_callback: Mutex<Option<LostCallback>>,
    error_callback: Mutex<Option<ErrorCallback>>,
    logging_callback: Mutex<Option<LoggingCallback>>,
}

impl ProxyInner for DeviceInner {
    fn base(&self) -> &ObjectBase {
        &self.base
    }

    fn on_destroy(&self, client: &ClientInner, state: &mut ClientState) {
        // The queue is destroyed first so the server never sees an orphaned queue.
        if self.queue.base().release() {
            finalize_locked(&*self.queue, client, state);
        }
    }
}

impl DeviceInner {
    /// Reports the loss to the user.  Only the first report per device does anything.
    pub(super) fn notify_lost(&self, reason: DeviceLostReason, message: String) {
        if self.lost.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!(device = %self.base.handle(), ?reason, %message, "device lost");
        drop(self.logging_callback.lock().take());
        let callback = self.lost_callback.lock().take();
        if let Some(callback) = callback {
            callback(reason, message);
        }
    }

    pub(super) fn uncaptured_error(&self, error: BackendError) {
        let callback = self.error_callback.lock().take();
        match callback {
            Some(mut callback) => {
                callback(error);
                // Put it back unless the callback installed a replacement.
                let mut slot = self.error_callback.lock();
                if slot.is_none() {
                    *slot = Some(callback);
                }
            }
            None => {
                tracing::warn!(device = %self.base.handle(), %error, "uncaptured device error");
            }
        }
    }

    /// Hands a message the backend logged to the user.  A lost device no longer logs.
    pub(super) fn log(&self, logging_type: LoggingType, message: String) {
        if self.lost.load(Ordering::Acquire) {
            tracing::debug!(device = %self.base.handle(), %message, "log from a lost device");
            return;
        }
        let callback = self.logging_callback.lock().take();
        match callback {
            Some(mut callback) => {
                callback(logging_type, message);
                let mut slot = self.logging_callback.lock();
                if slot.is_none() && !self.lost.load(Ordering::Acquire) {
                    *slot = Some(callback);
                }
            }
            None => {
                tracing::debug!(device = %self.base.handle(), ?logging_type, %message, "device log");
            }
        }
    }
}

/// An open connection to an adapter.  Creates buffers and command encoders.
pub struct Device {
    inner: Arc<DeviceInner>,
}

proxy!(Device, DeviceInner);

impl Device {
    /// Allocates the device and its default queue.
    pub(super) fn allocate(client: &Arc<ClientInner>, state: &mut ClientState) -> Device {
        let inner = Arc::new_cyclic(|weak: &Weak<DeviceInner>| {
            let handle = match state
                .objects
                .table(ObjectType::Device)
                .new_object(|_| Tracked::Device(weak.clone()))
            {
                Some(handle) => handle,
                None => client.ids_exhausted(state, ObjectType::Device),
            };
            let queue = client.allocate_handle(state, ObjectType::Queue);
            DeviceInner {
                base: ObjectBase::new(client, ObjectType::Device, handle),
                queue: PlainInner::new(ObjectBase::new(client, ObjectType::Queue, queue)),
                lost: AtomicBool::new(false),
                lost_callback: Mutex::new(None),
                error_callback: Mutex::new(None),
                logging_callback: Mutex::new(None),
            }
        });
        Device { inner }
    }

    pub(super) fn queue_handle(&self) -> ObjectHandle {
        self.inner.queue.base().handle()
    }

    /// The device's default queue.
    pub fn queue(&self) -> Queue {
        self.inner.queue.base().reference();
        Queue {
            inner: self.inner.queue.clone(),
        }
    }

    pub fn create_buffer(&self, descriptor: &BufferDescriptor) -> Buffer {
        let Some(client) = self.inner.base.client() else {
            return Buffer::detached(descriptor);
        };
        client.locked(|state| Buffer::allocate(&client, state, self.inner.base.id(), descriptor))
    }

    pub fn create_command_encoder(&self, label: &str) -> CommandEncoder {
        let Some(client) = self.inner.base.client() else {
            return CommandEncoder {
                inner: PlainInner::new(ObjectBase::detached(ObjectType::CommandEncoder)),
            };
        };
        client.locked(|state| {
            let handle = client.allocate_handle(state, ObjectType::CommandEncoder);
            client.send(
                state,
                &Command::<&[u8]>::DeviceCreateCommandEncoder {
                    device: self.inner.base.id(),
                    encoder: handle,
                    label: label.to_owned(),
                },
            );
            CommandEncoder {
                inner: PlainInner::new(ObjectBase::new(&client, ObjectType::CommandEncoder, handle)),
            }
        })
    }

    /// Starts capturing errors of type `filter` on the server.
    pub fn push_error_scope(&self, filter: ErrorType) {
        self.inner.base.with_client(|client, state| {
            client.send(
                state,
                &Command::<&[u8]>::DevicePushErrorScope {
                    device: self.inner.base.id(),
                    filter,
                },
            );
        });
    }

    /// Pops the innermost error scope.  The callback gets the first error it captured, if
    /// any, or [`RequestError::EmptyScope`] when no scope was pushed.
    pub fn pop_error_scope_with_callback(
        &self,
        callback: impl FnOnce(Result<Option<BackendError>, RequestError>) + Send + 'static,
    ) -> FutureId {
        let Some(client) = self.inner.base.client() else {
            callback(Err(RequestError::ConnectionLost));
            return FutureId::new(0);
        };
        client.locked(|state| {
            let future = client.track(
                state,
                EventKind::PopErrorScope {
                    callback: Box::new(callback),
                },
            );
            client.send(
                state,
                &Command::<&[u8]>::DevicePopErrorScope {
                    device: self.inner.base.id(),
                    future,
                },
            );
            future
        })
    }

    pub fn pop_error_scope(&self) -> WireFuture<Option<BackendError>, RequestError> {
        let (complete, future) = WireFuture::pending();
        self.pop_error_scope_with_callback(complete);
        future
    }

    /// Called with each error no error scope captured.  Replaces any earlier callback.
    pub fn set_uncaptured_error_callback(&self, callback: impl FnMut(BackendError) + Send + 'static) {
        *self.inner.error_callback.lock() = Some(Box::new(callback));
    }

    /// Called with each message the backend logs for this device, until the device is lost
    /// or the connection drops.  Replaces any earlier callback.
    pub fn set_logging_callback(
        &self,
        callback: impl FnMut(LoggingType, String) + Send + 'static,
    ) {
        if self.is_lost() {
            return;
        }
        *self.inner.logging_callback.lock() = Some(Box::new(callback));
    }

    /// Called at most once, when the device is lost.  A callback set after the loss is
    /// never called.
    pub fn set_device_lost_callback(
        &self,
        callback: impl FnOnce(DeviceLostReason, String) + Send + 'static,
    ) {
        *self.inner.lost_callback.lock() = Some(Box::new(callback));
    }

    pub fn is_lost(&self) -> bool {
        self.inner.lost.load(Ordering::Acquire)
    }

    /// Destroys the device on the server.  The loss comes back as
    /// [`DeviceLostReason::Destroyed`].
    pub fn destroy(&self) {
        self.inner.base.with_client(|client, state| {
            client.send(
                state,
                &Command::<&[u8]>::DeviceDestroy {
                    device: self.inner.base.id(),
                },
            );
        });
    }
}

/// Executes command buffers and writes buffers.
pub struct Queue {
    inner: Arc<PlainInner>,
}

proxy!(Queue, PlainInner);

impl Queue {
    pub fn write_buffer(&self, buffer: &Buffer, offset: u64, data: &[u8]) {
        self.inner.base().with_client(|client, state| {
            client.send(
                state,
                &Command::QueueWriteBuffer {
                    queue: self.inner.base().id(),
                    buffer: buffer.handle().id,
                    offset,
                    data,
                },
            );
        });
    }

    pub fn submit(&self, command_buffers: &[CommandBuffer]) {
        self.inner.base().with_client(|client, state| {
            client.send(
                state,
                &Command::<&[u8]>::QueueSubmit {
                    queue: self.inner.base().id(),
                    command_buffers: command_buffers.iter().map(|cb| cb.handle().id).collect(),
                },
            );
        });
    }

    /// `callback` runs once everything submitted so far has finished.
    pub fn on_submitted_work_done_with_callback(
        &self,
        callback: impl FnOnce(Result<(), RequestError>) + Send + 'static,
    ) -> FutureId {
        let Some(client) = self.inner.base().client() else {
            callback(Err(RequestError::ConnectionLost));
            return FutureId::new(0);
        };
        client.locked(|state| {
            let future = client.track(
                state,
                EventKind::WorkDone {
                    callback: Box::new(callback),
                },
            );
            client.send(
                state,
                &Command::<&[u8]>::QueueOnSubmittedWorkDone {
                    queue: self.inner.base().id(),
                    future,
                },
            );
            future
        })
    }

    pub fn on_submitted_work_done(&self) -> WireFuture<(), RequestError> {
        let (complete, future) = WireFuture::pending();
        self.on_submitted_work_done_with_callback(complete);
        future
    }
}

/// Records copies for later submission.
pub struct CommandEncoder {
    inner: Arc<PlainInner>,
}

proxy!(CommandEncoder, PlainInner);

impl CommandEncoder {
    pub fn copy_buffer_to_buffer(
        &self,
        source: &Buffer,
        source_offset: u64,
        destination: &Buffer,
        destination_offset: u64,
        size: u64,
    ) {
        self.inner.base().with_client(|client, state| {
            client.send(
                state,
                &Command::<&[u8]>::CommandEncoderCopyBufferToBuffer {
                    encoder: self.inner.base().id(),
                    source: source.handle().id,
                    source_offset,
                    destination: destination.handle().id,
                    destination_offset,
                    size,
                },
            );
        });
    }

    /// Ends recording.  The encoder itself is released.
    pub fn finish(self) -> CommandBuffer {
        let Some(client) = self.inner.base().client() else {
            return CommandBuffer {
                inner: PlainInner::new(ObjectBase::detached(ObjectType::CommandBuffer)),
            };
        };
        client.locked(|state| {
            let handle = client.allocate_handle(state, ObjectType::CommandBuffer);
            client.send(
                state,
                &Command::<&[u8]>::CommandEncoderFinish {
                    encoder: self.inner.base().id(),
                    command_buffer: handle,
                },
            );
            CommandBuffer {
                inner: PlainInner::new(ObjectBase::new(&client, ObjectType::CommandBuffer, handle)),
            }
        })
    }
}

/// Finished work, ready for [`Queue::submit`].
pub struct CommandBuffer {
    inner: Arc<PlainInner>,
}

proxy!(CommandBuffer, PlainInner);

#[cfg(test)]
mod tests {
    use crate::client::WireClient;
    use crate::config::WireDescriptor;
    use crate::handle::{ObjectHandle, ObjectType};
    use crate::serializer::NoopSerializer;
    use crate::types::{DeviceLostReason, RequestAdapterOptions};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_device_lost_fires_once() {
        let client = WireClient::new(Box::new(NoopSerializer), WireDescriptor::default());
        let device = client.inner.locked(|state| super::Device::allocate(&client.inner, state));
        assert_eq!(device.handle(), ObjectHandle::new(1, 0));
        assert_eq!(device.queue().handle(), ObjectHandle::new(1, 0));

        let calls = Arc::new(AtomicUsize::new(0));
        let count = calls.clone();
        device.set_device_lost_callback(move |reason, _| {
            assert_eq!(reason, DeviceLostReason::Destroyed);
            count.fetch_add(1, Ordering::SeqCst);
        });
        device.inner.notify_lost(DeviceLostReason::Destroyed, "gone".to_owned());
        device.inner.notify_lost(DeviceLostReason::ConnectionLost, "gone again".to_owned());
        client.disconnect();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(device.is_lost());
    }

    #[test]
    fn test_dropping_device_frees_device_and_queue_ids() {
        let client = WireClient::new(Box::new(NoopSerializer), WireDescriptor::default());
        let device = client.inner.locked(|state| super::Device::allocate(&client.inner, state));
        let queue = device.queue();
        drop(device);
        // The queue proxy keeps its own id alive.
        let live = |ty| client.inner.state.lock().objects.table(ty).len();
        assert_eq!(live(ObjectType::Device), 0);
        assert_eq!(live(ObjectType::Queue), 1);
        drop(queue);
        assert_eq!(live(ObjectType::Queue), 0);
    }

    #[test]
    fn test_requests_after_disconnect_fail_immediately() {
        let client = WireClient::new(Box::new(NoopSerializer), WireDescriptor::default());
        let instance = client.reserve_instance();
        client.disconnect();
        let failed = Arc::new(AtomicUsize::new(0));
        let count = failed.clone();
        instance.request_adapter_with_callback(&RequestAdapterOptions::default(), move |result| {
            assert!(result.is_err());
            count.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(failed.load(Ordering::SeqCst), 1);
        assert_eq!(client.pending_requests(), 0);
    }
}
