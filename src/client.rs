// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The proxy end of the wire.

A [`WireClient`] hands out proxies ([`Instance`], [`Adapter`], [`Device`], [`Queue`],
[`Buffer`], [`CommandEncoder`], [`CommandBuffer`]) whose methods serialize commands instead of
doing work.  Each proxy names a server object by an [`ObjectHandle`] that the client
allocated itself, so creating an object never waits for the server.

Asynchronous operations come in two flavours: a `*_with_callback` method that takes a
closure and returns the request's [`FutureId`], and a plain method returning a
[`WireFuture`].  Either way nothing happens until the server's reply is fed to
[`WireClient::handle_commands`].  Callbacks always run with no client lock held, so they may
call straight back into the wire.

# Disconnection

Once the transport fails, the server sends something malformed, or
[`WireClient::disconnect`] is called, the client stops sending.  Every outstanding request
resolves with a connection-lost error and every device reports
[`DeviceLostReason::ConnectionLost`] (once).  Proxies keep working locally; their commands go
nowhere.
*/

mod buffer;
mod device;
mod event_manager;
mod future;
mod instance;
mod objects;

pub use buffer::Buffer;
pub use device::{CommandBuffer, CommandEncoder, Device, Queue};
pub use future::{ConnectionLost, WireFuture};
pub use instance::{Adapter, Instance};

use crate::callback_queue::CallbackQueue;
use crate::chunked_receiver::ChunkedCommandHandler;
use crate::config::WireDescriptor;
use crate::deserialize_allocator::{Allocation, DeserializeAllocator};
use crate::error::{BackendError, WireError};
use crate::handle::{FutureId, ObjectHandle, ObjectType};
use crate::protocol::{ReturnCommand, WireEncode};
use crate::serializer::{ChunkedCommandSerializer, CommandSerializer};
use crate::types::DeviceLostReason;
use event_manager::{EventKind, EventManager, Outcome, Resolution};
use objects::{ClientObjects, Tracked};
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::Arc;

struct ClientState {
    receiver: ChunkedCommandHandler,
    allocator: DeserializeAllocator,
    objects: ClientObjects,
    events: EventManager,
    disconnected: bool,
}

struct ClientInner {
    serializer: ChunkedCommandSerializer,
    state: Mutex<ClientState>,
    callbacks: CallbackQueue,
}

impl ClientInner {
    /// Runs `f` under the state lock, then drains callbacks it queued.
    fn locked<R>(&self, f: impl FnOnce(&mut ClientState) -> R) -> R {
        let result = {
            let mut state = self.state.lock();
            f(&mut state)
        };
        self.callbacks.drain();
        result
    }

    /// Serializes `command`, disconnecting if the transport refuses it.
    ///
    /// Callers hold the state lock, so commands reach the transport in the order their
    /// object ids were allocated.
    fn send(&self, state: &mut ClientState, command: &impl WireEncode) {
        if state.disconnected {
            return;
        }
        if let Err(error) = self.serializer.serialize_command(command) {
            tracing::warn!(%error, command = command.name(), "failed to send; disconnecting");
            self.disconnect_locked(state);
        }
    }

    /// A fresh handle for `object_type`, or the null handle once ids run out.
    fn allocate_handle(&self, state: &mut ClientState, object_type: ObjectType) -> ObjectHandle {
        match state.objects.table(object_type).new_object(|_| Tracked::Plain) {
            Some(handle) => handle,
            None => self.ids_exhausted(state, object_type),
        }
    }

    fn ids_exhausted(&self, state: &mut ClientState, object_type: ObjectType) -> ObjectHandle {
        tracing::error!(%object_type, "object ids exhausted");
        self.disconnect_locked(state);
        ObjectHandle::NULL
    }

    /// Registers an outstanding request.  After a disconnect the request fails right away.
    fn track(&self, state: &mut ClientState, kind: EventKind) -> FutureId {
        let future = state.events.next_future();
        if state.disconnected {
            self.callbacks.add(move || kind.fail(future));
        } else {
            state.events.track(future, kind);
        }
        future
    }

    fn disconnect_locked(&self, state: &mut ClientState) {
        if state.disconnected {
            return;
        }
        tracing::warn!(pending = state.events.len(), "client disconnecting");
        state.disconnected = true;
        self.serializer.disconnect();
        state.receiver.clear();
        for device in state.objects.devices() {
            self.callbacks.add(move || {
                device.notify_lost(
                    DeviceLostReason::ConnectionLost,
                    "the wire connection was lost".to_owned(),
                );
            });
        }
        for (future, kind) in state.events.take_unresolved() {
            state.allocator.free_future(future);
            if let Some(kind) = kind {
                self.callbacks.add(move || kind.fail(future));
            }
        }
    }

    fn handle_return(
        self: &Arc<Self>,
        objects: &ClientObjects,
        events: &mut EventManager,
        allocator: &mut DeserializeAllocator,
        command: ReturnCommand<Allocation>,
    ) -> Result<(), WireError> {
        let (future, outcome) = match command {
            ReturnCommand::InstanceRequestAdapterCallback {
                future,
                status,
                message,
                info,
            } => (
                future,
                Outcome::Adapter {
                    status,
                    message,
                    info,
                },
            ),
            ReturnCommand::AdapterRequestDeviceCallback {
                future,
                status,
                message,
            } => (future, Outcome::Device { status, message }),
            ReturnCommand::BufferMapAsyncCallback {
                buffer,
                future,
                status,
                message,
                data,
            } => (
                future,
                Outcome::Map {
                    buffer,
                    status,
                    message,
                    data,
                },
            ),
            ReturnCommand::QueueWorkDoneCallback { future, status } => {
                (future, Outcome::WorkDone { status })
            }
            ReturnCommand::DevicePopErrorScopeCallback {
                future,
                status,
                error_type,
                message,
            } => (
                future,
                Outcome::PopErrorScope {
                    status,
                    error_type,
                    message,
                },
            ),
            ReturnCommand::DeviceUncapturedErrorCallback {
                device,
                error_type,
                message,
            } => {
                let error = BackendError::new(error_type, message);
                match objects.device(device) {
                    Some(device) => self.callbacks.add(move || device.uncaptured_error(error)),
                    None => tracing::debug!(%device, %error, "error for a released device"),
                }
                return Ok(());
            }
            ReturnCommand::DeviceLostCallback {
                device,
                reason,
                message,
            } => {
                match objects.device(device) {
                    Some(device) => self.callbacks.add(move || device.notify_lost(reason, message)),
                    None => tracing::debug!(%device, "loss of a released device"),
                }
                return Ok(());
            }
            ReturnCommand::DeviceLoggingCallback {
                device,
                logging_type,
                message,
            } => {
                match objects.device(device) {
                    Some(device) => self.callbacks.add(move || device.log(logging_type, message)),
                    None => tracing::debug!(%device, "log from a released device"),
                }
                return Ok(());
            }
        };
        match events.resolve(future, outcome)? {
            Resolution::Ready => {
                let client = Arc::downgrade(self);
                self.callbacks.add(move || {
                    if let Some(client) = client.upgrade() {
                        client.complete_event(future);
                    }
                });
            }
            Resolution::Retired => allocator.free_future(future),
        }
        Ok(())
    }

    /// Delivers a resolved request.  Runs from the callback queue with no lock held.
    fn complete_event(&self, future: FutureId) {
        let ready = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some((kind, outcome)) = state.events.take(future) else {
                // Rejected locally after the reply arrived.
                state.allocator.free_future(future);
                return;
            };
            let ready = kind.complete(future, outcome, &state.allocator);
            state.allocator.free_future(future);
            ready
        };
        ready();
    }
}

/// The client end of a connection.
pub struct WireClient {
    inner: Arc<ClientInner>,
}

impl WireClient {
    pub fn new(serializer: Box<dyn CommandSerializer>, descriptor: WireDescriptor) -> Self {
        WireClient {
            inner: Arc::new(ClientInner {
                serializer: ChunkedCommandSerializer::new(serializer),
                state: Mutex::new(ClientState {
                    receiver: ChunkedCommandHandler::new(descriptor.max_command_size),
                    allocator: DeserializeAllocator::new(
                        descriptor.inline_scratch_size,
                        descriptor.max_future_data_size,
                    ),
                    objects: ClientObjects::new(),
                    events: EventManager::new(),
                    disconnected: false,
                }),
                callbacks: CallbackQueue::new(),
            }),
        }
    }

    /// Allocates an instance without telling the server.  Pass its handle to
    /// [`WireServer::inject_instance`](crate::WireServer::inject_instance) to bind it.
    pub fn reserve_instance(&self) -> Instance {
        self.inner
            .locked(|state| Instance::allocate(&self.inner, state))
    }

    /// Decodes and handles every complete return command in `bytes`.
    ///
    /// The first failure disconnects the client and is returned.
    pub fn handle_commands(&self, bytes: &[u8]) -> Result<(), WireError> {
        let result = {
            let mut guard = self.inner.state.lock();
            if guard.disconnected {
                return Err(WireError::Disconnected);
            }
            let ClientState {
                receiver,
                allocator,
                objects,
                events,
                ..
            } = &mut *guard;
            let result = receiver.handle_bytes(bytes, |bytes| {
                let command = ReturnCommand::decode(bytes, allocator)?;
                tracing::trace!(command = command.name(), "handling return command");
                let result = self.inner.handle_return(objects, events, allocator, command);
                allocator.reset();
                result
            });
            if let Err(error) = &result {
                tracing::error!(%error, "protocol violation from server");
                self.inner.disconnect_locked(&mut guard);
            }
            result
        };
        self.inner.callbacks.drain();
        result
    }

    pub fn flush(&self) -> bool {
        self.inner.serializer.flush()
    }

    /// Drops the connection.  Pending requests fail with a connection-lost error.  Calling
    /// this again does nothing.
    pub fn disconnect(&self) {
        self.inner.locked(|state| self.inner.disconnect_locked(state));
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.state.lock().disconnected
    }

    /// Requests still waiting on the server.
    pub fn pending_requests(&self) -> usize {
        self.inner.state.lock().events.len()
    }
}

impl Drop for WireClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl Debug for WireClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireClient")
            .field("disconnected", &self.is_disconnected())
            .finish_non_exhaustive()
    }
}
