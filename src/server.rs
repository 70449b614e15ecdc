// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The executing end of the wire.

A [`WireServer`] owns one connection.  Bytes from the client go into
[`handle_commands`](WireServer::handle_commands), which reassembles chunked commands, decodes
them one at a time, and replays each against the backend [`Procs`] in the order the client
serialized them.

Object handles in commands are checked against the server's own tables.  A null,
unknown or generation-mismatched handle is a protocol violation and ends the connection.
A backend failure is not: it is captured by the owning device's error scopes or reported as
an uncaptured error, and the connection carries on.

Backend completions (buffer maps, work-done notifications, device loss, device logs) are
queued and only serialized back to the client after the server's state lock has been released.

```
use gpu_wire::{WireServer, WireDescriptor, ProcTable, NoopSerializer};
use gpu_wire::imp::SoftwareProcs;
use std::sync::Arc;

let server = WireServer::new(
    ProcTable::new(Arc::new(SoftwareProcs::new())),
    Box::new(NoopSerializer),
    WireDescriptor::default(),
);
assert!(!server.is_disconnected());
```
*/

mod dispatch;
mod known_objects;
mod objects;

use crate::callback_queue::CallbackQueue;
use crate::chunked_receiver::ChunkedCommandHandler;
use crate::config::WireDescriptor;
use crate::deserialize_allocator::DeserializeAllocator;
use crate::error::{RequestError, WireError};
use crate::handle::{ObjectHandle, ObjectId, ObjectType};
use crate::procs::{NativeHandle, ProcTable};
use crate::protocol::{Command, ReturnCommand};
use crate::serializer::{ChunkedCommandSerializer, CommandSerializer};
use crate::types::RequestStatus;
use objects::{ServerObject, ServerObjects};
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::{Arc, Weak};

struct ServerState {
    receiver: ChunkedCommandHandler,
    allocator: DeserializeAllocator,
    objects: ServerObjects,
}

pub(crate) struct ServerInner {
    procs: ProcTable,
    serializer: ChunkedCommandSerializer,
    state: Mutex<ServerState>,
    completions: CallbackQueue,
}

/// Splits a failed request into its wire status and message.
fn request_status(error: RequestError) -> (RequestStatus, String) {
    match error {
        RequestError::Unavailable(message) => (RequestStatus::Unavailable, message),
        RequestError::Backend(message) => (RequestStatus::Error, message),
        other => (RequestStatus::Error, other.to_string()),
    }
}

impl ServerInner {
    /// Serializes a return command.  A transport failure ends the connection.
    fn send(&self, command: &ReturnCommand<&[u8]>) {
        if let Err(error) = self.serializer.serialize_command(command) {
            tracing::warn!(%error, command = command.name(), "failed to send; disconnecting");
            self.disconnect();
        }
    }

    /// Queues `work` to run once the state lock is free.  Returns a closure suitable for
    /// handing to the backend.
    fn deferred<A: Send + 'static>(
        self: &Arc<Self>,
        work: impl FnOnce(&ServerInner, A) + Send + 'static,
    ) -> impl FnOnce(A) + Send + 'static {
        let weak: Weak<ServerInner> = Arc::downgrade(self);
        move |args| {
            if let Some(inner) = weak.upgrade() {
                let weak = Arc::downgrade(&inner);
                inner.completions.add(move || {
                    if let Some(inner) = weak.upgrade() {
                        work(&inner, args);
                    }
                });
            }
        }
    }

    /// [`deferred`](Self::deferred) for backend callbacks that may fire any number of times.
    fn deferred_each<A: Send + 'static>(
        self: &Arc<Self>,
        work: impl Fn(&ServerInner, A) + Send + Sync + 'static,
    ) -> impl Fn(A) + Send + Sync + 'static {
        let weak: Weak<ServerInner> = Arc::downgrade(self);
        let work = Arc::new(work);
        move |args| {
            if let Some(inner) = weak.upgrade() {
                let weak = Arc::downgrade(&inner);
                let work = work.clone();
                inner.completions.add(move || {
                    if let Some(inner) = weak.upgrade() {
                        work(&inner, args);
                    }
                });
            }
        }
    }

    fn disconnect(&self) {
        if !self.serializer.is_disconnected() {
            tracing::warn!("server disconnecting");
        }
        self.serializer.disconnect();
    }

    fn allocate_instance(&self, handle: ObjectHandle, native: NativeHandle) -> Result<(), WireError> {
        let mut state = self.state.lock();
        let instance = state
            .objects
            .instances
            .allocate(handle, ServerObject::new(handle, ObjectHandle::NULL))?;
        instance.native = Some(native);
        Ok(())
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        let procs = self.procs.get();
        let natives = self.state.get_mut().objects.drain_natives();
        for (object_type, native) in natives {
            procs.release(object_type, native);
        }
    }
}

/// The server end of a connection.
pub struct WireServer {
    inner: Arc<ServerInner>,
}

impl WireServer {
    pub fn new(
        procs: ProcTable,
        serializer: Box<dyn CommandSerializer>,
        descriptor: WireDescriptor,
    ) -> Self {
        WireServer {
            inner: Arc::new(ServerInner {
                procs,
                serializer: ChunkedCommandSerializer::new(serializer),
                state: Mutex::new(ServerState {
                    receiver: ChunkedCommandHandler::new(descriptor.max_command_size),
                    allocator: DeserializeAllocator::new(
                        descriptor.inline_scratch_size,
                        descriptor.max_future_data_size,
                    ),
                    objects: ServerObjects::new(),
                }),
                completions: CallbackQueue::new(),
            }),
        }
    }

    /// The backend slot this server dispatches to.
    pub fn procs(&self) -> &ProcTable {
        &self.inner.procs
    }

    /// Binds a client-reserved instance handle to a native instance.
    pub fn inject_instance(&self, handle: ObjectHandle, native: NativeHandle) -> Result<(), WireError> {
        self.inner.allocate_instance(handle, native)
    }

    /// Decodes and executes every complete command in `bytes`.
    ///
    /// The first decode or dispatch failure disconnects the server and is returned.  Commands
    /// before it have already run.
    pub fn handle_commands(&self, bytes: &[u8]) -> Result<(), WireError> {
        if self.is_disconnected() {
            return Err(WireError::Disconnected);
        }
        let result = {
            let mut guard = self.inner.state.lock();
            let ServerState {
                receiver,
                allocator,
                objects,
            } = &mut *guard;
            receiver.handle_bytes(bytes, |bytes| {
                let command = Command::decode(bytes, allocator)?;
                tracing::trace!(command = command.name(), "dispatching");
                let result = self.inner.execute(allocator, objects, command);
                allocator.reset();
                result
            })
        };
        if let Err(error) = &result {
            tracing::error!(%error, "protocol violation from client");
            self.inner.disconnect();
        }
        self.inner.completions.drain();
        result
    }

    /// Lets the backend deliver finished work and forwards the results.
    pub fn process_events(&self) {
        self.inner.procs.get().process_events();
        self.inner.completions.drain();
    }

    pub fn flush(&self) -> bool {
        self.inner.serializer.flush()
    }

    /// Stops sending and receiving.  Calling this again does nothing.
    pub fn disconnect(&self) {
        self.inner.disconnect();
    }

    pub fn is_disconnected(&self) -> bool {
        self.inner.serializer.is_disconnected()
    }

    /// Native handle behind a client object id, if that object exists and is valid.
    pub fn native_handle(&self, object_type: ObjectType, id: ObjectId) -> Option<NativeHandle> {
        self.inner.state.lock().objects.native(object_type, id)
    }

    /// Number of live objects of `object_type`, error objects included.
    pub fn object_count(&self, object_type: ObjectType) -> usize {
        self.inner.state.lock().objects.count(object_type)
    }
}

impl Debug for WireServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireServer")
            .field("disconnected", &self.is_disconnected())
            .finish_non_exhaustive()
    }
}
