// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*! gpu_wire carries a WebGPU-style API across a byte stream.

A [`WireClient`] hands out proxy objects whose methods serialize commands.  A [`WireServer`] on
the far side decodes those commands and replays them against a real backend through the
[`Procs`] trait.  Results that the client waits for (adapters, devices, buffer mappings, error
scopes, finished work) come back as return commands and resolve callbacks or [`WireFuture`]s.

The two halves never share memory.  They agree on objects through [`ObjectHandle`]s, an id plus
a generation, that the client allocates and the server checks.

| Concern                 | Client                         | Server                                  |
|-------------------------|--------------------------------|-----------------------------------------|
| Object ids              | allocates, recycles on release | accepts at the client's handle, checks generation |
| Commands                | serializes, chunks if large    | reassembles, decodes, dispatches        |
| Asynchronous results    | tracks futures, runs callbacks | forwards backend completions            |
| Failure                 | disconnect fails every request | disconnect stops dispatch               |

# Transports

Neither side does I/O.  Both write into a [`CommandSerializer`] you provide, and both read
from byte slices you pass to `handle_commands`.  A transport may cut the stream anywhere: a
command too big for one transport allocation is split into chunks and reassembled
transparently.  [`loopback`] has an in-memory transport and a helper that joins a client to a
server for tests.

# Errors

A malformed or out-of-order command, a stale handle, or a failed transport ends the
connection.  See [`WireError`].  Backend failures do not: they go to the device's error scopes
or its uncaptured-error callback as [`BackendError`]s.  Messages the backend logs for a device
reach [`Device::set_logging_callback`].

# Threads

Everything is `Send` and `Sync`.  Commands from several threads are serialized in the order
their locks were taken.  Callbacks run on whichever thread handled the reply (or called
[`WireClient::disconnect`]), never while the wire holds a lock, so they may call back in.

Diagnostics go through [`tracing`] and locks are [`parking_lot`] mutexes.  [`WireFuture`] sits
on a [`futures`] oneshot channel, so any executor can await it.
*/

mod callback_queue;
mod chunked_receiver;
mod client;
mod config;
mod deserialize_allocator;
mod error;
mod handle;
pub mod imp;
pub mod loopback;
mod object_allocator;
mod procs;
pub mod protocol;
mod refcount;
mod serializer;
mod server;
mod types;

pub use callback_queue::CallbackQueue;
pub use chunked_receiver::ChunkedCommandHandler;
pub use client::{
    Adapter, Buffer, CommandBuffer, CommandEncoder, ConnectionLost, Device, Instance, Queue,
    WireClient, WireFuture,
};
pub use config::WireDescriptor;
pub use deserialize_allocator::{Allocation, DeserializeAllocator};
pub use error::{
    BackendError, DecodeError, ErrorKind, ErrorType, MapAsyncError, RequestError, WireError,
};
pub use handle::{FutureId, ObjectGeneration, ObjectHandle, ObjectId, ObjectType};
pub use object_allocator::ObjectAllocator;
pub use procs::{
    DeviceLoggingCallback, DeviceLostCallback, MapCallback, NativeHandle, NullProcs, ProcTable, Procs,
    WorkDoneCallback,
};
pub use refcount::RefCount;
pub use serializer::{ChunkedCommandSerializer, CommandSerializer, NoopSerializer};
pub use server::WireServer;
pub use types::{
    AdapterInfo, BackendType, BufferDescriptor, BufferMapState, BufferUsages, DeviceDescriptor,
    DeviceLostReason, LoggingType, MapAsyncStatus, MapMode, PopErrorScopeStatus,
    PowerPreference, RequestAdapterOptions, RequestStatus,
};
