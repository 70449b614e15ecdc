// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! An in-memory backend.
//!
//! Buffers are byte vectors, copies run at submit time, and every asynchronous result waits
//! for the next [`process_events`](Procs::process_events).  Validation follows WebGPU's
//! rules closely enough to exercise the server's error routing.  Callbacks are never run
//! while the backend's own lock is held.

use crate::error::{BackendError, RequestError};
use crate::handle::ObjectType;
use crate::procs::{
    DeviceLoggingCallback, DeviceLostCallback, MapCallback, NativeHandle, Procs, WorkDoneCallback,
};
use crate::types::{
    AdapterInfo, BackendType, BufferDescriptor, BufferUsages, DeviceDescriptor,
    DeviceLostReason, LoggingType, MapAsyncStatus, MapMode, RequestAdapterOptions, RequestStatus,
};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt::Debug;

/// Tunables for [`SoftwareProcs`].
#[derive(Debug, Clone)]
pub struct SoftwareOptions {
    /// When false, every adapter request reports [`RequestError::Unavailable`].
    pub adapter_available: bool,
    pub max_buffer_size: u64,
}

impl Default for SoftwareOptions {
    fn default() -> Self {
        SoftwareOptions {
            adapter_available: true,
            max_buffer_size: 256 << 20,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CopyOp {
    source: NativeHandle,
    source_offset: u64,
    destination: NativeHandle,
    destination_offset: u64,
    size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum MapState {
    Unmapped,
    Pending {
        mode: MapMode,
        offset: u64,
        size: u64,
        ticket: u64,
    },
    Mapped {
        mode: MapMode,
        offset: u64,
        size: u64,
    },
    MappedAtCreation,
}

struct BufferState {
    device: NativeHandle,
    data: Vec<u8>,
    usage: BufferUsages,
    map: MapState,
    destroyed: bool,
}

struct DeviceState {
    alive: bool,
    lost: Option<DeviceLostCallback>,
    logging: Option<DeviceLoggingCallback>,
}

enum Object {
    Instance,
    Adapter,
    Device(DeviceState),
    Queue {
        device: NativeHandle,
    },
    Buffer(BufferState),
    Encoder {
        device: NativeHandle,
        copies: Vec<CopyOp>,
        finished: bool,
    },
    CommandBuffer {
        device: NativeHandle,
        copies: Vec<CopyOp>,
        submitted: bool,
    },
}

enum Pending {
    Map {
        buffer: NativeHandle,
        ticket: u64,
        early: Option<String>,
        callback: MapCallback,
    },
    WorkDone {
        callback: WorkDoneCallback,
    },
}

struct State {
    options: SoftwareOptions,
    next_handle: NativeHandle,
    next_ticket: u64,
    objects: HashMap<NativeHandle, Object>,
    pending: VecDeque<Pending>,
    calls: HashMap<&'static str, usize>,
}

pub struct SoftwareProcs {
    state: Mutex<State>,
}

fn check_alignment(value: u64, alignment: u64, what: &str) -> Result<(), BackendError> {
    if value % alignment == 0 {
        Ok(())
    } else {
        Err(BackendError::validation(format!(
            "{what} ({value}) is not a multiple of {alignment}"
        )))
    }
}

fn check_range(offset: u64, size: u64, len: u64, what: &str) -> Result<(), BackendError> {
    match offset.checked_add(size) {
        Some(end) if end <= len => Ok(()),
        _ => Err(BackendError::validation(format!(
            "{what} range {offset}+{size} exceeds size {len}"
        ))),
    }
}

impl State {
    fn note(&mut self, call: &'static str) {
        *self.calls.entry(call).or_default() += 1;
    }

    fn insert(&mut self, object: Object) -> NativeHandle {
        self.next_handle += 1;
        let handle = self.next_handle;
        self.objects.insert(handle, object);
        handle
    }

    fn buffer(&self, handle: NativeHandle) -> Result<&BufferState, BackendError> {
        match self.objects.get(&handle) {
            Some(Object::Buffer(buffer)) => Ok(buffer),
            _ => Err(BackendError::validation("invalid buffer")),
        }
    }

    fn buffer_mut(&mut self, handle: NativeHandle) -> Result<&mut BufferState, BackendError> {
        match self.objects.get_mut(&handle) {
            Some(Object::Buffer(buffer)) => Ok(buffer),
            _ => Err(BackendError::validation("invalid buffer")),
        }
    }

    fn device_alive(&self, device: NativeHandle) -> bool {
        matches!(self.objects.get(&device), Some(Object::Device(d)) if d.alive)
    }

    fn queue_device(&self, queue: NativeHandle) -> Result<NativeHandle, BackendError> {
        match self.objects.get(&queue) {
            Some(Object::Queue { device }) => Ok(*device),
            _ => Err(BackendError::validation("invalid queue")),
        }
    }

    /// A buffer that may take part in GPU work owned by `device`.
    fn usable_buffer(
        &self,
        handle: NativeHandle,
        device: NativeHandle,
    ) -> Result<&BufferState, BackendError> {
        let buffer = self.buffer(handle)?;
        if buffer.device != device {
            return Err(BackendError::validation(
                "buffer belongs to a different device",
            ));
        }
        if buffer.destroyed {
            return Err(BackendError::validation("buffer is destroyed"));
        }
        if buffer.map != MapState::Unmapped {
            return Err(BackendError::validation("buffer is mapped"));
        }
        Ok(buffer)
    }

    fn validate_map(
        &self,
        handle: NativeHandle,
        mode: MapMode,
        offset: u64,
        size: u64,
    ) -> Result<(), BackendError> {
        let buffer = self.buffer(handle)?;
        if buffer.destroyed {
            return Err(BackendError::validation("buffer is destroyed"));
        }
        if buffer.map != MapState::Unmapped {
            return Err(BackendError::validation("buffer is already mapped"));
        }
        let needed = match mode {
            MapMode::Read => BufferUsages::MAP_READ,
            MapMode::Write => BufferUsages::MAP_WRITE,
        };
        if !buffer.usage.contains(needed) {
            return Err(BackendError::validation("buffer usage does not allow this map mode"));
        }
        check_alignment(offset, 8, "map offset")?;
        check_alignment(size, 4, "map size")?;
        check_range(offset, size, buffer.data.len() as u64, "map")
    }

    /// Range currently readable through the mapping, as `(offset, size, writable)`.
    fn mapped_range(buffer: &BufferState) -> Option<(u64, u64, bool)> {
        match buffer.map {
            MapState::Mapped { mode, offset, size } => Some((offset, size, mode == MapMode::Write)),
            MapState::MappedAtCreation => Some((0, buffer.data.len() as u64, true)),
            MapState::Unmapped | MapState::Pending { .. } => None,
        }
    }
}

impl SoftwareProcs {
    pub fn new() -> Self {
        Self::with_options(SoftwareOptions::default())
    }

    pub fn with_options(options: SoftwareOptions) -> Self {
        SoftwareProcs {
            state: Mutex::new(State {
                options,
                next_handle: 0,
                next_ticket: 0,
                objects: HashMap::new(),
                pending: VecDeque::new(),
                calls: HashMap::new(),
            }),
        }
    }

    /// Creates the instance a server is seeded with.
    pub fn create_instance(&self) -> NativeHandle {
        self.state.lock().insert(Object::Instance)
    }

    /// Loses `device` as if the hardware went away.
    pub fn lose_device(&self, device: NativeHandle, message: &str) {
        let callback = {
            let mut state = self.state.lock();
            match state.objects.get_mut(&device) {
                Some(Object::Device(d)) => {
                    d.alive = false;
                    d.logging = None;
                    d.lost.take()
                }
                _ => None,
            }
        };
        if let Some(callback) = callback {
            callback(DeviceLostReason::Unknown, message.to_owned());
        }
    }

    /// Emits a log message from `device`, as a driver would.  A lost device stays silent.
    pub fn log(&self, device: NativeHandle, logging_type: LoggingType, message: &str) {
        let callback = match self.state.lock().objects.get(&device) {
            Some(Object::Device(d)) if d.alive => d.logging.clone(),
            _ => None,
        };
        match callback {
            Some(callback) => callback(logging_type, message.to_owned()),
            None => tracing::trace!(device, ?logging_type, message, "device log not delivered"),
        }
    }

    /// How many times the named [`Procs`] method has been called.
    pub fn call_count(&self, call: &str) -> usize {
        self.state.lock().calls.get(call).copied().unwrap_or(0)
    }

    /// Objects not yet released.
    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }

    /// Current contents of a buffer.
    pub fn buffer_contents(&self, buffer: NativeHandle) -> Option<Vec<u8>> {
        self.state.lock().buffer(buffer).ok().map(|b| b.data.clone())
    }
}

impl Default for SoftwareProcs {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for SoftwareProcs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SoftwareProcs")
            .field("objects", &state.objects.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl Procs for SoftwareProcs {
    fn instance_request_adapter(
        &self,
        instance: NativeHandle,
        _options: &RequestAdapterOptions,
    ) -> Result<(NativeHandle, AdapterInfo), RequestError> {
        let mut state = self.state.lock();
        state.note("instance_request_adapter");
        if !matches!(state.objects.get(&instance), Some(Object::Instance)) {
            return Err(RequestError::Backend("invalid instance".to_owned()));
        }
        if !state.options.adapter_available {
            return Err(RequestError::Unavailable(
                "no adapter matches the requested options".to_owned(),
            ));
        }
        let adapter = state.insert(Object::Adapter);
        let info = AdapterInfo {
            vendor: "gpu_wire".to_owned(),
            architecture: "cpu".to_owned(),
            device: "software".to_owned(),
            description: "in-memory software adapter".to_owned(),
            backend_type: BackendType::Software,
        };
        Ok((adapter, info))
    }

    fn adapter_request_device(
        &self,
        adapter: NativeHandle,
        descriptor: &DeviceDescriptor,
        lost: DeviceLostCallback,
    ) -> Result<(NativeHandle, NativeHandle), RequestError> {
        let mut state = self.state.lock();
        state.note("adapter_request_device");
        if !matches!(state.objects.get(&adapter), Some(Object::Adapter)) {
            return Err(RequestError::Backend("invalid adapter".to_owned()));
        }
        let device = state.insert(Object::Device(DeviceState {
            alive: true,
            lost: Some(lost),
            logging: None,
        }));
        let queue = state.insert(Object::Queue { device });
        tracing::debug!(device, label = %descriptor.label, "software device created");
        Ok((device, queue))
    }

    fn device_create_buffer(
        &self,
        device: NativeHandle,
        descriptor: &BufferDescriptor,
    ) -> Result<NativeHandle, BackendError> {
        let mut state = self.state.lock();
        state.note("device_create_buffer");
        if !matches!(state.objects.get(&device), Some(Object::Device(_))) {
            return Err(BackendError::validation("invalid device"));
        }
        let usage = descriptor.usage;
        if usage.contains(BufferUsages::MAP_READ)
            && !(BufferUsages::MAP_READ | BufferUsages::COPY_DST).contains(usage)
        {
            return Err(BackendError::validation(
                "MAP_READ may only be combined with COPY_DST",
            ));
        }
        if usage.contains(BufferUsages::MAP_WRITE)
            && !(BufferUsages::MAP_WRITE | BufferUsages::COPY_SRC).contains(usage)
        {
            return Err(BackendError::validation(
                "MAP_WRITE may only be combined with COPY_SRC",
            ));
        }
        if descriptor.mapped_at_creation {
            check_alignment(descriptor.size, 4, "size of a buffer mapped at creation")?;
        }
        if descriptor.size > state.options.max_buffer_size {
            return Err(BackendError::out_of_memory(format!(
                "buffer of {} bytes exceeds the {} byte limit",
                descriptor.size, state.options.max_buffer_size
            )));
        }
        let size = usize::try_from(descriptor.size)
            .map_err(|_| BackendError::out_of_memory("buffer size overflows memory"))?;
        let buffer = state.insert(Object::Buffer(BufferState {
            device,
            data: vec![0; size],
            usage,
            map: if descriptor.mapped_at_creation {
                MapState::MappedAtCreation
            } else {
                MapState::Unmapped
            },
            destroyed: false,
        }));
        Ok(buffer)
    }

    fn device_create_command_encoder(
        &self,
        device: NativeHandle,
        _label: &str,
    ) -> Result<NativeHandle, BackendError> {
        let mut state = self.state.lock();
        state.note("device_create_command_encoder");
        if !matches!(state.objects.get(&device), Some(Object::Device(_))) {
            return Err(BackendError::validation("invalid device"));
        }
        Ok(state.insert(Object::Encoder {
            device,
            copies: Vec::new(),
            finished: false,
        }))
    }

    fn device_destroy(&self, device: NativeHandle) {
        let callback = {
            let mut state = self.state.lock();
            state.note("device_destroy");
            match state.objects.get_mut(&device) {
                Some(Object::Device(d)) => {
                    d.alive = false;
                    d.logging = None;
                    d.lost.take()
                }
                _ => None,
            }
        };
        if let Some(callback) = callback {
            callback(DeviceLostReason::Destroyed, "device was destroyed".to_owned());
        }
    }

    fn device_set_logging_callback(&self, device: NativeHandle, callback: DeviceLoggingCallback) {
        let mut state = self.state.lock();
        state.note("device_set_logging_callback");
        if let Some(Object::Device(d)) = state.objects.get_mut(&device) {
            d.logging = Some(callback);
        }
    }

    fn command_encoder_copy_buffer_to_buffer(
        &self,
        encoder: NativeHandle,
        source: NativeHandle,
        source_offset: u64,
        destination: NativeHandle,
        destination_offset: u64,
        size: u64,
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.note("command_encoder_copy_buffer_to_buffer");
        let device = match state.objects.get(&encoder) {
            Some(Object::Encoder {
                device,
                finished: false,
                ..
            }) => *device,
            _ => return Err(BackendError::validation("invalid or finished command encoder")),
        };
        if source == destination {
            return Err(BackendError::validation("source and destination are the same buffer"));
        }
        let src = state.buffer(source)?;
        let dst = state.buffer(destination)?;
        if src.device != device || dst.device != device {
            return Err(BackendError::validation(
                "buffer belongs to a different device",
            ));
        }
        if !src.usage.contains(BufferUsages::COPY_SRC) {
            return Err(BackendError::validation("source lacks COPY_SRC usage"));
        }
        if !dst.usage.contains(BufferUsages::COPY_DST) {
            return Err(BackendError::validation("destination lacks COPY_DST usage"));
        }
        check_alignment(size, 4, "copy size")?;
        check_alignment(source_offset, 4, "source offset")?;
        check_alignment(destination_offset, 4, "destination offset")?;
        check_range(source_offset, size, src.data.len() as u64, "copy source")?;
        check_range(destination_offset, size, dst.data.len() as u64, "copy destination")?;
        if let Some(Object::Encoder { copies, .. }) = state.objects.get_mut(&encoder) {
            copies.push(CopyOp {
                source,
                source_offset,
                destination,
                destination_offset,
                size,
            });
        }
        Ok(())
    }

    fn command_encoder_finish(&self, encoder: NativeHandle) -> Result<NativeHandle, BackendError> {
        let mut state = self.state.lock();
        state.note("command_encoder_finish");
        let (device, copies) = match state.objects.get_mut(&encoder) {
            Some(Object::Encoder {
                device,
                copies,
                finished,
            }) if !*finished => {
                *finished = true;
                (*device, std::mem::take(copies))
            }
            _ => return Err(BackendError::validation("invalid or finished command encoder")),
        };
        Ok(state.insert(Object::CommandBuffer {
            device,
            copies,
            submitted: false,
        }))
    }

    fn queue_submit(
        &self,
        queue: NativeHandle,
        command_buffers: &[NativeHandle],
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.note("queue_submit");
        let device = state.queue_device(queue)?;

        let mut work = Vec::new();
        for handle in command_buffers {
            match state.objects.get(handle) {
                Some(Object::CommandBuffer {
                    device: owner,
                    copies,
                    submitted: false,
                }) => {
                    if *owner != device {
                        return Err(BackendError::validation(
                            "command buffer belongs to a different device",
                        ));
                    }
                    work.extend_from_slice(copies);
                }
                _ => {
                    return Err(BackendError::validation(
                        "invalid or already submitted command buffer",
                    ));
                }
            }
        }
        for op in &work {
            state.usable_buffer(op.source, device)?;
            state.usable_buffer(op.destination, device)?;
        }

        for handle in command_buffers {
            if let Some(Object::CommandBuffer { submitted, .. }) = state.objects.get_mut(handle) {
                *submitted = true;
            }
        }
        for op in work {
            let start = op.source_offset as usize;
            let bytes = state.buffer(op.source)?.data[start..start + op.size as usize].to_vec();
            let start = op.destination_offset as usize;
            state.buffer_mut(op.destination)?.data[start..start + bytes.len()]
                .copy_from_slice(&bytes);
        }
        Ok(())
    }

    fn queue_write_buffer(
        &self,
        queue: NativeHandle,
        buffer: NativeHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.note("queue_write_buffer");
        let device = state.queue_device(queue)?;
        let target = state.usable_buffer(buffer, device)?;
        if !target.usage.contains(BufferUsages::COPY_DST) {
            return Err(BackendError::validation("buffer lacks COPY_DST usage"));
        }
        check_alignment(offset, 4, "write offset")?;
        check_alignment(data.len() as u64, 4, "write size")?;
        check_range(offset, data.len() as u64, target.data.len() as u64, "write")?;
        let start = offset as usize;
        state.buffer_mut(buffer)?.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn queue_on_submitted_work_done(&self, queue: NativeHandle, callback: WorkDoneCallback) {
        let mut state = self.state.lock();
        state.note("queue_on_submitted_work_done");
        if state.queue_device(queue).is_err() {
            drop(state);
            callback(RequestStatus::Error);
            return;
        }
        state.pending.push_back(Pending::WorkDone { callback });
    }

    fn buffer_map_async(
        &self,
        buffer: NativeHandle,
        mode: MapMode,
        offset: u64,
        size: u64,
        callback: MapCallback,
    ) {
        let mut state = self.state.lock();
        state.note("buffer_map_async");
        state.next_ticket += 1;
        let ticket = state.next_ticket;
        let early = match state.validate_map(buffer, mode, offset, size) {
            Ok(()) => {
                if let Ok(target) = state.buffer_mut(buffer) {
                    target.map = MapState::Pending {
                        mode,
                        offset,
                        size,
                        ticket,
                    };
                }
                None
            }
            Err(error) => Some(error.message),
        };
        state.pending.push_back(Pending::Map {
            buffer,
            ticket,
            early,
            callback,
        });
    }

    fn buffer_mapped_range(&self, buffer: NativeHandle, offset: u64, size: u64) -> Option<Vec<u8>> {
        let state = self.state.lock();
        let target = state.buffer(buffer).ok()?;
        let (mapped_offset, mapped_size, _) = State::mapped_range(target)?;
        if offset < mapped_offset || offset.checked_add(size)? > mapped_offset + mapped_size {
            return None;
        }
        let start = offset as usize;
        Some(target.data[start..start + size as usize].to_vec())
    }

    fn buffer_write_mapped_range(
        &self,
        buffer: NativeHandle,
        offset: u64,
        data: &[u8],
    ) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.note("buffer_write_mapped_range");
        let target = state.buffer_mut(buffer)?;
        let Some((mapped_offset, mapped_size, true)) = State::mapped_range(target) else {
            return Err(BackendError::validation("buffer is not mapped for writing"));
        };
        let len = data.len() as u64;
        if offset < mapped_offset
            || offset.checked_add(len).is_none_or(|end| end > mapped_offset + mapped_size)
        {
            return Err(BackendError::validation("write outside the mapped range"));
        }
        let start = offset as usize;
        target.data[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn buffer_unmap(&self, buffer: NativeHandle) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.note("buffer_unmap");
        let target = state.buffer_mut(buffer)?;
        target.map = MapState::Unmapped;
        Ok(())
    }

    fn buffer_destroy(&self, buffer: NativeHandle) {
        let mut state = self.state.lock();
        state.note("buffer_destroy");
        if let Ok(target) = state.buffer_mut(buffer) {
            target.destroyed = true;
            target.map = MapState::Unmapped;
        }
    }

    fn release(&self, object_type: ObjectType, handle: NativeHandle) {
        let removed = {
            let mut state = self.state.lock();
            state.note("release");
            state.objects.remove(&handle)
        };
        tracing::trace!(%object_type, handle, "software object released");
        // A released device's lost callback is dropped here, outside the lock, uncalled.
        drop(removed);
    }

    fn process_events(&self) {
        let ready: Vec<(Pending, MapAsyncStatus, String)> = {
            let mut state = self.state.lock();
            state.note("process_events");
            let pending: Vec<Pending> = state.pending.drain(..).collect();
            pending
                .into_iter()
                .map(|work| {
                    let (status, message) = match &work {
                        Pending::WorkDone { .. } => (MapAsyncStatus::Success, String::new()),
                        Pending::Map {
                            early: Some(message),
                            ..
                        } => (MapAsyncStatus::ValidationError, message.clone()),
                        Pending::Map {
                            buffer,
                            ticket,
                            early: None,
                            ..
                        } => resolve_map(&mut state, *buffer, *ticket),
                    };
                    (work, status, message)
                })
                .collect()
        };
        for (work, status, message) in ready {
            match work {
                Pending::Map { callback, .. } => callback(status, message),
                Pending::WorkDone { callback } => callback(RequestStatus::Success),
            }
        }
    }
}

fn resolve_map(state: &mut State, buffer: NativeHandle, ticket: u64) -> (MapAsyncStatus, String) {
    let device = match state.buffer(buffer) {
        Ok(target) if !target.destroyed => target.device,
        _ => {
            return (
                MapAsyncStatus::DestroyedBeforeCallback,
                "buffer was destroyed before the mapping completed".to_owned(),
            );
        }
    };
    if !state.device_alive(device) {
        return (MapAsyncStatus::DeviceLost, "device was lost".to_owned());
    }
    let Ok(target) = state.buffer_mut(buffer) else {
        return (MapAsyncStatus::DestroyedBeforeCallback, String::new());
    };
    match target.map {
        MapState::Pending {
            mode,
            offset,
            size,
            ticket: current,
        } if current == ticket => {
            target.map = MapState::Mapped { mode, offset, size };
            (MapAsyncStatus::Success, String::new())
        }
        _ => (
            MapAsyncStatus::UnmappedBeforeCallback,
            "buffer was unmapped before the mapping completed".to_owned(),
        ),
    }
}
