// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Buffers and their mapping state machine.

A buffer is `Unmapped`, mapped at creation, mapped for reading, or mapped for writing, and
independently may have one map request outstanding.  The client keeps a copy of the mapped
bytes: reads come from the server's reply, and writes are sent back in one
`BufferUpdateMappedData` command when the buffer is unmapped.

Local answers win races with the server.  Unmapping or destroying a buffer with a request
outstanding fails that request right away; the server's reply, when it arrives, is dropped.
*/

use super::event_manager::EventKind;
use super::future::WireFuture;
use super::objects::{ObjectBase, ProxyInner, proxy};
use super::{ClientInner, ClientState};
use crate::error::MapAsyncError;
use crate::handle::{FutureId, ObjectHandle, ObjectId, ObjectType};
use crate::protocol::Command;
use crate::types::{BufferDescriptor, BufferMapState, BufferUsages, MapMode};
use parking_lot::Mutex;
use std::sync::Arc;

/// Required alignment of a mapped range's offset.
const MAP_OFFSET_ALIGNMENT: u64 = 8;
/// Required alignment of a mapped range's size.
const MAP_SIZE_ALIGNMENT: u64 = 4;

#[derive(Debug)]
enum Mapped {
    Unmapped,
    AtCreation(Vec<u8>),
    Read { offset: u64, data: Vec<u8> },
    Write { offset: u64, data: Vec<u8> },
}

impl Mapped {
    /// Start of the mapping, its bytes, and whether they may be written.
    fn view(&self) -> Option<(u64, &[u8], bool)> {
        match self {
            Mapped::Unmapped => None,
            Mapped::AtCreation(data) => Some((0, data, true)),
            Mapped::Read { offset, data } => Some((*offset, data, false)),
            Mapped::Write { offset, data } => Some((*offset, data, true)),
        }
    }

    fn bytes_mut(&mut self) -> Option<(u64, &mut Vec<u8>)> {
        match self {
            Mapped::Unmapped | Mapped::Read { .. } => None,
            Mapped::AtCreation(data) => Some((0, data)),
            Mapped::Write { offset, data } => Some((*offset, data)),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingMap {
    future: FutureId,
    mode: MapMode,
    offset: u64,
}

#[derive(Debug)]
struct Mapping {
    state: Mapped,
    pending: Option<PendingMap>,
    destroyed: bool,
}

/// Checks `offset..offset + size` against a mapping starting at `start` with `len` bytes.
/// Returns the range relative to the mapping.
fn mapped_range(start: u64, len: usize, offset: u64, size: u64) -> Result<(usize, usize), String> {
    if offset % MAP_OFFSET_ALIGNMENT != 0 {
        return Err(format!(
            "offset {offset} is not a multiple of {MAP_OFFSET_ALIGNMENT}"
        ));
    }
    if size % MAP_SIZE_ALIGNMENT != 0 {
        return Err(format!("size {size} is not a multiple of {MAP_SIZE_ALIGNMENT}"));
    }
    let relative = offset
        .checked_sub(start)
        .ok_or_else(|| format!("offset {offset} is before the mapping at {start}"))?;
    match relative.checked_add(size) {
        Some(end) if end <= len as u64 => Ok((relative as usize, end as usize)),
        _ => Err(format!(
            "range {offset}+{size} extends past the mapping {start}+{len}"
        )),
    }
}

pub(super) struct BufferInner {
    base: ObjectBase,
    size: u64,
    usage: BufferUsages,
    mapping: Mutex<Mapping>,
}

impl ProxyInner for BufferInner {
    fn base(&self) -> &ObjectBase {
        &self.base
    }

    fn on_destroy(&self, client: &ClientInner, state: &mut ClientState) {
        let mut mapping = self.mapping.lock();
        self.reject_pending(
            client,
            state,
            &mut mapping,
            MapAsyncError::DestroyedBeforeCallback,
        );
        mapping.state = Mapped::Unmapped;
    }
}

impl BufferInner {
    pub(super) fn handle(&self) -> ObjectHandle {
        self.base.handle()
    }

    fn id(&self) -> ObjectId {
        self.base.id()
    }

    /// Fails the outstanding request, if any, with `error`.  The server's reply to it will
    /// be dropped.
    fn reject_pending(
        &self,
        client: &ClientInner,
        state: &mut ClientState,
        mapping: &mut Mapping,
        error: MapAsyncError,
    ) {
        let Some(pending) = mapping.pending.take() else {
            return;
        };
        let future = pending.future;
        if let Some(kind) = state.events.reject(future) {
            client.callbacks.add(move || kind.fail_map(future, error));
        }
    }

    /// Forgets the outstanding request if it is `future`.
    pub(super) fn clear_pending(&self, future: FutureId) {
        let mut mapping = self.mapping.lock();
        if mapping.pending.is_some_and(|pending| pending.future == future) {
            mapping.pending = None;
        }
    }

    /// Applies the server's answer to `future`.
    pub(super) fn finish_map(
        &self,
        future: FutureId,
        result: Result<Vec<u8>, MapAsyncError>,
    ) -> Result<(), MapAsyncError> {
        let mut mapping = self.mapping.lock();
        let pending = match mapping.pending {
            Some(pending) if pending.future == future => pending,
            _ if mapping.destroyed => return Err(MapAsyncError::DestroyedBeforeCallback),
            _ => return Err(MapAsyncError::UnmappedBeforeCallback),
        };
        mapping.pending = None;
        let data = result?;
        mapping.state = match pending.mode {
            MapMode::Read => Mapped::Read {
                offset: pending.offset,
                data,
            },
            MapMode::Write => Mapped::Write {
                offset: pending.offset,
                data,
            },
        };
        Ok(())
    }
}

/// GPU memory.  Data moves through [`Queue::write_buffer`](crate::Queue::write_buffer),
/// copies, or mapping.
pub struct Buffer {
    inner: Arc<BufferInner>,
}

proxy!(Buffer, BufferInner);

/// Bytes for a buffer mapped at creation.  A size the client cannot allocate leaves the
/// buffer unmapped; the server reports the failure.
fn creation_mapping(descriptor: &BufferDescriptor) -> Mapped {
    if !descriptor.mapped_at_creation {
        return Mapped::Unmapped;
    }
    let mut data = Vec::new();
    let reserved = usize::try_from(descriptor.size)
        .ok()
        .filter(|size| data.try_reserve_exact(*size).is_ok());
    match reserved {
        Some(size) => {
            data.resize(size, 0);
            Mapped::AtCreation(data)
        }
        None => {
            tracing::warn!(size = descriptor.size, "cannot allocate mapping at creation");
            Mapped::Unmapped
        }
    }
}

impl Buffer {
    fn with_base(base: ObjectBase, descriptor: &BufferDescriptor) -> Buffer {
        Buffer {
            inner: Arc::new(BufferInner {
                base,
                size: descriptor.size,
                usage: descriptor.usage,
                mapping: Mutex::new(Mapping {
                    state: creation_mapping(descriptor),
                    pending: None,
                    destroyed: false,
                }),
            }),
        }
    }

    pub(super) fn allocate(
        client: &Arc<ClientInner>,
        state: &mut ClientState,
        device: ObjectId,
        descriptor: &BufferDescriptor,
    ) -> Buffer {
        let handle = client.allocate_handle(state, ObjectType::Buffer);
        client.send(
            state,
            &Command::<&[u8]>::DeviceCreateBuffer {
                device,
                buffer: handle,
                descriptor: descriptor.clone(),
            },
        );
        Buffer::with_base(ObjectBase::new(client, ObjectType::Buffer, handle), descriptor)
    }

    pub(super) fn detached(descriptor: &BufferDescriptor) -> Buffer {
        Buffer::with_base(ObjectBase::detached(ObjectType::Buffer), descriptor)
    }

    pub fn size(&self) -> u64 {
        self.inner.size
    }

    pub fn usage(&self) -> BufferUsages {
        self.inner.usage
    }

    pub fn map_state(&self) -> BufferMapState {
        let mapping = self.inner.mapping.lock();
        match (&mapping.pending, &mapping.state) {
            (Some(_), _) => BufferMapState::Pending,
            (None, Mapped::Unmapped) => BufferMapState::Unmapped,
            (None, _) => BufferMapState::Mapped,
        }
    }

    /// Requests a mapping of `offset..offset + size` (the rest of the buffer when `size` is
    /// `None`).
    ///
    /// Fails at once, without contacting the server, if the buffer is destroyed, mapped, or
    /// already has a request outstanding.
    pub fn map_async_with_callback(
        &self,
        mode: MapMode,
        offset: u64,
        size: Option<u64>,
        callback: impl FnOnce(Result<(), MapAsyncError>) + Send + 'static,
    ) -> FutureId {
        let size = size.unwrap_or_else(|| self.inner.size.saturating_sub(offset));
        let Some(client) = self.inner.base.client() else {
            callback(Err(MapAsyncError::ConnectionLost));
            return FutureId::new(0);
        };
        client.locked(|state| {
            let mut mapping = self.inner.mapping.lock();
            let refusal = if state.disconnected {
                Some(MapAsyncError::ConnectionLost)
            } else if mapping.destroyed {
                Some(MapAsyncError::DestroyedBeforeCallback)
            } else if mapping.pending.is_some() {
                Some(MapAsyncError::AlreadyPending)
            } else if !matches!(mapping.state, Mapped::Unmapped) {
                Some(MapAsyncError::Validation("buffer is already mapped".to_owned()))
            } else {
                None
            };
            let future = state.events.next_future();
            if let Some(error) = refusal {
                tracing::debug!(buffer = %self.inner.handle(), %error, "map request refused");
                client.callbacks.add(move || callback(Err(error)));
                return future;
            }
            mapping.pending = Some(PendingMap {
                future,
                mode,
                offset,
            });
            drop(mapping);
            state.events.track(
                future,
                EventKind::MapAsync {
                    buffer: self.inner.clone(),
                    callback: Box::new(callback),
                },
            );
            client.send(
                state,
                &Command::<&[u8]>::BufferMapAsync {
                    buffer: self.inner.id(),
                    future,
                    mode,
                    offset,
                    size,
                },
            );
            future
        })
    }

    pub fn map(
        &self,
        mode: MapMode,
        offset: u64,
        size: Option<u64>,
    ) -> WireFuture<(), MapAsyncError> {
        let (complete, future) = WireFuture::pending();
        self.map_async_with_callback(mode, offset, size, complete);
        future
    }

    /// A copy of mapped bytes.  `None` unless the buffer is mapped and the range is aligned
    /// and inside the mapping.
    pub fn mapped_range(&self, offset: u64, size: Option<u64>) -> Option<Vec<u8>> {
        let mapping = self.inner.mapping.lock();
        let (start, data, _) = mapping.state.view()?;
        let size = match size {
            Some(size) => size,
            None => (start + data.len() as u64).checked_sub(offset)?,
        };
        match mapped_range(start, data.len(), offset, size) {
            Ok((from, to)) => Some(data[from..to].to_vec()),
            Err(reason) => {
                tracing::debug!(buffer = %self.inner.handle(), %reason, "mapped range refused");
                None
            }
        }
    }

    /// Writes into a mapping made for writing.  The bytes reach the server on
    /// [`unmap`](Self::unmap).
    pub fn write_mapped_range(&self, offset: u64, bytes: &[u8]) -> Result<(), MapAsyncError> {
        let mut mapping = self.inner.mapping.lock();
        let Some((start, data)) = mapping.state.bytes_mut() else {
            return Err(MapAsyncError::Validation(
                "buffer is not mapped for writing".to_owned(),
            ));
        };
        let (from, to) = mapped_range(start, data.len(), offset, bytes.len() as u64)
            .map_err(MapAsyncError::Validation)?;
        data[from..to].copy_from_slice(bytes);
        Ok(())
    }

    /// Ends the mapping.  A request still outstanding fails with
    /// [`MapAsyncError::UnmappedBeforeCallback`].
    pub fn unmap(&self) {
        let Some(client) = self.inner.base.client() else {
            let mut mapping = self.inner.mapping.lock();
            mapping.pending = None;
            mapping.state = Mapped::Unmapped;
            return;
        };
        client.locked(|state| {
            let mut mapping = self.inner.mapping.lock();
            self.inner.reject_pending(
                &client,
                state,
                &mut mapping,
                MapAsyncError::UnmappedBeforeCallback,
            );
            let written = match std::mem::replace(&mut mapping.state, Mapped::Unmapped) {
                Mapped::AtCreation(data) => Some((0, data)),
                Mapped::Write { offset, data } => Some((offset, data)),
                Mapped::Read { .. } | Mapped::Unmapped => None,
            };
            drop(mapping);
            if let Some((offset, data)) = written {
                client.send(
                    state,
                    &Command::BufferUpdateMappedData {
                        buffer: self.inner.id(),
                        offset,
                        data: &data[..],
                    },
                );
            }
            client.send(
                state,
                &Command::<&[u8]>::BufferUnmap {
                    buffer: self.inner.id(),
                },
            );
        });
    }

    /// Destroys the buffer's storage.  The proxy stays valid but every later map fails.
    pub fn destroy(&self) {
        let Some(client) = self.inner.base.client() else {
            let mut mapping = self.inner.mapping.lock();
            mapping.destroyed = true;
            mapping.pending = None;
            mapping.state = Mapped::Unmapped;
            return;
        };
        client.locked(|state| {
            let mut mapping = self.inner.mapping.lock();
            self.inner.reject_pending(
                &client,
                state,
                &mut mapping,
                MapAsyncError::DestroyedBeforeCallback,
            );
            mapping.state = Mapped::Unmapped;
            mapping.destroyed = true;
            drop(mapping);
            client.send(
                state,
                &Command::<&[u8]>::BufferDestroy {
                    buffer: self.inner.id(),
                },
            );
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::WireClient;
    use crate::config::WireDescriptor;
    use crate::serializer::NoopSerializer;
    use std::sync::Mutex as StdMutex;

    fn buffer(client: &WireClient, mapped_at_creation: bool) -> Buffer {
        let descriptor = BufferDescriptor {
            label: "test".to_owned(),
            size: 32,
            usage: BufferUsages::MAP_READ | BufferUsages::MAP_WRITE,
            mapped_at_creation,
        };
        client
            .inner
            .locked(|state| Buffer::allocate(&client.inner, state, 1, &descriptor))
    }

    fn recorder() -> (
        Arc<StdMutex<Vec<Result<(), MapAsyncError>>>>,
        impl FnOnce(Result<(), MapAsyncError>) + Send + 'static,
    ) {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let sink = log.clone();
        (log, move |result| sink.lock().unwrap().push(result))
    }

    #[test]
    fn test_range_validation() {
        assert_eq!(mapped_range(0, 32, 8, 8), Ok((8, 16)));
        assert_eq!(mapped_range(8, 16, 16, 8), Ok((8, 16)));
        assert!(mapped_range(0, 32, 4, 8).is_err());
        assert!(mapped_range(0, 32, 8, 6).is_err());
        assert!(mapped_range(8, 16, 0, 8).is_err());
        assert!(mapped_range(0, 32, 24, 16).is_err());
        assert!(mapped_range(0, 32, u64::MAX - 7, 8).is_err());
    }

    #[test]
    fn test_mapped_at_creation_is_writable() {
        let client = WireClient::new(Box::new(NoopSerializer), WireDescriptor::default());
        let buffer = buffer(&client, true);
        assert_eq!(buffer.map_state(), BufferMapState::Mapped);
        buffer.write_mapped_range(8, &[1, 2, 3, 4]).unwrap();
        assert_eq!(
            buffer.mapped_range(8, Some(8)),
            Some(vec![1, 2, 3, 4, 0, 0, 0, 0])
        );
        assert!(buffer.write_mapped_range(30, &[1, 2, 3, 4]).is_err());
        buffer.unmap();
        assert_eq!(buffer.map_state(), BufferMapState::Unmapped);
        assert_eq!(buffer.mapped_range(0, None), None);
    }

    #[test]
    fn test_second_map_is_already_pending() {
        let client = WireClient::new(Box::new(NoopSerializer), WireDescriptor::default());
        let buffer = buffer(&client, false);
        let (first, first_callback) = recorder();
        let (second, second_callback) = recorder();
        buffer.map_async_with_callback(MapMode::Read, 0, None, first_callback);
        buffer.map_async_with_callback(MapMode::Read, 0, None, second_callback);
        assert!(first.lock().unwrap().is_empty());
        assert_eq!(
            *second.lock().unwrap(),
            vec![Err(MapAsyncError::AlreadyPending)]
        );
        assert_eq!(buffer.map_state(), BufferMapState::Pending);
    }

    #[test]
    fn test_unmap_and_destroy_answer_pending_maps() {
        let client = WireClient::new(Box::new(NoopSerializer), WireDescriptor::default());
        let buffer = buffer(&client, false);
        let (log, callback) = recorder();
        buffer.map_async_with_callback(MapMode::Write, 0, Some(16), callback);
        buffer.unmap();
        assert_eq!(
            *log.lock().unwrap(),
            vec![Err(MapAsyncError::UnmappedBeforeCallback)]
        );
        // The entry waits for the server's reply so it can be dropped.
        assert_eq!(client.pending_requests(), 1);

        let (log, callback) = recorder();
        buffer.map_async_with_callback(MapMode::Read, 0, None, callback);
        buffer.destroy();
        let (after, callback) = recorder();
        buffer.map_async_with_callback(MapMode::Read, 0, None, callback);
        assert_eq!(
            *log.lock().unwrap(),
            vec![Err(MapAsyncError::DestroyedBeforeCallback)]
        );
        assert_eq!(
            *after.lock().unwrap(),
            vec![Err(MapAsyncError::DestroyedBeforeCallback)]
        );
    }

    #[test]
    fn test_release_answers_pending_map() {
        let client = WireClient::new(Box::new(NoopSerializer), WireDescriptor::default());
        let buffer = buffer(&client, false);
        let (log, callback) = recorder();
        buffer.map_async_with_callback(MapMode::Read, 0, None, callback);
        drop(buffer);
        assert_eq!(
            *log.lock().unwrap(),
            vec![Err(MapAsyncError::DestroyedBeforeCallback)]
        );
    }
}
