// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Little-endian primitives for the command encoding.

use crate::deserialize_allocator::{Allocation, DeserializeAllocator};
use crate::error::{DecodeError, WireError};
use crate::handle::{FutureId, ObjectHandle, ObjectId};

/// Bytes of the `command_size` field that starts every command.
pub(crate) const SIZE_FIELD: usize = 8;
/// `command_size: u64` then `command_id: u32`.
pub const HEADER_SIZE: usize = SIZE_FIELD + 4;

/// Reads the declared size of the command starting at `bytes`.
pub(crate) fn peek_command_size(bytes: &[u8]) -> Option<u64> {
    let field: [u8; SIZE_FIELD] = bytes.get(..SIZE_FIELD)?.try_into().ok()?;
    Some(u64::from_le_bytes(field))
}

/// Where encoded bytes go.  Encoding runs twice: once into a [`Counter`] to size the
/// command, once into the transport's space.
pub(crate) trait Sink {
    fn put(&mut self, bytes: &[u8]);

    fn put_u8(&mut self, value: u8) {
        self.put(&[value]);
    }
    fn put_u32(&mut self, value: u32) {
        self.put(&value.to_le_bytes());
    }
    fn put_u64(&mut self, value: u64) {
        self.put(&value.to_le_bytes());
    }
    fn put_bool(&mut self, value: bool) {
        self.put_u8(value as u8);
    }
    fn put_id(&mut self, id: ObjectId) {
        self.put_u32(id);
    }
    fn put_handle(&mut self, handle: ObjectHandle) {
        self.put_u32(handle.id);
        self.put_u32(handle.generation);
    }
    fn put_future(&mut self, future: FutureId) {
        self.put_u64(future.get());
    }
    fn put_string(&mut self, value: &str) {
        self.put_u32(value.len() as u32);
        self.put(value.as_bytes());
    }
    fn put_payload(&mut self, value: &[u8]) {
        self.put_u64(value.len() as u64);
        self.put(value);
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counter(pub usize);

impl Sink for Counter {
    fn put(&mut self, bytes: &[u8]) {
        self.0 += bytes.len();
    }
}

pub(crate) struct SliceSink<'a> {
    out: &'a mut [u8],
    pos: usize,
}

impl<'a> SliceSink<'a> {
    pub(crate) fn new(out: &'a mut [u8]) -> Self {
        SliceSink { out, pos: 0 }
    }

    pub(crate) fn written(&self) -> usize {
        self.pos
    }
}

impl Sink for SliceSink<'_> {
    fn put(&mut self, bytes: &[u8]) {
        let end = self.pos + bytes.len();
        self.out[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
    }
}

/// Cursor over one command's bytes.
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Reader { bytes, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEof);
        }
        let bytes: &'a [u8] = self.bytes;
        let slice = &bytes[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(crate) fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.array::<1>()?[0])
    }

    pub(crate) fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(crate) fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub(crate) fn bool(&mut self, field: &'static str) -> Result<bool, DecodeError> {
        match self.u8()? {
            0 => Ok(false),
            1 => Ok(true),
            value => Err(DecodeError::InvalidEnum {
                field,
                value: value as u32,
            }),
        }
    }

    /// Reads a `u8` and maps it through `convert`, reporting `field` when it is unknown.
    pub(crate) fn enum_u8<T>(
        &mut self,
        field: &'static str,
        convert: impl FnOnce(u8) -> Option<T>,
    ) -> Result<T, DecodeError> {
        let value = self.u8()?;
        convert(value).ok_or(DecodeError::InvalidEnum {
            field,
            value: value as u32,
        })
    }

    pub(crate) fn id(&mut self) -> Result<ObjectId, DecodeError> {
        self.u32()
    }

    pub(crate) fn handle(&mut self) -> Result<ObjectHandle, DecodeError> {
        let id = self.u32()?;
        let generation = self.u32()?;
        Ok(ObjectHandle::new(id, generation))
    }

    pub(crate) fn future(&mut self) -> Result<FutureId, DecodeError> {
        Ok(FutureId::new(self.u64()?))
    }

    pub(crate) fn string(&mut self) -> Result<String, DecodeError> {
        let len = self.u32()? as usize;
        let bytes = self.take(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8)
    }

    /// Reads `count` ids, checking the bytes are present before allocating.
    pub(crate) fn ids(&mut self) -> Result<Vec<ObjectId>, DecodeError> {
        let count = self.u32()? as usize;
        if self.remaining() / 4 < count {
            return Err(DecodeError::UnexpectedEof);
        }
        (0..count).map(|_| self.id()).collect()
    }

    /// Copies a length-prefixed payload into deserialize allocator space.
    pub(crate) fn payload(
        &mut self,
        allocator: &mut DeserializeAllocator,
        futures: &[FutureId],
    ) -> Result<Allocation, WireError> {
        let len = self.u64()?;
        let len_usize = usize::try_from(len).map_err(|_| DecodeError::UnexpectedEof)?;
        let bytes = self.take(len_usize)?;
        let allocation = allocator
            .get_space(len_usize, futures)
            .ok_or(WireError::OutOfMemory(len))?;
        allocator
            .bytes_mut(&allocation)
            .ok_or(WireError::OutOfMemory(len))?
            .copy_from_slice(bytes);
        Ok(allocation)
    }

    pub(crate) fn finish(self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            extra => Err(DecodeError::TrailingBytes(extra)),
        }
    }
}
