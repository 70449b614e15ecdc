// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
The command vocabulary.

[`Command`] travels from client to server and [`ReturnCommand`] from server to client.  Both
are closed enums; the dispatch cores match on them exhaustively, so adding a command is a
compile error everywhere it needs handling.

Commands are generic over their byte payloads.  The sending side builds them with borrowed
slices (`Command<&[u8]>`); the receiving side gets [`Allocation`] tokens into its
[`DeserializeAllocator`].

# Layout

| Field           | Type  | Notes                                         |
|-----------------|-------|-----------------------------------------------|
| `command_size`  | `u64` | whole command including this header           |
| `command_id`    | `u32` | one of the ids below                          |
| fields          |       | in declaration order                          |

Handles are `id: u32, generation: u32`, object references are a bare `id: u32`, futures are
`u64`, strings are `u32` length plus UTF-8, payloads are `u64` length plus bytes.  Everything
is little endian.
*/

mod codec;

pub use codec::HEADER_SIZE;
pub(crate) use codec::{SIZE_FIELD, peek_command_size};

use crate::deserialize_allocator::{Allocation, DeserializeAllocator};
use crate::error::{DecodeError, ErrorType, WireError};
use crate::handle::{FutureId, ObjectHandle, ObjectId, ObjectType};
use crate::types::{
    AdapterInfo, BackendType, BufferDescriptor, BufferUsages, DeviceDescriptor,
    DeviceLostReason, LoggingType, MapAsyncStatus, MapMode, PopErrorScopeStatus,
    PowerPreference, RequestAdapterOptions, RequestStatus,
};
use codec::{Counter, Reader, Sink, SliceSink};

/// Something that can be written as one command.
pub trait WireEncode {
    /// Encoded size including the header.
    fn encoded_len(&self) -> usize;
    /// Writes the command into `out`, which must be exactly [`encoded_len`](Self::encoded_len) bytes.
    fn encode(&self, out: &mut [u8]);
    fn name(&self) -> &'static str;
}

fn encode_with<S: FnOnce(&mut SliceSink<'_>)>(out: &mut [u8], command_id: u32, body: S) {
    let len = out.len();
    let mut sink = SliceSink::new(out);
    sink.put_u64(len as u64);
    sink.put_u32(command_id);
    body(&mut sink);
    debug_assert_eq!(sink.written(), len);
}

/// Checks the header and returns the command id plus a reader positioned after it.
fn open(bytes: &[u8]) -> Result<(u32, Reader<'_>), DecodeError> {
    let mut reader = Reader::new(bytes);
    let size = reader.u64()?;
    if size != bytes.len() as u64 {
        return Err(DecodeError::BadCommandSize(size));
    }
    let command_id = reader.u32()?;
    Ok((command_id, reader))
}

const DESTROY_OBJECT: u32 = 1;
const INSTANCE_REQUEST_ADAPTER: u32 = 2;
const INSTANCE_PROCESS_EVENTS: u32 = 3;
const ADAPTER_REQUEST_DEVICE: u32 = 4;
const DEVICE_CREATE_BUFFER: u32 = 5;
const DEVICE_CREATE_COMMAND_ENCODER: u32 = 6;
const DEVICE_PUSH_ERROR_SCOPE: u32 = 7;
const DEVICE_POP_ERROR_SCOPE: u32 = 8;
const DEVICE_DESTROY: u32 = 9;
const COMMAND_ENCODER_COPY_BUFFER_TO_BUFFER: u32 = 10;
const COMMAND_ENCODER_FINISH: u32 = 11;
const QUEUE_SUBMIT: u32 = 12;
const QUEUE_WRITE_BUFFER: u32 = 13;
const QUEUE_ON_SUBMITTED_WORK_DONE: u32 = 14;
const BUFFER_MAP_ASYNC: u32 = 15;
const BUFFER_UPDATE_MAPPED_DATA: u32 = 16;
const BUFFER_UNMAP: u32 = 17;
const BUFFER_DESTROY: u32 = 18;

/// Client to server.
///
/// Fields that create an object carry the full [`ObjectHandle`] the client allocated;
/// fields that refer to an existing object carry only its id.
#[derive(Debug, Clone, PartialEq)]
pub enum Command<B> {
    DestroyObject {
        object_type: ObjectType,
        object: ObjectHandle,
    },
    InstanceRequestAdapter {
        instance: ObjectId,
        future: FutureId,
        adapter: ObjectHandle,
        options: RequestAdapterOptions,
    },
    InstanceProcessEvents {
        instance: ObjectId,
    },
    AdapterRequestDevice {
        adapter: ObjectId,
        future: FutureId,
        device: ObjectHandle,
        queue: ObjectHandle,
        descriptor: DeviceDescriptor,
    },
    DeviceCreateBuffer {
        device: ObjectId,
        buffer: ObjectHandle,
        descriptor: BufferDescriptor,
    },
    DeviceCreateCommandEncoder {
        device: ObjectId,
        encoder: ObjectHandle,
        label: String,
    },
    DevicePushErrorScope {
        device: ObjectId,
        filter: ErrorType,
    },
    DevicePopErrorScope {
        device: ObjectId,
        future: FutureId,
    },
    DeviceDestroy {
        device: ObjectId,
    },
    CommandEncoderCopyBufferToBuffer {
        encoder: ObjectId,
        source: ObjectId,
        source_offset: u64,
        destination: ObjectId,
        destination_offset: u64,
        size: u64,
    },
    CommandEncoderFinish {
        encoder: ObjectId,
        command_buffer: ObjectHandle,
    },
    QueueSubmit {
        queue: ObjectId,
        command_buffers: Vec<ObjectId>,
    },
    QueueWriteBuffer {
        queue: ObjectId,
        buffer: ObjectId,
        offset: u64,
        data: B,
    },
    QueueOnSubmittedWorkDone {
        queue: ObjectId,
        future: FutureId,
    },
    BufferMapAsync {
        buffer: ObjectId,
        future: FutureId,
        mode: MapMode,
        offset: u64,
        size: u64,
    },
    BufferUpdateMappedData {
        buffer: ObjectId,
        offset: u64,
        data: B,
    },
    BufferUnmap {
        buffer: ObjectId,
    },
    BufferDestroy {
        buffer: ObjectId,
    },
}

impl<B> Command<B> {
    pub fn command_id(&self) -> u32 {
        match self {
            Command::DestroyObject { .. } => DESTROY_OBJECT,
            Command::InstanceRequestAdapter { .. } => INSTANCE_REQUEST_ADAPTER,
            Command::InstanceProcessEvents { .. } => INSTANCE_PROCESS_EVENTS,
            Command::AdapterRequestDevice { .. } => ADAPTER_REQUEST_DEVICE,
            Command::DeviceCreateBuffer { .. } => DEVICE_CREATE_BUFFER,
            Command::DeviceCreateCommandEncoder { .. } => DEVICE_CREATE_COMMAND_ENCODER,
            Command::DevicePushErrorScope { .. } => DEVICE_PUSH_ERROR_SCOPE,
            Command::DevicePopErrorScope { .. } => DEVICE_POP_ERROR_SCOPE,
            Command::DeviceDestroy { .. } => DEVICE_DESTROY,
            Command::CommandEncoderCopyBufferToBuffer { .. } => {
                COMMAND_ENCODER_COPY_BUFFER_TO_BUFFER
            }
            Command::CommandEncoderFinish { .. } => COMMAND_ENCODER_FINISH,
            Command::QueueSubmit { .. } => QUEUE_SUBMIT,
            Command::QueueWriteBuffer { .. } => QUEUE_WRITE_BUFFER,
            Command::QueueOnSubmittedWorkDone { .. } => QUEUE_ON_SUBMITTED_WORK_DONE,
            Command::BufferMapAsync { .. } => BUFFER_MAP_ASYNC,
            Command::BufferUpdateMappedData { .. } => BUFFER_UPDATE_MAPPED_DATA,
            Command::BufferUnmap { .. } => BUFFER_UNMAP,
            Command::BufferDestroy { .. } => BUFFER_DESTROY,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::DestroyObject { .. } => "DestroyObject",
            Command::InstanceRequestAdapter { .. } => "InstanceRequestAdapter",
            Command::InstanceProcessEvents { .. } => "InstanceProcessEvents",
            Command::AdapterRequestDevice { .. } => "AdapterRequestDevice",
            Command::DeviceCreateBuffer { .. } => "DeviceCreateBuffer",
            Command::DeviceCreateCommandEncoder { .. } => "DeviceCreateCommandEncoder",
            Command::DevicePushErrorScope { .. } => "DevicePushErrorScope",
            Command::DevicePopErrorScope { .. } => "DevicePopErrorScope",
            Command::DeviceDestroy { .. } => "DeviceDestroy",
            Command::CommandEncoderCopyBufferToBuffer { .. } => "CommandEncoderCopyBufferToBuffer",
            Command::CommandEncoderFinish { .. } => "CommandEncoderFinish",
            Command::QueueSubmit { .. } => "QueueSubmit",
            Command::QueueWriteBuffer { .. } => "QueueWriteBuffer",
            Command::QueueOnSubmittedWorkDone { .. } => "QueueOnSubmittedWorkDone",
            Command::BufferMapAsync { .. } => "BufferMapAsync",
            Command::BufferUpdateMappedData { .. } => "BufferUpdateMappedData",
            Command::BufferUnmap { .. } => "BufferUnmap",
            Command::BufferDestroy { .. } => "BufferDestroy",
        }
    }
}

impl<B: AsRef<[u8]>> Command<B> {
    fn write_body<S: Sink>(&self, s: &mut S) {
        match self {
            Command::DestroyObject {
                object_type,
                object,
            } => {
                s.put_u8(*object_type as u8);
                s.put_handle(*object);
            }
            Command::InstanceRequestAdapter {
                instance,
                future,
                adapter,
                options,
            } => {
                s.put_id(*instance);
                s.put_future(*future);
                s.put_handle(*adapter);
                s.put_u8(options.power_preference as u8);
                s.put_bool(options.force_fallback_adapter);
            }
            Command::InstanceProcessEvents { instance } => s.put_id(*instance),
            Command::AdapterRequestDevice {
                adapter,
                future,
                device,
                queue,
                descriptor,
            } => {
                s.put_id(*adapter);
                s.put_future(*future);
                s.put_handle(*device);
                s.put_handle(*queue);
                s.put_string(&descriptor.label);
            }
            Command::DeviceCreateBuffer {
                device,
                buffer,
                descriptor,
            } => {
                s.put_id(*device);
                s.put_handle(*buffer);
                s.put_string(&descriptor.label);
                s.put_u64(descriptor.size);
                s.put_u32(descriptor.usage.bits());
                s.put_bool(descriptor.mapped_at_creation);
            }
            Command::DeviceCreateCommandEncoder {
                device,
                encoder,
                label,
            } => {
                s.put_id(*device);
                s.put_handle(*encoder);
                s.put_string(label);
            }
            Command::DevicePushErrorScope { device, filter } => {
                s.put_id(*device);
                s.put_u8(*filter as u8);
            }
            Command::DevicePopErrorScope { device, future } => {
                s.put_id(*device);
                s.put_future(*future);
            }
            Command::DeviceDestroy { device } => s.put_id(*device),
            Command::CommandEncoderCopyBufferToBuffer {
                encoder,
                source,
                source_offset,
                destination,
                destination_offset,
                size,
            } => {
                s.put_id(*encoder);
                s.put_id(*source);
                s.put_u64(*source_offset);
                s.put_id(*destination);
                s.put_u64(*destination_offset);
                s.put_u64(*size);
            }
            Command::CommandEncoderFinish {
                encoder,
                command_buffer,
            } => {
                s.put_id(*encoder);
                s.put_handle(*command_buffer);
            }
            Command::QueueSubmit {
                queue,
                command_buffers,
            } => {
                s.put_id(*queue);
                s.put_u32(command_buffers.len() as u32);
                for id in command_buffers {
                    s.put_id(*id);
                }
            }
            Command::QueueWriteBuffer {
                queue,
                buffer,
                offset,
                data,
            } => {
                s.put_id(*queue);
                s.put_id(*buffer);
                s.put_u64(*offset);
                s.put_payload(data.as_ref());
            }
            Command::QueueOnSubmittedWorkDone { queue, future } => {
                s.put_id(*queue);
                s.put_future(*future);
            }
            Command::BufferMapAsync {
                buffer,
                future,
                mode,
                offset,
                size,
            } => {
                s.put_id(*buffer);
                s.put_future(*future);
                s.put_u8(*mode as u8);
                s.put_u64(*offset);
                s.put_u64(*size);
            }
            Command::BufferUpdateMappedData {
                buffer,
                offset,
                data,
            } => {
                s.put_id(*buffer);
                s.put_u64(*offset);
                s.put_payload(data.as_ref());
            }
            Command::BufferUnmap { buffer } => s.put_id(*buffer),
            Command::BufferDestroy { buffer } => s.put_id(*buffer),
        }
    }
}

impl<B: AsRef<[u8]>> WireEncode for Command<B> {
    fn encoded_len(&self) -> usize {
        let mut counter = Counter::default();
        self.write_body(&mut counter);
        HEADER_SIZE + counter.0
    }

    fn encode(&self, out: &mut [u8]) {
        encode_with(out, self.command_id(), |sink| self.write_body(sink));
    }

    fn name(&self) -> &'static str {
        Command::name(self)
    }
}

impl Command<Allocation> {
    /// Decodes exactly one command.  Payloads land in scratch space of `allocator`.
    pub fn decode(bytes: &[u8], allocator: &mut DeserializeAllocator) -> Result<Self, WireError> {
        let (command_id, mut r) = open(bytes)?;
        let command = match command_id {
            DESTROY_OBJECT => Command::DestroyObject {
                object_type: r.enum_u8("object_type", ObjectType::from_wire)?,
                object: r.handle()?,
            },
            INSTANCE_REQUEST_ADAPTER => Command::InstanceRequestAdapter {
                instance: r.id()?,
                future: r.future()?,
                adapter: r.handle()?,
                options: RequestAdapterOptions {
                    power_preference: r.enum_u8("power_preference", PowerPreference::from_wire)?,
                    force_fallback_adapter: r.bool("force_fallback_adapter")?,
                },
            },
            INSTANCE_PROCESS_EVENTS => Command::InstanceProcessEvents { instance: r.id()? },
            ADAPTER_REQUEST_DEVICE => Command::AdapterRequestDevice {
                adapter: r.id()?,
                future: r.future()?,
                device: r.handle()?,
                queue: r.handle()?,
                descriptor: DeviceDescriptor { label: r.string()? },
            },
            DEVICE_CREATE_BUFFER => Command::DeviceCreateBuffer {
                device: r.id()?,
                buffer: r.handle()?,
                descriptor: BufferDescriptor {
                    label: r.string()?,
                    size: r.u64()?,
                    usage: {
                        let bits = r.u32()?;
                        BufferUsages::from_bits(bits).ok_or(DecodeError::InvalidEnum {
                            field: "usage",
                            value: bits,
                        })?
                    },
                    mapped_at_creation: r.bool("mapped_at_creation")?,
                },
            },
            DEVICE_CREATE_COMMAND_ENCODER => Command::DeviceCreateCommandEncoder {
                device: r.id()?,
                encoder: r.handle()?,
                label: r.string()?,
            },
            DEVICE_PUSH_ERROR_SCOPE => Command::DevicePushErrorScope {
                device: r.id()?,
                filter: r.enum_u8("filter", ErrorType::from_wire)?,
            },
            DEVICE_POP_ERROR_SCOPE => Command::DevicePopErrorScope {
                device: r.id()?,
                future: r.future()?,
            },
            DEVICE_DESTROY => Command::DeviceDestroy { device: r.id()? },
            COMMAND_ENCODER_COPY_BUFFER_TO_BUFFER => Command::CommandEncoderCopyBufferToBuffer {
                encoder: r.id()?,
                source: r.id()?,
                source_offset: r.u64()?,
                destination: r.id()?,
                destination_offset: r.u64()?,
                size: r.u64()?,
            },
            COMMAND_ENCODER_FINISH => Command::CommandEncoderFinish {
                encoder: r.id()?,
                command_buffer: r.handle()?,
            },
            QUEUE_SUBMIT => Command::QueueSubmit {
                queue: r.id()?,
                command_buffers: r.ids()?,
            },
            QUEUE_WRITE_BUFFER => Command::QueueWriteBuffer {
                queue: r.id()?,
                buffer: r.id()?,
                offset: r.u64()?,
                data: r.payload(allocator, &[])?,
            },
            QUEUE_ON_SUBMITTED_WORK_DONE => Command::QueueOnSubmittedWorkDone {
                queue: r.id()?,
                future: r.future()?,
            },
            BUFFER_MAP_ASYNC => Command::BufferMapAsync {
                buffer: r.id()?,
                future: r.future()?,
                mode: r.enum_u8("mode", MapMode::from_wire)?,
                offset: r.u64()?,
                size: r.u64()?,
            },
            BUFFER_UPDATE_MAPPED_DATA => Command::BufferUpdateMappedData {
                buffer: r.id()?,
                offset: r.u64()?,
                data: r.payload(allocator, &[])?,
            },
            BUFFER_UNMAP => Command::BufferUnmap { buffer: r.id()? },
            BUFFER_DESTROY => Command::BufferDestroy { buffer: r.id()? },
            other => return Err(DecodeError::UnknownCommand(other).into()),
        };
        r.finish()?;
        Ok(command)
    }
}

const INSTANCE_REQUEST_ADAPTER_CALLBACK: u32 = 1;
const ADAPTER_REQUEST_DEVICE_CALLBACK: u32 = 2;
const BUFFER_MAP_ASYNC_CALLBACK: u32 = 3;
const QUEUE_WORK_DONE_CALLBACK: u32 = 4;
const DEVICE_POP_ERROR_SCOPE_CALLBACK: u32 = 5;
const DEVICE_UNCAPTURED_ERROR_CALLBACK: u32 = 6;
const DEVICE_LOST_CALLBACK: u32 = 7;
const DEVICE_LOGGING_CALLBACK: u32 = 8;

/// Server to client.
#[derive(Debug, Clone, PartialEq)]
pub enum ReturnCommand<B> {
    InstanceRequestAdapterCallback {
        future: FutureId,
        status: RequestStatus,
        message: String,
        info: AdapterInfo,
    },
    AdapterRequestDeviceCallback {
        future: FutureId,
        status: RequestStatus,
        message: String,
    },
    /// `data` holds the mapped range on success and is empty otherwise.  On decode it is
    /// tracked against `future` so it survives until the client's callback has run.
    BufferMapAsyncCallback {
        buffer: ObjectHandle,
        future: FutureId,
        status: MapAsyncStatus,
        message: String,
        data: B,
    },
    QueueWorkDoneCallback {
        future: FutureId,
        status: RequestStatus,
    },
    DevicePopErrorScopeCallback {
        future: FutureId,
        status: PopErrorScopeStatus,
        error_type: Option<ErrorType>,
        message: String,
    },
    DeviceUncapturedErrorCallback {
        device: ObjectHandle,
        error_type: ErrorType,
        message: String,
    },
    DeviceLostCallback {
        device: ObjectHandle,
        reason: DeviceLostReason,
        message: String,
    },
    DeviceLoggingCallback {
        device: ObjectHandle,
        logging_type: LoggingType,
        message: String,
    },
}

impl<B> ReturnCommand<B> {
    pub fn command_id(&self) -> u32 {
        match self {
            ReturnCommand::InstanceRequestAdapterCallback { .. } => {
                INSTANCE_REQUEST_ADAPTER_CALLBACK
            }
            ReturnCommand::AdapterRequestDeviceCallback { .. } => ADAPTER_REQUEST_DEVICE_CALLBACK,
            ReturnCommand::BufferMapAsyncCallback { .. } => BUFFER_MAP_ASYNC_CALLBACK,
            ReturnCommand::QueueWorkDoneCallback { .. } => QUEUE_WORK_DONE_CALLBACK,
            ReturnCommand::DevicePopErrorScopeCallback { .. } => DEVICE_POP_ERROR_SCOPE_CALLBACK,
            ReturnCommand::DeviceUncapturedErrorCallback { .. } => {
                DEVICE_UNCAPTURED_ERROR_CALLBACK
            }
            ReturnCommand::DeviceLostCallback { .. } => DEVICE_LOST_CALLBACK,
            ReturnCommand::DeviceLoggingCallback { .. } => DEVICE_LOGGING_CALLBACK,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ReturnCommand::InstanceRequestAdapterCallback { .. } => {
                "InstanceRequestAdapterCallback"
            }
            ReturnCommand::AdapterRequestDeviceCallback { .. } => "AdapterRequestDeviceCallback",
            ReturnCommand::BufferMapAsyncCallback { .. } => "BufferMapAsyncCallback",
            ReturnCommand::QueueWorkDoneCallback { .. } => "QueueWorkDoneCallback",
            ReturnCommand::DevicePopErrorScopeCallback { .. } => "DevicePopErrorScopeCallback",
            ReturnCommand::DeviceUncapturedErrorCallback { .. } => {
                "DeviceUncapturedErrorCallback"
            }
            ReturnCommand::DeviceLostCallback { .. } => "DeviceLostCallback",
            ReturnCommand::DeviceLoggingCallback { .. } => "DeviceLoggingCallback",
        }
    }
}

impl<B: AsRef<[u8]>> ReturnCommand<B> {
    fn write_body<S: Sink>(&self, s: &mut S) {
        match self {
            ReturnCommand::InstanceRequestAdapterCallback {
                future,
                status,
                message,
                info,
            } => {
                s.put_future(*future);
                s.put_u8(*status as u8);
                s.put_string(message);
                s.put_string(&info.vendor);
                s.put_string(&info.architecture);
                s.put_string(&info.device);
                s.put_string(&info.description);
                s.put_u8(info.backend_type as u8);
            }
            ReturnCommand::AdapterRequestDeviceCallback {
                future,
                status,
                message,
            } => {
                s.put_future(*future);
                s.put_u8(*status as u8);
                s.put_string(message);
            }
            ReturnCommand::BufferMapAsyncCallback {
                buffer,
                future,
                status,
                message,
                data,
            } => {
                s.put_handle(*buffer);
                s.put_future(*future);
                s.put_u8(*status as u8);
                s.put_string(message);
                s.put_payload(data.as_ref());
            }
            ReturnCommand::QueueWorkDoneCallback { future, status } => {
                s.put_future(*future);
                s.put_u8(*status as u8);
            }
            ReturnCommand::DevicePopErrorScopeCallback {
                future,
                status,
                error_type,
                message,
            } => {
                s.put_future(*future);
                s.put_u8(*status as u8);
                s.put_u8(error_type.map_or(0, |t| t as u8));
                s.put_string(message);
            }
            ReturnCommand::DeviceUncapturedErrorCallback {
                device,
                error_type,
                message,
            } => {
                s.put_handle(*device);
                s.put_u8(*error_type as u8);
                s.put_string(message);
            }
            ReturnCommand::DeviceLostCallback {
                device,
                reason,
                message,
            } => {
                s.put_handle(*device);
                s.put_u8(*reason as u8);
                s.put_string(message);
            }
            ReturnCommand::DeviceLoggingCallback {
                device,
                logging_type,
                message,
            } => {
                s.put_handle(*device);
                s.put_u8(*logging_type as u8);
                s.put_string(message);
            }
        }
    }
}

impl<B: AsRef<[u8]>> WireEncode for ReturnCommand<B> {
    fn encoded_len(&self) -> usize {
        let mut counter = Counter::default();
        self.write_body(&mut counter);
        HEADER_SIZE + counter.0
    }

    fn encode(&self, out: &mut [u8]) {
        encode_with(out, self.command_id(), |sink| self.write_body(sink));
    }

    fn name(&self) -> &'static str {
        ReturnCommand::name(self)
    }
}

impl ReturnCommand<Allocation> {
    /// Decodes exactly one return command.
    pub fn decode(bytes: &[u8], allocator: &mut DeserializeAllocator) -> Result<Self, WireError> {
        let (command_id, mut r) = open(bytes)?;
        let command = match command_id {
            INSTANCE_REQUEST_ADAPTER_CALLBACK => ReturnCommand::InstanceRequestAdapterCallback {
                future: r.future()?,
                status: r.enum_u8("status", RequestStatus::from_wire)?,
                message: r.string()?,
                info: AdapterInfo {
                    vendor: r.string()?,
                    architecture: r.string()?,
                    device: r.string()?,
                    description: r.string()?,
                    backend_type: r.enum_u8("backend_type", BackendType::from_wire)?,
                },
            },
            ADAPTER_REQUEST_DEVICE_CALLBACK => ReturnCommand::AdapterRequestDeviceCallback {
                future: r.future()?,
                status: r.enum_u8("status", RequestStatus::from_wire)?,
                message: r.string()?,
            },
            BUFFER_MAP_ASYNC_CALLBACK => {
                let buffer = r.handle()?;
                let future = r.future()?;
                let status = r.enum_u8("status", MapAsyncStatus::from_wire)?;
                let message = r.string()?;
                let data = r.payload(allocator, &[future])?;
                ReturnCommand::BufferMapAsyncCallback {
                    buffer,
                    future,
                    status,
                    message,
                    data,
                }
            }
            QUEUE_WORK_DONE_CALLBACK => ReturnCommand::QueueWorkDoneCallback {
                future: r.future()?,
                status: r.enum_u8("status", RequestStatus::from_wire)?,
            },
            DEVICE_POP_ERROR_SCOPE_CALLBACK => ReturnCommand::DevicePopErrorScopeCallback {
                future: r.future()?,
                status: r.enum_u8("status", PopErrorScopeStatus::from_wire)?,
                error_type: match r.u8()? {
                    0 => None,
                    value => Some(ErrorType::from_wire(value).ok_or(
                        DecodeError::InvalidEnum {
                            field: "error_type",
                            value: value as u32,
                        },
                    )?),
                },
                message: r.string()?,
            },
            DEVICE_UNCAPTURED_ERROR_CALLBACK => ReturnCommand::DeviceUncapturedErrorCallback {
                device: r.handle()?,
                error_type: r.enum_u8("error_type", ErrorType::from_wire)?,
                message: r.string()?,
            },
            DEVICE_LOST_CALLBACK => ReturnCommand::DeviceLostCallback {
                device: r.handle()?,
                reason: r.enum_u8("reason", DeviceLostReason::from_wire)?,
                message: r.string()?,
            },
            DEVICE_LOGGING_CALLBACK => ReturnCommand::DeviceLoggingCallback {
                device: r.handle()?,
                logging_type: r.enum_u8("logging_type", LoggingType::from_wire)?,
                message: r.string()?,
            },
            other => return Err(DecodeError::UnknownCommand(other).into()),
        };
        r.finish()?;
        Ok(command)
    }
}

/// Encodes a command into a fresh vector.
pub fn encode_to_vec(command: &impl WireEncode) -> Vec<u8> {
    let mut out = vec![0; command.encoded_len()];
    command.encode(&mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator() -> DeserializeAllocator {
        DeserializeAllocator::new(256, 1 << 20)
    }

    #[test]
    fn test_header_carries_size_and_id() {
        let command: Command<&[u8]> = Command::BufferUnmap { buffer: 3 };
        let bytes = encode_to_vec(&command);
        assert_eq!(bytes.len(), HEADER_SIZE + 4);
        assert_eq!(peek_command_size(&bytes), Some(bytes.len() as u64));
        assert_eq!(u32::from_le_bytes(bytes[8..12].try_into().unwrap()), BUFFER_UNMAP);
    }

    #[test]
    fn test_create_buffer_decodes() {
        let descriptor = BufferDescriptor {
            label: "vertices".to_owned(),
            size: 1024,
            usage: BufferUsages::VERTEX | BufferUsages::COPY_DST,
            mapped_at_creation: true,
        };
        let command: Command<&[u8]> = Command::DeviceCreateBuffer {
            device: 2,
            buffer: ObjectHandle::new(5, 1),
            descriptor: descriptor.clone(),
        };
        let bytes = encode_to_vec(&command);
        let decoded = Command::decode(&bytes, &mut allocator()).unwrap();
        assert_eq!(
            decoded,
            Command::DeviceCreateBuffer {
                device: 2,
                buffer: ObjectHandle::new(5, 1),
                descriptor,
            }
        );
    }

    #[test]
    fn test_payload_lands_in_allocator() {
        let data = [9u8; 300];
        let command: Command<&[u8]> = Command::QueueWriteBuffer {
            queue: 1,
            buffer: 4,
            offset: 16,
            data: &data,
        };
        let bytes = encode_to_vec(&command);
        let mut allocator = allocator();
        let Command::QueueWriteBuffer { data: decoded, .. } =
            Command::decode(&bytes, &mut allocator).unwrap()
        else {
            panic!("wrong command");
        };
        assert_eq!(allocator.bytes(&decoded).unwrap(), &data[..]);
        assert!(!decoded.is_tracked());
    }

    #[test]
    fn test_map_callback_data_is_tracked() {
        let command: ReturnCommand<&[u8]> = ReturnCommand::BufferMapAsyncCallback {
            buffer: ObjectHandle::new(2, 0),
            future: FutureId::new(11),
            status: MapAsyncStatus::Success,
            message: String::new(),
            data: b"contents",
        };
        let bytes = encode_to_vec(&command);
        let mut allocator = allocator();
        let decoded = ReturnCommand::decode(&bytes, &mut allocator).unwrap();
        let ReturnCommand::BufferMapAsyncCallback { data, .. } = decoded else {
            panic!("wrong command");
        };
        allocator.reset();
        assert_eq!(allocator.bytes(&data).unwrap(), b"contents");
        allocator.free_future(FutureId::new(11));
        assert!(allocator.bytes(&data).is_none());
    }

    #[test]
    fn test_unknown_command_id() {
        let mut bytes = encode_to_vec(&Command::<&[u8]>::BufferDestroy { buffer: 1 });
        bytes[8..12].copy_from_slice(&999u32.to_le_bytes());
        assert_eq!(
            Command::decode(&bytes, &mut allocator()),
            Err(WireError::Decode(DecodeError::UnknownCommand(999)))
        );
    }

    #[test]
    fn test_size_mismatch_rejected() {
        let mut bytes = encode_to_vec(&Command::<&[u8]>::BufferDestroy { buffer: 1 });
        bytes.push(0);
        assert!(matches!(
            Command::decode(&bytes, &mut allocator()),
            Err(WireError::Decode(DecodeError::BadCommandSize(_)))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode_to_vec(&Command::<&[u8]>::BufferDestroy { buffer: 1 });
        bytes.push(0);
        let len = bytes.len() as u64;
        bytes[..8].copy_from_slice(&len.to_le_bytes());
        assert_eq!(
            Command::decode(&bytes, &mut allocator()),
            Err(WireError::Decode(DecodeError::TrailingBytes(1)))
        );
    }

    #[test]
    fn test_unknown_object_type_rejected() {
        let mut bytes = encode_to_vec(&Command::<&[u8]>::DestroyObject {
            object_type: ObjectType::Buffer,
            object: ObjectHandle::new(1, 0),
        });
        bytes[HEADER_SIZE] = 200;
        assert_eq!(
            Command::decode(&bytes, &mut allocator()),
            Err(WireError::Decode(DecodeError::InvalidEnum {
                field: "object_type",
                value: 200
            }))
        );
    }

    #[test]
    fn test_unknown_usage_bits_rejected() {
        let mut bytes = encode_to_vec(&Command::<&[u8]>::DeviceCreateBuffer {
            device: 2,
            buffer: ObjectHandle::new(5, 1),
            descriptor: BufferDescriptor {
                label: String::new(),
                size: 16,
                usage: BufferUsages::COPY_DST,
                mapped_at_creation: false,
            },
        });
        // device id, buffer handle, empty label, size
        let usage_at = HEADER_SIZE + 4 + 8 + 4 + 8;
        bytes[usage_at..usage_at + 4].copy_from_slice(&0x0100_0008u32.to_le_bytes());
        assert_eq!(
            Command::decode(&bytes, &mut allocator()),
            Err(WireError::Decode(DecodeError::InvalidEnum {
                field: "usage",
                value: 0x0100_0008
            }))
        );
    }

    #[test]
    fn test_pop_error_scope_without_error() {
        let command: ReturnCommand<&[u8]> = ReturnCommand::DevicePopErrorScopeCallback {
            future: FutureId::new(3),
            status: PopErrorScopeStatus::Success,
            error_type: None,
            message: String::new(),
        };
        let bytes = encode_to_vec(&command);
        let decoded = ReturnCommand::decode(&bytes, &mut allocator()).unwrap();
        assert_eq!(
            decoded,
            ReturnCommand::DevicePopErrorScopeCallback {
                future: FutureId::new(3),
                status: PopErrorScopeStatus::Success,
                error_type: None,
                message: String::new(),
            }
        );
    }

    #[test]
    fn test_unknown_logging_type_rejected() {
        let mut bytes = encode_to_vec(&ReturnCommand::<&[u8]>::DeviceLoggingCallback {
            device: ObjectHandle::new(2, 0),
            logging_type: LoggingType::Info,
            message: "hello".to_owned(),
        });
        bytes[HEADER_SIZE + 8] = 9;
        assert_eq!(
            ReturnCommand::decode(&bytes, &mut allocator()),
            Err(WireError::Decode(DecodeError::InvalidEnum {
                field: "logging_type",
                value: 9
            }))
        );
    }
}
