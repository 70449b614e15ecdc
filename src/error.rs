// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Error types.

Errors fall into two families.  Connection-level errors ([`WireError`]) mean the byte stream
can no longer be trusted; whoever sees one disconnects.  API-level errors ([`BackendError`],
[`RequestError`], [`MapAsyncError`]) are ordinary per-call results delivered through callbacks,
and the wire keeps running.
*/

use crate::handle::{FutureId, ObjectHandle, ObjectId, ObjectType};
use std::fmt::Display;

/// A command could not be decoded from its bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum DecodeError {
    #[error("command ended unexpectedly")]
    UnexpectedEof,
    #[error("unknown command id {0}")]
    UnknownCommand(u32),
    #[error("invalid value {value} for {field}")]
    InvalidEnum { field: &'static str, value: u32 },
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    #[error("declared command size {0} is invalid")]
    BadCommandSize(u64),
    #[error("{0} bytes left over after decoding")]
    TrailingBytes(usize),
}

/// Broad classes of [`WireError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The transport refused to carry bytes, or the wire is already down.
    Transport,
    /// The peer sent something that makes no sense.
    Protocol,
    /// The receiving side could not find memory for a payload.
    ResourceExhaustion,
}

/// A connection-level failure.  Every one of these ends the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum WireError {
    #[error("malformed command: {0}")]
    Decode(#[from] DecodeError),
    #[error("null {0} where an object is required")]
    NullObject(ObjectType),
    #[error("unknown {object_type} {id}")]
    UnknownObject {
        object_type: ObjectType,
        id: ObjectId,
    },
    #[error("stale {object_type} handle {handle}")]
    StaleHandle {
        object_type: ObjectType,
        handle: ObjectHandle,
    },
    #[error("cannot allocate {object_type} at {handle}")]
    InvalidAllocation {
        object_type: ObjectType,
        handle: ObjectHandle,
    },
    #[error("no pending request for {0}")]
    UnknownFuture(FutureId),
    #[error("command not valid for the object's state: {0}")]
    InvalidState(&'static str),
    #[error("out of memory deserializing {0} bytes")]
    OutOfMemory(u64),
    #[error("transport refused {0} bytes")]
    Transport(usize),
    #[error("the wire is disconnected")]
    Disconnected,
}

impl WireError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            WireError::Transport(_) | WireError::Disconnected => ErrorKind::Transport,
            WireError::OutOfMemory(_) => ErrorKind::ResourceExhaustion,
            WireError::Decode(_)
            | WireError::NullObject(_)
            | WireError::UnknownObject { .. }
            | WireError::StaleHandle { .. }
            | WireError::InvalidAllocation { .. }
            | WireError::UnknownFuture(_)
            | WireError::InvalidState(_) => ErrorKind::Protocol,
        }
    }
}

/// Category of an API-level error, as in WebGPU's `GPUErrorFilter`.
///
/// The discriminants are part of the wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorType {
    Validation = 1,
    OutOfMemory = 2,
    Internal = 3,
    Unknown = 4,
}

impl ErrorType {
    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(ErrorType::Validation),
            2 => Some(ErrorType::OutOfMemory),
            3 => Some(ErrorType::Internal),
            4 => Some(ErrorType::Unknown),
            _ => None,
        }
    }
}

impl Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorType::Validation => write!(f, "validation"),
            ErrorType::OutOfMemory => write!(f, "out of memory"),
            ErrorType::Internal => write!(f, "internal"),
            ErrorType::Unknown => write!(f, "unknown"),
        }
    }
}

/// A backend operation failed.  Routed to the owning device, never fatal to the wire.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{error_type} error: {message}")]
pub struct BackendError {
    pub error_type: ErrorType,
    pub message: String,
}

impl BackendError {
    pub fn new(error_type: ErrorType, message: impl Into<String>) -> Self {
        BackendError {
            error_type,
            message: message.into(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Validation, message)
    }

    pub fn out_of_memory(message: impl Into<String>) -> Self {
        Self::new(ErrorType::OutOfMemory, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorType::Internal, message)
    }
}

/// Outcome of a failed adapter, device, work-done or error-scope request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum RequestError {
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("request failed: {0}")]
    Backend(String),
    #[error("no error scope to pop")]
    EmptyScope,
    #[error("the wire connection was lost")]
    ConnectionLost,
}

/// Outcome of a failed buffer mapping.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum MapAsyncError {
    #[error("map request rejected: {0}")]
    Validation(String),
    #[error("a mapping is already pending on this buffer")]
    AlreadyPending,
    #[error("buffer was destroyed before the mapping completed")]
    DestroyedBeforeCallback,
    #[error("buffer was unmapped before the mapping completed")]
    UnmappedBeforeCallback,
    #[error("the device was lost")]
    DeviceLost,
    #[error("the wire connection was lost")]
    ConnectionLost,
}
