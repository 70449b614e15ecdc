// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Plain data passed through the API and across the wire.
//!
//! Enum discriminants here are wire values.  Each enum has a `from_wire` that rejects
//! anything the decoder does not know.

use bitflags::bitflags;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum PowerPreference {
    #[default]
    Undefined = 0,
    LowPower = 1,
    HighPerformance = 2,
}

impl PowerPreference {
    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(PowerPreference::Undefined),
            1 => Some(PowerPreference::LowPower),
            2 => Some(PowerPreference::HighPerformance),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum BackendType {
    #[default]
    Null = 0,
    Software = 1,
    Vulkan = 2,
    Metal = 3,
    D3D12 = 4,
    OpenGL = 5,
}

impl BackendType {
    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(BackendType::Null),
            1 => Some(BackendType::Software),
            2 => Some(BackendType::Vulkan),
            3 => Some(BackendType::Metal),
            4 => Some(BackendType::D3D12),
            5 => Some(BackendType::OpenGL),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RequestAdapterOptions {
    pub power_preference: PowerPreference,
    pub force_fallback_adapter: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AdapterInfo {
    pub vendor: String,
    pub architecture: String,
    pub device: String,
    pub description: String,
    pub backend_type: BackendType,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceDescriptor {
    pub label: String,
}

bitflags! {
    /// Bit set of buffer usages, with WebGPU's bit assignments.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferUsages: u32 {
        const MAP_READ  = 0x0001;
        const MAP_WRITE = 0x0002;
        const COPY_SRC  = 0x0004;
        const COPY_DST  = 0x0008;
        const INDEX     = 0x0010;
        const VERTEX    = 0x0020;
        const UNIFORM   = 0x0040;
        const STORAGE   = 0x0080;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BufferDescriptor {
    pub label: String,
    pub size: u64,
    pub usage: BufferUsages,
    pub mapped_at_creation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MapMode {
    Read = 1,
    Write = 2,
}

impl MapMode {
    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(MapMode::Read),
            2 => Some(MapMode::Write),
            _ => None,
        }
    }
}

/// Client-visible mapping state of a buffer, as in WebGPU's `GPUBufferMapState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferMapState {
    Unmapped,
    Pending,
    Mapped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DeviceLostReason {
    Unknown = 0,
    Destroyed = 1,
    ConnectionLost = 2,
}

impl DeviceLostReason {
    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(DeviceLostReason::Unknown),
            1 => Some(DeviceLostReason::Destroyed),
            2 => Some(DeviceLostReason::ConnectionLost),
            _ => None,
        }
    }
}

/// Severity of a message a device logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LoggingType {
    Verbose = 1,
    Info = 2,
    Warning = 3,
    Error = 4,
}

impl LoggingType {
    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        match value {
            1 => Some(LoggingType::Verbose),
            2 => Some(LoggingType::Info),
            3 => Some(LoggingType::Warning),
            4 => Some(LoggingType::Error),
            _ => None,
        }
    }
}

/// Result of an adapter, device or work-done request as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RequestStatus {
    Success = 0,
    Unavailable = 1,
    Error = 2,
}

impl RequestStatus {
    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(RequestStatus::Success),
            1 => Some(RequestStatus::Unavailable),
            2 => Some(RequestStatus::Error),
            _ => None,
        }
    }
}

/// Result of a buffer mapping as reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MapAsyncStatus {
    Success = 0,
    ValidationError = 1,
    DestroyedBeforeCallback = 2,
    UnmappedBeforeCallback = 3,
    DeviceLost = 4,
}

impl MapAsyncStatus {
    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(MapAsyncStatus::Success),
            1 => Some(MapAsyncStatus::ValidationError),
            2 => Some(MapAsyncStatus::DestroyedBeforeCallback),
            3 => Some(MapAsyncStatus::UnmappedBeforeCallback),
            4 => Some(MapAsyncStatus::DeviceLost),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PopErrorScopeStatus {
    Success = 0,
    EmptyStack = 1,
}

impl PopErrorScopeStatus {
    pub(crate) fn from_wire(value: u8) -> Option<Self> {
        match value {
            0 => Some(PopErrorScopeStatus::Success),
            1 => Some(PopErrorScopeStatus::EmptyStack),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_bits() {
        let usage = BufferUsages::MAP_READ | BufferUsages::COPY_DST;
        assert!(usage.contains(BufferUsages::MAP_READ));
        assert!(!usage.contains(BufferUsages::MAP_WRITE));
        assert_eq!(BufferUsages::from_bits(usage.bits()), Some(usage));
        assert_eq!(BufferUsages::from_bits(0x1_0000), None);
    }
}
