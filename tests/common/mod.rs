// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Shared setup for the wire integration tests.
#![allow(dead_code)]

use futures::executor::block_on;
use gpu_wire::loopback::WireHelper;
use gpu_wire::{
    Buffer, BufferDescriptor, BufferUsages, Device, DeviceDescriptor, RequestAdapterOptions,
};

/// Routes the library's logs to the test harness.  Safe to call from every test.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn wire() -> WireHelper {
    init_logging();
    WireHelper::new().expect("loopback wire")
}

/// Negotiates an adapter and a device over `wire`.
pub fn device(wire: &WireHelper) -> Device {
    let adapter = wire
        .instance()
        .request_adapter(&RequestAdapterOptions::default());
    wire.round_trip().expect("adapter round trip");
    let adapter = block_on(adapter).expect("adapter");
    let device = adapter.request_device(&DeviceDescriptor {
        label: "test device".to_owned(),
    });
    wire.round_trip().expect("device round trip");
    block_on(device).expect("device")
}

pub fn buffer(device: &Device, size: u64, usage: BufferUsages) -> Buffer {
    device.create_buffer(&BufferDescriptor {
        label: String::new(),
        size,
        usage,
        mapped_at_creation: false,
    })
}
