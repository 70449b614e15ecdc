// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! What happens to outstanding work when the connection goes away, from either end.

mod common;

use common::{buffer, device, wire};
use futures::executor::block_on;
use gpu_wire::protocol::{Command, HEADER_SIZE, encode_to_vec};
use gpu_wire::{
    BufferUsages, DecodeError, Device, DeviceLostReason, ErrorKind, MapAsyncError, MapMode,
    ObjectType, RequestAdapterOptions, RequestError, WireError,
};
use std::sync::{Arc, Mutex};

type Losses = Arc<Mutex<Vec<(DeviceLostReason, String)>>>;

fn record_losses(device: &Device) -> Losses {
    let losses: Losses = Arc::default();
    let sink = losses.clone();
    device.set_device_lost_callback(move |reason, message| {
        sink.lock().unwrap().push((reason, message));
    });
    losses
}

fn reasons(losses: &Losses) -> Vec<DeviceLostReason> {
    losses.lock().unwrap().iter().map(|(reason, _)| *reason).collect()
}

#[test]
fn disconnect_fails_everything_outstanding() {
    let wire = wire();
    let device = device(&wire);
    let losses = record_losses(&device);
    let buffer = buffer(&device, 16, BufferUsages::MAP_READ);
    let mapped = buffer.map(MapMode::Read, 0, None);
    let done = device.queue().on_submitted_work_done();
    let adapter = wire
        .instance()
        .request_adapter(&RequestAdapterOptions::default());
    assert_eq!(wire.client().pending_requests(), 3);

    wire.client().disconnect();
    assert!(wire.client().is_disconnected());
    assert_eq!(wire.client().pending_requests(), 0);
    assert_eq!(block_on(mapped), Err(MapAsyncError::ConnectionLost));
    assert_eq!(block_on(done), Err(RequestError::ConnectionLost));
    assert!(matches!(block_on(adapter), Err(RequestError::ConnectionLost)));
    assert_eq!(reasons(&losses), vec![DeviceLostReason::ConnectionLost]);
    assert!(device.is_lost());
    assert_eq!(buffer.map_state(), gpu_wire::BufferMapState::Unmapped);
}

#[test]
fn disconnect_twice_is_harmless() {
    let wire = wire();
    let device = device(&wire);
    let losses = record_losses(&device);
    wire.client().disconnect();
    wire.client().disconnect();
    assert_eq!(reasons(&losses), vec![DeviceLostReason::ConnectionLost]);
    wire.server().disconnect();
    wire.server().disconnect();
    assert!(wire.server().is_disconnected());
}

#[test]
fn requests_after_disconnect_fail_immediately() {
    let wire = wire();
    let device = device(&wire);
    wire.client().disconnect();

    let done = device.queue().on_submitted_work_done();
    assert_eq!(block_on(done), Err(RequestError::ConnectionLost));
    let scope = device.pop_error_scope();
    assert_eq!(block_on(scope), Err(RequestError::ConnectionLost));
    let buffer = buffer(&device, 16, BufferUsages::MAP_READ);
    assert_eq!(
        block_on(buffer.map(MapMode::Read, 0, None)),
        Err(MapAsyncError::ConnectionLost)
    );
    assert_eq!(wire.client().pending_requests(), 0);
}

#[test]
fn commands_after_disconnect_never_reach_the_server() {
    let wire = wire();
    let device = device(&wire);
    wire.round_trip().unwrap();
    let before = wire.server().object_count(ObjectType::Buffer);
    wire.client().disconnect();
    let _buffer = buffer(&device, 16, BufferUsages::COPY_DST);
    wire.flush_client().unwrap();
    assert!(wire.to_server().take_messages().is_empty());
    assert_eq!(wire.server().object_count(ObjectType::Buffer), before);
}

#[test]
fn closed_transport_disconnects_the_client() {
    let wire = wire();
    let device = device(&wire);
    let losses = record_losses(&device);
    let done = device.queue().on_submitted_work_done();
    wire.to_server().close();

    // The next command finds the transport gone.
    let _buffer = buffer(&device, 16, BufferUsages::COPY_DST);
    assert!(wire.client().is_disconnected());
    assert_eq!(block_on(done), Err(RequestError::ConnectionLost));
    assert_eq!(reasons(&losses), vec![DeviceLostReason::ConnectionLost]);
}

#[test]
fn unknown_command_disconnects_the_server() {
    let wire = wire();
    let mut garbage = (HEADER_SIZE as u64).to_le_bytes().to_vec();
    garbage.extend(9999u32.to_le_bytes());
    let error = wire.server().handle_commands(&garbage).unwrap_err();
    assert_eq!(error, WireError::Decode(DecodeError::UnknownCommand(9999)));
    assert_eq!(error.kind(), ErrorKind::Protocol);
    assert!(wire.server().is_disconnected());
    assert_eq!(
        wire.server().handle_commands(&garbage),
        Err(WireError::Disconnected)
    );
}

#[test]
fn undersized_command_disconnects_the_server() {
    let wire = wire();
    let mut garbage = 4u64.to_le_bytes().to_vec();
    garbage.extend([0; 8]);
    assert_eq!(
        wire.server().handle_commands(&garbage),
        Err(WireError::Decode(DecodeError::BadCommandSize(4)))
    );
    assert!(wire.server().is_disconnected());
}

#[test]
fn unknown_object_disconnects_the_server() {
    let wire = wire();
    let bytes = encode_to_vec(&Command::<&[u8]>::BufferUnmap { buffer: 42 });
    assert_eq!(
        wire.server().handle_commands(&bytes),
        Err(WireError::UnknownObject {
            object_type: ObjectType::Buffer,
            id: 42,
        })
    );
    assert!(wire.server().is_disconnected());
}

#[test]
fn server_loss_then_disconnect_reports_once() {
    let wire = wire();
    let device = device(&wire);
    let losses = record_losses(&device);
    let native = wire
        .server()
        .native_handle(ObjectType::Device, device.handle().id)
        .unwrap();
    wire.procs().lose_device(native, "unplugged");
    wire.round_trip().unwrap();
    assert_eq!(
        *losses.lock().unwrap(),
        vec![(DeviceLostReason::Unknown, "unplugged".to_owned())]
    );

    wire.client().disconnect();
    assert_eq!(losses.lock().unwrap().len(), 1);
}

#[test]
fn destroyed_device_reports_destroyed() {
    let wire = wire();
    let device = device(&wire);
    let losses = record_losses(&device);
    let buffer = buffer(&device, 16, BufferUsages::MAP_READ);
    wire.round_trip().unwrap();

    device.destroy();
    let mapped = buffer.map(MapMode::Read, 0, None);
    wire.round_trip().unwrap();
    assert_eq!(reasons(&losses), vec![DeviceLostReason::Destroyed]);
    assert!(device.is_lost());
    assert_eq!(block_on(mapped), Err(MapAsyncError::DeviceLost));
}

#[test]
fn malformed_reply_disconnects_the_client() {
    let wire = wire();
    let device = device(&wire);
    let losses = record_losses(&device);
    let mut garbage = (HEADER_SIZE as u64).to_le_bytes().to_vec();
    garbage.extend(77u32.to_le_bytes());
    assert!(wire.client().handle_commands(&garbage).is_err());
    assert!(wire.client().is_disconnected());
    assert_eq!(reasons(&losses), vec![DeviceLostReason::ConnectionLost]);
}
