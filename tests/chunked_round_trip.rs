// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Commands larger than a transport allocation, and transports that cut the stream at
//! arbitrary points, still arrive intact.

mod common;

use common::init_logging;
use futures::executor::block_on;
use gpu_wire::imp::SoftwareOptions;
use gpu_wire::loopback::WireHelper;
use gpu_wire::protocol::{Command, encode_to_vec};
use gpu_wire::{BufferUsages, ChunkedCommandHandler, MapMode, ObjectType, WireDescriptor};
use proptest::prelude::*;

fn payload() -> impl Strategy<Value = Vec<u8>> {
    (1usize..128).prop_flat_map(|words| prop::collection::vec(any::<u8>(), words * 4))
}

/// Transports too small to hold even a command header.
#[test]
fn capacities_below_the_header_size() {
    init_logging();
    let bytes: Vec<u8> = (0..64u8).collect();
    for capacity in 1..16 {
        let wire = WireHelper::with_options(
            SoftwareOptions::default(),
            WireDescriptor::default(),
            capacity,
        )
        .unwrap();
        let device = common::device(&wire);
        let target = common::buffer(&device, 64, BufferUsages::MAP_READ | BufferUsages::COPY_DST);
        device.queue().write_buffer(&target, 0, &bytes);
        let mapped = target.map(MapMode::Read, 0, None);
        wire.round_trip().unwrap();
        block_on(mapped).unwrap();
        assert_eq!(target.mapped_range(0, None).unwrap(), bytes, "capacity {capacity}");
        assert!(!wire.client().is_disconnected(), "capacity {capacity}");
        assert!(!wire.server().is_disconnected(), "capacity {capacity}");
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn write_and_read_back_through_small_transports(
        capacity in 1usize..600,
        bytes in payload(),
    ) {
        init_logging();
        let wire = WireHelper::with_options(
            SoftwareOptions::default(),
            WireDescriptor::default(),
            capacity,
        )
        .unwrap();
        let device = common::device(&wire);
        let size = bytes.len() as u64;
        let target = common::buffer(&device, size, BufferUsages::MAP_READ | BufferUsages::COPY_DST);
        device.queue().write_buffer(&target, 0, &bytes);
        wire.round_trip().unwrap();

        let native = wire
            .server()
            .native_handle(ObjectType::Buffer, target.handle().id)
            .unwrap();
        prop_assert_eq!(wire.procs().buffer_contents(native).unwrap(), bytes.clone());

        // The map reply carries the bytes back, chunked the other way.
        let mapped = target.map(MapMode::Read, 0, None);
        wire.round_trip().unwrap();
        block_on(mapped).unwrap();
        prop_assert_eq!(target.mapped_range(0, None).unwrap(), bytes);
        prop_assert!(!wire.client().is_disconnected());
        prop_assert!(!wire.server().is_disconnected());
    }

    #[test]
    fn arbitrary_cuts_yield_the_same_commands(
        payloads in prop::collection::vec(payload(), 1..6),
        cuts in prop::collection::vec(any::<prop::sample::Index>(), 0..8),
    ) {
        let commands: Vec<Vec<u8>> = payloads
            .iter()
            .enumerate()
            .map(|(i, data)| {
                encode_to_vec(&Command::QueueWriteBuffer {
                    queue: 1,
                    buffer: i as u32 + 1,
                    offset: 0,
                    data: &data[..],
                })
            })
            .collect();
        let stream = commands.concat();
        let mut points: Vec<usize> = cuts.iter().map(|cut| cut.index(stream.len())).collect();
        points.push(stream.len());
        points.sort_unstable();

        let mut handler = ChunkedCommandHandler::new(WireDescriptor::default().max_command_size);
        let mut received = Vec::new();
        let mut start = 0;
        for point in points {
            handler
                .handle_bytes(&stream[start..point], |command| {
                    received.push(command.to_vec());
                    Ok(())
                })
                .unwrap();
            start = point;
        }
        prop_assert!(!handler.has_partial_command());
        prop_assert_eq!(received, commands);
    }
}
