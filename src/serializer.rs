// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Sending side of the wire.

[`CommandSerializer`] is the transport seam: whatever process or IPC layer embeds the wire
hands in something that can lend out bounded write space and flush it.  The wire never opens
sockets or pipes itself.

[`ChunkedCommandSerializer`] sits on top and turns commands into bytes.  A command that fits
in one transport allocation is encoded straight into transport space.  A larger one is encoded
into a temporary buffer and copied out in allocation-sized chunks; the receiving
[`ChunkedCommandHandler`](crate::chunked_receiver::ChunkedCommandHandler) stitches the pieces
back together.
*/

use crate::error::WireError;
use crate::protocol::WireEncode;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};

/// A bounded byte transport.
pub trait CommandSerializer: Send {
    /// Largest `size` that [`get_cmd_space`](Self::get_cmd_space) can ever satisfy.
    fn maximum_allocation_size(&self) -> usize;

    /// Lends out `size` writable bytes, or `None` when the transport cannot take them.
    ///
    /// Bytes handed out are committed to the stream; they are sent no later than the next
    /// [`flush`](Self::flush).
    fn get_cmd_space(&mut self, size: usize) -> Option<&mut [u8]>;

    /// Pushes everything committed so far to the peer.
    fn flush(&mut self) -> bool;
}

/// Sink installed after a disconnect.  Accepts nothing and flushes nothing.
#[derive(Debug, Default)]
pub struct NoopSerializer;

impl CommandSerializer for NoopSerializer {
    fn maximum_allocation_size(&self) -> usize {
        usize::MAX
    }

    fn get_cmd_space(&mut self, _size: usize) -> Option<&mut [u8]> {
        None
    }

    fn flush(&mut self) -> bool {
        false
    }
}

/// Thread-safe command writer with transparent chunking.
pub struct ChunkedCommandSerializer {
    transport: Mutex<Box<dyn CommandSerializer>>,
    disconnected: AtomicBool,
}

impl ChunkedCommandSerializer {
    pub fn new(transport: Box<dyn CommandSerializer>) -> Self {
        ChunkedCommandSerializer {
            transport: Mutex::new(transport),
            disconnected: AtomicBool::new(false),
        }
    }

    /// Writes one command.
    ///
    /// After [`disconnect`](Self::disconnect) commands are dropped and this returns `Ok`.
    /// While connected, a transport that refuses space yields [`WireError::Transport`].
    pub fn serialize_command(&self, command: &impl WireEncode) -> Result<(), WireError> {
        let size = command.encoded_len();
        let mut transport = self.transport.lock();
        if self.is_disconnected() {
            return Ok(());
        }
        if size <= transport.maximum_allocation_size() {
            match transport.get_cmd_space(size) {
                Some(space) => {
                    command.encode(space);
                    tracing::trace!(command = command.name(), size, "serialized");
                    Ok(())
                }
                None => Err(WireError::Transport(size)),
            }
        } else {
            let mut buffer = Vec::new();
            buffer
                .try_reserve_exact(size)
                .map_err(|_| WireError::OutOfMemory(size as u64))?;
            buffer.resize(size, 0);
            command.encode(&mut buffer);
            tracing::trace!(command = command.name(), size, "serializing in chunks");
            write_chunks(&mut **transport, &buffer)
        }
    }

    /// Copies pre-encoded command bytes into the transport, splitting as needed.
    pub fn serialize_chunked_command(&self, bytes: &[u8]) -> Result<(), WireError> {
        let mut transport = self.transport.lock();
        if self.is_disconnected() {
            return Ok(());
        }
        write_chunks(&mut **transport, bytes)
    }

    pub fn flush(&self) -> bool {
        self.transport.lock().flush()
    }

    /// Swaps the transport for a [`NoopSerializer`].  Bytes already committed to the old
    /// transport are flushed first.  Calling this again does nothing.
    pub fn disconnect(&self) {
        let mut transport = self.transport.lock();
        if self.disconnected.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut old = std::mem::replace(&mut *transport, Box::new(NoopSerializer));
        drop(transport);
        old.flush();
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }
}

/// Writes `bytes` in pieces of at most the transport's allocation size.  Stops at the first
/// refused piece; pieces already written stay written.
fn write_chunks(transport: &mut dyn CommandSerializer, mut bytes: &[u8]) -> Result<(), WireError> {
    let max = transport.maximum_allocation_size();
    if max == 0 {
        return Err(WireError::Transport(bytes.len()));
    }
    while !bytes.is_empty() {
        let chunk = bytes.len().min(max);
        match transport.get_cmd_space(chunk) {
            Some(space) => space.copy_from_slice(&bytes[..chunk]),
            None => {
                tracing::warn!(
                    remaining = bytes.len(),
                    "transport refused a chunk; abandoning command"
                );
                return Err(WireError::Transport(chunk));
            }
        }
        bytes = &bytes[chunk..];
    }
    Ok(())
}

impl Debug for ChunkedCommandSerializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedCommandSerializer")
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, encode_to_vec};
    use parking_lot::Mutex as PlMutex;
    use std::sync::Arc;

    /// Records every allocation as its own message.
    struct Recording {
        max: usize,
        refuse_after: Option<usize>,
        current: Vec<u8>,
        sent: Arc<PlMutex<Vec<Vec<u8>>>>,
    }

    impl Recording {
        fn new(max: usize) -> (Self, Arc<PlMutex<Vec<Vec<u8>>>>) {
            let sent = Arc::new(PlMutex::new(Vec::new()));
            (
                Recording {
                    max,
                    refuse_after: None,
                    current: Vec::new(),
                    sent: sent.clone(),
                },
                sent,
            )
        }
    }

    impl CommandSerializer for Recording {
        fn maximum_allocation_size(&self) -> usize {
            self.max
        }
        fn get_cmd_space(&mut self, size: usize) -> Option<&mut [u8]> {
            if let Some(limit) = self.refuse_after {
                if self.sent.lock().len() >= limit {
                    return None;
                }
            }
            if !self.current.is_empty() {
                let done = std::mem::take(&mut self.current);
                self.sent.lock().push(done);
            }
            self.current = vec![0; size];
            Some(self.current.as_mut_slice())
        }
        fn flush(&mut self) -> bool {
            if !self.current.is_empty() {
                let done = std::mem::take(&mut self.current);
                self.sent.lock().push(done);
            }
            true
        }
    }

    fn write_command(len: usize) -> Vec<u8> {
        let data: Vec<u8> = (0..len).map(|i| i as u8).collect();
        encode_to_vec(&Command::QueueWriteBuffer {
            queue: 1,
            buffer: 2,
            offset: 0,
            data: &data[..],
        })
    }

    #[test]
    fn test_small_command_single_allocation() {
        let (transport, sent) = Recording::new(1024);
        let serializer = ChunkedCommandSerializer::new(Box::new(transport));
        serializer
            .serialize_command(&Command::<&[u8]>::BufferUnmap { buffer: 1 })
            .unwrap();
        assert!(serializer.flush());
        assert_eq!(sent.lock().len(), 1);
    }

    #[test]
    fn test_large_command_is_chunked() {
        let bytes = write_command(100);
        let (transport, sent) = Recording::new(16);
        let serializer = ChunkedCommandSerializer::new(Box::new(transport));
        serializer.serialize_chunked_command(&bytes).unwrap();
        serializer.flush();
        let sent = sent.lock();
        assert!(sent.iter().all(|chunk| chunk.len() <= 16));
        assert_eq!(sent.concat(), bytes);
    }

    #[test]
    fn test_refused_chunk_aborts_rest() {
        let bytes = write_command(100);
        let (mut transport, sent) = Recording::new(16);
        transport.refuse_after = Some(2);
        let serializer = ChunkedCommandSerializer::new(Box::new(transport));
        assert_eq!(
            serializer.serialize_chunked_command(&bytes),
            Err(WireError::Transport(16))
        );
        serializer.flush();
        // The chunks that made it out are an untouched prefix.
        let sent = sent.lock().concat();
        assert!(bytes.starts_with(&sent));
        assert!(sent.len() < bytes.len());
    }

    #[test]
    fn test_disconnect_drops_later_commands() {
        let (transport, sent) = Recording::new(1024);
        let serializer = ChunkedCommandSerializer::new(Box::new(transport));
        serializer
            .serialize_command(&Command::<&[u8]>::BufferUnmap { buffer: 1 })
            .unwrap();
        serializer.disconnect();
        // Committed before the disconnect, so it was flushed on the way out.
        assert_eq!(sent.lock().len(), 1);

        serializer
            .serialize_command(&Command::<&[u8]>::BufferUnmap { buffer: 2 })
            .unwrap();
        assert!(!serializer.flush());
        assert_eq!(sent.lock().len(), 1);
    }

    #[test]
    fn test_disconnect_twice() {
        let (transport, sent) = Recording::new(1024);
        let serializer = ChunkedCommandSerializer::new(Box::new(transport));
        serializer.disconnect();
        serializer.disconnect();
        assert!(serializer.is_disconnected());
        assert!(serializer.serialize_chunked_command(&[1, 2, 3]).is_ok());
        assert!(sent.lock().is_empty());
    }

    #[test]
    fn test_threads_do_not_interleave_chunks() {
        let (transport, sent) = Recording::new(8);
        let serializer = Arc::new(ChunkedCommandSerializer::new(Box::new(transport)));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let serializer = serializer.clone();
                std::thread::spawn(move || {
                    let data = vec![t as u8; 40];
                    for _ in 0..10 {
                        serializer
                            .serialize_command(&Command::QueueWriteBuffer {
                                queue: t,
                                buffer: t,
                                offset: 0,
                                data: &data[..],
                            })
                            .unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        serializer.flush();

        let stream = sent.lock().concat();
        let mut allocator = crate::deserialize_allocator::DeserializeAllocator::new(64, 1024);
        let mut rest = &stream[..];
        let mut commands = 0;
        while !rest.is_empty() {
            let size = crate::protocol::peek_command_size(rest).unwrap() as usize;
            let Command::QueueWriteBuffer { queue, data, .. } =
                Command::decode(&rest[..size], &mut allocator).unwrap()
            else {
                panic!("unexpected command");
            };
            assert!(allocator.bytes(&data).unwrap().iter().all(|b| *b == queue as u8));
            allocator.reset();
            rest = &rest[size..];
            commands += 1;
        }
        assert_eq!(commands, 40);
    }
}
