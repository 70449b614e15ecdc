// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Receiving side of chunking.
//!
//! The transport delivers bytes in whatever pieces it likes.  A piece can hold several
//! whole commands, the tail of one command, or only part of a header.  The handler keeps the
//! unfinished command between calls and hands complete commands, one at a time, to the
//! decode loop.  Nothing above this layer ever sees a chunk boundary.

use crate::error::{DecodeError, WireError};
use crate::protocol::{HEADER_SIZE, SIZE_FIELD, peek_command_size};

#[derive(Debug)]
pub struct ChunkedCommandHandler {
    partial: Vec<u8>,
    expected: Option<usize>,
    max_command_size: usize,
}

impl ChunkedCommandHandler {
    pub fn new(max_command_size: usize) -> Self {
        ChunkedCommandHandler {
            partial: Vec::new(),
            expected: None,
            max_command_size,
        }
    }

    /// Feeds `bytes` in, calling `on_command` with each command that becomes complete.
    ///
    /// Stops at the first error, from either framing or `on_command`.
    pub fn handle_bytes(
        &mut self,
        mut bytes: &[u8],
        mut on_command: impl FnMut(&[u8]) -> Result<(), WireError>,
    ) -> Result<(), WireError> {
        while !bytes.is_empty() {
            if self.partial.is_empty() {
                if let Some(size) = peek_command_size(bytes) {
                    let size = self.check_size(size)?;
                    if bytes.len() >= size {
                        on_command(&bytes[..size])?;
                        bytes = &bytes[size..];
                        continue;
                    }
                }
            }

            let wanted = self.expected.unwrap_or(SIZE_FIELD) - self.partial.len();
            let take = wanted.min(bytes.len());
            if self.partial.try_reserve(take).is_err() {
                return Err(WireError::OutOfMemory(take as u64));
            }
            self.partial.extend_from_slice(&bytes[..take]);
            bytes = &bytes[take..];

            match self.expected {
                None => {
                    if let Some(size) = peek_command_size(&self.partial) {
                        let size = self.check_size(size)?;
                        if self.partial.try_reserve_exact(size - self.partial.len()).is_err() {
                            return Err(WireError::OutOfMemory(size as u64));
                        }
                        self.expected = Some(size);
                    }
                }
                Some(size) if self.partial.len() == size => {
                    let command = std::mem::take(&mut self.partial);
                    self.expected = None;
                    on_command(&command)?;
                }
                Some(_) => {}
            }
        }
        Ok(())
    }

    fn check_size(&self, size: u64) -> Result<usize, WireError> {
        match usize::try_from(size) {
            Ok(size) if size >= HEADER_SIZE && size <= self.max_command_size => Ok(size),
            _ => Err(DecodeError::BadCommandSize(size).into()),
        }
    }

    /// Whether a command is partially received.
    pub fn has_partial_command(&self) -> bool {
        !self.partial.is_empty()
    }

    /// Forgets any partially received command.
    pub fn clear(&mut self) {
        self.partial = Vec::new();
        self.expected = None;
    }
}
