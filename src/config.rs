// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Tunables shared by both ends of a connection.

/// Limits applied by a [`WireClient`](crate::WireClient) or [`WireServer`](crate::WireServer)
/// to what it receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireDescriptor {
    /// Bytes of deserialize scratch space allocated up front.
    pub inline_scratch_size: usize,
    /// Largest command, after reassembly, that the receiver will accept.
    pub max_command_size: usize,
    /// Cap on payload bytes kept alive for unresolved futures.
    pub max_future_data_size: usize,
}

impl Default for WireDescriptor {
    fn default() -> Self {
        WireDescriptor {
            inline_scratch_size: 2048,
            max_command_size: 64 << 20,
            max_future_data_size: 256 << 20,
        }
    }
}
