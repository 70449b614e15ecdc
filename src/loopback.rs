// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
/*!
Client and server in one process.

[`BufferedTransport`] is a [`CommandSerializer`] that collects flushed bytes in memory; its
[`TransportHandle`] lets the other side take them.  [`WireHelper`] wires a [`WireClient`] and a
[`WireServer`] (backed by [`SoftwareProcs`]) together through a pair of these, and moves
bytes only when asked, so tests decide exactly when each side sees the other's commands.

```
use gpu_wire::loopback::WireHelper;
use gpu_wire::RequestAdapterOptions;

let wire = WireHelper::new().unwrap();
let adapter = wire.instance().request_adapter(&RequestAdapterOptions::default());
wire.round_trip().unwrap();
let adapter = futures::executor::block_on(adapter).unwrap();
assert!(!adapter.handle().is_null());
```
*/

use crate::client::{Instance, WireClient};
use crate::config::WireDescriptor;
use crate::error::WireError;
use crate::imp::{SoftwareOptions, SoftwareProcs};
use crate::procs::ProcTable;
use crate::serializer::CommandSerializer;
use crate::server::WireServer;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Arc;

/// Allocation size used by [`WireHelper::new`].
pub const DEFAULT_TRANSPORT_CAPACITY: usize = 64 * 1024;

#[derive(Debug, Default)]
struct MessageQueue {
    messages: VecDeque<Vec<u8>>,
    closed: bool,
}

/// In-memory sending end.  Each flush (or allocation that would overflow the capacity)
/// becomes one message.
#[derive(Debug)]
pub struct BufferedTransport {
    capacity: usize,
    current: Vec<u8>,
    queue: Arc<Mutex<MessageQueue>>,
}

/// Receiving end of a [`BufferedTransport`].
#[derive(Debug, Clone)]
pub struct TransportHandle {
    queue: Arc<Mutex<MessageQueue>>,
}

impl BufferedTransport {
    /// A transport whose messages never exceed `capacity` bytes.
    pub fn new(capacity: usize) -> (BufferedTransport, TransportHandle) {
        let queue = Arc::new(Mutex::new(MessageQueue::default()));
        (
            BufferedTransport {
                capacity,
                current: Vec::new(),
                queue: queue.clone(),
            },
            TransportHandle { queue },
        )
    }

    fn commit(&mut self) {
        if !self.current.is_empty() {
            let message = std::mem::take(&mut self.current);
            self.queue.lock().messages.push_back(message);
        }
    }
}

impl CommandSerializer for BufferedTransport {
    fn maximum_allocation_size(&self) -> usize {
        self.capacity
    }

    fn get_cmd_space(&mut self, size: usize) -> Option<&mut [u8]> {
        if size > self.capacity || self.queue.lock().closed {
            return None;
        }
        if self.current.len() + size > self.capacity {
            self.commit();
        }
        let start = self.current.len();
        self.current.resize(start + size, 0);
        Some(&mut self.current[start..])
    }

    fn flush(&mut self) -> bool {
        if self.queue.lock().closed {
            return false;
        }
        self.commit();
        true
    }
}

impl TransportHandle {
    /// Every message flushed so far, oldest first.
    pub fn take_messages(&self) -> Vec<Vec<u8>> {
        self.queue.lock().messages.drain(..).collect()
    }

    /// Makes the sending end refuse everything from now on, as a broken pipe would.
    pub fn close(&self) {
        self.queue.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.queue.lock().closed
    }
}

/// A connected client and server.
pub struct WireHelper {
    instance: Instance,
    client: WireClient,
    server: WireServer,
    procs: Arc<SoftwareProcs>,
    to_server: TransportHandle,
    to_client: TransportHandle,
}

impl WireHelper {
    pub fn new() -> Result<Self, WireError> {
        Self::with_options(
            SoftwareOptions::default(),
            WireDescriptor::default(),
            DEFAULT_TRANSPORT_CAPACITY,
        )
    }

    /// A pair whose transports split anything larger than `transport_capacity` into chunks.
    pub fn with_options(
        options: SoftwareOptions,
        descriptor: WireDescriptor,
        transport_capacity: usize,
    ) -> Result<Self, WireError> {
        let procs = Arc::new(SoftwareProcs::with_options(options));
        let (client_transport, to_server) = BufferedTransport::new(transport_capacity);
        let (server_transport, to_client) = BufferedTransport::new(transport_capacity);
        let client = WireClient::new(Box::new(client_transport), descriptor.clone());
        let server = WireServer::new(
            ProcTable::new(procs.clone()),
            Box::new(server_transport),
            descriptor,
        );
        let instance = client.reserve_instance();
        server.inject_instance(instance.handle(), procs.create_instance())?;
        tracing::debug!(instance = %instance.handle(), "loopback wire ready");
        Ok(WireHelper {
            instance,
            client,
            server,
            procs,
            to_server,
            to_client,
        })
    }

    pub fn client(&self) -> &WireClient {
        &self.client
    }

    pub fn server(&self) -> &WireServer {
        &self.server
    }

    pub fn procs(&self) -> &Arc<SoftwareProcs> {
        &self.procs
    }

    /// The instance reserved and injected at construction.
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// The client-to-server pipe.
    pub fn to_server(&self) -> &TransportHandle {
        &self.to_server
    }

    /// The server-to-client pipe.
    pub fn to_client(&self) -> &TransportHandle {
        &self.to_client
    }

    /// Delivers everything the client has sent to the server.
    pub fn flush_client(&self) -> Result<(), WireError> {
        self.client.flush();
        for message in self.to_server.take_messages() {
            self.server.handle_commands(&message)?;
        }
        Ok(())
    }

    /// Delivers everything the server has sent to the client.
    pub fn flush_server(&self) -> Result<(), WireError> {
        self.server.flush();
        for message in self.to_client.take_messages() {
            self.client.handle_commands(&message)?;
        }
        Ok(())
    }

    /// Client to server, backend events, server to client.
    pub fn round_trip(&self) -> Result<(), WireError> {
        self.flush_client()?;
        self.server.process_events();
        self.flush_server()
    }
}

impl Debug for WireHelper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireHelper")
            .field("client", &self.client)
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}
