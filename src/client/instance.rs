// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Instances and adapters.

use super::device::Device;
use super::event_manager::EventKind;
use super::future::WireFuture;
use super::objects::{ObjectBase, PlainInner, ProxyInner, proxy};
use super::{ClientInner, ClientState};
use crate::error::RequestError;
use crate::handle::{FutureId, ObjectType};
use crate::protocol::Command;
use crate::types::{AdapterInfo, DeviceDescriptor, RequestAdapterOptions};
use parking_lot::Mutex;
use std::sync::Arc;

/// Entry point for adapter discovery.  Obtained from
/// [`WireClient::reserve_instance`](crate::WireClient::reserve_instance).
pub struct Instance {
    inner: Arc<PlainInner>,
}

proxy!(Instance, PlainInner);

impl Instance {
    pub(super) fn allocate(client: &Arc<ClientInner>, state: &mut ClientState) -> Instance {
        let handle = client.allocate_handle(state, ObjectType::Instance);
        Instance {
            inner: PlainInner::new(ObjectBase::new(client, ObjectType::Instance, handle)),
        }
    }

    /// Asks the server for an adapter.  `callback` runs once the reply has been handled.
    ///
    /// The adapter's id is allocated now; if the request fails the id is released again.
    pub fn request_adapter_with_callback(
        &self,
        options: &RequestAdapterOptions,
        callback: impl FnOnce(Result<Adapter, RequestError>) + Send + 'static,
    ) -> FutureId {
        let Some(client) = self.inner.base().client() else {
            callback(Err(RequestError::ConnectionLost));
            return FutureId::new(0);
        };
        client.locked(|state| {
            let adapter = Adapter::allocate(&client, state);
            let handle = adapter.handle();
            let future = client.track(
                state,
                EventKind::RequestAdapter {
                    adapter,
                    callback: Box::new(callback),
                },
            );
            client.send(
                state,
                &Command::<&[u8]>::InstanceRequestAdapter {
                    instance: self.inner.base().id(),
                    future,
                    adapter: handle,
                    options: options.clone(),
                },
            );
            future
        })
    }

    pub fn request_adapter(
        &self,
        options: &RequestAdapterOptions,
    ) -> WireFuture<Adapter, RequestError> {
        let (complete, future) = WireFuture::pending();
        self.request_adapter_with_callback(options, complete);
        future
    }

    /// Asks the server to let its backend deliver finished work.
    pub fn process_events(&self) {
        self.inner.base().with_client(|client, state| {
            client.send(
                state,
                &Command::<&[u8]>::InstanceProcessEvents {
                    instance: self.inner.base().id(),
                },
            );
        });
    }
}

pub(super) struct AdapterInner {
    base: ObjectBase,
    info: Mutex<AdapterInfo>,
}

impl ProxyInner for AdapterInner {
    fn base(&self) -> &ObjectBase {
        &self.base
    }
}

/// A physical (or software) GPU offered by the server.
pub struct Adapter {
    inner: Arc<AdapterInner>,
}

proxy!(Adapter, AdapterInner);

impl Adapter {
    fn allocate(client: &Arc<ClientInner>, state: &mut ClientState) -> Adapter {
        let handle = client.allocate_handle(state, ObjectType::Adapter);
        Adapter {
            inner: Arc::new(AdapterInner {
                base: ObjectBase::new(client, ObjectType::Adapter, handle),
                info: Mutex::new(AdapterInfo::default()),
            }),
        }
    }

    pub(super) fn set_info(&self, info: AdapterInfo) {
        *self.inner.info.lock() = info;
    }

    /// What the server said about this adapter.
    pub fn info(&self) -> AdapterInfo {
        self.inner.info.lock().clone()
    }

    /// Asks the server for a device and its default queue.
    pub fn request_device_with_callback(
        &self,
        descriptor: &DeviceDescriptor,
        callback: impl FnOnce(Result<Device, RequestError>) + Send + 'static,
    ) -> FutureId {
        let Some(client) = self.inner.base().client() else {
            callback(Err(RequestError::ConnectionLost));
            return FutureId::new(0);
        };
        client.locked(|state| {
            let device = Device::allocate(&client, state);
            let (device_handle, queue_handle) = (device.handle(), device.queue_handle());
            let future = client.track(
                state,
                EventKind::RequestDevice {
                    device,
                    callback: Box::new(callback),
                },
            );
            client.send(
                state,
                &Command::<&[u8]>::AdapterRequestDevice {
                    adapter: self.inner.base().id(),
                    future,
                    device: device_handle,
                    queue: queue_handle,
                    descriptor: descriptor.clone(),
                },
            );
            future
        })
    }

    pub fn request_device(&self, descriptor: &DeviceDescriptor) -> WireFuture<Device, RequestError> {
        let (complete, future) = WireFuture::pending();
        self.request_device_with_callback(descriptor, complete);
        future
    }
}
