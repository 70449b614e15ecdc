// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! What every proxy shares.
//!
//! A proxy is a thin handle around an `Arc` of its inner state.  The `Arc` keeps memory alive;
//! the [`RefCount`] inside [`ObjectBase`] counts user-visible proxies, and when it reaches zero
//! the object is forgotten and the server is told to destroy it.  Internal bookkeeping (a
//! pending map holding its buffer, say) clones the `Arc` without touching the count.

use super::device::DeviceInner;
use super::{ClientInner, ClientState};
use crate::handle::{ObjectHandle, ObjectId, ObjectType};
use crate::object_allocator::ObjectAllocator;
use crate::protocol::Command;
use crate::refcount::RefCount;
use std::sync::{Arc, Weak};

pub(super) struct ObjectBase {
    handle: ObjectHandle,
    object_type: ObjectType,
    refcount: RefCount,
    client: Weak<ClientInner>,
}

impl ObjectBase {
    pub(super) fn new(client: &Arc<ClientInner>, object_type: ObjectType, handle: ObjectHandle) -> Self {
        ObjectBase {
            handle,
            object_type,
            refcount: RefCount::new(),
            client: Arc::downgrade(client),
        }
    }

    /// A proxy created after its client went away.  It has the null handle and never sends.
    pub(super) fn detached(object_type: ObjectType) -> Self {
        ObjectBase {
            handle: ObjectHandle::NULL,
            object_type,
            refcount: RefCount::new(),
            client: Weak::new(),
        }
    }

    pub(super) fn handle(&self) -> ObjectHandle {
        self.handle
    }

    pub(super) fn id(&self) -> ObjectId {
        self.handle.id
    }

    pub(super) fn client(&self) -> Option<Arc<ClientInner>> {
        self.client.upgrade()
    }

    /// Runs `f` under the client's state lock.  `None` if the client is gone.
    pub(super) fn with_client<R>(
        &self,
        f: impl FnOnce(&ClientInner, &mut ClientState) -> R,
    ) -> Option<R> {
        let client = self.client()?;
        Some(client.locked(|state| f(&client, state)))
    }

    pub(super) fn reference(&self) {
        self.refcount.reference();
    }

    pub(super) fn release(&self) -> bool {
        self.refcount.release()
    }
}

/// Implemented by each proxy's inner state.
pub(super) trait ProxyInner {
    fn base(&self) -> &ObjectBase;

    /// Runs under the client lock when the last proxy goes away, before the destroy command
    /// is sent.
    fn on_destroy(&self, _client: &ClientInner, _state: &mut ClientState) {}
}

/// Inner state of proxies that carry nothing beyond their identity.
pub(super) struct PlainInner {
    base: ObjectBase,
}

impl PlainInner {
    pub(super) fn new(base: ObjectBase) -> Arc<Self> {
        Arc::new(PlainInner { base })
    }
}

impl ProxyInner for PlainInner {
    fn base(&self) -> &ObjectBase {
        &self.base
    }
}

/// Forgets the object and tells the server.  Called once, on the final release.
pub(super) fn finalize(inner: &dyn ProxyInner) {
    if inner.base().handle.is_null() {
        return;
    }
    inner
        .base()
        .with_client(|client, state| finalize_locked(inner, client, state));
}

/// [`finalize`] for callers already holding the client lock.
pub(super) fn finalize_locked(inner: &dyn ProxyInner, client: &ClientInner, state: &mut ClientState) {
    let base = inner.base();
    if base.handle.is_null() {
        return;
    }
    inner.on_destroy(client, state);
    state.objects.table(base.object_type).free(base.handle);
    client.send(
        state,
        &Command::<&[u8]>::DestroyObject {
            object_type: base.object_type,
            object: base.handle,
        },
    );
}

/// Clone, drop and identity for a proxy type `$name { inner: Arc<$inner> }`.
macro_rules! proxy {
    ($name:ident, $inner:ty) => {
        impl Clone for $name {
            fn clone(&self) -> Self {
                self.inner.base().reference();
                $name {
                    inner: self.inner.clone(),
                }
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                if self.inner.base().release() {
                    let inner: &$inner = &self.inner;
                    $crate::client::objects::finalize(inner);
                }
            }
        }

        impl PartialEq for $name {
            fn eq(&self, other: &Self) -> bool {
                std::sync::Arc::ptr_eq(&self.inner, &other.inner)
            }
        }

        impl Eq for $name {}

        impl std::fmt::Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_tuple(stringify!($name))
                    .field(&self.inner.base().handle())
                    .finish()
            }
        }

        impl $name {
            /// The handle naming this object on both sides of the wire.
            pub fn handle(&self) -> $crate::handle::ObjectHandle {
                self.inner.base().handle()
            }
        }
    };
}

pub(super) use proxy;

/// What the client remembers per allocated id.  Only devices need to be found again from a
/// handle, when the server reports an error or a loss.
pub(super) enum Tracked {
    Plain,
    Device(Weak<DeviceInner>),
}

pub(super) struct ClientObjects {
    tables: [ObjectAllocator<Tracked>; ObjectType::ALL.len()],
}

impl ClientObjects {
    pub(super) fn new() -> Self {
        ClientObjects {
            tables: std::array::from_fn(|_| ObjectAllocator::new()),
        }
    }

    pub(super) fn table(&mut self, object_type: ObjectType) -> &mut ObjectAllocator<Tracked> {
        &mut self.tables[object_type as usize]
    }

    /// The live device behind `handle`.  Stale handles give `None`.
    pub(super) fn device(&self, handle: ObjectHandle) -> Option<Arc<DeviceInner>> {
        match self.tables[ObjectType::Device as usize].get_handle(handle)? {
            Tracked::Device(device) => device.upgrade(),
            Tracked::Plain => None,
        }
    }

    pub(super) fn devices(&self) -> Vec<Arc<DeviceInner>> {
        self.tables[ObjectType::Device as usize]
            .iter()
            .filter_map(|(_, tracked)| match tracked {
                Tracked::Device(device) => device.upgrade(),
                Tracked::Plain => None,
            })
            .collect()
    }
}
