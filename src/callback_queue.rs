// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Deferred completion callbacks.
//!
//! Code that holds a lock, or is halfway through mutating wire state, must not run user code.
//! It [`add`](CallbackQueue::add)s the work here instead, and the outermost caller
//! [`drain`](CallbackQueue::drain)s once it has let go.  A user callback is then free to call
//! back into the wire.
//!
//! Callbacks run in the order they were added.  Callbacks added while a drain is running are
//! run by that same drain before it returns, and a drain started from inside a callback (or
//! from another thread while one is running) leaves the work to the drain already in progress.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};

type Callback = Box<dyn FnOnce() + Send>;

pub struct CallbackQueue {
    queue: Mutex<VecDeque<Callback>>,
    draining: AtomicBool,
}

/// Clears the draining flag even if a callback panics.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl CallbackQueue {
    pub fn new() -> Self {
        CallbackQueue {
            queue: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
        }
    }

    pub fn add(&self, callback: impl FnOnce() + Send + 'static) {
        self.queue.lock().push_back(Box::new(callback));
    }

    /// Runs queued callbacks until the queue is empty.  Never runs a callback while the
    /// queue's own lock is held.
    pub fn drain(&self) {
        loop {
            if self
                .draining
                .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
                .is_err()
            {
                return;
            }
            {
                let _guard = DrainGuard(&self.draining);
                loop {
                    let next = self.queue.lock().pop_front();
                    match next {
                        Some(callback) => callback(),
                        None => break,
                    }
                }
            }
            // Work added between our last pop and clearing the flag would otherwise wait for
            // the next drain.
            if self.queue.lock().is_empty() {
                return;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl Default for CallbackQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Debug for CallbackQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackQueue")
            .field("pending", &self.len())
            .finish()
    }
}

impl Drop for CallbackQueue {
    fn drop(&mut self) {
        self.drain();
    }
}
