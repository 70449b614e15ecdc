// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! Outstanding requests, keyed by the future id sent with them.
//!
//! An entry moves through three states: waiting for the server, resolved (reply received,
//! delivery queued), and gone.  A request can also be rejected locally while waiting, for
//! example when its buffer is unmapped; the entry then stays behind without a callback so
//! the server's eventual reply is recognised and dropped.

use super::buffer::BufferInner;
use super::device::Device;
use super::instance::Adapter;
use crate::deserialize_allocator::{Allocation, DeserializeAllocator};
use crate::error::{BackendError, ErrorType, MapAsyncError, RequestError, WireError};
use crate::handle::{FutureId, ObjectHandle};
use crate::types::{AdapterInfo, MapAsyncStatus, PopErrorScopeStatus, RequestStatus};
use std::collections::HashMap;
use std::sync::Arc;

pub(super) type AdapterCallback = Box<dyn FnOnce(Result<Adapter, RequestError>) + Send>;
pub(super) type DeviceCallback = Box<dyn FnOnce(Result<Device, RequestError>) + Send>;
pub(super) type MapCallback = Box<dyn FnOnce(Result<(), MapAsyncError>) + Send>;
pub(super) type WorkDoneCallback = Box<dyn FnOnce(Result<(), RequestError>) + Send>;
pub(super) type PopErrorScopeCallback =
    Box<dyn FnOnce(Result<Option<BackendError>, RequestError>) + Send>;

/// What a request is waiting for, and who to tell.
pub(super) enum EventKind {
    RequestAdapter {
        adapter: Adapter,
        callback: AdapterCallback,
    },
    RequestDevice {
        device: Device,
        callback: DeviceCallback,
    },
    MapAsync {
        buffer: Arc<BufferInner>,
        callback: MapCallback,
    },
    WorkDone {
        callback: WorkDoneCallback,
    },
    PopErrorScope {
        callback: PopErrorScopeCallback,
    },
}

/// A server reply, stripped of its future id.
#[derive(Debug)]
pub(super) enum Outcome {
    Adapter {
        status: RequestStatus,
        message: String,
        info: AdapterInfo,
    },
    Device {
        status: RequestStatus,
        message: String,
    },
    Map {
        buffer: ObjectHandle,
        status: MapAsyncStatus,
        message: String,
        data: Allocation,
    },
    WorkDone {
        status: RequestStatus,
    },
    PopErrorScope {
        status: PopErrorScopeStatus,
        error_type: Option<ErrorType>,
        message: String,
    },
}

fn request_result(status: RequestStatus, message: String) -> Result<(), RequestError> {
    match status {
        RequestStatus::Success => Ok(()),
        RequestStatus::Unavailable => Err(RequestError::Unavailable(message)),
        RequestStatus::Error => Err(RequestError::Backend(message)),
    }
}

fn map_error(status: MapAsyncStatus, message: String) -> MapAsyncError {
    match status {
        MapAsyncStatus::DestroyedBeforeCallback => MapAsyncError::DestroyedBeforeCallback,
        MapAsyncStatus::UnmappedBeforeCallback => MapAsyncError::UnmappedBeforeCallback,
        MapAsyncStatus::DeviceLost => MapAsyncError::DeviceLost,
        MapAsyncStatus::Success | MapAsyncStatus::ValidationError => {
            MapAsyncError::Validation(message)
        }
    }
}

impl EventKind {
    fn name(&self) -> &'static str {
        match self {
            EventKind::RequestAdapter { .. } => "request adapter",
            EventKind::RequestDevice { .. } => "request device",
            EventKind::MapAsync { .. } => "map async",
            EventKind::WorkDone { .. } => "work done",
            EventKind::PopErrorScope { .. } => "pop error scope",
        }
    }

    /// Whether `outcome` is a reply to this kind of request.
    pub(super) fn matches(&self, outcome: &Outcome) -> bool {
        match (self, outcome) {
            (EventKind::RequestAdapter { .. }, Outcome::Adapter { .. })
            | (EventKind::RequestDevice { .. }, Outcome::Device { .. })
            | (EventKind::WorkDone { .. }, Outcome::WorkDone { .. })
            | (EventKind::PopErrorScope { .. }, Outcome::PopErrorScope { .. }) => true,
            (EventKind::MapAsync { buffer, .. }, Outcome::Map { buffer: replied, .. }) => {
                buffer.handle() == *replied
            }
            _ => false,
        }
    }

    /// Resolves the request with a connection-lost error.  Runs with no lock held.
    pub(super) fn fail(self, future: FutureId) {
        match self {
            EventKind::RequestAdapter { adapter, callback } => {
                drop(adapter);
                callback(Err(RequestError::ConnectionLost));
            }
            EventKind::RequestDevice { device, callback } => {
                drop(device);
                callback(Err(RequestError::ConnectionLost));
            }
            kind @ EventKind::MapAsync { .. } => kind.fail_map(future, MapAsyncError::ConnectionLost),
            EventKind::WorkDone { callback } => callback(Err(RequestError::ConnectionLost)),
            EventKind::PopErrorScope { callback } => callback(Err(RequestError::ConnectionLost)),
        }
    }

    /// Resolves a map request with `error`.  Other kinds fail as if the connection dropped.
    /// Runs with no lock held.
    pub(super) fn fail_map(self, future: FutureId, error: MapAsyncError) {
        match self {
            EventKind::MapAsync { buffer, callback } => {
                buffer.clear_pending(future);
                callback(Err(error));
            }
            other => other.fail(future),
        }
    }

    /// Turns the reply into a closure that delivers it.
    ///
    /// Runs under the client lock: everything that touches user code or drops a proxy is
    /// deferred into the returned closure.
    pub(super) fn complete(
        self,
        future: FutureId,
        outcome: Outcome,
        allocator: &DeserializeAllocator,
    ) -> Box<dyn FnOnce() + Send> {
        match (self, outcome) {
            (
                EventKind::RequestAdapter { adapter, callback },
                Outcome::Adapter {
                    status,
                    message,
                    info,
                },
            ) => Box::new(move || match request_result(status, message) {
                Ok(()) => {
                    adapter.set_info(info);
                    callback(Ok(adapter));
                }
                Err(error) => {
                    drop(adapter);
                    callback(Err(error));
                }
            }),
            (EventKind::RequestDevice { device, callback }, Outcome::Device { status, message }) => {
                Box::new(move || match request_result(status, message) {
                    Ok(()) => callback(Ok(device)),
                    Err(error) => {
                        drop(device);
                        callback(Err(error));
                    }
                })
            }
            (
                EventKind::MapAsync { buffer, callback },
                Outcome::Map {
                    status,
                    message,
                    data,
                    ..
                },
            ) => {
                let result = match status {
                    MapAsyncStatus::Success => match allocator.bytes(&data) {
                        Some(bytes) => Ok(bytes.to_vec()),
                        None => Err(MapAsyncError::Validation(
                            "mapped data is no longer available".to_owned(),
                        )),
                    },
                    status => Err(map_error(status, message)),
                };
                Box::new(move || {
                    let result = buffer.finish_map(future, result);
                    callback(result);
                })
            }
            (EventKind::WorkDone { callback }, Outcome::WorkDone { status }) => {
                Box::new(move || {
                    callback(request_result(status, "submitted work failed".to_owned()))
                })
            }
            (
                EventKind::PopErrorScope { callback },
                Outcome::PopErrorScope {
                    status,
                    error_type,
                    message,
                },
            ) => {
                let result = match (status, error_type) {
                    (PopErrorScopeStatus::EmptyStack, _) => Err(RequestError::EmptyScope),
                    (PopErrorScopeStatus::Success, None) => Ok(None),
                    (PopErrorScopeStatus::Success, Some(error_type)) => {
                        Ok(Some(BackendError::new(error_type, message)))
                    }
                };
                Box::new(move || callback(result))
            }
            // `resolve` refuses mismatched replies, so this only happens if that check is
            // bypassed.  Fail the request rather than lose it.
            (kind, outcome) => {
                tracing::error!(kind = kind.name(), ?outcome, "reply does not match request");
                Box::new(move || kind.fail(future))
            }
        }
    }
}

struct Entry {
    /// `None` once rejected locally.
    kind: Option<EventKind>,
    outcome: Option<Outcome>,
}

pub(super) enum Resolution {
    /// Queue delivery.
    Ready,
    /// The request was already answered locally; the reply is dropped.
    Retired,
}

pub(super) struct EventManager {
    next_serial: u64,
    entries: HashMap<FutureId, Entry>,
}

impl EventManager {
    pub(super) fn new() -> Self {
        EventManager {
            next_serial: 0,
            entries: HashMap::new(),
        }
    }

    /// A future id never handed out before.  Serials start at 1.
    pub(super) fn next_future(&mut self) -> FutureId {
        self.next_serial += 1;
        FutureId::new(self.next_serial)
    }

    pub(super) fn track(&mut self, future: FutureId, kind: EventKind) {
        self.entries.insert(
            future,
            Entry {
                kind: Some(kind),
                outcome: None,
            },
        );
    }

    /// Records the server's reply to `future`.
    ///
    /// A reply for a future that was never issued, was already answered, or whose kind does
    /// not fit the request is a protocol error.
    pub(super) fn resolve(
        &mut self,
        future: FutureId,
        outcome: Outcome,
    ) -> Result<Resolution, WireError> {
        let Some(entry) = self.entries.get_mut(&future) else {
            return Err(WireError::UnknownFuture(future));
        };
        if entry.outcome.is_some() {
            return Err(WireError::UnknownFuture(future));
        }
        if entry.kind.is_none() {
            self.entries.remove(&future);
            tracing::debug!(%future, "reply to a request already answered locally");
            return Ok(Resolution::Retired);
        }
        if !entry.kind.as_ref().is_some_and(|kind| kind.matches(&outcome)) {
            return Err(WireError::InvalidState("reply does not match the request"));
        }
        entry.outcome = Some(outcome);
        Ok(Resolution::Ready)
    }

    /// Removes a resolved entry for delivery.  `None` if it was rejected in the meantime,
    /// in which case the entry is gone too.
    pub(super) fn take(&mut self, future: FutureId) -> Option<(EventKind, Outcome)> {
        let entry = self.entries.get(&future)?;
        if entry.kind.is_some() && entry.outcome.is_none() {
            return None;
        }
        let entry = self.entries.remove(&future)?;
        Some((entry.kind?, entry.outcome?))
    }

    /// Answers `future` locally.  Returns its kind, so the caller can deliver the error,
    /// unless the request was already answered.
    pub(super) fn reject(&mut self, future: FutureId) -> Option<EventKind> {
        // A resolved entry stays behind; `take` finds no kind and cleans it up.
        self.entries.get_mut(&future)?.kind.take()
    }

    /// Removes every request still waiting on the server.  Resolved requests stay and are
    /// delivered normally.
    pub(super) fn take_unresolved(&mut self) -> Vec<(FutureId, Option<EventKind>)> {
        let waiting: Vec<FutureId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.outcome.is_none())
            .map(|(future, _)| *future)
            .collect();
        let mut out: Vec<(FutureId, Option<EventKind>)> = waiting
            .into_iter()
            .filter_map(|future| {
                self.entries
                    .remove(&future)
                    .map(|entry| (future, entry.kind))
            })
            .collect();
        out.sort_by_key(|(future, _)| *future);
        out
    }

    pub(super) fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn work_done(log: &Arc<Mutex<Vec<Result<(), RequestError>>>>) -> EventKind {
        let log = log.clone();
        EventKind::WorkDone {
            callback: Box::new(move |result| log.lock().unwrap().push(result)),
        }
    }

    fn allocator() -> DeserializeAllocator {
        DeserializeAllocator::new(64, 1 << 20)
    }

    #[test]
    fn test_serials_start_at_one() {
        let mut events = EventManager::new();
        assert_eq!(events.next_future(), FutureId::new(1));
        assert_eq!(events.next_future(), FutureId::new(2));
    }

    #[test]
    fn test_resolve_then_take_delivers() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut events = EventManager::new();
        let future = events.next_future();
        events.track(future, work_done(&log));
        assert!(events.take(future).is_none());

        let status = RequestStatus::Success;
        assert!(matches!(
            events.resolve(future, Outcome::WorkDone { status }),
            Ok(Resolution::Ready)
        ));
        let (kind, outcome) = events.take(future).unwrap();
        kind.complete(future, outcome, &allocator())();
        assert_eq!(*log.lock().unwrap(), vec![Ok(())]);
        assert_eq!(events.len(), 0);
    }

    #[test]
    fn test_unknown_and_duplicate_replies_are_errors() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut events = EventManager::new();
        let status = RequestStatus::Success;
        assert_eq!(
            events
                .resolve(FutureId::new(9), Outcome::WorkDone { status })
                .err(),
            Some(WireError::UnknownFuture(FutureId::new(9)))
        );

        let future = events.next_future();
        events.track(future, work_done(&log));
        assert!(events.resolve(future, Outcome::WorkDone { status }).is_ok());
        assert_eq!(
            events.resolve(future, Outcome::WorkDone { status }).err(),
            Some(WireError::UnknownFuture(future))
        );
    }

    #[test]
    fn test_reply_of_wrong_kind_is_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut events = EventManager::new();
        let future = events.next_future();
        events.track(future, work_done(&log));
        let reply = Outcome::Device {
            status: RequestStatus::Success,
            message: String::new(),
        };
        assert!(matches!(
            events.resolve(future, reply),
            Err(WireError::InvalidState(_))
        ));
    }

    #[test]
    fn test_rejected_request_retires_its_reply() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut events = EventManager::new();
        let future = events.next_future();
        events.track(future, work_done(&log));
        let kind = events.reject(future).unwrap();
        kind.fail(future);
        assert_eq!(*log.lock().unwrap(), vec![Err(RequestError::ConnectionLost)]);
        assert!(events.reject(future).is_none());

        let status = RequestStatus::Success;
        assert!(matches!(
            events.resolve(future, Outcome::WorkDone { status }),
            Ok(Resolution::Retired)
        ));
        assert_eq!(events.len(), 0);
    }

    #[test]
    fn test_take_unresolved_keeps_resolved_entries() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut events = EventManager::new();
        let answered = events.next_future();
        let waiting = events.next_future();
        events.track(answered, work_done(&log));
        events.track(waiting, work_done(&log));
        let status = RequestStatus::Error;
        events
            .resolve(answered, Outcome::WorkDone { status })
            .unwrap();

        let unresolved = events.take_unresolved();
        assert_eq!(unresolved.len(), 1);
        assert_eq!(unresolved[0].0, waiting);
        assert_eq!(events.len(), 1);
        assert!(events.take(answered).is_some());
    }

    #[test]
    fn test_pop_error_scope_outcomes() {
        let results = Arc::new(Mutex::new(Vec::new()));
        let allocator = allocator();
        let cases = [
            (PopErrorScopeStatus::EmptyStack, None),
            (PopErrorScopeStatus::Success, None),
            (PopErrorScopeStatus::Success, Some(ErrorType::Validation)),
        ];
        for (status, error_type) in cases {
            let results = results.clone();
            let kind = EventKind::PopErrorScope {
                callback: Box::new(move |result| results.lock().unwrap().push(result)),
            };
            let outcome = Outcome::PopErrorScope {
                status,
                error_type,
                message: "bad".to_owned(),
            };
            kind.complete(FutureId::new(1), outcome, &allocator)();
        }
        assert_eq!(
            *results.lock().unwrap(),
            vec![
                Err(RequestError::EmptyScope),
                Ok(None),
                Ok(Some(BackendError::validation("bad"))),
            ]
        );
    }
}
