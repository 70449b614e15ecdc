// SPDX-License-Identifier: Parity-7.0.0 OR PolyForm-Noncommercial-1.0.0
//! `Future` adapters over callback-style requests.

use crate::error::{MapAsyncError, RequestError};
use futures::channel::oneshot;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Errors that can stand for "the connection went away before an answer arrived".
pub trait ConnectionLost {
    fn connection_lost() -> Self;
}

impl ConnectionLost for RequestError {
    fn connection_lost() -> Self {
        RequestError::ConnectionLost
    }
}

impl ConnectionLost for MapAsyncError {
    fn connection_lost() -> Self {
        MapAsyncError::ConnectionLost
    }
}

/// The result of a request, available once the server's reply has been handled.
///
/// Nothing drives this future except [`WireClient::handle_commands`](crate::WireClient::handle_commands)
/// (or a disconnect), so polling it from the thread that feeds the client will wait forever.
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct WireFuture<T, E> {
    receiver: oneshot::Receiver<Result<T, E>>,
}

impl<T: Send + 'static, E: Send + 'static> WireFuture<T, E> {
    /// A future and the callback that completes it.
    pub(super) fn pending() -> (impl FnOnce(Result<T, E>) + Send + 'static, Self) {
        let (sender, receiver) = oneshot::channel();
        let complete = move |result: Result<T, E>| {
            // The caller may have stopped waiting.
            let _ = sender.send(result);
        };
        (complete, WireFuture { receiver })
    }
}

impl<T, E: ConnectionLost> Future for WireFuture<T, E> {
    type Output = Result<T, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.get_mut().receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The callback was dropped without running.
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(E::connection_lost())),
            Poll::Pending => Poll::Pending,
        }
    }
}
