//! Results of asynchronous operations.
use futures_core::ready;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use crate::{Error, Result};

/// Future result of an operation on a [`Session`][crate::Session] or a
/// [`Channel`][crate::Channel].
///
/// The promise is settled exactly once by the session, with either a value or an [`Error`]. If
/// the session fails, every pending promise is settled with the error that closed the session.
///
/// You can `.await` the promise directly, wait for it with a [timeout][Self::wait_timeout()] or
/// [detach][Self::detach()] from it. Neither a timeout nor detaching cancels the protocol exchange
/// that is in flight; they only stop *you* from waiting for its result.
#[derive(Debug)]
#[must_use = "the operation continues even if you don't await its result"]
pub struct Promise<T> {
    state: PromiseState<T>,
}

#[derive(Debug)]
enum PromiseState<T> {
    Waiting(oneshot::Receiver<Result<T>>),
    Ready(Option<Result<T>>),
}

/// The sending half of a [`Promise`], held by the session.
#[derive(Debug)]
pub(crate) struct Resolver<T> {
    tx: oneshot::Sender<Result<T>>,
}

impl<T> Promise<T> {
    pub(crate) fn new() -> (Resolver<T>, Promise<T>) {
        let (tx, rx) = oneshot::channel();
        (Resolver { tx }, Promise { state: PromiseState::Waiting(rx) })
    }

    pub(crate) fn ready(result: Result<T>) -> Promise<T> {
        Promise { state: PromiseState::Ready(Some(result)) }
    }

    /// Waits for the result, but at most for `timeout`.
    ///
    /// Returns [`Error::Timeout`] if the result did not arrive in time. The operation itself
    /// continues and its result is discarded.
    pub async fn wait_timeout(self, timeout: Duration) -> Result<T> {
        match tokio::time::timeout(timeout, self).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    /// Returns the result if the promise is already settled, without waiting.
    ///
    /// After this method returns `Some`, the promise must not be polled again.
    pub fn try_result(&mut self) -> Option<Result<T>> {
        match &mut self.state {
            PromiseState::Waiting(rx) => match rx.try_recv() {
                Ok(result) => Some(result),
                Err(oneshot::error::TryRecvError::Empty) => None,
                Err(oneshot::error::TryRecvError::Closed) => Some(Err(Error::Aborted)),
            },
            PromiseState::Ready(result) => result.take(),
        }
    }

    /// Stops waiting for the result.
    ///
    /// The operation is not cancelled: the session still finishes the protocol exchange, but the
    /// result is dropped.
    pub fn detach(self) {}
}

impl<T> Future for Promise<T> {
    type Output = Result<T>;
    fn poll(self: Pin<&mut Self>, cx: &mut Context) -> Poll<Result<T>> {
        let this = self.get_mut();
        match &mut this.state {
            PromiseState::Waiting(rx) => Poll::Ready(match ready!(Pin::new(rx).poll(cx)) {
                Ok(result) => result,
                Err(_) => Err(Error::Aborted),
            }),
            PromiseState::Ready(result) =>
                Poll::Ready(result.take().unwrap_or(Err(Error::Aborted))),
        }
    }
}

impl<T> Resolver<T> {
    /// Settles the promise. The value is dropped if nobody is waiting any more.
    pub fn resolve(self, result: Result<T>) {
        let _: std::result::Result<_, _> = self.tx.send(result);
    }

    pub fn is_waiting(&self) -> bool {
        !self.tx.is_closed()
    }
}

impl<T> Unpin for Promise<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve() {
        let (resolver, promise) = Promise::new();
        resolver.resolve(Ok(42));
        assert_eq!(promise.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_dropped_resolver() {
        let (resolver, promise) = Promise::<u32>::new();
        drop(resolver);
        assert!(matches!(promise.await, Err(Error::Aborted)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_does_not_cancel() {
        let (resolver, promise) = Promise::<u32>::new();
        let res = promise.wait_timeout(Duration::from_secs(5)).await;
        assert!(matches!(res, Err(Error::Timeout)));
        assert!(!resolver.is_waiting());
        resolver.resolve(Ok(1));
    }

    #[test]
    fn test_try_result() {
        let (resolver, mut promise) = Promise::new();
        assert!(promise.try_result().is_none());
        resolver.resolve(Ok("done"));
        assert_eq!(promise.try_result().unwrap().unwrap(), "done");

        let mut promise = Promise::ready(Err::<(), _>(Error::ChannelClosed));
        assert!(matches!(promise.try_result(), Some(Err(Error::ChannelClosed))));
    }

    #[test]
    fn test_detach() {
        let (resolver, promise) = Promise::<()>::new();
        assert!(resolver.is_waiting());
        promise.detach();
        assert!(!resolver.is_waiting());
        resolver.resolve(Ok(()));
    }
}
