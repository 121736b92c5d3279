use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use cds_core::error::{CdsError, Result};
use tokio::sync::oneshot;

/// Create a connected handle/future pair.
pub fn result_channel<T>() -> (ResultHandle<T>, ResultFuture<T>) {
    let (tx, rx) = oneshot::channel();
    (ResultHandle { tx }, ResultFuture { rx })
}

/// Write side, owned by the executor.
///
/// `complete` consumes the handle, so a value can be assigned at most once.
#[derive(Debug)]
pub struct ResultHandle<T> {
    tx: oneshot::Sender<T>,
}

impl<T> ResultHandle<T> {
    /// Deliver the workflow output. Returns false if nobody is waiting anymore.
    pub fn complete(self, value: T) -> bool {
        self.tx.send(value).is_ok()
    }

    /// Whether the waiting side has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Read side, awaited by the caller.
///
/// Resolves to the workflow output. The only error is
/// [`CdsError::ResultAbandoned`], when the handle was dropped uncompleted.
#[derive(Debug)]
pub struct ResultFuture<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for ResultFuture<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| CdsError::ResultAbandoned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_complete_then_await() {
        let (handle, future) = result_channel();
        assert!(handle.complete("done"));
        assert_eq!(future.await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_complete_from_another_task() {
        let (handle, future) = result_channel::<u32>();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            handle.complete(7);
        });
        assert_eq!(future.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_dropped_handle_is_reported() {
        let (handle, future) = result_channel::<String>();
        drop(handle);
        assert!(matches!(future.await, Err(CdsError::ResultAbandoned)));
    }

    #[test]
    fn test_complete_without_waiter() {
        let (handle, future) = result_channel();
        drop(future);
        assert!(handle.is_closed());
        assert!(!handle.complete(1));
    }
}
