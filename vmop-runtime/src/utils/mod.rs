//! Helpers shared by the runtime's long-running tasks

mod backoff;
mod stream_backoff;

pub use backoff::{retry_backoff, ResettableBackoff, ResettableBackoffWrapper, MAX_RETRY_DELAY, MIN_RETRY_DELAY};
pub use stream_backoff::StreamBackoff;

use futures::{Future, FutureExt};
use std::{pin::Pin, task::Poll};
use tokio::{runtime::Handle, task::JoinHandle};

/// A [`JoinHandle`] that cancels the [`Future`] when dropped, rather than detaching it
#[derive(Debug)]
pub struct CancelableJoinHandle<T> {
    inner: JoinHandle<T>,
}

impl<T> CancelableJoinHandle<T>
where
    T: Send + 'static,
{
    /// Spawn `future` onto `runtime`
    pub fn spawn(future: impl Future<Output = T> + Send + 'static, runtime: &Handle) -> Self {
        CancelableJoinHandle {
            inner: runtime.spawn(future),
        }
    }
}

impl<T> Drop for CancelableJoinHandle<T> {
    fn drop(&mut self) {
        self.inner.abort()
    }
}

impl<T> Future for CancelableJoinHandle<T> {
    type Output = T;

    fn poll(mut self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx).map(|result| match result {
            Ok(output) => output,
            // only aborted on drop, so this can only be a panic
            Err(err) => std::panic::resume_unwind(err.into_panic()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::CancelableJoinHandle;
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        time::Duration,
    };
    use tokio::runtime::Handle;

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_cancels_the_task() {
        let finished = Arc::new(AtomicBool::new(false));
        let flag = finished.clone();
        let handle = CancelableJoinHandle::spawn(
            async move {
                tokio::time::sleep(Duration::from_secs(60)).await;
                flag.store(true, Ordering::SeqCst);
            },
            &Handle::current(),
        );
        drop(handle);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn awaiting_the_handle_returns_the_output() {
        let handle = CancelableJoinHandle::spawn(async { 42 }, &Handle::current());
        assert_eq!(handle.await, 42);
    }
}
