use crate::scheduler::{ScheduleRequest, Scheduler};
use futures::{Future, FutureExt, Stream};
use pin_project::pin_project;
use std::{
    collections::HashMap,
    pin::Pin,
    task::{Context, Poll},
};
use vmop_core::ResourceKey;

/// Reconciles that are running right now, at most one per key
struct InFlight<F> {
    running: HashMap<ResourceKey, F>,
    /// `0` means unbounded
    limit: usize,
}

impl<F: Future + Unpin> InFlight<F> {
    fn new(limit: usize) -> Self {
        Self {
            running: HashMap::new(),
            limit,
        }
    }

    fn is_full(&self) -> bool {
        self.limit > 0 && self.running.len() >= self.limit
    }

    fn is_running(&self, key: &ResourceKey) -> bool {
        self.running.contains_key(key)
    }

    fn start(&mut self, key: ResourceKey, reconcile: F) {
        let previous = self.running.insert(key, reconcile);
        debug_assert!(previous.is_none(), "started a key that was still running");
    }

    /// Poll every running reconcile, yielding the output of the first that finished
    ///
    /// `Ready(None)` means nothing is running.
    fn poll_finished(&mut self, cx: &mut Context<'_>) -> Poll<Option<F::Output>> {
        let finished = self
            .running
            .iter_mut()
            .find_map(|(key, reconcile)| match reconcile.poll_unpin(cx) {
                Poll::Ready(output) => Some((key.clone(), output)),
                Poll::Pending => None,
            });
        match finished {
            Some((key, output)) => {
                self.running.remove(&key);
                Poll::Ready(Some(output))
            }
            None if self.running.is_empty() => Poll::Ready(None),
            None => Poll::Pending,
        }
    }
}

/// Pulls due keys from a [`Scheduler`] and starts a reconcile for each
///
/// A key that becomes due while it is still running stays held in the scheduler
/// until the running reconcile finishes, and no more than `limit` reconciles run at once.
#[pin_project]
pub struct Runner<R, F, MkF> {
    #[pin]
    scheduler: Scheduler<R>,
    start: MkF,
    in_flight: InFlight<F>,
}

impl<R, F, MkF> Runner<R, F, MkF>
where
    F: Future + Unpin,
    MkF: FnMut(&ResourceKey) -> F,
{
    pub fn new(scheduler: Scheduler<R>, limit: usize, start: MkF) -> Self {
        Self {
            scheduler,
            start,
            in_flight: InFlight::new(limit),
        }
    }
}

impl<R, F, MkF> Stream for Runner<R, F, MkF>
where
    R: Stream<Item = ScheduleRequest>,
    F: Future + Unpin,
    MkF: FnMut(&ResourceKey) -> F,
{
    type Item = F::Output;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        let mut scheduler = this.scheduler;
        let idle = match this.in_flight.poll_finished(cx) {
            Poll::Ready(Some(output)) => return Poll::Ready(Some(output)),
            Poll::Ready(None) => true,
            Poll::Pending => false,
        };
        loop {
            // a finishing reconcile wakes us through poll_finished
            if this.in_flight.is_full() {
                return Poll::Pending;
            }
            let in_flight = &*this.in_flight;
            match scheduler.as_mut().poll_due(cx, |key| !in_flight.is_running(key)) {
                Poll::Ready(Some(key)) => {
                    let reconcile = (this.start)(&key);
                    this.in_flight.start(key, reconcile);
                    cx.waker().wake_by_ref();
                }
                Poll::Ready(None) if idle => return Poll::Ready(None),
                Poll::Ready(None) | Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{InFlight, Runner};
    use crate::scheduler::{scheduler, ScheduleRequest};
    use futures::{
        channel::{mpsc, oneshot},
        future::{self, poll_fn},
        poll, FutureExt, SinkExt, StreamExt,
    };
    use std::{
        cell::{Cell, RefCell},
        task::Poll,
        time::Duration,
    };
    use tokio::{
        runtime::Handle,
        task::yield_now,
        time::{pause, sleep, timeout},
    };
    use vmop_core::{gvk::kinds, ResourceKey};

    fn rule(name: &str) -> ResourceKey {
        ResourceKey::new(kinds::VM_RULE, name).within("ns1")
    }

    #[tokio::test]
    async fn in_flight_yields_outputs_until_empty() {
        let mut in_flight = InFlight::new(2);
        let (tx, mut rx) = mpsc::unbounded::<()>();
        in_flight.start(rule("r1"), future::ready(None).boxed());
        in_flight.start(rule("r2"), async move { rx.next().await }.boxed());
        assert!(in_flight.is_full());

        assert_eq!(poll_fn(|cx| in_flight.poll_finished(cx)).await, Some(None));
        assert!(!in_flight.is_running(&rule("r1")));
        assert!(in_flight.is_running(&rule("r2")));
        assert!(poll!(poll_fn(|cx| in_flight.poll_finished(cx))).is_pending());

        drop(tx);
        assert_eq!(poll_fn(|cx| in_flight.poll_finished(cx)).await, Some(None));
        assert_eq!(poll!(poll_fn(|cx| in_flight.poll_finished(cx))), Poll::Ready(None));
    }

    #[tokio::test]
    async fn same_key_waits_for_its_running_reconcile() {
        pause();
        let guard = RefCell::new(());
        let mut count = 0;
        let (mut tx, rx) = mpsc::unbounded();
        let mut runner = Box::pin(
            Runner::new(scheduler(rx), 0, |_| {
                count += 1;
                // panics if a previous run still holds the borrow
                let held = guard.borrow_mut();
                Box::pin(async move {
                    sleep(Duration::from_secs(1)).await;
                    drop(held);
                })
            })
            .for_each(|()| async {}),
        );
        tx.send(ScheduleRequest::now(rule("r1"))).await.unwrap();
        assert!(poll!(runner.as_mut()).is_pending());
        tx.send(ScheduleRequest::now(rule("r1"))).await.unwrap();
        future::join(
            async {
                sleep(Duration::from_secs(5)).await;
                drop(tx);
            },
            runner,
        )
        .await;
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn limit_caps_parallel_reconciles() {
        pause();
        let running = Cell::new(0_usize);
        let peak = Cell::new(0_usize);
        let (running_ref, peak_ref) = (&running, &peak);
        let requests = (0..6)
            .map(|i| ScheduleRequest::now(rule(&format!("r{i}"))))
            .collect::<Vec<_>>();
        Runner::new(scheduler(futures::stream::iter(requests)), 2, move |_| {
            running_ref.set(running_ref.get() + 1);
            peak_ref.set(peak_ref.get().max(running_ref.get()));
            Box::pin(async move {
                sleep(Duration::from_secs(1)).await;
                running_ref.set(running_ref.get() - 1);
            })
        })
        .for_each(|()| async {})
        .await;
        assert_eq!(peak.get(), 2);
        assert_eq!(running.get(), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn idle_runner_wakes_for_new_keys() {
        let (mut tx, rx) = mpsc::unbounded();
        let (result_tx, result_rx) = oneshot::channel();
        let mut runner = Runner::new(scheduler(rx), 0, |key: &ResourceKey| future::ready(key.name.clone()));
        // the background task must be polling before the key is sent
        Handle::current().spawn(async move { result_tx.send(runner.next().await).unwrap() });
        yield_now().await;
        tx.send(ScheduleRequest::now(rule("r1"))).await.unwrap();
        assert_eq!(
            timeout(Duration::from_secs(1), result_rx).await.unwrap().unwrap(),
            Some("r1".to_string())
        );
    }
}
