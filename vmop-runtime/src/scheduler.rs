//! De-duplicating delay queue for reconcile requests
use futures::{
    stream::{Fuse, FusedStream},
    Stream, StreamExt,
};
use pin_project::pin_project;
use std::{
    collections::{hash_map::Entry, HashMap, HashSet},
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};
use tokio::time::Instant;
use tokio_util::time::delay_queue::{self, DelayQueue};
use vmop_core::ResourceKey;

/// A request to emit `key` once `run_at` has passed
#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    /// The object to reconcile
    pub key: ResourceKey,
    /// The earliest point in time at which the key may be emitted
    pub run_at: Instant,
}

impl ScheduleRequest {
    /// A request to emit `key` as soon as possible
    pub fn now(key: ResourceKey) -> Self {
        Self {
            key,
            run_at: Instant::now(),
        }
    }

    /// A request to emit `key` once `delay` has passed
    pub fn after(key: ResourceKey, delay: Duration) -> Self {
        Self {
            key,
            run_at: Instant::now() + delay,
        }
    }
}

/// Stream of keys whose scheduled time has come
///
/// Every key is queued at most once. Scheduling a key that is already queued
/// keeps whichever of the two deadlines is earlier, so a burst of watch events for
/// one object collapses into a single reconcile.
#[pin_project]
pub struct Scheduler<R> {
    queue: DelayQueue<ResourceKey>,
    /// Deadline and queue slot of every queued key
    deadlines: HashMap<ResourceKey, (Instant, delay_queue::Key)>,
    /// Keys that are due but were refused by the caller of [`Scheduler::poll_due`]
    held: HashSet<ResourceKey>,
    #[pin]
    requests: Fuse<R>,
}

impl<R: Stream<Item = ScheduleRequest>> Scheduler<R> {
    fn new(requests: R) -> Self {
        Self {
            queue: DelayQueue::new(),
            deadlines: HashMap::new(),
            held: HashSet::new(),
            requests: requests.fuse(),
        }
    }

    /// Poll for the next due key that `may_start` accepts
    ///
    /// Refused keys stay held, without losing their place, until a later poll
    /// accepts them. Held keys are offered before newly expired ones.
    pub fn poll_due(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        may_start: impl Fn(&ResourceKey) -> bool,
    ) -> Poll<Option<ResourceKey>> {
        let mut this = self.project();
        while let Poll::Ready(Some(request)) = this.requests.as_mut().poll_next(cx) {
            enqueue(this.queue, this.deadlines, this.held, request);
        }

        if let Some(key) = this.held.iter().find(|key| may_start(key)).cloned() {
            this.held.remove(&key);
            return Poll::Ready(Some(key));
        }
        loop {
            match this.queue.poll_expired(cx) {
                Poll::Ready(Some(expired)) => {
                    let key = expired.into_inner();
                    this.deadlines.remove(&key);
                    if may_start(&key) {
                        return Poll::Ready(Some(key));
                    }
                    this.held.insert(key);
                }
                Poll::Ready(None) if this.held.is_empty() && this.requests.is_terminated() => {
                    return Poll::Ready(None)
                }
                Poll::Ready(None) | Poll::Pending => return Poll::Pending,
            }
        }
    }

    /// Number of keys queued or held
    pub fn len(&self) -> usize {
        self.deadlines.len() + self.held.len()
    }

    /// Whether nothing is queued or held
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    pub(crate) fn is_held(&self, key: &ResourceKey) -> bool {
        self.held.contains(key)
    }
}

fn enqueue(
    queue: &mut DelayQueue<ResourceKey>,
    deadlines: &mut HashMap<ResourceKey, (Instant, delay_queue::Key)>,
    held: &HashSet<ResourceKey>,
    request: ScheduleRequest,
) {
    // a held key is already due
    if held.contains(&request.key) {
        return;
    }
    match deadlines.entry(request.key) {
        Entry::Occupied(mut queued) => {
            let (run_at, slot) = queued.get_mut();
            if request.run_at < *run_at {
                queue.reset_at(slot, request.run_at);
                *run_at = request.run_at;
            }
        }
        Entry::Vacant(entry) => {
            let slot = queue.insert_at(entry.key().clone(), request.run_at);
            entry.insert((request.run_at, slot));
        }
    }
}

impl<R: Stream<Item = ScheduleRequest>> Stream for Scheduler<R> {
    type Item = ResourceKey;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.poll_due(cx, |_| true)
    }
}

/// Turn a stream of [`ScheduleRequest`]s into a stream of due keys
pub fn scheduler<R: Stream<Item = ScheduleRequest>>(requests: R) -> Scheduler<R> {
    Scheduler::new(requests)
}

#[cfg(test)]
mod tests {
    use super::{scheduler, ScheduleRequest};
    use futures::{channel::mpsc, future::poll_fn, poll, stream, FutureExt, SinkExt, StreamExt};
    use tokio::time::{advance, pause, Duration};
    use vmop_core::{gvk::kinds, ResourceKey};

    fn rule(name: &str) -> ResourceKey {
        ResourceKey::new(kinds::VM_RULE, name).within("ns1")
    }

    #[tokio::test]
    async fn refused_key_is_held_until_accepted() {
        pause();
        let mut scheduler = Box::pin(scheduler(stream::iter(vec![ScheduleRequest::now(rule("r1"))])));
        assert!(poll!(poll_fn(|cx| scheduler.as_mut().poll_due(cx, |_| false))).is_pending());
        assert!(scheduler.is_held(&rule("r1")));
        assert_eq!(scheduler.len(), 1);
        assert_eq!(scheduler.next().await, Some(rule("r1")));
        assert!(scheduler.is_empty());
        assert!(scheduler.next().await.is_none());
    }

    #[tokio::test]
    async fn held_key_is_not_queued_twice() {
        pause();
        let (mut tx, rx) = mpsc::unbounded();
        let mut scheduler = Box::pin(scheduler(rx));
        tx.send(ScheduleRequest::now(rule("r1"))).await.unwrap();
        assert!(poll!(poll_fn(|cx| scheduler.as_mut().poll_due(cx, |_| false))).is_pending());
        tx.send(ScheduleRequest::now(rule("r1"))).await.unwrap();
        drop(tx);
        assert_eq!(scheduler.next().await, Some(rule("r1")));
        assert!(scheduler.next().await.is_none());
    }

    #[tokio::test]
    async fn refused_key_does_not_block_others() {
        let mut scheduler = Box::pin(scheduler(stream::iter(vec![
            ScheduleRequest::now(rule("r1")),
            ScheduleRequest::now(rule("r2")),
        ])));
        let due = poll_fn(|cx| scheduler.as_mut().poll_due(cx, |key| key.name != "r1")).await;
        assert_eq!(due, Some(rule("r2")));
    }

    #[tokio::test]
    async fn keys_are_emitted_at_their_deadline() {
        pause();
        let mut scheduler = scheduler(stream::iter(vec![
            ScheduleRequest::after(rule("r1"), Duration::from_secs(1)),
            ScheduleRequest::after(rule("r2"), Duration::from_secs(3)),
        ]));
        assert!(poll!(scheduler.next()).is_pending());
        advance(Duration::from_secs(2)).await;
        assert_eq!(scheduler.next().now_or_never().unwrap(), Some(rule("r1")));
        assert!(poll!(scheduler.next()).is_pending());
        advance(Duration::from_secs(2)).await;
        assert_eq!(scheduler.next().now_or_never().unwrap(), Some(rule("r2")));
        assert!(scheduler.next().await.is_none());
    }

    #[tokio::test]
    async fn burst_for_one_key_collapses_to_earliest_deadline() {
        pause();
        let mut scheduler = scheduler(stream::iter(vec![
            ScheduleRequest::after(rule("r1"), Duration::from_secs(3)),
            ScheduleRequest::after(rule("r1"), Duration::from_secs(1)),
            ScheduleRequest::after(rule("r1"), Duration::from_secs(5)),
        ]));
        assert!(poll!(scheduler.next()).is_pending());
        advance(Duration::from_secs(2)).await;
        assert_eq!(scheduler.next().now_or_never().unwrap(), Some(rule("r1")));
        assert!(scheduler.next().await.is_none());
    }

    #[tokio::test]
    async fn emitted_key_can_be_scheduled_again() {
        pause();
        let (mut tx, rx) = mpsc::unbounded();
        let mut scheduler = scheduler(rx);
        for _ in 0..2 {
            tx.send(ScheduleRequest::after(rule("r1"), Duration::from_secs(1)))
                .await
                .unwrap();
            assert!(poll!(scheduler.next()).is_pending());
            advance(Duration::from_secs(2)).await;
            assert_eq!(scheduler.next().now_or_never().unwrap(), Some(rule("r1")));
            assert!(poll!(scheduler.next()).is_pending());
        }
    }
}
