//! Runs a reconciler for every changed object of one kind

use self::runner::Runner;
use crate::{
    cluster::{SharedCluster, WatchScope},
    reflector::{self, reflector, Store},
    scheduler::{scheduler, ScheduleRequest},
    utils::{retry_backoff, CancelableJoinHandle, ResettableBackoffWrapper, StreamBackoff},
    watcher::watcher,
};
use backon::ExponentialBuilder;
use futures::{
    channel::mpsc,
    future,
    stream::{self, BoxStream, SelectAll},
    Future, FutureExt, Stream, StreamExt,
};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{runtime::Handle, time::Instant};
use tokio_util::sync::CancellationToken;
use vmop_core::{ApiKind, ResourceKey};

mod runner;

/// Errors reported by the [`applier`] stream
#[derive(Debug, Error)]
pub enum Error<ReconcilerErr: std::error::Error + 'static> {
    /// The reconciler returned an error; the key was requeued by the error policy
    #[error("reconciling {1} failed: {0}")]
    ReconcilerFailed(#[source] ReconcilerErr, ResourceKey),
}

/// Results of the reconciliation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    /// Whether (and when) to next trigger the reconciliation if no external watch triggers hit
    requeue_after: Option<Duration>,
}

impl Action {
    /// Reconcile again after `duration` even if no external watch triggers hit
    #[must_use]
    pub fn requeue(duration: Duration) -> Self {
        Self {
            requeue_after: Some(duration),
        }
    }

    /// Do nothing until a change is detected
    ///
    /// The key is still picked up again by a periodic resync, if one is configured.
    #[must_use]
    pub fn await_change() -> Self {
        Self { requeue_after: None }
    }

    /// The delay after which the key is reconciled again, if any
    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

/// Per-key exponential backoff for failed reconciles
///
/// The first failure of a key requeues it after 5ms, every following failure doubles
/// the delay up to 1000s. A successful reconcile forgets the key.
#[derive(Debug, Default)]
pub struct ErrorBackoff {
    backoffs: HashMap<ResourceKey, ResettableBackoffWrapper<ExponentialBuilder>>,
}

impl ErrorBackoff {
    /// The action to take after `key` failed
    pub fn on_error(&mut self, key: &ResourceKey) -> Action {
        let delay = self
            .backoffs
            .entry(key.clone())
            .or_default()
            .next()
            .unwrap_or(crate::utils::MAX_RETRY_DELAY);
        Action::requeue(delay)
    }

    /// Forget the failure history of `key`
    pub fn on_success(&mut self, key: &ResourceKey) {
        self.backoffs.remove(key);
    }

    /// Number of keys currently backing off
    pub fn len(&self) -> usize {
        self.backoffs.len()
    }

    /// Whether no key is currently backing off
    pub fn is_empty(&self) -> bool {
        self.backoffs.is_empty()
    }
}

/// Apply a reconciler to an input stream of keys, with a given retry policy
///
/// The `queue` is a source of keys that need to be reconciled, usually derived
/// from a [`watcher`] stream. Keys are de-duplicated while they wait, and a key is
/// never reconciled twice at the same time. At most `concurrency` reconciles run
/// at once, `0` meaning unbounded.
///
/// Every completed reconcile is classified by its [`Action`] or, on error, by
/// `error_policy`; a requeue delay puts the key back into the queue.
pub fn applier<QueueStream, ReconcilerFut, E>(
    mut reconciler: impl FnMut(ResourceKey) -> ReconcilerFut,
    mut error_policy: impl FnMut(&ResourceKey, &E) -> Action,
    queue: QueueStream,
    concurrency: usize,
) -> impl Stream<Item = Result<(ResourceKey, Action), Error<E>>>
where
    QueueStream: Stream<Item = ResourceKey>,
    ReconcilerFut: Future<Output = Result<Action, E>> + Unpin,
    E: std::error::Error + 'static,
{
    let (scheduler_tx, scheduler_rx) = mpsc::unbounded::<ScheduleRequest>();
    let requests = stream::select(
        // 1. inputs from the queue stream
        queue.map(ScheduleRequest::now),
        // 2. requeues sent to scheduler_tx
        scheduler_rx,
    );
    Runner::new(scheduler(requests), concurrency, move |key: &ResourceKey| {
        let key = key.clone();
        reconciler(key.clone()).map(move |result| (key, result))
    })
    // finally, for each completed reconcile call:
    .map(move |(key, result)| {
        let action = match &result {
            Ok(action) => *action,
            Err(err) => error_policy(&key, err),
        };
        if let Some(delay) = action.requeue_after() {
            // the receiver lives as long as this stream does
            let _ = scheduler_tx.unbounded_send(ScheduleRequest::after(key.clone(), delay));
        }
        match result {
            Ok(action) => Ok((key, action)),
            Err(err) => Err(Error::ReconcilerFailed(err, key)),
        }
    })
}

/// Drives a reconciler over every object of one kind in a [`WatchScope`]
///
/// A controller is made up of:
/// - a `watcher` on the kind, feeding a `reflector` store
/// - an optional periodic resync that re-enqueues every cached key
/// - a reconcile callback, with per-key exponential backoff on errors
///
/// Nothing happens until the stream returned by [`Controller::run`] is polled.
pub struct Controller {
    kind: ApiKind,
    selector: SelectAll<BoxStream<'static, ResourceKey>>,
    reader: Store,
    concurrency: usize,
    resync_period: Duration,
}

impl Controller {
    /// Create a controller for objects of `kind` within `scope`
    pub fn new(cluster: SharedCluster, kind: ApiKind, scope: WatchScope) -> Self {
        let (reader, writer) = reflector::store(kind.clone());
        let events = StreamBackoff::new(
            watcher(cluster, kind.clone(), scope),
            ResettableBackoffWrapper::new(retry_backoff()),
        );
        let key_kind = kind.clone();
        let self_watcher = reflector(writer, events)
            .filter_map(move |event| {
                future::ready(match event {
                    Ok(event) => Some(stream::iter(
                        event
                            .into_iter_touched()
                            .map(|obj| obj.key(&key_kind))
                            .collect::<Vec<_>>(),
                    )),
                    Err(err) => {
                        tracing::warn!(kind = %key_kind, error = %err, "watch failed, backing off");
                        None
                    }
                })
            })
            .flatten()
            .boxed();
        let mut selector = SelectAll::new();
        selector.push(self_watcher);
        Self {
            kind,
            selector,
            reader,
            concurrency: 0,
            resync_period: Duration::ZERO,
        }
    }

    /// Retrieve a copy of the reader before starting the controller
    pub fn store(&self) -> Store {
        self.reader.clone()
    }

    /// Run at most `concurrency` reconciles at once, `0` meaning unbounded
    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Re-enqueue every cached key each `period`; zero disables resync
    #[must_use]
    pub fn resync(mut self, period: Duration) -> Self {
        self.resync_period = period;
        self
    }

    /// Trigger reconciles from an arbitrary stream of keys
    #[must_use]
    pub fn reconcile_on(mut self, trigger: impl Stream<Item = ResourceKey> + Send + 'static) -> Self {
        self.selector.push(trigger.boxed());
        self
    }

    /// Consume the controller and start the applier stream
    ///
    /// Every reconcile is spawned onto the current runtime and aborted if the
    /// stream is dropped. The stream ends once `shutdown` is cancelled.
    pub fn run<ReconcilerFut, E>(
        mut self,
        mut reconciler: impl FnMut(ResourceKey) -> ReconcilerFut,
        shutdown: CancellationToken,
    ) -> impl Stream<Item = Result<(ResourceKey, Action), Error<E>>>
    where
        ReconcilerFut: Future<Output = Result<Action, E>> + Send + 'static,
        E: std::error::Error + Send + 'static,
    {
        if !self.resync_period.is_zero() {
            let reader = self.reader.clone();
            let period = self.resync_period;
            let ticks = stream::unfold(
                tokio::time::interval_at(Instant::now() + period, period),
                |mut interval| async move {
                    interval.tick().await;
                    Some(((), interval))
                },
            );
            let kind = self.kind.clone();
            self.selector.push(
                ticks
                    .flat_map(move |()| {
                        let keys = reader.keys();
                        tracing::debug!(%kind, keys = keys.len(), "resync");
                        stream::iter(keys)
                    })
                    .boxed(),
            );
        }

        let backoff = Arc::new(Mutex::new(ErrorBackoff::default()));
        let error_backoff = backoff.clone();
        let stop = shutdown.clone();
        applier(
            move |key| CancelableJoinHandle::spawn(reconciler(key), &Handle::current()),
            move |key, err: &E| {
                tracing::debug!(%key, error = %err, "reconcile failed, backing off");
                error_backoff.lock().on_error(key)
            },
            self.selector,
            self.concurrency,
        )
        .inspect(move |result| {
            if let Ok((key, _)) = result {
                backoff.lock().on_success(key);
            }
        })
        .take_until(async move { stop.cancelled().await })
    }
}

/// Log the outcome of every reconcile of a controller stream until it ends
pub async fn drain<E: std::error::Error + 'static>(
    kind: &ApiKind,
    results: impl Stream<Item = Result<(ResourceKey, Action), Error<E>>>,
) {
    results
        .for_each(|result| {
            match result {
                Ok((key, action)) => tracing::trace!(%key, ?action, "reconciled"),
                Err(err) => tracing::warn!(%kind, error = %err, "reconcile failed"),
            }
            future::ready(())
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::{applier, Action, Controller, ErrorBackoff};
    use crate::cluster::{MemoryCluster, SharedCluster, WatchScope};
    use futures::{channel::mpsc, future, StreamExt};
    use parking_lot::Mutex;
    use std::{sync::Arc, time::Duration};
    use tokio_util::sync::CancellationToken;
    use vmop_core::{gvk::kinds, DynamicObject, ResourceKey};

    #[derive(Debug, thiserror::Error)]
    #[error("reconcile failed")]
    struct Failed;

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new(kinds::VM_RULE, name).within("ns")
    }

    #[test]
    fn error_backoff_doubles_per_key_and_resets_on_success() {
        let mut backoff = ErrorBackoff::default();
        assert_eq!(backoff.on_error(&key("a")), Action::requeue(Duration::from_millis(5)));
        let second = backoff.on_error(&key("a")).requeue_after().unwrap();
        assert!(second > Duration::from_millis(5));
        assert_eq!(backoff.on_error(&key("b")), Action::requeue(Duration::from_millis(5)));
        backoff.on_success(&key("a"));
        assert_eq!(backoff.len(), 1);
        assert_eq!(backoff.on_error(&key("a")), Action::requeue(Duration::from_millis(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn applier_requeues_failed_keys_until_they_succeed() {
        let attempts = Arc::new(Mutex::new(0));
        let (queue_tx, queue_rx) = mpsc::unbounded();
        queue_tx.unbounded_send(key("flaky")).unwrap();
        let counter = attempts.clone();
        let results = applier(
            move |_key| {
                let mut attempts = counter.lock();
                *attempts += 1;
                future::ready(if *attempts < 3 { Err(Failed) } else { Ok(Action::await_change()) })
            },
            |_, _| Action::requeue(Duration::from_secs(1)),
            queue_rx,
            1,
        );
        let outcomes = results.take(3).collect::<Vec<_>>().await;
        assert!(outcomes[0].is_err());
        assert!(outcomes[1].is_err());
        assert!(matches!(&outcomes[2], Ok((k, action)) if *k == key("flaky") && action.requeue_after().is_none()));
        assert_eq!(*attempts.lock(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn controller_reconciles_watched_objects_and_stops_on_shutdown() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.seed(&kinds::VM_RULE, DynamicObject::new("r1", &kinds::VM_RULE).within("ns"));
        let shared: SharedCluster = cluster.clone();
        let shutdown = CancellationToken::new();
        let results = Controller::new(shared, kinds::VM_RULE, WatchScope::ClusterWide)
            .concurrency(2)
            .run(|_key| future::ready(Ok::<_, Failed>(Action::await_change())), shutdown.clone());
        futures::pin_mut!(results);

        let (first, _) = results.next().await.unwrap().unwrap();
        assert_eq!(first, key("r1"));
        cluster.seed(&kinds::VM_RULE, DynamicObject::new("r2", &kinds::VM_RULE).within("ns"));
        let (second, _) = results.next().await.unwrap().unwrap();
        assert_eq!(second, key("r2"));

        shutdown.cancel();
        assert!(results.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn resync_reenqueues_cached_keys() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.seed(&kinds::VM_RULE, DynamicObject::new("r1", &kinds::VM_RULE).within("ns"));
        let shutdown = CancellationToken::new();
        let results = Controller::new(cluster, kinds::VM_RULE, WatchScope::ClusterWide)
            .resync(Duration::from_secs(30))
            .run(|_key| future::ready(Ok::<_, Failed>(Action::await_change())), shutdown);
        let keys = results.take(3).map(|res| res.unwrap().0).collect::<Vec<_>>().await;
        assert_eq!(keys, vec![key("r1"); 3]);
    }
}
