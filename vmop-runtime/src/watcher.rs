//! Watches one kind across the operator's namespaces, with error recovery

use crate::cluster::{self, ClusterExt, SharedCluster, WatchScope, WatchStream};
use educe::Educe;
use futures::{Stream, StreamExt};
use thiserror::Error;
use vmop_core::{ApiKind, DynamicObject, ErrorResponse, WatchEvent};

/// Errors yielded by the [`watcher`] stream
#[derive(Debug, Error)]
pub enum Error {
    /// The list issued after (re)opening the watch failed
    #[error("failed to perform initial object list: {0}")]
    InitialListFailed(#[source] cluster::Error),
    /// The watch could not be opened
    #[error("failed to start watching object: {0}")]
    WatchStartFailed(#[source] cluster::Error),
    /// The API server sent an error event
    #[error("error returned by apiserver during watch: {0}")]
    WatchError(#[source] ErrorResponse),
    /// The watch transport failed
    #[error("watch stream failed: {0}")]
    WatchFailed(#[source] cluster::Error),
}
/// Convenient alias for `Result<T, watcher::Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Watch events returned from the [`watcher`]
#[derive(Debug, Clone)]
pub enum Event {
    /// An object was added or modified
    Applied(DynamicObject),
    /// An object was deleted
    ///
    /// Deletions can be missed while the watch is being restarted.
    Deleted(DynamicObject),
    /// The watch was (re)started and these are all objects that currently exist
    ///
    /// Objects seen before but missing here should be assumed deleted.
    Restarted(Vec<DynamicObject>),
}

impl Event {
    /// Every object added or modified by the event
    pub fn into_iter_applied(self) -> impl Iterator<Item = DynamicObject> {
        match self {
            Event::Applied(obj) => vec![obj],
            Event::Deleted(_) => vec![],
            Event::Restarted(objs) => objs,
        }
        .into_iter()
    }

    /// Every object added, modified or deleted by the event
    pub fn into_iter_touched(self) -> impl Iterator<Item = DynamicObject> {
        match self {
            Event::Applied(obj) | Event::Deleted(obj) => vec![obj],
            Event::Restarted(objs) => objs,
        }
        .into_iter()
    }
}

#[derive(Educe)]
#[educe(Debug)]
enum State {
    /// The next poll opens a watch and lists every existing object
    Empty,
    /// Events are read from the open watch
    ///
    /// A broken or expired watch sends us back to `Empty`.
    Watching {
        #[educe(Debug(ignore))]
        stream: WatchStream,
    },
}

/// Progresses the watcher a single step, returning (event, state)
///
/// Trampolined: called again until the event is `Some`.
async fn step_trampolined(
    cluster: &SharedCluster,
    kind: &ApiKind,
    scope: &WatchScope,
    state: State,
) -> (Option<Result<Event>>, State) {
    match state {
        // the watch opens first, so nothing changing during the list is lost
        State::Empty => match cluster.watch_in_scope(kind, scope).await {
            Ok(stream) => match cluster.list_in_scope(kind, scope, &Default::default()).await {
                Ok(objects) => (Some(Ok(Event::Restarted(objects))), State::Watching { stream }),
                Err(err) => (Some(Err(Error::InitialListFailed(err))), State::Empty),
            },
            Err(err) => (Some(Err(Error::WatchStartFailed(err))), State::Empty),
        },
        State::Watching { mut stream } => match stream.next().await {
            Some(Ok(WatchEvent::Added(obj) | WatchEvent::Modified(obj))) => {
                (Some(Ok(Event::Applied(obj))), State::Watching { stream })
            }
            Some(Ok(WatchEvent::Deleted(obj))) => (Some(Ok(Event::Deleted(obj))), State::Watching { stream }),
            Some(Ok(WatchEvent::Bookmark(_))) => (None, State::Watching { stream }),
            Some(Ok(WatchEvent::Error(err))) => {
                // gone: the watch fell out of the history window, so relist
                let new_state = if err.is_gone() {
                    State::Empty
                } else {
                    State::Watching { stream }
                };
                (Some(Err(Error::WatchError(err))), new_state)
            }
            Some(Err(err)) => (Some(Err(Error::WatchFailed(err))), State::Watching { stream }),
            None => (None, State::Empty),
        },
    }
}

async fn step(
    cluster: &SharedCluster,
    kind: &ApiKind,
    scope: &WatchScope,
    mut state: State,
) -> (Result<Event>, State) {
    loop {
        match step_trampolined(cluster, kind, scope, state).await {
            (Some(result), new_state) => return (result, new_state),
            (None, new_state) => state = new_state,
        }
    }
}

/// Watches every object of `kind` within `scope` continuously
///
/// Errors are propagated, after which the stream goes into recovery on the next poll.
/// Wrap it in a [`StreamBackoff`](crate::utils::StreamBackoff) to avoid hammering the
/// API server while it is unavailable.
///
/// The stream starts with an [`Event::Restarted`] holding every existing object, and
/// emits another one whenever the watch had to be reopened.
pub fn watcher(cluster: SharedCluster, kind: ApiKind, scope: WatchScope) -> impl Stream<Item = Result<Event>> + Send {
    futures::stream::unfold((cluster, kind, scope, State::Empty), |(cluster, kind, scope, state)| async {
        let (event, state) = step(&cluster, &kind, &scope, state).await;
        Some((event, (cluster, kind, scope, state)))
    })
}
