//! Caches objects in memory

pub mod store;

pub use store::{store, Store, Writer};

use crate::watcher;
use futures::{Stream, TryStreamExt};

/// Cache objects from a [`watcher()`](crate::watcher::watcher) stream into a local [`Store`]
///
/// Observes the raw stream of [`watcher::Event`] objects, and modifies the cache.
/// It passes the raw stream through unmodified.
///
/// The cache contains the last-seen state of objects, which may lag slightly
/// behind the actual state.
pub fn reflector<W>(mut writer: Writer, stream: W) -> impl Stream<Item = W::Item>
where
    W: Stream<Item = watcher::Result<watcher::Event>>,
{
    stream.inspect_ok(move |event| writer.apply_watcher_event(event))
}
