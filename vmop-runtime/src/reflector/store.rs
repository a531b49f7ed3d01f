//! Read-only cache of the objects seen by a watcher
use crate::watcher;
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};
use vmop_core::{ApiKind, DynamicObject, ResourceKey};

type Cache = Arc<RwLock<HashMap<ResourceKey, DynamicObject>>>;

/// A writable Store handle
///
/// This is exclusive since it's not safe to share a single `Store` between multiple reflectors.
/// In particular, `Restarted` events will clobber the state of other connected reflectors.
#[derive(Debug)]
pub struct Writer {
    kind: ApiKind,
    store: Cache,
}

impl Writer {
    /// An empty store for objects of `kind`
    pub fn new(kind: ApiKind) -> Self {
        Self {
            kind,
            store: Cache::default(),
        }
    }

    /// Return a read handle to the store
    ///
    /// Multiple read handles may be obtained, by either calling `as_reader` multiple times,
    /// or by calling `Store::clone()` afterwards.
    #[must_use]
    pub fn as_reader(&self) -> Store {
        Store {
            store: self.store.clone(),
        }
    }

    /// Applies a single watcher event to the store
    pub fn apply_watcher_event(&mut self, event: &watcher::Event) {
        match event {
            watcher::Event::Applied(obj) => {
                self.store.write().insert(obj.key(&self.kind), obj.clone());
            }
            watcher::Event::Deleted(obj) => {
                self.store.write().remove(&obj.key(&self.kind));
            }
            watcher::Event::Restarted(new_objs) => {
                let new_objs = new_objs
                    .iter()
                    .map(|obj| (obj.key(&self.kind), obj.clone()))
                    .collect::<HashMap<_, _>>();
                *self.store.write() = new_objs;
            }
        }
    }
}

/// A readable cache of objects of one kind
///
/// Cloning will produce a new reference to the same backing store.
///
/// Cannot be constructed directly since one writer handle is required,
/// use `Writer::as_reader()` instead.
#[derive(Debug, Clone)]
pub struct Store {
    store: Cache,
}

impl Store {
    /// Retrieve a `clone()` of the entry referred to by `key`, if it is in the cache.
    ///
    /// The cache may lag behind the cluster: deleted objects can linger and new
    /// objects may be missing for a short while.
    #[must_use]
    pub fn get(&self, key: &ResourceKey) -> Option<DynamicObject> {
        self.store.read().get(key).cloned()
    }

    /// Keys of every cached object
    #[must_use]
    pub fn keys(&self) -> Vec<ResourceKey> {
        self.store.read().keys().cloned().collect()
    }

    /// Return a full snapshot of the current values
    #[must_use]
    pub fn state(&self) -> Vec<DynamicObject> {
        self.store.read().values().cloned().collect()
    }

    /// Number of cached objects
    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }
}

/// Create a (Store, Writer) pair for objects of `kind`
#[must_use]
pub fn store(kind: ApiKind) -> (Store, Writer) {
    let writer = Writer::new(kind);
    (writer.as_reader(), writer)
}
