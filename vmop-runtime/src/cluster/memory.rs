use super::{Cluster, Error, ListParams, Result, WatchStream};
use async_broadcast::{InactiveReceiver, Sender};
use async_trait::async_trait;
use futures::{future, StreamExt};
use parking_lot::RwLock;
use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};
use tokio::sync::watch;
use vmop_core::{ApiKind, DynamicObject, ErrorResponse, ResourceKey, WatchEvent};

const EVENT_BUFFER: usize = 1024;

/// The kind of write recorded by a [`MemoryCluster`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verb {
    /// [`Cluster::create`]
    Create,
    /// [`Cluster::replace`]
    Replace,
    /// [`Cluster::patch_metadata`]
    PatchMetadata,
    /// [`Cluster::delete`]
    Delete,
}

/// A write issued through the [`Cluster`] interface
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteRecord {
    /// What kind of write it was
    pub verb: Verb,
    /// The object that was written
    pub key: ResourceKey,
}

#[derive(Default)]
struct State {
    objects: HashMap<ResourceKey, DynamicObject>,
    resource_version: u64,
    writes: Vec<WriteRecord>,
    unserved: HashSet<ApiKind>,
    failing: HashMap<ApiKind, ErrorResponse>,
}

impl State {
    fn check_served(&self, kind: &ApiKind) -> Result<()> {
        if self.unserved.contains(kind) {
            return Err(Error::KindNotServed(kind.to_string()));
        }
        if let Some(resp) = self.failing.get(kind) {
            return Err(Error::Api(resp.clone()));
        }
        Ok(())
    }

    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

/// An in-memory API server
///
/// Stores [`DynamicObject`]s by key, fans watch events out to every open watch,
/// and records each write made through the [`Cluster`] interface so tests can
/// assert on write counts. Objects placed with [`seed`](Self::seed) or removed
/// with [`remove_external`](Self::remove_external) model changes made by other
/// actors: they produce watch events but no write records.
pub struct MemoryCluster {
    state: RwLock<State>,
    events: Sender<(ApiKind, WatchEvent<DynamicObject>)>,
    // keeps the channel open while no watch is running
    _events_rx: InactiveReceiver<(ApiKind, WatchEvent<DynamicObject>)>,
    synced: watch::Sender<bool>,
}

impl Default for MemoryCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCluster {
    /// An empty cluster whose cache reports as synced
    pub fn new() -> Self {
        let (mut events, events_rx) = async_broadcast::broadcast(EVENT_BUFFER);
        events.set_overflow(true);
        events.set_await_active(false);
        let (synced, _) = watch::channel(true);
        Self {
            state: RwLock::new(State::default()),
            events,
            _events_rx: events_rx.deactivate(),
            synced,
        }
    }

    /// Insert or overwrite an object as another actor would
    pub fn seed(&self, kind: &ApiKind, mut obj: DynamicObject) -> DynamicObject {
        let mut state = self.state.write();
        let key = obj.key(kind);
        obj.metadata.resource_version = Some(state.next_version());
        let event = match state.objects.get(&key) {
            Some(old) => {
                obj.metadata.uid = old.metadata.uid.clone();
                WatchEvent::Modified(obj.clone())
            }
            None => {
                obj.metadata.uid.get_or_insert_with(|| format!("uid-{}", state.resource_version));
                WatchEvent::Added(obj.clone())
            }
        };
        state.objects.insert(key, obj.clone());
        self.emit(kind, event);
        obj
    }

    /// Remove an object as another actor would
    pub fn remove_external(&self, key: &ResourceKey) -> Option<DynamicObject> {
        let removed = self.state.write().objects.remove(key);
        if let Some(obj) = &removed {
            self.emit(&key.kind, WatchEvent::Deleted(obj.clone()));
        }
        removed
    }

    /// Current state of an object, bypassing the [`Cluster`] interface
    pub fn object(&self, key: &ResourceKey) -> Option<DynamicObject> {
        self.state.read().objects.get(key).cloned()
    }

    /// Stop serving `kind`, as if its definition was not installed
    pub fn unserve(&self, kind: &ApiKind) {
        self.state.write().unserved.insert(kind.clone());
    }

    /// Fail every read and write of `kind` with `response` until [`heal`](Self::heal) is called
    pub fn fail_with(&self, kind: &ApiKind, response: ErrorResponse) {
        self.state.write().failing.insert(kind.clone(), response);
    }

    /// Undo [`fail_with`](Self::fail_with)
    pub fn heal(&self, kind: &ApiKind) {
        self.state.write().failing.remove(kind);
    }

    /// Control what [`Cluster::wait_for_sync`] reports
    pub fn set_synced(&self, synced: bool) {
        self.synced.send_replace(synced);
    }

    /// Every write made so far, oldest first
    pub fn writes(&self) -> Vec<WriteRecord> {
        self.state.read().writes.clone()
    }

    /// Number of writes made so far
    pub fn write_count(&self) -> usize {
        self.state.read().writes.len()
    }

    /// Forget the recorded writes
    pub fn clear_writes(&self) {
        self.state.write().writes.clear();
    }

    fn emit(&self, kind: &ApiKind, event: WatchEvent<DynamicObject>) {
        // overflow drops the oldest event, so this only fails once the cluster is gone
        let _ = self.events.try_broadcast((kind.clone(), event));
    }
}

#[async_trait]
impl Cluster for MemoryCluster {
    async fn get(&self, key: &ResourceKey) -> Result<DynamicObject> {
        let state = self.state.read();
        state.check_served(&key.kind)?;
        state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(key.clone()))
    }

    async fn list(&self, kind: &ApiKind, namespace: Option<&str>, params: &ListParams) -> Result<Vec<DynamicObject>> {
        let state = self.state.read();
        state.check_served(kind)?;
        let mut found = state
            .objects
            .iter()
            .filter(|(key, _)| &key.kind == kind)
            .filter(|(key, _)| namespace.map_or(true, |ns| key.namespace.as_deref() == Some(ns)))
            .filter(|(_, obj)| params.matches(obj))
            .map(|(_, obj)| obj.clone())
            .collect::<Vec<_>>();
        found.sort_by(|a, b| (a.namespace_any(), a.name_any()).cmp(&(b.namespace_any(), b.name_any())));
        Ok(found)
    }

    async fn watch(&self, kind: &ApiKind, namespace: Option<&str>) -> Result<WatchStream> {
        self.state.read().check_served(kind)?;
        let kind = kind.clone();
        let namespace = namespace.map(String::from);
        let stream = self
            .events
            .new_receiver()
            .filter(move |(event_kind, event)| {
                let object_namespace = match event {
                    WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => {
                        obj.metadata.namespace.as_deref()
                    }
                    WatchEvent::Bookmark(_) | WatchEvent::Error(_) => None,
                };
                let wanted =
                    event_kind == &kind && namespace.as_deref().map_or(true, |ns| object_namespace == Some(ns));
                future::ready(wanted)
            })
            .map(|(_, event)| Ok(event));
        Ok(stream.boxed())
    }

    async fn create(&self, kind: &ApiKind, mut obj: DynamicObject) -> Result<DynamicObject> {
        let mut state = self.state.write();
        state.check_served(kind)?;
        let key = obj.key(kind);
        if state.objects.contains_key(&key) {
            return Err(Error::Conflict {
                key,
                message: "already exists".into(),
            });
        }
        let version = state.next_version();
        obj.metadata.uid = Some(format!("uid-{version}"));
        obj.metadata.resource_version = Some(version);
        state.objects.insert(key.clone(), obj.clone());
        state.writes.push(WriteRecord {
            verb: Verb::Create,
            key,
        });
        self.emit(kind, WatchEvent::Added(obj.clone()));
        Ok(obj)
    }

    async fn replace(&self, kind: &ApiKind, mut obj: DynamicObject) -> Result<DynamicObject> {
        let mut state = self.state.write();
        state.check_served(kind)?;
        let key = obj.key(kind);
        let current = state.objects.get(&key).ok_or_else(|| Error::NotFound(key.clone()))?;
        if let Some(expected) = &obj.metadata.resource_version {
            if current.metadata.resource_version.as_ref() != Some(expected) {
                return Err(Error::Conflict {
                    key,
                    message: format!("resource version {expected} is stale"),
                });
            }
        }
        obj.metadata.uid = current.metadata.uid.clone();
        obj.metadata.resource_version = Some(state.next_version());
        state.objects.insert(key.clone(), obj.clone());
        state.writes.push(WriteRecord {
            verb: Verb::Replace,
            key,
        });
        self.emit(kind, WatchEvent::Modified(obj.clone()));
        Ok(obj)
    }

    async fn patch_metadata(&self, key: &ResourceKey, patch: &serde_json::Value) -> Result<DynamicObject> {
        let mut state = self.state.write();
        state.check_served(&key.kind)?;
        let current = state.objects.get(key).ok_or_else(|| Error::NotFound(key.clone()))?;
        let mut doc = serde_json::to_value(current).map_err(|err| bad_request(err.to_string()))?;
        if let Some(meta_patch) = patch.get("metadata") {
            json_patch::merge(&mut doc["metadata"], meta_patch);
        }
        let mut patched: DynamicObject =
            serde_json::from_value(doc).map_err(|err| bad_request(err.to_string()))?;
        patched.metadata.name = current.metadata.name.clone();
        patched.metadata.namespace = current.metadata.namespace.clone();
        patched.metadata.uid = current.metadata.uid.clone();
        patched.metadata.resource_version = Some(state.next_version());
        state.objects.insert(key.clone(), patched.clone());
        state.writes.push(WriteRecord {
            verb: Verb::PatchMetadata,
            key: key.clone(),
        });
        self.emit(&key.kind, WatchEvent::Modified(patched.clone()));
        Ok(patched)
    }

    async fn delete(&self, key: &ResourceKey) -> Result<()> {
        let mut state = self.state.write();
        state.check_served(&key.kind)?;
        let removed = state.objects.remove(key).ok_or_else(|| Error::NotFound(key.clone()))?;
        state.writes.push(WriteRecord {
            verb: Verb::Delete,
            key: key.clone(),
        });
        self.emit(&key.kind, WatchEvent::Deleted(removed));
        Ok(())
    }

    async fn wait_for_sync(&self, timeout: Duration) -> bool {
        let mut synced = self.synced.subscribe();
        let outcome = tokio::time::timeout(timeout, synced.wait_for(|synced| *synced)).await;
        outcome.is_ok_and(|waited| waited.is_ok())
    }
}

fn bad_request(message: String) -> Error {
    Error::Api(ErrorResponse::new(400, "BadRequest", message))
}
