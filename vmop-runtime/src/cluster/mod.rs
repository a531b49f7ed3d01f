//! The cluster API capability consumed by the engine
//!
//! Dispatchers, the converter and the ownership bootstrap are written purely
//! against [`Cluster`], so they can run on top of any transport and be tested
//! against [`MemoryCluster`].
use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use std::{fmt, sync::Arc, time::Duration};
use thiserror::Error;
use vmop_core::{ApiKind, DynamicObject, ErrorResponse, ResourceKey, Selector, WatchEvent};

mod memory;
mod throttle;

pub use memory::{MemoryCluster, Verb, WriteRecord};
pub use throttle::{ThrottledCluster, TokenBucket};

/// Errors returned by a [`Cluster`]
#[derive(Debug, Error)]
pub enum Error {
    /// The addressed object does not exist
    #[error("{0} not found")]
    NotFound(ResourceKey),

    /// The cluster does not serve this kind (its definition is not installed)
    #[error("kind {0} is not served by the cluster")]
    KindNotServed(String),

    /// A create raced with an existing object, or a replace used a stale version
    #[error("conflict writing {key}: {message}")]
    Conflict {
        /// The contested object
        key: ResourceKey,
        /// Server explanation
        message: String,
    },

    /// Any other error reported by the API server
    #[error("api error: {0}")]
    Api(#[source] ErrorResponse),

    /// The watch stream broke and must be restarted
    #[error("watch stream failed: {0}")]
    Watch(String),
}

impl Error {
    /// Whether the error means the object is already gone
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_)) || matches!(self, Error::Api(resp) if resp.is_not_found())
    }
}

/// Convenient alias for `Result<T, cluster::Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// A stream of raw watch events for one kind
pub type WatchStream = BoxStream<'static, Result<WatchEvent<DynamicObject>>>;

/// Shared handle to a cluster implementation
pub type SharedCluster = Arc<dyn Cluster>;

/// Filters applied to list calls
#[derive(Clone, Debug, Default)]
pub struct ListParams {
    /// Only return objects whose labels match
    pub label_selector: Option<Selector>,
}

impl ListParams {
    /// Filter by label selector
    #[must_use]
    pub fn labels(mut self, selector: Selector) -> Self {
        self.label_selector = Some(selector);
        self
    }

    /// Whether an object passes the filters
    pub fn matches(&self, obj: &DynamicObject) -> bool {
        self.label_selector
            .as_ref()
            .map_or(true, |selector| selector.matches(obj.label_map()))
    }
}

/// Which namespaces the operator watches
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum WatchScope {
    /// Every namespace, and cluster-scoped objects
    #[default]
    ClusterWide,
    /// Only the listed namespaces
    Namespaces(Vec<String>),
}

impl WatchScope {
    /// Build a scope from an allow-list, where an empty list means cluster-wide
    pub fn from_namespaces(namespaces: Vec<String>) -> Self {
        if namespaces.is_empty() {
            WatchScope::ClusterWide
        } else {
            WatchScope::Namespaces(namespaces)
        }
    }

    /// Whether the operator may see every namespace
    pub fn is_cluster_wide(&self) -> bool {
        matches!(self, WatchScope::ClusterWide)
    }

    /// The namespaces to issue calls against, where `None` means all namespaces
    pub fn targets(&self) -> Vec<Option<&str>> {
        match self {
            WatchScope::ClusterWide => vec![None],
            WatchScope::Namespaces(namespaces) => namespaces.iter().map(|ns| Some(ns.as_str())).collect(),
        }
    }
}

impl fmt::Display for WatchScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchScope::ClusterWide => f.write_str("cluster-wide"),
            WatchScope::Namespaces(namespaces) => f.write_str(&namespaces.join(",")),
        }
    }
}

/// Read and write access to the cluster API
///
/// Reads may be served from an eventually consistent cache. Callers never mutate
/// returned objects in place to change cluster state, every change is a write call.
#[async_trait]
pub trait Cluster: Send + Sync + 'static {
    /// Fetch a single object
    async fn get(&self, key: &ResourceKey) -> Result<DynamicObject>;

    /// List objects of a kind, in one namespace or (with `None`) all of them
    async fn list(&self, kind: &ApiKind, namespace: Option<&str>, params: &ListParams) -> Result<Vec<DynamicObject>>;

    /// Watch objects of a kind, in one namespace or (with `None`) all of them
    ///
    /// The stream only carries changes made after the call returns.
    async fn watch(&self, kind: &ApiKind, namespace: Option<&str>) -> Result<WatchStream>;

    /// Create a new object; fails with [`Error::Conflict`] if it already exists
    async fn create(&self, kind: &ApiKind, obj: DynamicObject) -> Result<DynamicObject>;

    /// Replace an existing object
    ///
    /// If `obj` carries a resource version it must match the stored one.
    async fn replace(&self, kind: &ApiKind, obj: DynamicObject) -> Result<DynamicObject>;

    /// Apply a JSON merge patch touching only `metadata`
    async fn patch_metadata(&self, key: &ResourceKey, patch: &serde_json::Value) -> Result<DynamicObject>;

    /// Delete an object
    async fn delete(&self, key: &ResourceKey) -> Result<()>;

    /// Wait until the read cache has caught up with the server, or `timeout` elapses
    async fn wait_for_sync(&self, timeout: Duration) -> bool;
}

/// Convenience helpers on top of [`Cluster`]
#[async_trait]
pub trait ClusterExt: Cluster {
    /// Fetch a single object, mapping a missing object to `None`
    async fn get_opt(&self, key: &ResourceKey) -> Result<Option<DynamicObject>> {
        match self.get(key).await {
            Ok(obj) => Ok(Some(obj)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// List objects of a kind across every namespace of `scope`
    async fn list_in_scope(
        &self,
        kind: &ApiKind,
        scope: &WatchScope,
        params: &ListParams,
    ) -> Result<Vec<DynamicObject>> {
        let mut objects = Vec::new();
        for namespace in scope.targets() {
            objects.extend(self.list(kind, namespace, params).await?);
        }
        Ok(objects)
    }

    /// Watch objects of a kind across every namespace of `scope`
    async fn watch_in_scope(&self, kind: &ApiKind, scope: &WatchScope) -> Result<WatchStream> {
        let mut streams = Vec::new();
        for namespace in scope.targets() {
            streams.push(self.watch(kind, namespace).await?);
        }
        Ok(futures::stream::select_all(streams).into_stream().boxed())
    }
}

impl<C: Cluster + ?Sized> ClusterExt for C {}

#[async_trait]
impl<C: Cluster + ?Sized> Cluster for Arc<C> {
    async fn get(&self, key: &ResourceKey) -> Result<DynamicObject> {
        (**self).get(key).await
    }

    async fn list(&self, kind: &ApiKind, namespace: Option<&str>, params: &ListParams) -> Result<Vec<DynamicObject>> {
        (**self).list(kind, namespace, params).await
    }

    async fn watch(&self, kind: &ApiKind, namespace: Option<&str>) -> Result<WatchStream> {
        (**self).watch(kind, namespace).await
    }

    async fn create(&self, kind: &ApiKind, obj: DynamicObject) -> Result<DynamicObject> {
        (**self).create(kind, obj).await
    }

    async fn replace(&self, kind: &ApiKind, obj: DynamicObject) -> Result<DynamicObject> {
        (**self).replace(kind, obj).await
    }

    async fn patch_metadata(&self, key: &ResourceKey, patch: &serde_json::Value) -> Result<DynamicObject> {
        (**self).patch_metadata(key, patch).await
    }

    async fn delete(&self, key: &ResourceKey) -> Result<()> {
        (**self).delete(key).await
    }

    async fn wait_for_sync(&self, timeout: Duration) -> bool {
        (**self).wait_for_sync(timeout).await
    }
}
