//! Reconciles a changed child by rebuilding every parent that selects it
use crate::{
    cluster::{self, ClusterExt, ListParams, SharedCluster, WatchScope},
    controller::Action,
    matcher::{LabelMatcher, MatchTarget, SelectorMatcher},
    materializer::{BoxError, Materializer},
    metrics::ObjectStats,
    rate_limiter::{RateLimiters, ReconcileRateLimiter},
};
use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;
use tracing::{debug, error, info_span, Instrument};
use vmop_core::{gvk::kinds, relation, DynamicObject, Relation, ResourceKey};

/// Errors that abort a reconcile pass; the key is retried with backoff
#[derive(Debug, Error)]
pub enum Error {
    /// The child could not be read
    #[error("cannot get {key}: {source}")]
    GetFailed {
        /// The child being reconciled
        key: ResourceKey,
        /// Cluster error
        #[source]
        source: cluster::Error,
    },

    /// The parents could not be listed
    #[error("cannot list {kind} parents: {source}")]
    ListFailed {
        /// Parent kind
        kind: String,
        /// Cluster error
        #[source]
        source: cluster::Error,
    },

    /// The namespace of the child could not be read for namespace selection
    #[error("cannot get namespace {namespace}: {source}")]
    NamespaceLookupFailed {
        /// Namespace of the child
        namespace: String,
        /// Cluster error
        #[source]
        source: cluster::Error,
    },

    /// A parent could not be rebuilt; parents rebuilt before it stay rebuilt
    #[error("cannot rebuild {parent}: {source}")]
    MaterializeFailed {
        /// `namespace/name` of the parent
        parent: String,
        /// Materializer error
        #[source]
        source: BoxError,
    },
}

/// Reconciles children of one [`Relation`]
///
/// Cheap to share behind an `Arc`; every reconcile only reads the cluster and calls
/// the [`Materializer`].
pub struct Dispatcher {
    relation: Relation,
    cluster: SharedCluster,
    materializer: Arc<dyn Materializer>,
    matcher: Arc<dyn SelectorMatcher>,
    limiter: Arc<ReconcileRateLimiter>,
    stats: ObjectStats,
    scope: WatchScope,
}

impl Dispatcher {
    /// A dispatcher for `relation`, throttled by the limiter of its parent kind
    pub fn new(
        relation: Relation,
        cluster: SharedCluster,
        materializer: Arc<dyn Materializer>,
        limiters: &RateLimiters,
        stats: ObjectStats,
        scope: WatchScope,
    ) -> Self {
        let limiter = limiters.for_parent(&relation.parent);
        Self {
            relation,
            cluster,
            materializer,
            matcher: Arc::new(LabelMatcher),
            limiter,
            stats,
            scope,
        }
    }

    /// Evaluate selectors with `matcher` instead of [`LabelMatcher`]
    #[must_use]
    pub fn with_matcher(mut self, matcher: Arc<dyn SelectorMatcher>) -> Self {
        self.matcher = matcher;
        self
    }

    /// The relation this dispatcher serves
    pub fn relation(&self) -> &Relation {
        &self.relation
    }

    /// Reconcile the child behind `key`
    ///
    /// A missing child or a throttled attempt is a success that waits for the next change.
    pub async fn reconcile(&self, key: &ResourceKey) -> Result<Action, Error> {
        let span = info_span!(
            "reconcile",
            kind = %self.relation.child.kind,
            namespace = key.namespace_or_empty(),
            name = %key.name,
        );
        self.reconcile_inner(key).instrument(span).await
    }

    async fn reconcile_inner(&self, key: &ResourceKey) -> Result<Action, Error> {
        let child = match self.cluster.get_opt(key).await {
            Ok(Some(child)) => child,
            Ok(None) => {
                debug!("object is gone");
                return Ok(Action::await_change());
            }
            Err(source) => {
                return Err(Error::GetFailed {
                    key: key.clone(),
                    source,
                })
            }
        };
        self.stats.record_reconcile(&self.relation.child.kind);

        if self.limiter.should_throttle() {
            self.stats.record_throttled(&self.relation.child.kind);
            debug!(parent_kind = %self.relation.parent.kind, "reconcile throttled");
            return Ok(Action::await_change());
        }

        let parents = self
            .cluster
            .list_in_scope(&self.relation.parent, &self.scope, &ListParams::default())
            .await
            .map_err(|source| Error::ListFailed {
                kind: self.relation.parent.kind.to_string(),
                source,
            })?;

        let mut namespace_labels = None;
        for parent in parents {
            if parent.is_deleting() || relation::parsing_error(&parent).is_some() {
                continue;
            }
            let span = info_span!(
                "parent",
                parent = %parent.name_any(),
                parent_namespace = %parent.namespace_any(),
            );
            let selected = self
                .selects(&parent, &child, &mut namespace_labels)
                .instrument(span.clone())
                .await?;
            if !selected {
                continue;
            }
            self.materializer
                .materialize(&parent, &child)
                .instrument(span)
                .await
                .map_err(|source| Error::MaterializeFailed {
                    parent: format!("{}/{}", parent.namespace_any(), parent.name_any()),
                    source,
                })?;
        }
        Ok(Action::await_change())
    }

    /// Whether `parent` selects `child`, evaluation errors count as "not selected"
    ///
    /// A child being deleted is always selected: its labels may have changed since
    /// the parent last picked it up, and the parent must drop it either way.
    async fn selects(
        &self,
        parent: &DynamicObject,
        child: &DynamicObject,
        namespace_labels: &mut Option<BTreeMap<String, String>>,
    ) -> Result<bool, Error> {
        if child.is_deleting() {
            return Ok(true);
        }
        let descriptor = match self.relation.descriptor(parent) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                error!(error = %err, "cannot read selectors of parent");
                return Ok(false);
            }
        };
        if descriptor.select_all_by_default {
            return Ok(true);
        }
        if descriptor.namespace_selector.is_some() && namespace_labels.is_none() {
            *namespace_labels = Some(self.namespace_labels(child.namespace_any()).await?);
        }
        let empty = BTreeMap::new();
        let target = MatchTarget {
            namespace: child.namespace_any(),
            namespace_labels: namespace_labels.as_ref().unwrap_or(&empty),
            labels: child.label_map(),
        };
        match self.matcher.matches(&descriptor, parent.namespace_any(), &target) {
            Ok(selected) => Ok(selected),
            Err(err) => {
                error!(error = %err, "cannot match parent and child");
                Ok(false)
            }
        }
    }

    async fn namespace_labels(&self, namespace: &str) -> Result<BTreeMap<String, String>, Error> {
        let key = ResourceKey::new(kinds::NAMESPACE, namespace);
        match self.cluster.get_opt(&key).await {
            Ok(ns) => Ok(ns.map(|ns| ns.label_map().clone()).unwrap_or_default()),
            Err(source) => Err(Error::NamespaceLookupFailed {
                namespace: namespace.to_string(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Dispatcher, Error};
    use crate::{
        cluster::{MemoryCluster, WatchScope},
        materializer::RecordingMaterializer,
        metrics::ObjectStats,
        rate_limiter::{RateLimitSettings, RateLimiters},
    };
    use serde_json::json;
    use std::{sync::Arc, time::Duration};
    use vmop_core::{gvk::kinds, DynamicObject, ErrorResponse, Relation, ResourceKey};

    struct Fixture {
        cluster: Arc<MemoryCluster>,
        materializer: Arc<RecordingMaterializer>,
        stats: ObjectStats,
        dispatcher: Dispatcher,
    }

    fn fixture(scope: WatchScope) -> Fixture {
        let cluster = Arc::new(MemoryCluster::new());
        let materializer = Arc::new(RecordingMaterializer::new());
        let stats = ObjectStats::default();
        let relation = Relation::builtin().into_iter().next().unwrap();
        let dispatcher = Dispatcher::new(
            relation,
            cluster.clone(),
            materializer.clone(),
            &RateLimiters::new(RateLimitSettings {
                limit: 0,
                window: Duration::from_secs(1),
            }),
            stats.clone(),
            scope,
        );
        Fixture {
            cluster,
            materializer,
            stats,
            dispatcher,
        }
    }

    fn alert(name: &str, ns: &str, spec: serde_json::Value) -> DynamicObject {
        DynamicObject::new(name, &kinds::VM_ALERT)
            .within(ns)
            .data(json!({ "spec": spec }))
    }

    fn rule_key(name: &str, ns: &str) -> ResourceKey {
        ResourceKey::new(kinds::VM_RULE, name).within(ns)
    }

    #[tokio::test]
    async fn missing_child_is_a_quiet_success() {
        let f = fixture(WatchScope::ClusterWide);
        let action = f.dispatcher.reconcile(&rule_key("gone", "ns1")).await.unwrap();
        assert!(action.requeue_after().is_none());
        assert_eq!(f.stats.get("VMRule").reconciles, 0);
        assert_eq!(f.materializer.call_count(), 0);
    }

    #[tokio::test]
    async fn poisoned_and_deleting_parents_are_skipped() {
        let f = fixture(WatchScope::ClusterWide);
        f.cluster.seed(&kinds::VM_RULE, DynamicObject::new("r1", &kinds::VM_RULE).within("ns1"));
        f.cluster.seed(&kinds::VM_ALERT, alert("broken", "ns1", json!({ "parsingError": "bad rule" })));
        let mut deleting = alert("leaving", "ns1", json!({}));
        deleting.metadata.deletion_timestamp = serde_json::from_value(json!("2024-01-01T00:00:00Z")).unwrap();
        f.cluster.seed(&kinds::VM_ALERT, deleting);
        f.cluster.seed(&kinds::VM_ALERT, alert("healthy", "ns1", json!({})));

        f.dispatcher.reconcile(&rule_key("r1", "ns1")).await.unwrap();
        assert_eq!(f.materializer.calls(), vec![("ns1/healthy".to_string(), "ns1/r1".to_string())]);
        assert_eq!(f.stats.get("VMRule").reconciles, 1);
    }

    #[tokio::test]
    async fn namespace_selector_reads_namespace_labels() {
        let f = fixture(WatchScope::ClusterWide);
        f.cluster.seed(
            &kinds::NAMESPACE,
            DynamicObject::new("apps", &kinds::NAMESPACE).labels([("env", "prod")]),
        );
        f.cluster.seed(&kinds::VM_RULE, DynamicObject::new("r1", &kinds::VM_RULE).within("apps"));
        f.cluster.seed(&kinds::VM_RULE, DynamicObject::new("r2", &kinds::VM_RULE).within("dev"));
        f.cluster.seed(
            &kinds::VM_ALERT,
            alert("a1", "monitoring", json!({ "ruleNamespaceSelector": { "matchLabels": { "env": "prod" } } })),
        );

        f.dispatcher.reconcile(&rule_key("r1", "apps")).await.unwrap();
        f.dispatcher.reconcile(&rule_key("r2", "dev")).await.unwrap();
        assert_eq!(f.materializer.calls(), vec![(
            "monitoring/a1".to_string(),
            "apps/r1".to_string()
        )]);
    }

    #[tokio::test]
    async fn malformed_selector_only_skips_that_parent() {
        let f = fixture(WatchScope::ClusterWide);
        f.cluster.seed(&kinds::VM_RULE, DynamicObject::new("r1", &kinds::VM_RULE).within("ns1"));
        f.cluster.seed(
            &kinds::VM_ALERT,
            alert("a0", "ns1", json!({
                "ruleSelector": { "matchExpressions": [{ "key": "team", "operator": "Near" }] }
            })),
        );
        f.cluster.seed(&kinds::VM_ALERT, alert("a1", "ns1", json!({})));

        f.dispatcher.reconcile(&rule_key("r1", "ns1")).await.unwrap();
        assert_eq!(f.materializer.calls(), vec![("ns1/a1".to_string(), "ns1/r1".to_string())]);
    }

    #[tokio::test]
    async fn list_and_materialize_failures_are_retryable_errors() {
        let f = fixture(WatchScope::Namespaces(vec!["ns1".into()]));
        f.cluster.seed(&kinds::VM_RULE, DynamicObject::new("r1", &kinds::VM_RULE).within("ns1"));
        f.cluster.fail_with(&kinds::VM_ALERT, ErrorResponse::new(500, "InternalError", "etcd down"));
        assert!(matches!(
            f.dispatcher.reconcile(&rule_key("r1", "ns1")).await,
            Err(Error::ListFailed { .. })
        ));

        f.cluster.heal(&kinds::VM_ALERT);
        f.cluster.seed(&kinds::VM_ALERT, alert("a1", "ns1", json!({})));
        f.materializer.fail_with("configmap too large");
        let err = f.dispatcher.reconcile(&rule_key("r1", "ns1")).await.unwrap_err();
        assert!(matches!(&err, Error::MaterializeFailed { parent, .. } if parent == "ns1/a1"));
    }

    #[tokio::test]
    async fn failing_parent_stops_the_pass_after_earlier_parents() {
        let f = fixture(WatchScope::ClusterWide);
        f.cluster.seed(&kinds::VM_RULE, DynamicObject::new("r1", &kinds::VM_RULE).within("ns1"));
        for name in ["a1", "a2", "a3"] {
            f.cluster.seed(&kinds::VM_ALERT, alert(name, "ns1", json!({ "selectAllByDefault": true })));
        }
        f.materializer.fail_parent("ns1/a2", "template error");

        let err = f.dispatcher.reconcile(&rule_key("r1", "ns1")).await.unwrap_err();
        assert!(matches!(&err, Error::MaterializeFailed { parent, .. } if parent == "ns1/a2"));
        assert_eq!(f.materializer.calls(), vec![
            ("ns1/a1".to_string(), "ns1/r1".to_string()),
            ("ns1/a2".to_string(), "ns1/r1".to_string()),
        ]);
    }

    #[tokio::test]
    async fn parents_outside_the_watched_namespaces_are_not_considered() {
        let f = fixture(WatchScope::Namespaces(vec!["ns1".into()]));
        f.cluster.seed(&kinds::VM_RULE, DynamicObject::new("r1", &kinds::VM_RULE).within("ns1"));
        let every_namespace = json!({ "ruleNamespaceSelector": {} });
        f.cluster.seed(&kinds::VM_ALERT, alert("inside", "ns1", every_namespace.clone()));
        f.cluster.seed(&kinds::VM_ALERT, alert("outside", "ns2", every_namespace));

        f.dispatcher.reconcile(&rule_key("r1", "ns1")).await.unwrap();
        assert_eq!(f.materializer.calls(), vec![("ns1/inside".to_string(), "ns1/r1".to_string())]);
    }
}
