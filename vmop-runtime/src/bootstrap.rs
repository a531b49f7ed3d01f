//! One-shot ownership stamping of cluster-scoped objects
//!
//! Runs before any dispatcher starts. Every failure is fatal for startup.
use crate::{
    cluster::{self, ListParams, SharedCluster},
    config::OwnershipConfig,
};
use thiserror::Error;
use tracing::{debug, info};
use vmop_core::{
    gvk::kinds::{self, OPERATOR_GROUP},
    ownership::MANAGED_BY_LABEL,
    ApiKind, DynamicObject, OwnershipMarker, ResourceKey, Selector,
};

/// Errors of the ownership bootstrap
#[derive(Debug, Error)]
pub enum Error {
    /// Objects of a kind could not be listed
    #[error("cannot list {kind}: {source}")]
    List {
        /// The kind being listed
        kind: String,
        /// Cluster error
        #[source]
        source: cluster::Error,
    },

    /// The marker could not be stamped onto an object
    #[error("cannot stamp ownership onto {key}: {source}")]
    Patch {
        /// The object being patched
        key: ResourceKey,
        /// Cluster error
        #[source]
        source: cluster::Error,
    },
}

/// What the bootstrap did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OwnershipReport {
    /// Objects that received the marker
    pub stamped: usize,
    /// Objects that already carried it
    pub already_owned: usize,
}

/// Stamp the ownership marker onto every object this operator manages
///
/// Objects of the configured kinds are considered managed when they carry the
/// `managed-by` label naming the operator; definitions are managed when they
/// belong to the operator's API group.
pub async fn ensure_ownership(cluster: &SharedCluster, config: &OwnershipConfig) -> Result<OwnershipReport, Error> {
    let marker = OwnershipMarker::new(config.operator_name.clone(), config.instance.clone());
    let mut report = OwnershipReport::default();
    for kind in &config.kinds {
        for obj in managed_objects(cluster, kind, &config.operator_name).await? {
            if marker.is_applied(&obj.metadata) {
                report.already_owned += 1;
                continue;
            }
            let key = obj.key(kind);
            cluster
                .patch_metadata(&key, &marker.merge_patch())
                .await
                .map_err(|source| Error::Patch {
                    key: key.clone(),
                    source,
                })?;
            debug!(%key, "stamped ownership");
            report.stamped += 1;
        }
    }
    info!(
        stamped = report.stamped,
        already_owned = report.already_owned,
        "ownership bootstrap finished"
    );
    Ok(report)
}

async fn managed_objects(
    cluster: &SharedCluster,
    kind: &ApiKind,
    operator_name: &str,
) -> Result<Vec<DynamicObject>, Error> {
    let list_failed = |source| Error::List {
        kind: kind.kind.to_string(),
        source,
    };
    if kind == &kinds::CUSTOM_RESOURCE_DEFINITION {
        let definitions = cluster
            .list(kind, None, &ListParams::default())
            .await
            .map_err(list_failed)?;
        return Ok(definitions
            .into_iter()
            .filter(|crd| crd.spec_field::<String>("group").ok().flatten().as_deref() == Some(OPERATOR_GROUP))
            .collect());
    }
    let params = ListParams::default().labels(Selector::from_iter([(
        MANAGED_BY_LABEL.to_string(),
        operator_name.to_string(),
    )]));
    cluster.list(kind, None, &params).await.map_err(list_failed)
}

#[cfg(test)]
mod tests {
    use super::{ensure_ownership, Error, OwnershipReport};
    use crate::{
        cluster::{MemoryCluster, SharedCluster, Verb},
        config::OwnershipConfig,
    };
    use serde_json::json;
    use std::sync::Arc;
    use vmop_core::{
        gvk::kinds,
        ownership::{MANAGED_BY_LABEL, OWNER_INSTANCE_ANNOTATION},
        DynamicObject, ErrorResponse, ResourceKey,
    };

    fn seeded() -> Arc<MemoryCluster> {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.seed(
            &kinds::CLUSTER_ROLE,
            DynamicObject::new("vm-agent-role", &kinds::CLUSTER_ROLE).labels([(MANAGED_BY_LABEL, "vm-operator")]),
        );
        cluster.seed(
            &kinds::CLUSTER_ROLE,
            DynamicObject::new("someone-else", &kinds::CLUSTER_ROLE).labels([(MANAGED_BY_LABEL, "helm")]),
        );
        cluster.seed(
            &kinds::CUSTOM_RESOURCE_DEFINITION,
            DynamicObject::new("vmrules.operator.victoriametrics.com", &kinds::CUSTOM_RESOURCE_DEFINITION)
                .data(json!({ "spec": { "group": "operator.victoriametrics.com" } })),
        );
        cluster.seed(
            &kinds::CUSTOM_RESOURCE_DEFINITION,
            DynamicObject::new("servicemonitors.monitoring.coreos.com", &kinds::CUSTOM_RESOURCE_DEFINITION)
                .data(json!({ "spec": { "group": "monitoring.coreos.com" } })),
        );
        cluster
    }

    #[tokio::test]
    async fn stamps_managed_objects_once() {
        let cluster = seeded();
        let shared: SharedCluster = cluster.clone();
        let config = OwnershipConfig::default();

        let report = ensure_ownership(&shared, &config).await.unwrap();
        assert_eq!(report, OwnershipReport {
            stamped: 2,
            already_owned: 0
        });
        assert!(cluster.writes().iter().all(|write| write.verb == Verb::PatchMetadata));
        let role = cluster
            .object(&ResourceKey::new(kinds::CLUSTER_ROLE, "vm-agent-role"))
            .unwrap();
        assert_eq!(role.annotation(OWNER_INSTANCE_ANNOTATION), Some("vm-operator"));
        let foreign = cluster
            .object(&ResourceKey::new(kinds::CLUSTER_ROLE, "someone-else"))
            .unwrap();
        assert_eq!(foreign.annotation(OWNER_INSTANCE_ANNOTATION), None);

        cluster.clear_writes();
        let again = ensure_ownership(&shared, &config).await.unwrap();
        assert_eq!(again, OwnershipReport {
            stamped: 0,
            already_owned: 2
        });
        assert_eq!(cluster.write_count(), 0);
    }

    #[tokio::test]
    async fn list_failure_is_fatal() {
        let cluster = seeded();
        cluster.fail_with(&kinds::CLUSTER_ROLE_BINDING, ErrorResponse::new(403, "Forbidden", "rbac"));
        let shared: SharedCluster = cluster.clone();
        let err = ensure_ownership(&shared, &OwnershipConfig::default()).await.unwrap_err();
        assert!(matches!(err, Error::List { kind, .. } if kind == "ClusterRoleBinding"));
    }
}
