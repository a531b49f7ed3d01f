//! Type information for the kinds the engine watches and writes.
use std::{borrow::Cow, fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to parse group version: {0}")]
/// Failed to parse group version.
pub struct ParseGroupVersionError(pub String);

/// Core information about a family of API resources
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct GroupVersion {
    /// API group
    pub group: String,
    /// Version
    pub version: String,
}

impl GroupVersion {
    /// Construct from explicit group and version
    pub fn gv(group_: &str, version_: &str) -> Self {
        Self {
            group: group_.to_string(),
            version: version_.to_string(),
        }
    }

    /// Generate the apiVersion string used in a kind's yaml
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl FromStr for GroupVersion {
    type Err = ParseGroupVersionError;

    fn from_str(gv: &str) -> Result<Self, Self::Err> {
        let gvsplit = gv.splitn(2, '/').collect::<Vec<_>>();
        let (group, version) = match *gvsplit.as_slice() {
            [g, v] if !v.is_empty() => (g.to_string(), v.to_string()), // standard case
            [v] if !v.is_empty() => ("".to_string(), v.to_string()),   // core v1 case
            _ => return Err(ParseGroupVersionError(gv.into())),
        };
        Ok(Self { group, version })
    }
}

/// Whether objects of a kind live inside a namespace
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// Objects are addressed by namespace and name
    Namespaced,
    /// Objects are addressed by name only
    Cluster,
}

/// Everything needed to address a kind on the API server
///
/// Equality and hashing consider the full group/version/kind triple, so the
/// same kind name served from two groups (e.g. `Probe`) never collides.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ApiKind {
    /// API group, empty for the core group
    pub group: Cow<'static, str>,
    /// Version
    pub version: Cow<'static, str>,
    /// Singular PascalCase kind name
    pub kind: Cow<'static, str>,
    /// Plural lowercase resource name
    pub plural: Cow<'static, str>,
    /// Namespace scope of the kind
    pub scope: Scope,
}

impl ApiKind {
    /// A namespaced kind known at compile time
    pub const fn namespaced(
        group: &'static str,
        version: &'static str,
        kind: &'static str,
        plural: &'static str,
    ) -> Self {
        Self {
            group: Cow::Borrowed(group),
            version: Cow::Borrowed(version),
            kind: Cow::Borrowed(kind),
            plural: Cow::Borrowed(plural),
            scope: Scope::Namespaced,
        }
    }

    /// A cluster scoped kind known at compile time
    pub const fn cluster(
        group: &'static str,
        version: &'static str,
        kind: &'static str,
        plural: &'static str,
    ) -> Self {
        Self {
            group: Cow::Borrowed(group),
            version: Cow::Borrowed(version),
            kind: Cow::Borrowed(kind),
            plural: Cow::Borrowed(plural),
            scope: Scope::Cluster,
        }
    }

    /// Generate the apiVersion string used in a kind's yaml
    pub fn api_version(&self) -> String {
        GroupVersion::gv(&self.group, &self.version).api_version()
    }

    /// Whether objects of this kind are namespaced
    pub fn is_namespaced(&self) -> bool {
        self.scope == Scope::Namespaced
    }
}

impl fmt::Display for ApiKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.kind, self.api_version())
    }
}

/// Well-known kinds
#[allow(missing_docs)]
pub mod kinds {
    use super::ApiKind;

    /// Group of the native schema
    pub const OPERATOR_GROUP: &str = "operator.victoriametrics.com";
    /// Group of the foreign (prometheus-operator) schema
    pub const MONITORING_GROUP: &str = "monitoring.coreos.com";

    pub const VM_RULE: ApiKind = ApiKind::namespaced(OPERATOR_GROUP, "v1beta1", "VMRule", "vmrules");
    pub const VM_ALERT: ApiKind = ApiKind::namespaced(OPERATOR_GROUP, "v1beta1", "VMAlert", "vmalerts");
    pub const VM_AGENT: ApiKind = ApiKind::namespaced(OPERATOR_GROUP, "v1beta1", "VMAgent", "vmagents");
    pub const VM_SERVICE_SCRAPE: ApiKind =
        ApiKind::namespaced(OPERATOR_GROUP, "v1beta1", "VMServiceScrape", "vmservicescrapes");
    pub const VM_POD_SCRAPE: ApiKind =
        ApiKind::namespaced(OPERATOR_GROUP, "v1beta1", "VMPodScrape", "vmpodscrapes");
    pub const VM_NODE_SCRAPE: ApiKind =
        ApiKind::namespaced(OPERATOR_GROUP, "v1beta1", "VMNodeScrape", "vmnodescrapes");
    pub const VM_PROBE: ApiKind = ApiKind::namespaced(OPERATOR_GROUP, "v1beta1", "VMProbe", "vmprobes");
    pub const VM_STATIC_SCRAPE: ApiKind =
        ApiKind::namespaced(OPERATOR_GROUP, "v1beta1", "VMStaticScrape", "vmstaticscrapes");
    pub const VM_SCRAPE_CONFIG: ApiKind =
        ApiKind::namespaced(OPERATOR_GROUP, "v1beta1", "VMScrapeConfig", "vmscrapeconfigs");
    pub const VM_USER: ApiKind = ApiKind::namespaced(OPERATOR_GROUP, "v1beta1", "VMUser", "vmusers");
    pub const VM_AUTH: ApiKind = ApiKind::namespaced(OPERATOR_GROUP, "v1beta1", "VMAuth", "vmauths");
    pub const VM_ALERTMANAGER_CONFIG: ApiKind = ApiKind::namespaced(
        OPERATOR_GROUP,
        "v1beta1",
        "VMAlertmanagerConfig",
        "vmalertmanagerconfigs",
    );
    pub const VM_ALERTMANAGER: ApiKind =
        ApiKind::namespaced(OPERATOR_GROUP, "v1beta1", "VMAlertmanager", "vmalertmanagers");

    pub const SERVICE_MONITOR: ApiKind =
        ApiKind::namespaced(MONITORING_GROUP, "v1", "ServiceMonitor", "servicemonitors");
    pub const POD_MONITOR: ApiKind = ApiKind::namespaced(MONITORING_GROUP, "v1", "PodMonitor", "podmonitors");
    pub const PROMETHEUS_RULE: ApiKind =
        ApiKind::namespaced(MONITORING_GROUP, "v1", "PrometheusRule", "prometheusrules");
    pub const PROBE: ApiKind = ApiKind::namespaced(MONITORING_GROUP, "v1", "Probe", "probes");
    pub const SCRAPE_CONFIG: ApiKind =
        ApiKind::namespaced(MONITORING_GROUP, "v1alpha1", "ScrapeConfig", "scrapeconfigs");
    pub const ALERTMANAGER_CONFIG: ApiKind = ApiKind::namespaced(
        MONITORING_GROUP,
        "v1alpha1",
        "AlertmanagerConfig",
        "alertmanagerconfigs",
    );

    pub const NAMESPACE: ApiKind = ApiKind::cluster("", "v1", "Namespace", "namespaces");
    pub const CLUSTER_ROLE: ApiKind =
        ApiKind::cluster("rbac.authorization.k8s.io", "v1", "ClusterRole", "clusterroles");
    pub const CLUSTER_ROLE_BINDING: ApiKind = ApiKind::cluster(
        "rbac.authorization.k8s.io",
        "v1",
        "ClusterRoleBinding",
        "clusterrolebindings",
    );
    pub const CUSTOM_RESOURCE_DEFINITION: ApiKind = ApiKind::cluster(
        "apiextensions.k8s.io",
        "v1",
        "CustomResourceDefinition",
        "customresourcedefinitions",
    );
}

#[cfg(test)]
mod tests {
    use super::{kinds, GroupVersion};

    #[test]
    fn api_version_omits_core_group() {
        assert_eq!(kinds::NAMESPACE.api_version(), "v1");
        assert_eq!(kinds::VM_RULE.api_version(), "operator.victoriametrics.com/v1beta1");
    }

    #[test]
    fn group_version_parses_core_and_grouped() {
        let core: GroupVersion = "v1".parse().unwrap();
        assert_eq!(core.group, "");
        let grouped: GroupVersion = "monitoring.coreos.com/v1".parse().unwrap();
        assert_eq!(grouped.group, "monitoring.coreos.com");
        assert!("apps/".parse::<GroupVersion>().is_err());
    }

    #[test]
    fn same_kind_name_in_other_group_is_distinct() {
        assert_ne!(kinds::PROBE, kinds::VM_PROBE);
        assert_eq!(format!("{}", kinds::PROBE), "Probe.monitoring.coreos.com/v1");
    }
}
