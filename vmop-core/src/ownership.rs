//! Ownership markers stamped on cluster-scoped objects
use crate::ObjectMeta;
use serde_json::json;

/// Label naming the operator that manages an object
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
/// Annotation naming the operator instance that owns an object
pub const OWNER_INSTANCE_ANNOTATION: &str = "operator.victoriametrics.com/owner-instance";

/// Label/annotation pair recording which operator instance owns an object
///
/// Objects that already carry the marker are not patched again.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnershipMarker {
    /// Value of [`MANAGED_BY_LABEL`]
    pub operator: String,
    /// Value of [`OWNER_INSTANCE_ANNOTATION`]
    pub instance: String,
}

impl OwnershipMarker {
    /// Create a marker for an operator instance
    pub fn new(operator: impl Into<String>, instance: impl Into<String>) -> Self {
        Self {
            operator: operator.into(),
            instance: instance.into(),
        }
    }

    /// Whether `meta` already carries this exact marker
    pub fn is_applied(&self, meta: &ObjectMeta) -> bool {
        let label = meta.labels.as_ref().and_then(|l| l.get(MANAGED_BY_LABEL));
        let annotation = meta
            .annotations
            .as_ref()
            .and_then(|a| a.get(OWNER_INSTANCE_ANNOTATION));
        label == Some(&self.operator) && annotation == Some(&self.instance)
    }

    /// A JSON merge patch that stamps the marker
    pub fn merge_patch(&self) -> serde_json::Value {
        json!({
            "metadata": {
                "labels": { MANAGED_BY_LABEL: self.operator },
                "annotations": { OWNER_INSTANCE_ANNOTATION: self.instance },
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stamped(operator: &str, instance: &str) -> ObjectMeta {
        ObjectMeta {
            labels: Some([(MANAGED_BY_LABEL.to_string(), operator.to_string())].into()),
            annotations: Some([(OWNER_INSTANCE_ANNOTATION.to_string(), instance.to_string())].into()),
            ..ObjectMeta::default()
        }
    }

    #[test]
    fn marker_needs_both_label_and_annotation() {
        let marker = OwnershipMarker::new("vm-operator", "vm-operator-0");
        assert!(!marker.is_applied(&ObjectMeta::default()));
        assert!(marker.is_applied(&stamped("vm-operator", "vm-operator-0")));

        let mut label_only = stamped("vm-operator", "vm-operator-0");
        label_only.annotations = None;
        assert!(!marker.is_applied(&label_only));
    }

    #[test]
    fn other_instance_is_not_considered_applied() {
        let current = OwnershipMarker::new("vm-operator", "new");
        assert!(!current.is_applied(&stamped("vm-operator", "old")));
        assert!(!current.is_applied(&stamped("other-operator", "new")));
    }

    #[test]
    fn merge_patch_keeps_existing_keys_untouched() {
        let patch = OwnershipMarker::new("vm-operator", "i").merge_patch();
        assert_eq!(patch["metadata"]["labels"][MANAGED_BY_LABEL], "vm-operator");
        assert_eq!(patch["metadata"]["annotations"][OWNER_INSTANCE_ANNOTATION], "i");
    }
}
