//! Contains the object representation shared by every kind the engine touches.
//!
//! The engine never needs typed specs: relationships, translations and ownership
//! markers are all read from well-known fields, so every object is held as a
//! [`DynamicObject`] and the few fields that matter are parsed on demand.
use crate::{gvk::ApiKind, key::ResourceKey, metadata::TypeMeta, ObjectMeta};

use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("failed to parse field {field} of {object}: {source}")]
/// Failed to read a typed field out of a [`DynamicObject`]
pub struct ParseObjectError {
    /// Display form of the object being read
    pub object: String,
    /// Path of the field below the object root
    pub field: String,
    #[source]
    source: serde_json::Error,
}

/// A dynamic representation of a cluster object
///
/// This will work with any non-list type object.
#[derive(serde::Serialize, serde::Deserialize, Clone, Debug, PartialEq, Default)]
pub struct DynamicObject {
    /// The type fields, not always present
    #[serde(flatten, default)]
    pub types: Option<TypeMeta>,
    /// Object metadata
    #[serde(default)]
    pub metadata: ObjectMeta,

    /// All other keys
    #[serde(flatten)]
    pub data: serde_json::Value,
}

impl DynamicObject {
    /// Create a DynamicObject with minimal values set from an [`ApiKind`]
    #[must_use]
    pub fn new(name: &str, kind: &ApiKind) -> Self {
        Self {
            types: Some(TypeMeta {
                api_version: kind.api_version(),
                kind: kind.kind.to_string(),
            }),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            data: serde_json::Value::Object(Default::default()),
        }
    }

    /// Attach dynamic data to a DynamicObject
    #[must_use]
    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Attach a namespace to a DynamicObject
    #[must_use]
    pub fn within(mut self, ns: &str) -> Self {
        self.metadata.namespace = Some(ns.into());
        self
    }

    /// Replace the labels of a DynamicObject
    #[must_use]
    pub fn labels<I, K, V>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.metadata.labels = Some(labels.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    /// The object name, or `""` if it has none yet
    pub fn name_any(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// The object namespace, or `""` for cluster-scoped objects
    pub fn namespace_any(&self) -> &str {
        self.metadata.namespace.as_deref().unwrap_or_default()
    }

    /// The key addressing this object as `kind`
    pub fn key(&self, kind: &ApiKind) -> ResourceKey {
        ResourceKey::from_meta(kind.clone(), &self.metadata)
    }

    /// Whether the object carries a deletion marker
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Labels of the object, empty if unset
    pub fn label_map(&self) -> &BTreeMap<String, String> {
        static EMPTY: BTreeMap<String, String> = BTreeMap::new();
        self.metadata.labels.as_ref().unwrap_or(&EMPTY)
    }

    /// Annotations of the object, empty if unset
    pub fn annotation_map(&self) -> &BTreeMap<String, String> {
        static EMPTY: BTreeMap<String, String> = BTreeMap::new();
        self.metadata.annotations.as_ref().unwrap_or(&EMPTY)
    }

    /// Look up a single annotation
    pub fn annotation(&self, name: &str) -> Option<&str> {
        self.annotation_map().get(name).map(String::as_str)
    }

    /// The `spec` subtree, if any
    pub fn spec(&self) -> Option<&serde_json::Value> {
        self.data.get("spec")
    }

    /// Parse an optional field below `spec`
    ///
    /// Missing and `null` fields both read as `None`.
    pub fn spec_field<T: DeserializeOwned>(&self, field: &str) -> Result<Option<T>, ParseObjectError> {
        match self.spec().and_then(|spec| spec.get(field)) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|source| ParseObjectError {
                    object: format!("{}/{}", self.namespace_any(), self.name_any()),
                    field: format!("spec.{field}"),
                    source,
                }),
        }
    }
}

#[cfg(test)]
mod test {
    use super::DynamicObject;
    use crate::gvk::kinds;
    use serde_json::json;

    #[test]
    fn can_round_trip_through_json() -> Result<(), serde_json::Error> {
        let raw = json!({
            "apiVersion": "operator.victoriametrics.com/v1beta1",
            "kind": "VMRule",
            "metadata": { "name": "example", "namespace": "default", "labels": { "team": "x" } },
            "spec": { "groups": [] }
        });
        let obj: DynamicObject = serde_json::from_value(raw.clone())?;
        assert_eq!(obj.name_any(), "example");
        assert_eq!(obj.label_map().get("team").map(String::as_str), Some("x"));
        assert_eq!(obj.spec(), Some(&json!({ "groups": [] })));
        assert_eq!(obj.types.as_ref().map(|t| t.kind.as_str()), Some("VMRule"));
        Ok(())
    }

    #[test]
    fn deletion_marker_is_read_from_metadata() -> Result<(), serde_json::Error> {
        let obj: DynamicObject = serde_json::from_value(json!({
            "metadata": { "name": "r1", "namespace": "ns1", "deletionTimestamp": "2024-01-01T00:00:00Z" },
        }))?;
        assert!(obj.is_deleting());
        assert!(!DynamicObject::new("r2", &kinds::VM_RULE).is_deleting());
        Ok(())
    }

    #[test]
    fn spec_field_reports_path_on_type_mismatch() {
        let obj = DynamicObject::new("a1", &kinds::VM_ALERT)
            .within("ns1")
            .data(json!({ "spec": { "selectAllByDefault": "yes", "parsingError": null } }));
        let err = obj.spec_field::<bool>("selectAllByDefault").unwrap_err();
        assert_eq!(err.field, "spec.selectAllByDefault");
        assert_eq!(err.object, "ns1/a1");
        assert_eq!(obj.spec_field::<String>("parsingError").unwrap(), None);
        assert_eq!(obj.spec_field::<String>("missing").unwrap(), None);
    }
}
