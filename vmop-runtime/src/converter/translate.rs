//! Translation of foreign objects into their native counterparts
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use vmop_core::{gvk::kinds, metadata::OwnerReference, ApiKind, DynamicObject, ObjectMeta};

/// Annotation recording which foreign object a native object mirrors
pub const CONVERTED_FROM_ANNOTATION: &str = "operator.victoriametrics.com/converted-from";
/// Annotation that shields a native object from conversion writes when set to `enabled`
pub const IGNORE_UPDATES_ANNOTATION: &str = "operator.victoriametrics.com/ignore-prometheus-updates";

const RELABEL_RENAMES: &[(&str, &str)] = &[
    ("relabelings", "relabelConfigs"),
    ("metricRelabelings", "metricRelabelConfigs"),
];
const PROBE_RENAMES: &[(&str, &str)] = &[
    ("relabelings", "relabelConfigs"),
    ("metricRelabelings", "metricRelabelConfigs"),
    ("prober", "vmProberSpec"),
];

/// A foreign kind and the native kind it is mirrored into
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConversionPair {
    /// The kind being read
    pub foreign: ApiKind,
    /// The kind being written
    pub native: ApiKind,
    /// Spec keys renamed at any depth, `(foreign, native)`
    pub renames: &'static [(&'static str, &'static str)],
}

impl ConversionPair {
    /// Every supported pair
    pub fn builtin() -> Vec<ConversionPair> {
        vec![
            ConversionPair {
                foreign: kinds::SERVICE_MONITOR,
                native: kinds::VM_SERVICE_SCRAPE,
                renames: RELABEL_RENAMES,
            },
            ConversionPair {
                foreign: kinds::POD_MONITOR,
                native: kinds::VM_POD_SCRAPE,
                renames: RELABEL_RENAMES,
            },
            ConversionPair {
                foreign: kinds::PROMETHEUS_RULE,
                native: kinds::VM_RULE,
                renames: &[],
            },
            ConversionPair {
                foreign: kinds::PROBE,
                native: kinds::VM_PROBE,
                renames: PROBE_RENAMES,
            },
            ConversionPair {
                foreign: kinds::SCRAPE_CONFIG,
                native: kinds::VM_SCRAPE_CONFIG,
                renames: RELABEL_RENAMES,
            },
            ConversionPair {
                foreign: kinds::ALERTMANAGER_CONFIG,
                native: kinds::VM_ALERTMANAGER_CONFIG,
                renames: &[],
            },
        ]
    }
}

/// Knobs of [`translate`]
#[derive(Clone, Debug, Default)]
pub struct TranslateOptions {
    /// Label and annotation prefixes that are not copied
    pub filter_prefixes: Vec<String>,
    /// Point an owner reference at the foreign object
    pub owner_references: bool,
}

/// The foreign object cannot be expressed as a native one
#[derive(Debug, Error)]
#[error("cannot translate {object}: {reason}")]
pub struct TranslateError {
    /// `Kind/namespace/name` of the foreign object
    pub object: String,
    /// What is wrong with it
    pub reason: String,
}

/// The value of [`CONVERTED_FROM_ANNOTATION`] for a foreign object
pub fn source_ref(kind: &ApiKind, foreign: &DynamicObject) -> String {
    format!("{}/{}/{}", kind.kind, foreign.namespace_any(), foreign.name_any())
}

/// Build the native mirror of `foreign`
///
/// The mirror has the same name and namespace. Server-populated metadata is not
/// copied, so the result can be created as is.
pub fn translate(
    pair: &ConversionPair,
    foreign: &DynamicObject,
    options: &TranslateOptions,
) -> Result<DynamicObject, TranslateError> {
    let spec = match foreign.spec() {
        Some(Value::Object(spec)) => spec,
        Some(_) | None => {
            return Err(TranslateError {
                object: source_ref(&pair.foreign, foreign),
                reason: "spec is not an object".into(),
            })
        }
    };
    let spec = rename_keys(&Value::Object(spec.clone()), pair.renames);

    let mut annotations = filtered(foreign.annotation_map(), &options.filter_prefixes);
    annotations.insert(
        CONVERTED_FROM_ANNOTATION.to_string(),
        source_ref(&pair.foreign, foreign),
    );
    let labels = filtered(foreign.label_map(), &options.filter_prefixes);

    let owner_references = match (&foreign.metadata.uid, options.owner_references) {
        (Some(uid), true) => Some(vec![OwnerReference {
            api_version: pair.foreign.api_version(),
            kind: pair.foreign.kind.to_string(),
            name: foreign.name_any().to_string(),
            uid: uid.clone(),
            ..OwnerReference::default()
        }]),
        _ => None,
    };

    let mut native = DynamicObject::new(foreign.name_any(), &pair.native);
    native.metadata = ObjectMeta {
        name: foreign.metadata.name.clone(),
        namespace: foreign.metadata.namespace.clone(),
        labels: (!labels.is_empty()).then_some(labels),
        annotations: Some(annotations),
        owner_references,
        ..ObjectMeta::default()
    };
    native.data = serde_json::json!({ "spec": spec });
    Ok(native)
}

fn filtered(map: &BTreeMap<String, String>, prefixes: &[String]) -> BTreeMap<String, String> {
    map.iter()
        .filter(|(key, _)| !prefixes.iter().any(|prefix| key.starts_with(prefix.as_str())))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect()
}

fn rename_keys(value: &Value, renames: &[(&str, &str)]) -> Value {
    match value {
        Value::Object(fields) => {
            let mut out = Map::with_capacity(fields.len());
            for (key, value) in fields {
                let key = renames
                    .iter()
                    .find(|(from, _)| *from == key.as_str())
                    .map_or(key.as_str(), |(_, to)| *to);
                out.insert(key.to_string(), rename_keys(value, renames));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|item| rename_keys(item, renames)).collect()),
        other => other.clone(),
    }
}

/// Whether two native objects agree on everything the converter writes
///
/// Server-populated metadata (resource version, uid, timestamps) is ignored, and so
/// are labels and annotations that only `existing` carries.
pub fn same_content(existing: &DynamicObject, desired: &DynamicObject) -> bool {
    existing.spec() == desired.spec()
        && contains_all(existing.label_map(), desired.label_map())
        && contains_all(existing.annotation_map(), desired.annotation_map())
        && existing.metadata.owner_references == desired.metadata.owner_references
}

fn contains_all(map: &BTreeMap<String, String>, wanted: &BTreeMap<String, String>) -> bool {
    wanted.iter().all(|(key, value)| map.get(key) == Some(value))
}
