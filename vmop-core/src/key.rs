use crate::{gvk::ApiKind, ObjectMeta};
use educe::Educe;
use std::fmt::{self, Display};

/// A kinded and namespaced (if relevant) reference to a cluster object
///
/// This is the unit of serialization for reconciles: the work queue never runs two
/// reconciles for equal keys at once.
///
/// ```
/// use vmop_core::{gvk::kinds, ResourceKey};
/// assert_ne!(
///     ResourceKey::new(kinds::VM_RULE, "a"),
///     ResourceKey::new(kinds::VM_USER, "a"),
/// );
/// ```
#[derive(Educe)]
#[educe(Debug, PartialEq, Eq, Hash, Clone)]
pub struct ResourceKey {
    /// The kind of the object
    pub kind: ApiKind,
    /// The name of the object
    pub name: String,
    /// The namespace of the object
    ///
    /// May only be `None` if the kind is cluster-scoped.
    pub namespace: Option<String>,
    /// Extra information about the object being referred to
    ///
    /// This is *not* considered when comparing keys.
    #[educe(Hash(ignore), PartialEq(ignore))]
    pub extra: Extra,
}

/// Non-vital information about an object being referred to
///
/// See [`ResourceKey::extra`].
#[derive(Default, Debug, Clone)]
#[non_exhaustive]
pub struct Extra {
    /// The version of the resource at the time of reference
    pub resource_version: Option<String>,
    /// The uid of the object
    pub uid: Option<String>,
}

impl ResourceKey {
    /// A key to a cluster-scoped object, or a namespaced object before [`within`](Self::within)
    #[must_use]
    pub fn new(kind: ApiKind, name: &str) -> Self {
        Self {
            kind,
            name: name.into(),
            namespace: None,
            extra: Extra::default(),
        }
    }

    /// Place the key inside `namespace`
    #[must_use]
    pub fn within(mut self, namespace: &str) -> Self {
        self.namespace = Some(namespace.to_string());
        self
    }

    /// Build a key from object metadata
    ///
    /// Objects without a name (only possible with `generateName` before creation)
    /// get an empty name.
    #[must_use]
    pub fn from_meta(kind: ApiKind, meta: &ObjectMeta) -> Self {
        Self {
            kind,
            name: meta.name.clone().unwrap_or_default(),
            namespace: meta.namespace.clone(),
            extra: Extra {
                resource_version: meta.resource_version.clone(),
                uid: meta.uid.clone(),
            },
        }
    }

    /// The namespace, or `""` for cluster-scoped objects
    pub fn namespace_or_empty(&self) -> &str {
        self.namespace.as_deref().unwrap_or_default()
    }
}

impl Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.kind, self.name)?;
        if let Some(namespace) = &self.namespace {
            write!(f, ".{namespace}")?;
        }
        Ok(())
    }
}
