//! Parent/child relationships between declared kinds
//!
//! A parent (e.g. a `VMAlert`) selects the children (e.g. `VMRule`s) it is built
//! from through a pair of selectors in its spec. Which spec fields hold those
//! selectors depends on the parent kind and the child kind, see [`Relation`].
use crate::{
    dynamic::{DynamicObject, ParseObjectError},
    gvk::{kinds, ApiKind},
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

/// Spec field of a parent that holds a persistent validation error
pub const PARSING_ERROR_FIELD: &str = "parsingError";
/// Spec field of a parent that turns off selector evaluation
pub const SELECT_ALL_BY_DEFAULT_FIELD: &str = "selectAllByDefault";

/// How a parent selects its children, as read from its spec
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RelationshipDescriptor {
    /// Selects every child in scope; the selector fields are ignored when set
    pub select_all_by_default: bool,
    /// Label selector applied to the child's labels
    pub selector: Option<LabelSelector>,
    /// Namespace selector applied to the labels of the child's namespace
    ///
    /// Absent means "the parent's own namespace only".
    pub namespace_selector: Option<LabelSelector>,
}

impl RelationshipDescriptor {
    /// A descriptor selecting everything
    #[must_use]
    pub fn select_all() -> Self {
        Self {
            select_all_by_default: true,
            ..Self::default()
        }
    }

    /// A descriptor evaluating `selector` within the parent's namespace
    #[must_use]
    pub fn with_selector(selector: LabelSelector) -> Self {
        Self {
            selector: Some(selector),
            ..Self::default()
        }
    }

    /// Also evaluate `namespace_selector` against namespace labels
    #[must_use]
    pub fn namespace_selector(mut self, namespace_selector: LabelSelector) -> Self {
        self.namespace_selector = Some(namespace_selector);
        self
    }
}

/// A child kind, the parent kind that consumes it, and where the parent keeps its selectors
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Relation {
    /// The kind being reconciled
    pub child: ApiKind,
    /// The kind whose derived objects depend on the child
    pub parent: ApiKind,
    /// Spec field of the parent holding the label selector
    pub selector_field: &'static str,
    /// Spec field of the parent holding the namespace selector
    pub namespace_selector_field: &'static str,
}

impl Relation {
    /// Declare a relation
    pub const fn new(
        child: ApiKind,
        parent: ApiKind,
        selector_field: &'static str,
        namespace_selector_field: &'static str,
    ) -> Self {
        Self {
            child,
            parent,
            selector_field,
            namespace_selector_field,
        }
    }

    /// All relations between the native kinds
    pub fn builtin() -> Vec<Relation> {
        vec![
            Relation::new(kinds::VM_RULE, kinds::VM_ALERT, "ruleSelector", "ruleNamespaceSelector"),
            Relation::new(
                kinds::VM_SERVICE_SCRAPE,
                kinds::VM_AGENT,
                "serviceScrapeSelector",
                "serviceScrapeNamespaceSelector",
            ),
            Relation::new(
                kinds::VM_POD_SCRAPE,
                kinds::VM_AGENT,
                "podScrapeSelector",
                "podScrapeNamespaceSelector",
            ),
            Relation::new(
                kinds::VM_NODE_SCRAPE,
                kinds::VM_AGENT,
                "nodeScrapeSelector",
                "nodeScrapeNamespaceSelector",
            ),
            Relation::new(kinds::VM_PROBE, kinds::VM_AGENT, "probeSelector", "probeNamespaceSelector"),
            Relation::new(
                kinds::VM_STATIC_SCRAPE,
                kinds::VM_AGENT,
                "staticScrapeSelector",
                "staticScrapeNamespaceSelector",
            ),
            Relation::new(
                kinds::VM_SCRAPE_CONFIG,
                kinds::VM_AGENT,
                "scrapeConfigSelector",
                "scrapeConfigNamespaceSelector",
            ),
            Relation::new(kinds::VM_USER, kinds::VM_AUTH, "userSelector", "userNamespaceSelector"),
            Relation::new(
                kinds::VM_ALERTMANAGER_CONFIG,
                kinds::VM_ALERTMANAGER,
                "configSelector",
                "configNamespaceSelector",
            ),
        ]
    }

    /// Read the parent's relationship descriptor for this relation
    pub fn descriptor(&self, parent: &DynamicObject) -> Result<RelationshipDescriptor, ParseObjectError> {
        let select_all_by_default = parent
            .spec_field::<bool>(SELECT_ALL_BY_DEFAULT_FIELD)?
            .unwrap_or_default();
        if select_all_by_default {
            return Ok(RelationshipDescriptor::select_all());
        }
        Ok(RelationshipDescriptor {
            select_all_by_default,
            selector: parent.spec_field(self.selector_field)?,
            namespace_selector: parent.spec_field(self.namespace_selector_field)?,
        })
    }
}

/// The persistent validation error recorded on a parent, if any
///
/// Parents with a non-empty error are skipped until the error is cleared.
pub fn parsing_error(parent: &DynamicObject) -> Option<String> {
    parent
        .spec_field::<String>(PARSING_ERROR_FIELD)
        .ok()
        .flatten()
        .filter(|err| !err.is_empty())
}
