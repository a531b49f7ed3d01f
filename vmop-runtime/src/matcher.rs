//! Decides whether a parent's selectors pick up a child
use std::collections::BTreeMap;
use vmop_core::{RelationshipDescriptor, Selector, SelectorError};

/// The facts about a child that selectors are evaluated against
#[derive(Clone, Copy, Debug)]
pub struct MatchTarget<'a> {
    /// Namespace of the child
    pub namespace: &'a str,
    /// Labels of the child's namespace object
    pub namespace_labels: &'a BTreeMap<String, String>,
    /// Labels of the child
    pub labels: &'a BTreeMap<String, String>,
}

/// Evaluate a parent's selectors against a child
///
/// * Without a namespace selector only children in `parent_namespace` are eligible.
/// * An empty namespace selector makes every namespace eligible, any other one is
///   evaluated against the labels of the child's namespace.
/// * Without a label selector every eligible child matches.
///
/// Both selectors are validated before anything is evaluated, so a malformed
/// selector is reported even when the namespace check alone would reject the child.
/// Must not be called for parents with `selectAllByDefault` set.
pub fn matches(
    relationship: &RelationshipDescriptor,
    parent_namespace: &str,
    target: &MatchTarget<'_>,
) -> Result<bool, SelectorError> {
    debug_assert!(
        !relationship.select_all_by_default,
        "selectors of a select-all parent must not be evaluated"
    );
    let namespace_selector = relationship
        .namespace_selector
        .as_ref()
        .map(Selector::try_from)
        .transpose()?;
    let label_selector = relationship.selector.as_ref().map(Selector::try_from).transpose()?;

    let namespace_eligible = match &namespace_selector {
        None => target.namespace == parent_namespace,
        Some(selector) => selector.matches(target.namespace_labels),
    };
    if !namespace_eligible {
        return Ok(false);
    }
    Ok(label_selector.map_or(true, |selector| selector.matches(target.labels)))
}

/// Pluggable selector evaluation, see [`matches`]
pub trait SelectorMatcher: Send + Sync {
    /// Evaluate `relationship` against `target`
    fn matches(
        &self,
        relationship: &RelationshipDescriptor,
        parent_namespace: &str,
        target: &MatchTarget<'_>,
    ) -> Result<bool, SelectorError>;
}

/// The standard label selector semantics
#[derive(Clone, Copy, Debug, Default)]
pub struct LabelMatcher;

impl SelectorMatcher for LabelMatcher {
    fn matches(
        &self,
        relationship: &RelationshipDescriptor,
        parent_namespace: &str,
        target: &MatchTarget<'_>,
    ) -> Result<bool, SelectorError> {
        matches(relationship, parent_namespace, target)
    }
}
