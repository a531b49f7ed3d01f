//! Label selector evaluation
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    iter::FromIterator,
};
use thiserror::Error;

// local type aliases
type Map = BTreeMap<String, String>;
type Expressions = Vec<Expression>;

/// A malformed [`LabelSelectorRequirement`]
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectorError {
    /// The operator is none of `In`, `NotIn`, `Exists`, `DoesNotExist`
    #[error("unknown operator {operator:?} for key {key:?}")]
    UnknownOperator {
        /// Requirement key
        key: String,
        /// Offending operator
        operator: String,
    },
    /// `In` and `NotIn` need a non-empty value list
    #[error("operator {operator} for key {key:?} requires at least one value")]
    MissingValues {
        /// Requirement key
        key: String,
        /// Offending operator
        operator: String,
    },
    /// `Exists` and `DoesNotExist` must not carry values
    #[error("operator {operator} for key {key:?} must not have values")]
    UnexpectedValues {
        /// Requirement key
        key: String,
        /// Offending operator
        operator: String,
    },
    /// Label keys must not be empty
    #[error("selector requirement has an empty key")]
    EmptyKey,
}

/// A selector expression with existing operations
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
pub enum Expression {
    /// Label value is one of the set
    In(String, BTreeSet<String>),
    /// Label is absent or its value is not in the set
    NotIn(String, BTreeSet<String>),
    /// Label has exactly this value
    Equal(String, String),
    /// Label is absent or has another value
    NotEqual(String, String),
    /// Label is present
    Exists(String),
    /// Label is absent
    DoesNotExist(String),
}

/// Perform selection on a list of expressions
///
/// An empty selector selects everything.
#[derive(Clone, Debug, Eq, PartialEq, Default, Deserialize, Serialize)]
pub struct Selector(Expressions);

impl Selector {
    /// Create a selector from a vector of expressions
    fn from_expressions(exprs: Expressions) -> Self {
        Self(exprs)
    }

    /// Create a selector from a map of key=value label matches
    fn from_map(map: Map) -> Self {
        Self(map.into_iter().map(|(k, v)| Expression::Equal(k, v)).collect())
    }

    /// Convert a selector to the string form understood by list filters
    pub fn to_selector_string(&self) -> String {
        let selectors: Vec<String> = self.0.iter().map(|e| e.to_string()).collect();
        selectors.join(",")
    }

    /// Indicates whether this label selector matches all objects
    pub fn selects_all(&self) -> bool {
        self.0.is_empty()
    }

    /// Evaluate the selector against a label set
    pub fn matches(&self, labels: &Map) -> bool {
        self.0.iter().all(|expr| expr.matches(labels))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_selector_string())
    }
}

// === Expression ===

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expression::In(key, values) => {
                write!(f, "{key} in ({})", values.iter().cloned().collect::<Vec<_>>().join(","))
            }
            Expression::NotIn(key, values) => {
                write!(f, "{key} notin ({})", values.iter().cloned().collect::<Vec<_>>().join(","))
            }
            Expression::Equal(key, value) => write!(f, "{key}={value}"),
            Expression::NotEqual(key, value) => write!(f, "{key}!={value}"),
            Expression::Exists(key) => write!(f, "{key}"),
            Expression::DoesNotExist(key) => write!(f, "!{key}"),
        }
    }
}

impl Expression {
    fn matches(&self, labels: &Map) -> bool {
        match self {
            Expression::In(key, values) => match labels.get(key) {
                Some(v) => values.contains(v),
                None => false,
            },
            Expression::NotIn(key, values) => match labels.get(key) {
                Some(v) => !values.contains(v),
                None => true,
            },
            Expression::Exists(key) => labels.contains_key(key),
            Expression::DoesNotExist(key) => !labels.contains_key(key),
            Expression::Equal(key, value) => labels.get(key) == Some(value),
            Expression::NotEqual(key, value) => labels.get(key) != Some(value),
        }
    }
}

// convenience conversions for Selector

impl FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect())
    }
}

impl FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self::from_expressions(iter.into_iter().collect())
    }
}

impl From<Expression> for Selector {
    fn from(value: Expression) -> Self {
        Self(vec![value])
    }
}

impl TryFrom<LabelSelector> for Selector {
    type Error = SelectorError;

    fn try_from(value: LabelSelector) -> Result<Self, Self::Error> {
        let mut equality: Selector = value
            .match_labels
            .map(|labels| labels.into_iter().collect())
            .unwrap_or_default();
        if equality.0.iter().any(|e| matches!(e, Expression::Equal(k, _) if k.is_empty())) {
            return Err(SelectorError::EmptyKey);
        }
        for requirement in value.match_expressions.into_iter().flatten() {
            equality.0.push(requirement.try_into()?);
        }
        Ok(equality)
    }
}

impl TryFrom<&LabelSelector> for Selector {
    type Error = SelectorError;

    fn try_from(value: &LabelSelector) -> Result<Self, Self::Error> {
        value.clone().try_into()
    }
}

impl TryFrom<LabelSelectorRequirement> for Expression {
    type Error = SelectorError;

    fn try_from(requirement: LabelSelectorRequirement) -> Result<Self, Self::Error> {
        let key = requirement.key;
        if key.is_empty() {
            return Err(SelectorError::EmptyKey);
        }
        let values = requirement.values.unwrap_or_default();
        let operator = requirement.operator;
        match operator.as_str() {
            "In" | "NotIn" if values.is_empty() => Err(SelectorError::MissingValues {
                key,
                operator: operator.clone(),
            }),
            "In" => Ok(Expression::In(key, values.into_iter().collect())),
            "NotIn" => Ok(Expression::NotIn(key, values.into_iter().collect())),
            "Exists" | "DoesNotExist" if !values.is_empty() => {
                Err(SelectorError::UnexpectedValues {
                    key,
                    operator: operator.clone(),
                })
            }
            "Exists" => Ok(Expression::Exists(key)),
            "DoesNotExist" => Ok(Expression::DoesNotExist(key)),
            _ => Err(SelectorError::UnknownOperator {
                key,
                operator: operator.clone(),
            }),
        }
    }
}

impl From<Selector> for LabelSelector {
    fn from(value: Selector) -> Self {
        let mut equality = vec![];
        let mut expressions = vec![];
        for expr in value.0 {
            match expr {
                Expression::In(key, values) => expressions.push(LabelSelectorRequirement {
                    key,
                    operator: "In".into(),
                    values: Some(values.into_iter().collect()),
                }),
                Expression::NotIn(key, values) => expressions.push(LabelSelectorRequirement {
                    key,
                    operator: "NotIn".into(),
                    values: Some(values.into_iter().collect()),
                }),
                Expression::Equal(key, value) => equality.push((key, value)),
                Expression::NotEqual(key, value) => expressions.push(LabelSelectorRequirement {
                    key,
                    operator: "NotIn".into(),
                    values: Some(vec![value]),
                }),
                Expression::Exists(key) => expressions.push(LabelSelectorRequirement {
                    key,
                    operator: "Exists".into(),
                    values: None,
                }),
                Expression::DoesNotExist(key) => expressions.push(LabelSelectorRequirement {
                    key,
                    operator: "DoesNotExist".into(),
                    values: None,
                }),
            }
        }

        LabelSelector {
            match_labels: (!equality.is_empty()).then_some(equality.into_iter().collect()),
            match_expressions: (!expressions.is_empty()).then_some(expressions),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::iter::FromIterator;

    fn labels(pairs: &[(&str, &str)]) -> Map {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_raw_matches() {
        for (selector, labels, matches, msg) in &[
            (Selector::default(), Map::default(), true, "empty match"),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                labels(&[("foo", "bar")]),
                true,
                "exact label match",
            ),
            (
                Selector::from_iter(Some(("foo", "bar"))),
                labels(&[("foo", "bar"), ("bah", "baz")]),
                true,
                "sufficient label match",
            ),
            (
                Selector::from_iter(Some(Expression::In("foo".into(), ["bar".to_string()].into()))),
                labels(&[("foo", "bar"), ("bah", "baz")]),
                true,
                "In expression match",
            ),
            (
                Selector::from_iter(Some(Expression::NotEqual("foo".into(), "bar".into()))),
                labels(&[("foo", "bar"), ("bah", "baz")]),
                false,
                "NotEqual expression match",
            ),
            (
                Selector::from_iter(Some(Expression::NotIn("foo".into(), ["quux".to_string()].into()))),
                labels(&[("foo", "bar"), ("bah", "baz")]),
                true,
                "NotIn expression match",
            ),
            (
                Selector::from_iter(Some(Expression::NotIn("foo".into(), ["bar".to_string()].into()))),
                labels(&[("foo", "bar"), ("bah", "baz")]),
                false,
                "NotIn expression non-match",
            ),
            (
                Selector(vec![
                    Expression::Equal("foo".to_string(), "bar".to_string()),
                    Expression::In("bah".into(), ["bar".to_string()].into()),
                ]),
                labels(&[("foo", "bar"), ("bah", "baz")]),
                false,
                "matches labels but not expressions",
            ),
            (
                Selector(vec![
                    Expression::Equal("foo".to_string(), "bar".to_string()),
                    Expression::In("bah".into(), ["bar".to_string()].into()),
                ]),
                labels(&[("foo", "bar"), ("bah", "bar")]),
                true,
                "matches both labels and expressions",
            ),
        ] {
            assert_eq!(selector.matches(labels), *matches, "{}", msg);
            let label_selector: LabelSelector = selector.clone().into();
            let converted_selector = Selector::try_from(label_selector).unwrap();
            assert_eq!(
                converted_selector.matches(labels),
                *matches,
                "After conversion: {}",
                msg
            );
        }
    }

    #[test]
    fn test_label_selector_matches() {
        let selector = Selector::try_from(LabelSelector {
            match_expressions: Some(vec![
                LabelSelectorRequirement {
                    key: "foo".into(),
                    operator: "In".into(),
                    values: Some(vec!["bar".into()]),
                },
                LabelSelectorRequirement {
                    key: "foo".into(),
                    operator: "NotIn".into(),
                    values: Some(vec!["baz".into()]),
                },
                LabelSelectorRequirement {
                    key: "foo".into(),
                    operator: "Exists".into(),
                    values: None,
                },
                LabelSelectorRequirement {
                    key: "baz".into(),
                    operator: "DoesNotExist".into(),
                    values: None,
                },
            ]),
            match_labels: Some([("foo".into(), "bar".into())].into()),
        })
        .unwrap();
        assert!(selector.matches(&labels(&[("foo", "bar")])));
        assert!(!selector.matches(&Default::default()));
    }

    #[test]
    fn malformed_requirements_are_rejected() {
        let requirement = |operator: &str, values: Option<Vec<String>>| LabelSelector {
            match_expressions: Some(vec![LabelSelectorRequirement {
                key: "team".into(),
                operator: operator.into(),
                values,
            }]),
            match_labels: None,
        };
        assert!(matches!(
            Selector::try_from(requirement("Near", None)),
            Err(SelectorError::UnknownOperator { .. })
        ));
        assert!(matches!(
            Selector::try_from(requirement("In", Some(vec![]))),
            Err(SelectorError::MissingValues { .. })
        ));
        assert!(matches!(
            Selector::try_from(requirement("Exists", Some(vec!["x".into()]))),
            Err(SelectorError::UnexpectedValues { .. })
        ));
        assert_eq!(
            Selector::try_from(LabelSelector {
                match_labels: Some([("".into(), "x".into())].into()),
                match_expressions: None,
            }),
            Err(SelectorError::EmptyKey)
        );
    }

    #[test]
    fn empty_label_selector_selects_all() {
        let selector = Selector::try_from(LabelSelector::default()).unwrap();
        assert!(selector.selects_all());
        assert!(selector.matches(&labels(&[("anything", "goes")])));
    }

    #[test]
    fn test_to_selector_string() {
        let selector = Selector(vec![
            Expression::In("foo".into(), ["bar".into(), "baz".into()].into()),
            Expression::NotIn("foo".into(), ["bar".into(), "baz".into()].into()),
            Expression::Equal("foo".into(), "bar".into()),
            Expression::NotEqual("foo".into(), "bar".into()),
            Expression::Exists("foo".into()),
            Expression::DoesNotExist("foo".into()),
        ])
        .to_selector_string();

        assert_eq!(
            selector,
            "foo in (bar,baz),foo notin (bar,baz),foo=bar,foo!=bar,foo,!foo"
        )
    }
}
