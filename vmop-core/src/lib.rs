//! Types shared by the vmop reconciliation engine
//!
//! This crate is client-less: it holds keys, the dynamic object representation,
//! label selector semantics, parent/child relationships and ownership markers.
//! The same information is re-exported from `vmop` under `vmop::core`.
#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod dynamic;
pub use dynamic::{DynamicObject, ParseObjectError};

pub mod gvk;
pub use gvk::{ApiKind, GroupVersion, Scope};

mod key;
pub use key::{Extra, ResourceKey};

pub mod labels;
pub use labels::{Selector, SelectorError};

pub mod metadata;

pub mod ownership;
pub use ownership::OwnershipMarker;

pub mod relation;
pub use relation::{Relation, RelationshipDescriptor};

pub mod watch;
pub use watch::WatchEvent;

mod error;
pub use error::{Error, ErrorResponse};

/// Convenient alias for `Result<T, Error>`
pub type Result<T, E = Error> = std::result::Result<T, E>;
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, LabelSelectorRequirement, ObjectMeta};
