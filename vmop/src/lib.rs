//! vmop is the reconciliation engine of an operator for a metrics monitoring stack.
//!
//! # Overview
//!
//! Parents (alerting engines, scrape agents, auth proxies, alert routers) select
//! children (rules, scrape targets, users, routing configs) through label and
//! namespace selectors. Whenever a child changes, every parent selecting it is
//! rebuilt. Resources of a foreign monitoring schema are mirrored into native ones.
//!
//! The main modules are:
//!
//! - [`core`](crate::core) with keys, dynamic objects, selectors and relationships
//! - [`runtime`](crate::runtime) with the [`Manager`](crate::runtime::Manager), the
//!   per-relation [`Dispatcher`](crate::runtime::Dispatcher), the schema
//!   [`Converter`](crate::runtime::Converter) and the [`Cluster`](crate::runtime::Cluster) seam
//!
//! # Running the engine
//!
//! ```no_run
//! use std::sync::Arc;
//! use vmop::runtime::{materializer::RecordingMaterializer, Manager, MemoryCluster, SharedCluster};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cluster: SharedCluster = Arc::new(MemoryCluster::new());
//!     let manager = Manager::from_env(cluster, Arc::new(RecordingMaterializer::new()))?;
//!     manager.run(CancellationToken::new()).await?;
//!     Ok(())
//! }
//! ```
#![deny(missing_docs)]
#![forbid(unsafe_code)]

#[doc(inline)]
pub use vmop_core as core;
#[doc(inline)]
pub use vmop_runtime as runtime;

pub use vmop_core::{ApiKind, DynamicObject, Relation, ResourceKey, Selector};
pub use vmop_runtime::{Cluster, Controller, Dispatcher, Manager, OperatorConfig};
