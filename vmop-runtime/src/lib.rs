//! Reconciliation engine for the vmop operator
//!
//! Watches child resources, fans every change out to the parents that select
//! it, and mirrors foreign monitoring resources into native ones.
//!
//! Most users start from [`Manager`], which wires a [`Dispatcher`] per
//! parent/child relationship, the schema [`converter`] and the ownership
//! [`bootstrap`] onto a [`Cluster`].
#![deny(missing_docs)]
#![deny(unsafe_code)]

pub mod bootstrap;
pub mod cluster;
pub mod config;
pub mod controller;
pub mod converter;
pub mod dispatcher;
pub mod manager;
pub mod matcher;
pub mod materializer;
pub mod metrics;
pub mod rate_limiter;
pub mod readiness;
pub mod reflector;
pub mod scheduler;
pub mod utils;
pub mod watcher;

pub use cluster::{Cluster, ClusterExt, MemoryCluster, SharedCluster, WatchScope};
pub use config::OperatorConfig;
pub use controller::{applier, Action, Controller};
pub use converter::Converter;
pub use dispatcher::Dispatcher;
pub use manager::Manager;
pub use materializer::Materializer;
pub use reflector::{reflector, Store};
pub use scheduler::scheduler;
pub use watcher::watcher;
