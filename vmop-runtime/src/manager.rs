//! Two-phase operator startup: ownership bootstrap, then dispatchers and converters
use crate::{
    bootstrap::{self, ensure_ownership, OwnershipReport},
    cluster::{SharedCluster, ThrottledCluster, WatchScope},
    config::{ConfigError, OperatorConfig},
    controller::{self, Controller},
    converter::Converter,
    dispatcher::Dispatcher,
    materializer::Materializer,
    metrics::ObjectStats,
    rate_limiter::RateLimiters,
    readiness::Readiness,
    utils::CancelableJoinHandle,
};
use futures::future;
use std::sync::Arc;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use vmop_core::Relation;

/// Errors that prevent the operator from starting
#[derive(Debug, Error)]
pub enum Error {
    /// The configuration could not be loaded
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// The ownership bootstrap failed
    #[error("ownership bootstrap failed: {0}")]
    Bootstrap(#[from] bootstrap::Error),
}

/// Wires dispatchers, converters and the bootstrap gate onto a cluster
pub struct Manager {
    config: OperatorConfig,
    cluster: SharedCluster,
    materializer: Arc<dyn Materializer>,
    relations: Vec<Relation>,
    stats: ObjectStats,
    limiters: RateLimiters,
    readiness: Readiness,
}

impl Manager {
    /// A manager for every builtin relation
    ///
    /// Every call to `cluster` is throttled by the client settings of `config`.
    pub fn new(config: OperatorConfig, cluster: SharedCluster, materializer: Arc<dyn Materializer>) -> Self {
        let cluster: SharedCluster = Arc::new(ThrottledCluster::new(
            cluster,
            config.client.qps,
            config.client.burst,
        ));
        Self {
            stats: ObjectStats::default(),
            limiters: RateLimiters::new(config.rate_limit),
            readiness: Readiness::new(cluster.clone()),
            relations: Relation::builtin(),
            config,
            cluster,
            materializer,
        }
    }

    /// A manager configured from the process environment
    pub fn from_env(cluster: SharedCluster, materializer: Arc<dyn Materializer>) -> Result<Self, Error> {
        Ok(Self::new(OperatorConfig::from_env()?, cluster, materializer))
    }

    /// Only run dispatchers for `relations`
    #[must_use]
    pub fn relations(mut self, relations: Vec<Relation>) -> Self {
        self.relations = relations;
        self
    }

    /// Handle to the reconcile counters
    pub fn stats(&self) -> ObjectStats {
        self.stats.clone()
    }

    /// Handle to the readiness probe
    pub fn readiness(&self) -> Readiness {
        self.readiness.clone()
    }

    /// The namespaces being watched
    pub fn scope(&self) -> WatchScope {
        WatchScope::from_namespaces(self.config.watch_namespaces.clone())
    }

    /// Run the bootstrap gate, then spawn every long-running task
    ///
    /// Tasks stop when `shutdown` is cancelled or when the returned handle is dropped.
    pub async fn start(self, shutdown: CancellationToken) -> Result<Running, Error> {
        let scope = self.scope();
        let ownership = if self.config.ownership.enabled && scope.is_cluster_wide() {
            info!("starting CRD ownership bootstrap");
            Some(ensure_ownership(&self.cluster, &self.config.ownership).await?)
        } else {
            info!(%scope, enabled = self.config.ownership.enabled, "skipping ownership bootstrap");
            None
        };

        let runtime = Handle::current();
        let mut tasks = Vec::new();
        for relation in self.relations {
            let kind = relation.child.clone();
            let dispatcher = Arc::new(Dispatcher::new(
                relation,
                self.cluster.clone(),
                self.materializer.clone(),
                &self.limiters,
                self.stats.clone(),
                scope.clone(),
            ));
            let results = Controller::new(self.cluster.clone(), kind.clone(), scope.clone())
                .concurrency(self.config.concurrency)
                .resync(self.config.resync_period)
                .run(
                    move |key| {
                        let dispatcher = dispatcher.clone();
                        async move { dispatcher.reconcile(&key).await }
                    },
                    shutdown.clone(),
                );
            info!(%kind, "starting dispatcher");
            tasks.push(CancelableJoinHandle::spawn(
                async move { controller::drain(&kind, results).await },
                &runtime,
            ));
        }

        let converter = Arc::new(Converter::new(self.cluster.clone(), scope, &self.config.converter));
        for pair in converter.pairs().to_vec() {
            let converter = converter.clone();
            let shutdown = shutdown.clone();
            tasks.push(CancelableJoinHandle::spawn(
                async move { converter.run_pair(&pair, shutdown).await },
                &runtime,
            ));
        }
        Ok(Running { tasks, ownership })
    }

    /// Start the operator and wait until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Error> {
        self.start(shutdown).await?.join().await;
        Ok(())
    }
}

/// The tasks of a started [`Manager`]
///
/// Dropping it aborts every task.
pub struct Running {
    tasks: Vec<CancelableJoinHandle<()>>,
    ownership: Option<OwnershipReport>,
}

impl Running {
    /// The bootstrap outcome, `None` if the phase was skipped
    pub fn ownership(&self) -> Option<OwnershipReport> {
        self.ownership
    }

    /// Number of running dispatcher and converter tasks
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Wait for every task to stop
    pub async fn join(self) {
        future::join_all(self.tasks).await;
    }
}

#[cfg(test)]
mod tests {
    use super::{Error, Manager};
    use crate::{
        cluster::{MemoryCluster, SharedCluster},
        config::{ClientConfig, OperatorConfig},
        materializer::RecordingMaterializer,
    };
    use std::{sync::Arc, time::Duration};
    use tokio_util::sync::CancellationToken;
    use vmop_core::{gvk::kinds, ErrorResponse, Relation};

    fn unthrottled() -> OperatorConfig {
        OperatorConfig::default().client(ClientConfig { qps: 0.0, burst: 0 })
    }

    fn manager(cluster: &Arc<MemoryCluster>, config: OperatorConfig) -> Manager {
        let shared: SharedCluster = cluster.clone();
        Manager::new(config, shared, Arc::new(RecordingMaterializer::new()))
    }

    #[tokio::test]
    async fn bootstrap_failure_prevents_startup() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.fail_with(&kinds::CLUSTER_ROLE, ErrorResponse::new(403, "Forbidden", "rbac"));
        let result = manager(&cluster, unthrottled()).start(CancellationToken::new()).await;
        assert!(matches!(result, Err(Error::Bootstrap(_))));
    }

    #[tokio::test]
    async fn namespaced_scope_skips_bootstrap() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.fail_with(&kinds::CLUSTER_ROLE, ErrorResponse::new(403, "Forbidden", "rbac"));
        let config = unthrottled().watch_namespaces(vec!["team".into()]);
        let running = manager(&cluster, config).start(CancellationToken::new()).await.unwrap();
        assert!(running.ownership().is_none());
        // 9 dispatchers and 6 converters
        assert_eq!(running.task_count(), 15);
    }

    #[tokio::test(start_paused = true)]
    async fn stops_on_shutdown() {
        let cluster = Arc::new(MemoryCluster::new());
        let shutdown = CancellationToken::new();
        let rules_only = Relation::builtin()
            .into_iter()
            .filter(|relation| relation.child == kinds::VM_RULE)
            .collect();
        let running = manager(&cluster, unthrottled())
            .relations(rules_only)
            .start(shutdown.clone())
            .await
            .unwrap();
        assert_eq!(running.ownership().map(|report| report.stamped), Some(0));
        tokio::time::sleep(Duration::from_secs(1)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), running.join())
            .await
            .unwrap();
    }
}
