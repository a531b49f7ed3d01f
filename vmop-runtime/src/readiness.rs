//! Readiness probe backed by the read cache's sync state
use crate::cluster::SharedCluster;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};
use thiserror::Error;

/// How long a single probe waits for the cache to sync
pub const SYNC_TIMEOUT: Duration = Duration::from_secs(10);

/// The probe failed; the process keeps running
#[derive(Debug, Error)]
#[error("controller sync cache in progress")]
pub struct NotReady;

/// Answers readiness probes
///
/// Once the cache has synced the answer is cached for the lifetime of the process.
#[derive(Clone)]
pub struct Readiness {
    cluster: SharedCluster,
    synced: Arc<AtomicBool>,
}

impl Readiness {
    /// A probe for `cluster`, not yet synced
    pub fn new(cluster: SharedCluster) -> Self {
        Self {
            cluster,
            synced: Arc::default(),
        }
    }

    /// Whether a previous probe saw the cache synced
    pub fn is_ready(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }

    /// Probe readiness, waiting up to [`SYNC_TIMEOUT`] for the cache
    pub async fn check(&self) -> Result<(), NotReady> {
        if self.is_ready() {
            return Ok(());
        }
        if self.cluster.wait_for_sync(SYNC_TIMEOUT).await {
            self.synced.store(true, Ordering::Release);
            Ok(())
        } else {
            Err(NotReady)
        }
    }
}
