use super::{Cluster, ListParams, Result, WatchStream};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use vmop_core::{ApiKind, DynamicObject, ResourceKey};

/// Longest a single call is delayed, however low the rate
pub const MAX_WAIT: Duration = Duration::from_secs(3600);

/// Client-side token bucket limiting the rate of API calls
///
/// Holds up to `burst` tokens, refilled at `qps` tokens per second. Callers
/// reserve a token up front and sleep until it becomes available, so waiters
/// are served in the order they arrived. A non-positive `qps` disables limiting.
#[derive(Debug)]
pub struct TokenBucket {
    qps: f64,
    burst: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refreshed_at: Instant,
}

impl TokenBucket {
    /// A full bucket
    pub fn new(qps: f32, burst: u32) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            qps: f64::from(qps),
            burst,
            state: Mutex::new(BucketState {
                tokens: burst,
                refreshed_at: Instant::now(),
            }),
        }
    }

    /// Take a token, returning how long the caller has to wait before using it
    pub fn reserve(&self) -> Duration {
        if self.qps <= 0.0 {
            return Duration::ZERO;
        }
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.refreshed_at).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.qps).min(self.burst);
        state.refreshed_at = now;
        state.tokens -= 1.0;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::try_from_secs_f64(-state.tokens / self.qps)
                .map_or(MAX_WAIT, |wait| wait.min(MAX_WAIT))
        }
    }

    /// Wait for a token
    pub async fn acquire(&self) {
        let wait = self.reserve();
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }
}

/// Wraps a [`Cluster`], passing every call through a [`TokenBucket`]
pub struct ThrottledCluster<C> {
    inner: C,
    bucket: TokenBucket,
}

impl<C: Cluster> ThrottledCluster<C> {
    /// Limit `inner` to `qps` calls per second with bursts of up to `burst` calls
    pub fn new(inner: C, qps: f32, burst: u32) -> Self {
        Self {
            inner,
            bucket: TokenBucket::new(qps, burst),
        }
    }

    /// The wrapped cluster
    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: Cluster> Cluster for ThrottledCluster<C> {
    async fn get(&self, key: &ResourceKey) -> Result<DynamicObject> {
        self.bucket.acquire().await;
        self.inner.get(key).await
    }

    async fn list(&self, kind: &ApiKind, namespace: Option<&str>, params: &ListParams) -> Result<Vec<DynamicObject>> {
        self.bucket.acquire().await;
        self.inner.list(kind, namespace, params).await
    }

    async fn watch(&self, kind: &ApiKind, namespace: Option<&str>) -> Result<WatchStream> {
        self.bucket.acquire().await;
        self.inner.watch(kind, namespace).await
    }

    async fn create(&self, kind: &ApiKind, obj: DynamicObject) -> Result<DynamicObject> {
        self.bucket.acquire().await;
        self.inner.create(kind, obj).await
    }

    async fn replace(&self, kind: &ApiKind, obj: DynamicObject) -> Result<DynamicObject> {
        self.bucket.acquire().await;
        self.inner.replace(kind, obj).await
    }

    async fn patch_metadata(&self, key: &ResourceKey, patch: &serde_json::Value) -> Result<DynamicObject> {
        self.bucket.acquire().await;
        self.inner.patch_metadata(key, patch).await
    }

    async fn delete(&self, key: &ResourceKey) -> Result<()> {
        self.bucket.acquire().await;
        self.inner.delete(key).await
    }

    // a local cache check, not an API call
    async fn wait_for_sync(&self, timeout: Duration) -> bool {
        self.inner.wait_for_sync(timeout).await
    }
}
