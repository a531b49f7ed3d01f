//! Admission control for reconciles that rebuild a parent
//!
//! A limiter admits a fixed number of attempts per window. Throttled attempts
//! are dropped without a retry: the next admitted attempt reads the latest state
//! of every child anyway.
use parking_lot::Mutex;
use serde::Deserialize;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::time::Instant;
use vmop_core::ApiKind;

/// How many reconcile attempts a limiter admits per window
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Attempts admitted per window, `0` disables limiting
    pub limit: u32,
    /// Length of a window
    #[serde(with = "crate::config::seconds")]
    pub window: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            limit: 5,
            window: Duration::from_secs(2),
        }
    }
}

#[derive(Debug)]
struct Window {
    started_at: Instant,
    admitted: u32,
}

/// A fixed-window counter shared by every dispatcher rebuilding the same parent kind
#[derive(Debug)]
pub struct ReconcileRateLimiter {
    settings: RateLimitSettings,
    window: Mutex<Window>,
}

impl ReconcileRateLimiter {
    /// A limiter whose first window starts now
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            window: Mutex::new(Window {
                started_at: Instant::now(),
                admitted: 0,
            }),
        }
    }

    /// Record an attempt, returning `true` if it must be skipped
    ///
    /// Throttled attempts do not count against the window.
    pub fn should_throttle(&self) -> bool {
        if self.settings.limit == 0 {
            return false;
        }
        let mut window = self.window.lock();
        let now = Instant::now();
        if now.duration_since(window.started_at) >= self.settings.window {
            window.started_at = now;
            window.admitted = 0;
        }
        if window.admitted >= self.settings.limit {
            return true;
        }
        window.admitted += 1;
        false
    }

    /// The settings this limiter enforces
    pub fn settings(&self) -> RateLimitSettings {
        self.settings
    }
}

/// Limiters keyed by parent kind, created on first use
///
/// Cloning the registry shares the limiters, so every dispatcher whose relation
/// targets the same parent kind draws from the same window.
#[derive(Clone, Debug, Default)]
pub struct RateLimiters {
    settings: RateLimitSettings,
    limiters: Arc<Mutex<HashMap<ApiKind, Arc<ReconcileRateLimiter>>>>,
}

impl RateLimiters {
    /// An empty registry handing out limiters with `settings`
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            limiters: Arc::default(),
        }
    }

    /// The limiter guarding rebuilds of `parent`
    pub fn for_parent(&self, parent: &ApiKind) -> Arc<ReconcileRateLimiter> {
        self.limiters
            .lock()
            .entry(parent.clone())
            .or_insert_with(|| Arc::new(ReconcileRateLimiter::new(self.settings)))
            .clone()
    }
}
