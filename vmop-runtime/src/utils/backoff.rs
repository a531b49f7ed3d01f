use std::time::Duration;

use backon::{Backoff, BackoffBuilder, ExponentialBuilder};

/// Shortest delay before retrying a failed reconcile or watch
pub const MIN_RETRY_DELAY: Duration = Duration::from_millis(5);
/// Longest delay before retrying a failed reconcile or watch
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(1000);

/// Exponential backoff doubling from [`MIN_RETRY_DELAY`] up to [`MAX_RETRY_DELAY`], never giving up
pub fn retry_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(MIN_RETRY_DELAY)
        .with_max_delay(MAX_RETRY_DELAY)
        .with_factor(2.0)
        .with_max_times(usize::MAX)
}

/// A [`Backoff`] that can also be reset
pub trait ResettableBackoff: Backoff {
    /// Start over from the first delay
    fn reset(&mut self);
}

/// Implements [`ResettableBackoff`] by rebuilding the backing [`Backoff`] after each reset
#[derive(Debug)]
pub struct ResettableBackoffWrapper<B: BackoffBuilder> {
    backoff_builder: B,
    current_backoff: Option<B::Backoff>,
}

impl<B: BackoffBuilder> ResettableBackoffWrapper<B> {
    /// Wrap a builder; the backoff is built lazily on first use
    pub fn new(backoff_builder: B) -> Self {
        Self {
            backoff_builder,
            current_backoff: None,
        }
    }
}

impl Default for ResettableBackoffWrapper<ExponentialBuilder> {
    fn default() -> Self {
        Self::new(retry_backoff())
    }
}

impl<B: BackoffBuilder + Clone> Iterator for ResettableBackoffWrapper<B> {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        self.current_backoff
            .get_or_insert_with(|| self.backoff_builder.clone().build())
            .next()
    }
}

impl<B: BackoffBuilder + Clone> ResettableBackoff for ResettableBackoffWrapper<B>
where
    B::Backoff: Send + Sync + Unpin,
    B: Send + Sync + Unpin,
{
    fn reset(&mut self) {
        self.current_backoff = None;
    }
}
