use std::{future::Future, pin::Pin, task::Poll};

use futures::{Stream, TryStream};
use pin_project::pin_project;
use tokio::time::{sleep, Instant, Sleep};

use super::backoff::ResettableBackoff;

/// Applies a [`ResettableBackoff`] policy to a [`Stream`]
///
/// After any [`Err`] is emitted, the stream is paused for the next backoff delay.
/// The backoff is reset on any [`Ok`] value. If the backoff runs out, the stream closes.
#[pin_project]
pub struct StreamBackoff<S, B> {
    #[pin]
    stream: S,
    backoff: B,
    #[pin]
    state: State,
}

#[pin_project(project = StreamBackoffStateProj)]
#[allow(clippy::large_enum_variant)]
enum State {
    BackingOff(#[pin] Sleep),
    GivenUp,
    Awake,
}

impl<S: TryStream, B: ResettableBackoff> StreamBackoff<S, B> {
    /// Apply `backoff` to `stream`
    pub fn new(stream: S, backoff: B) -> Self {
        Self {
            stream,
            backoff,
            state: State::Awake,
        }
    }
}

impl<S: TryStream, B: ResettableBackoff> Stream for StreamBackoff<S, B> {
    type Item = Result<S::Ok, S::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        match this.state.as_mut().project() {
            StreamBackoffStateProj::BackingOff(mut backoff_sleep) => match backoff_sleep.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    tracing::debug!(deadline = ?backoff_sleep.deadline(), "backoff complete, waking up");
                    this.state.set(State::Awake)
                }
                Poll::Pending => {
                    let deadline = backoff_sleep.deadline();
                    tracing::trace!(
                        ?deadline,
                        remaining_duration = ?deadline.saturating_duration_since(Instant::now()),
                        "still backing off"
                    );
                    return Poll::Pending;
                }
            },
            StreamBackoffStateProj::GivenUp => {
                tracing::debug!("backoff has given up, stream is closed");
                return Poll::Ready(None);
            }
            StreamBackoffStateProj::Awake => {}
        }

        let next_item = this.stream.try_poll_next(cx);
        match &next_item {
            Poll::Ready(Some(Err(_))) => {
                if let Some(backoff_duration) = this.backoff.next() {
                    let backoff_sleep = sleep(backoff_duration);
                    tracing::debug!(
                        deadline = ?backoff_sleep.deadline(),
                        duration = ?backoff_duration,
                        "error received, backing off"
                    );
                    this.state.set(State::BackingOff(backoff_sleep));
                } else {
                    tracing::debug!("error received, giving up");
                    this.state.set(State::GivenUp);
                }
            }
            Poll::Ready(_) => {
                tracing::trace!("non-error received, resetting backoff");
                this.backoff.reset();
            }
            Poll::Pending => {}
        }
        next_item
    }
}

#[cfg(test)]
mod tests {
    use std::{task::Poll, time::Duration};

    use super::StreamBackoff;
    use crate::utils::backoff::ResettableBackoffWrapper;
    use backon::ConstantBuilder;
    use futures::{pin_mut, poll, stream, StreamExt};

    #[tokio::test]
    async fn stream_should_back_off_after_errors() {
        tokio::time::pause();
        let tick = Duration::from_secs(1);
        let rx = stream::iter([Ok(0), Err(1), Ok(2)]);
        let backoff = ResettableBackoffWrapper::new(ConstantBuilder::default().with_delay(tick).with_max_times(10));
        let rx = StreamBackoff::new(rx, backoff);
        pin_mut!(rx);
        assert_eq!(poll!(rx.next()), Poll::Ready(Some(Ok(0))));
        assert_eq!(poll!(rx.next()), Poll::Ready(Some(Err(1))));
        assert_eq!(poll!(rx.next()), Poll::Pending);
        tokio::time::advance(tick * 2).await;
        assert_eq!(poll!(rx.next()), Poll::Ready(Some(Ok(2))));
        assert_eq!(poll!(rx.next()), Poll::Ready(None));
    }

    #[tokio::test]
    async fn stream_should_close_when_backoff_runs_out() {
        tokio::time::pause();
        let rx = stream::iter([Err::<(), _>(0), Err(1)]);
        let backoff = ResettableBackoffWrapper::new(
            ConstantBuilder::default()
                .with_delay(Duration::from_secs(1))
                .with_max_times(0),
        );
        let rx = StreamBackoff::new(rx, backoff);
        pin_mut!(rx);
        assert_eq!(poll!(rx.next()), Poll::Ready(Some(Err(0))));
        assert_eq!(poll!(rx.next()), Poll::Ready(None));
    }
}
