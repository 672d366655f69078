//! Retrying fallible async tasks with backoff.
use std::{future::Future, time::Duration};

use rand::{thread_rng, Rng};
use tokio::{sync::oneshot, task::AbortHandle};

/// Source of delays between attempts.
pub trait BackoffController: Send {
    /// Delay before the next attempt.
    fn backoff(&mut self) -> Duration;
}

/// Exponential backoff: the delay doubles after every attempt until it reaches `max`, with up to
/// 10% of random jitter on top.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    max: Duration,
    current: Duration,
}

impl ExponentialBackoff {
    /// Delay before the first retry.
    pub const DEFAULT_BASE: Duration = Duration::from_secs(1);
    /// Upper bound of the delay.
    pub const DEFAULT_MAX: Duration = Duration::from_secs(30);

    #[allow(missing_docs)]
    pub fn new(base: Duration, max: Duration) -> ExponentialBackoff {
        ExponentialBackoff { max, current: base }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        ExponentialBackoff::new(
            ExponentialBackoff::DEFAULT_BASE,
            ExponentialBackoff::DEFAULT_MAX,
        )
    }
}

impl BackoffController for ExponentialBackoff {
    fn backoff(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        jitter(delay, delay / 10)
    }
}

/// Apply a random jitter to `interval`.
pub(crate) fn jitter(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    interval + thread_rng().gen_range(Duration::ZERO..jitter)
}

/// Handle to a task started with [`run_with_retry`].
#[derive(Debug)]
pub struct RetryHandle<T, E> {
    result: oneshot::Receiver<Result<T, E>>,
    abort_handle: AbortHandle,
}

/// Cancels a task started with [`run_with_retry`]. Obtained from [`RetryHandle::canceller`].
#[derive(Debug, Clone)]
pub struct RetryCanceller(AbortHandle);

impl RetryCanceller {
    /// Stop all further attempts.
    pub fn cancel_retry(&self) {
        self.0.abort();
    }
}

impl<T, E> RetryHandle<T, E> {
    /// Wait for the first successful attempt, or the last error once retries are exhausted.
    ///
    /// Never resolves if the task was cancelled.
    pub async fn result(self) -> Result<T, E> {
        match self.result.await {
            Ok(result) => result,
            Err(_cancelled) => std::future::pending().await,
        }
    }

    /// Stop all further attempts. An attempt in progress is dropped at its next suspension point.
    pub fn cancel_retry(&self) {
        self.abort_handle.abort();
    }

    /// Cancellation handle usable after [`RetryHandle::result`] took the handle.
    pub fn canceller(&self) -> RetryCanceller {
        RetryCanceller(self.abort_handle.clone())
    }
}

/// Run `task` until it succeeds.
///
/// Delays between attempts come from `backoff` ([`ExponentialBackoff`] if `None`). With
/// `max_retries` set, at most `max_retries + 1` attempts are made and the last error is returned;
/// otherwise the task is retried forever. Attempts never overlap.
///
/// Must be called within a tokio runtime.
pub fn run_with_retry<T, E, F, Fut>(
    mut task: F,
    backoff: Option<Box<dyn BackoffController>>,
    max_retries: Option<u32>,
) -> RetryHandle<T, E>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Send + 'static,
{
    let (sender, receiver) = oneshot::channel();
    let mut backoff: Box<dyn BackoffController> = match backoff {
        Some(backoff) => backoff,
        None => Box::new(ExponentialBackoff::default()),
    };

    let join_handle = tokio::spawn(async move {
        let mut retries = 0u32;
        loop {
            match task().await {
                Ok(value) => {
                    let _ = sender.send(Ok(value));
                    return;
                }
                Err(err) => {
                    if max_retries.is_some_and(|max_retries| retries >= max_retries) {
                        let _ = sender.send(Err(err));
                        return;
                    }
                    retries += 1;
                    let delay = backoff.backoff();
                    log::debug!(target: "optimizely",
                                retries,
                                delay:debug = delay;
                                "attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                }
            }
        }
    });

    RetryHandle {
        result: receiver,
        abort_handle: join_handle.abort_handle(),
    }
}
