//! Scheduled retries with pluggable delay strategies
//!
//! A [`Retry`] owns a [`RetryStrategy`] and at most one pending timer. Calling
//! [`Retry::schedule`] arms the timer for the strategy's current delay and
//! advances the strategy immediately, so repeated scheduling keeps growing the
//! delay even before any callback has run.
//!
//! # Example
//!
//! ```
//! use futures::FutureExt;
//! use relay_common::retry::make_retry_exponential_backoff;
//! use std::time::Duration;
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let mut retry = make_retry_exponential_backoff(
//!     Duration::from_millis(100),
//!     Duration::from_millis(1600),
//!     tokio::runtime::Handle::current(),
//! );
//!
//! assert_eq!(retry.delay_value(), Duration::from_millis(100));
//! retry.schedule(|| async {}.boxed());
//! assert_eq!(retry.delay_value(), Duration::from_millis(200));
//! retry.cancel();
//! # });
//! ```

use futures::future::BoxFuture;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;

/// Policy computing the delay before the next attempt.
///
/// `delay` and `increase_delay` are separate so the delay for the attempt
/// being armed can be read before it is advanced for the following one.
pub trait RetryStrategy: Send {
    /// Current delay, without advancing it.
    fn delay(&self) -> Duration;

    /// Advances the delay for the next attempt.
    fn increase_delay(&mut self);

    /// Restores the initial delay.
    fn reset(&mut self);
}

/// Doubles the delay on every attempt, capped at `max_delay`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffStrategy {
    initial_delay: Duration,
    delay: Duration,
    max_delay: Duration,
}

impl ExponentialBackoffStrategy {
    pub fn new(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            delay: initial_delay,
            max_delay,
        }
    }

    fn next_delay(&self) -> Duration {
        self.delay.saturating_mul(2).min(self.max_delay)
    }
}

impl RetryStrategy for ExponentialBackoffStrategy {
    fn delay(&self) -> Duration {
        self.delay
    }

    fn increase_delay(&mut self) {
        self.delay = self.next_delay();
    }

    fn reset(&mut self) {
        self.delay = self.initial_delay;
    }
}

/// Always waits the same amount of time.
#[derive(Debug, Clone)]
pub struct FixedDelayStrategy {
    delay: Duration,
}

impl FixedDelayStrategy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl RetryStrategy for FixedDelayStrategy {
    fn delay(&self) -> Duration {
        self.delay
    }

    fn increase_delay(&mut self) {}

    fn reset(&mut self) {}
}

/// Single-shot retry timer driven by a [`RetryStrategy`].
///
/// Only one retry is pending at a time: scheduling while a timer is armed
/// cancels the armed one and replaces it. Dropping the `Retry` cancels any
/// pending timer.
pub struct Retry {
    strategy: Box<dyn RetryStrategy>,
    handle: Handle,
    attempt_number: Arc<AtomicUsize>,
    pending: Option<oneshot::Sender<()>>,
}

impl Retry {
    /// Creates a retry bound to the runtime behind `handle`.
    pub fn new(strategy: Box<dyn RetryStrategy>, handle: Handle) -> Self {
        Self {
            strategy,
            handle,
            attempt_number: Arc::new(AtomicUsize::new(0)),
            pending: None,
        }
    }

    /// Arms the timer for the current delay and advances the strategy.
    ///
    /// When the timer fires the attempt counter is incremented and `callback`
    /// runs. A cancelled timer never runs its callback and never counts as an
    /// attempt.
    pub fn schedule<F>(&mut self, callback: F)
    where
        F: FnOnce() -> BoxFuture<'static, ()> + Send + 'static,
    {
        self.cancel();

        let delay = self.strategy.delay();
        self.strategy.increase_delay();

        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.pending = Some(cancel_tx);

        let attempt_number = Arc::clone(&self.attempt_number);
        self.handle.spawn(async move {
            tokio::select! {
                // Cancellation wins when both branches are ready.
                biased;

                // Sender sent or dropped: either way the timer is cancelled.
                _ = cancel_rx => {}
                _ = tokio::time::sleep(delay) => {
                    attempt_number.fetch_add(1, Ordering::SeqCst);
                    callback().await;
                }
            }
        });
    }

    /// Cancels the pending retry, if any.
    pub fn cancel(&mut self) {
        if let Some(cancel_tx) = self.pending.take() {
            // Err means the timer already fired.
            let _ = cancel_tx.send(());
        }
    }

    /// Whether a scheduled timer has neither fired nor been cancelled.
    pub fn is_pending(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    /// Number of retries that have fired since creation or the last reset.
    pub fn attempt_number(&self) -> usize {
        self.attempt_number.load(Ordering::SeqCst)
    }

    /// Delay the next `schedule` call will use.
    pub fn delay_value(&self) -> Duration {
        self.strategy.delay()
    }

    /// Resets the delay and the attempt counter. A pending timer stays armed.
    pub fn reset(&mut self) {
        self.strategy.reset();
        self.attempt_number.store(0, Ordering::SeqCst);
    }
}

impl Drop for Retry {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl std::fmt::Debug for Retry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retry")
            .field("delay", &self.strategy.delay())
            .field("attempt_number", &self.attempt_number())
            .field("pending", &self.is_pending())
            .finish()
    }
}

/// Creates a [`Retry`] with an [`ExponentialBackoffStrategy`].
pub fn make_retry_exponential_backoff(
    delay: Duration,
    max_delay: Duration,
    handle: Handle,
) -> Retry {
    Retry::new(
        Box::new(ExponentialBackoffStrategy::new(delay, max_delay)),
        handle,
    )
}
