//! Bounded retry for values that appear eventually.
//!
//! A [`RetryPolicy`] runs its first attempt immediately and later ones
//! `delay` apart, giving up before the next attempt would start past
//! `max_duration`.  Callers that retry more than once take a
//! [`RetryFactory`] so every retried operation gets its own budget.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, WallClock};
use crate::error::{Error, Result};

/// Called with the failed attempt's error and number before each retry.
pub type NotifyFn = Box<dyn FnMut(&Error, u32) + Send>;

/// Produces a fresh policy for each retried operation.
pub type RetryFactory = Arc<dyn Fn() -> RetryPolicy + Send + Sync>;

pub struct RetryPolicy {
    pub clock: Arc<dyn Clock>,
    pub delay: Duration,
    pub max_duration: Duration,
    pub notify: Option<NotifyFn>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("delay", &self.delay)
            .field("max_duration", &self.max_duration)
            .field("notify", &self.notify.is_some())
            .finish()
    }
}

impl RetryPolicy {
    pub fn new(clock: Arc<dyn Clock>, delay: Duration, max_duration: Duration) -> Self {
        Self {
            clock,
            delay,
            max_duration,
            notify: None,
        }
    }

    pub fn with_notify(mut self, notify: impl FnMut(&Error, u32) + Send + 'static) -> Self {
        self.notify = Some(Box::new(notify));
        self
    }

    /// A factory handing out copies of one wall-clock policy shape.
    pub fn factory(delay: Duration, max_duration: Duration) -> RetryFactory {
        Arc::new(move || RetryPolicy::new(Arc::new(WallClock), delay, max_duration))
    }

    /// One millisecond of patience.  Fails fast on purpose: anything that
    /// must wait for an address has to supply a real factory.
    pub fn fail_fast() -> RetryFactory {
        Self::factory(Duration::from_millis(1), Duration::from_millis(1))
    }

    /// Runs `attempt` until it succeeds, the budget runs out, or `abort`
    /// fires.  Exhaustion returns the last error annotated with the
    /// attempt count; abort returns [`Error::Cancelled`].
    pub async fn call<T, F, Fut>(mut self, abort: &CancellationToken, mut attempt: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let start = self.clock.now();
        let mut count = 1;
        loop {
            if abort.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let err = match attempt().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_cancelled() => return Err(err),
                Err(err) => err,
            };

            let elapsed = self.clock.now().saturating_duration_since(start);
            if elapsed + self.delay > self.max_duration {
                debug!("giving up after {} attempts: {}", count, err);
                return Err(Error::RetryExhausted {
                    attempts: count,
                    last: Box::new(err),
                });
            }
            if let Some(notify) = self.notify.as_mut() {
                notify(&err, count);
            }

            tokio::select! {
                _ = abort.cancelled() => return Err(Error::Cancelled),
                _ = self.clock.after(self.delay) => {}
            }
            count += 1;
        }
    }
}
