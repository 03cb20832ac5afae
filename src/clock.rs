use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

/// Time source for the tracker and retry policies.  Tests may pause tokio
/// time to drive [`WallClock`] virtually.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Completes once `duration` has elapsed.
    async fn after(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

#[async_trait]
impl Clock for WallClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn after(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
