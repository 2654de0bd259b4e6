use async_trait::async_trait;
use std::time::Duration;
use tokio::time::Instant;

/// Time source for every bounded wait (polling, probing, fleet deadline).
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    async fn sleep(&self, duration: Duration);
}

/// Tokio's clock. Under `#[tokio::test(start_paused = true)]` sleeps auto-advance.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Time left before `deadline`, or `None` once it has passed.
pub fn remaining(clock: &dyn Clock, deadline: Instant) -> Option<Duration> {
    let left = deadline.saturating_duration_since(clock.now());
    if left.is_zero() {
        None
    } else {
        Some(left)
    }
}
