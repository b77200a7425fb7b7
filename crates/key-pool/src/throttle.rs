//! Minimum-interval gate for independent requests
//!
//! Call sites that issue a burst of independent requests (for example a batch
//! of images) pass through a `Throttle` so successive requests are spaced out
//! and do not trip upstream rate limits. Waiters are served in order.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

pub struct Throttle {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// Wait until at least `min_interval` has passed since the previous
    /// caller was let through. The first call passes immediately.
    pub async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            tokio::time::sleep_until(prev + self.min_interval).await;
        }
        *last = Some(Instant::now());
    }
}
