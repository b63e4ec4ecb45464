use std::time::Duration;

use tokio::time::{Instant, sleep_until};

/// Enforces the backend's minimum gap between two calls of one request.
///
/// Calls closer together than the gap are rejected by the backend with no
/// retry signal.
#[derive(Debug, Clone)]
pub struct Pacer {
    min_interval: Duration,
    last: Option<Instant>,
}

impl Pacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    /// Records that a backend call just completed.
    pub fn mark(&mut self) {
        self.last = Some(Instant::now());
    }

    /// Sleeps until `min_interval` has passed since the last `mark`.
    pub async fn wait(&mut self) {
        if let Some(last) = self.last {
            sleep_until(last + self.min_interval).await;
        }
    }
}
