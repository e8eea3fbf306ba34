// Wall-clock implementation of the Clock port.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::traits::Clock;

/// Production clock backed by the system time and tokio's timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
