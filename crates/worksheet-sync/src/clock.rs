//! Injected time source.
//!
//! The poller computes its next deadline from [`Clock::now`] and waits with
//! [`Clock::sleep`]; tests substitute `testing::ManualClock` to run
//! backoff schedules in virtual time.

use std::future::Future;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    fn sleep(&self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Wall-clock time backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}
