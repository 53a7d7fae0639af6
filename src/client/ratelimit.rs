use log::debug;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{Clock, SystemClock};

/// Spaces out actions by a minimum interval, with a little random jitter on the sleep.
///
/// Slots are reserved in call order: the reserved slot is monotonically
/// non-decreasing across callers, though sleepers may wake in any order.
pub struct RateLimiter {
    interval_ms: i64,
    jitter_ms: i64,
    next_allowed_ms: Mutex<i64>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(interval: Duration, jitter: Duration) -> Self {
        Self::with_clock(interval, jitter, Arc::new(SystemClock))
    }

    pub fn with_clock(interval: Duration, jitter: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            interval_ms: interval.as_millis() as i64,
            jitter_ms: jitter.as_millis() as i64,
            next_allowed_ms: Mutex::new(0),
            clock,
        }
    }

    /// Wait for the next free slot and return it (epoch milliseconds).
    pub async fn wait(&self) -> i64 {
        let now = self.clock.now_ms();
        let slot = {
            let mut next_allowed = self.next_allowed_ms.lock();
            if now >= *next_allowed {
                *next_allowed = now + self.interval_ms;
                return now;
            }
            let slot = *next_allowed;
            *next_allowed += self.interval_ms;
            slot
        };

        let jitter = if self.jitter_ms > 0 {
            rand::thread_rng().gen_range(-self.jitter_ms..=self.jitter_ms)
        } else {
            0
        };
        let delay = (slot - now + jitter).max(0);
        debug!("Rate limited, sleeping {}ms", delay);
        tokio::time::sleep(Duration::from_millis(delay as u64)).await;
        slot
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::ManualClock;
    use futures::future::join_all;

    #[tokio::test(start_paused = true)]
    async fn test_first_call_does_not_wait() {
        let clock = Arc::new(ManualClock::new(50_000));
        let limiter = RateLimiter::with_clock(Duration::from_millis(1000), Duration::ZERO, clock);

        let started = tokio::time::Instant::now();
        assert_eq!(limiter.wait().await, 50_000);
        assert_eq!(started.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_back_to_back_calls_are_spaced() {
        let clock = Arc::new(ManualClock::new(50_000));
        let limiter = RateLimiter::with_clock(Duration::from_millis(1000), Duration::ZERO, clock);

        let started = tokio::time::Instant::now();
        assert_eq!(limiter.wait().await, 50_000);
        assert_eq!(limiter.wait().await, 51_000);
        assert_eq!(started.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_slots_are_monotonic() {
        let clock = Arc::new(ManualClock::new(1_000));
        let jitter = Duration::from_millis(50);
        let limiter = RateLimiter::with_clock(Duration::from_millis(1000), jitter, clock);

        let slots = join_all((0..10).map(|_| limiter.wait())).await;
        for pair in slots.windows(2) {
            assert!(pair[1] >= pair[0] + 1000, "slots {:?}", slots);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_limiter_resets_to_now() {
        let clock = Arc::new(ManualClock::new(1_000));
        let interval = Duration::from_millis(1000);
        let limiter = RateLimiter::with_clock(interval, Duration::ZERO, clock.clone());

        limiter.wait().await;
        clock.advance(5_000);
        assert_eq!(limiter.wait().await, 6_000);
    }
}
