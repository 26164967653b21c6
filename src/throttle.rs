//! Byte-rate limiting for dispatched connections
//!
//! A token bucket refilled by wall-clock time. The dispatcher charges it
//! for every chunk forwarded into a peer channel; once the bucket runs
//! dry the read loop sleeps until enough tokens accrue.

use std::time::Duration;
use tokio::time::Instant;

/// How much burst a bucket allows relative to one second of rate
const BURST_SECONDS: f64 = 1.0;

/// Async token-bucket limiter for a single connection
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    refilled: Instant,
}

impl TokenBucket {
    /// Create a bucket allowing `bytes_per_sec` sustained throughput
    pub fn new(bytes_per_sec: u64) -> Self {
        let rate = bytes_per_sec.max(1) as f64;
        let capacity = rate * BURST_SECONDS;
        Self {
            rate,
            capacity,
            tokens: capacity,
            refilled: Instant::now(),
        }
    }

    /// Charge `bytes` against the bucket, sleeping while it is empty
    pub async fn throttle(&mut self, bytes: usize) {
        self.refill();
        self.tokens -= bytes as f64;

        if self.tokens < 0.0 {
            let wait = -self.tokens / self.rate;
            tokio::time::sleep(Duration::from_secs_f64(wait)).await;
            self.refill();
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.refilled).as_secs_f64();
        self.refilled = now;
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_burst_within_capacity_is_free() {
        let mut bucket = TokenBucket::new(1_000_000);
        let start = Instant::now();
        bucket.throttle(500_000).await;
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrun_sleeps() {
        let mut bucket = TokenBucket::new(1000);

        // Drain the burst allowance, then one second's worth more
        bucket.throttle(1000).await;
        let start = Instant::now();
        bucket.throttle(1000).await;

        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(900), "waited {waited:?}");
    }
}
