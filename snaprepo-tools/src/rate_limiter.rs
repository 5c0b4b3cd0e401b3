//! Token bucket rate limiting for snapshot and restore streams.

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Token bucket filter.
///
/// `register_traffic` accounts consumed bytes and returns how long the
/// caller should sleep before continuing so that the average rate
/// stays below `rate` bytes per second. A rate of `0` disables the
/// limiter.
pub struct RateLimiter {
    rate: u64,
    burst: u64,
    tokens: u64,
    last_update: Instant,
}

impl RateLimiter {
    pub fn new(rate: u64) -> Self {
        Self {
            rate,
            burst: rate,
            tokens: rate,
            last_update: Instant::now(),
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.rate == 0
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_update);
        let refill = (elapsed.as_secs_f64() * self.rate as f64) as u64;
        if refill > 0 {
            self.tokens = (self.tokens + refill).min(self.burst);
            self.last_update = now;
        }
    }

    /// Account `bytes` of traffic, returning the required delay.
    pub fn register_traffic(&mut self, now: Instant, bytes: u64) -> Duration {
        if self.is_unlimited() {
            return Duration::ZERO;
        }
        self.refill(now);
        if self.tokens >= bytes {
            self.tokens -= bytes;
            return Duration::ZERO;
        }
        let missing = bytes - self.tokens;
        self.tokens = 0;
        Duration::from_secs_f64(missing as f64 / self.rate as f64)
    }
}

/// A reader applying a shared [`RateLimiter`] to every read.
pub struct RateLimitedReader<R> {
    reader: R,
    limiter: Option<Arc<Mutex<RateLimiter>>>,
}

impl<R: Read> RateLimitedReader<R> {
    pub fn new(reader: R, limiter: Option<Arc<Mutex<RateLimiter>>>) -> Self {
        Self { reader, limiter }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read> Read for RateLimitedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, std::io::Error> {
        let count = self.reader.read(buf)?;
        if count > 0 {
            if let Some(limiter) = &self.limiter {
                let delay = limiter
                    .lock()
                    .unwrap()
                    .register_traffic(Instant::now(), count as u64);
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unlimited_limiter_never_delays() {
        let mut limiter = RateLimiter::new(0);
        let delay = limiter.register_traffic(Instant::now(), u64::MAX);
        assert_eq!(delay, Duration::ZERO);
    }

    #[test]
    fn limiter_delays_after_burst() {
        let mut limiter = RateLimiter::new(1000);
        let now = Instant::now();
        // first read drains the initial burst
        assert_eq!(limiter.register_traffic(now, 1000), Duration::ZERO);
        // the next kilobyte has to wait about a second
        let delay = limiter.register_traffic(now, 1000);
        assert!(delay > Duration::from_millis(900));
        assert!(delay <= Duration::from_millis(1100));
    }
}
