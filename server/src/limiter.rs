// Copyright 2022-2023 CeresDB Project Authors. Licensed under Apache-2.0.

//! Token bucket admission control on the mutating endpoints.

use std::{
    sync::Mutex,
    time::Instant,
};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowLimiterView {
    pub enable: bool,
    /// Refill rate in tokens per second.
    pub limit: u64,
    /// Bucket capacity.
    pub burst: u64,
}

impl Default for FlowLimiterView {
    fn default() -> Self {
        Self {
            enable: false,
            limit: 100,
            burst: 200,
        }
    }
}

struct Inner {
    enable: bool,
    limit: u64,
    burst: u64,
    tokens: f64,
    last_refill: Instant,
}

impl Inner {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.limit as f64).min(self.burst as f64);
        self.last_refill = now;
    }
}

/// Global token bucket, one token per admitted mutating call.
pub struct FlowLimiter {
    inner: Mutex<Inner>,
}

impl FlowLimiter {
    pub fn new(view: FlowLimiterView) -> Self {
        Self {
            inner: Mutex::new(Inner {
                enable: view.enable,
                limit: view.limit,
                burst: view.burst,
                tokens: view.burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token; a disabled limiter admits everything.
    pub fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.enable {
            return true;
        }

        inner.refill(Instant::now());
        if inner.tokens >= 1.0 {
            inner.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Replace the limiter settings at runtime; the bucket restarts full.
    pub fn update(&self, view: FlowLimiterView) {
        let mut inner = self.inner.lock().unwrap();
        inner.enable = view.enable;
        inner.limit = view.limit;
        inner.burst = view.burst;
        inner.tokens = view.burst as f64;
        inner.last_refill = Instant::now();
    }

    pub fn view(&self) -> FlowLimiterView {
        let inner = self.inner.lock().unwrap();
        FlowLimiterView {
            enable: inner.enable,
            limit: inner.limit,
            burst: inner.burst,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_disabled_limiter_admits_all() {
        let limiter = FlowLimiter::new(FlowLimiterView {
            enable: false,
            limit: 1,
            burst: 1,
        });
        for _ in 0..100 {
            assert!(limiter.try_acquire());
        }
    }

    #[test]
    fn test_limit_and_refill() {
        let limiter = FlowLimiter::new(FlowLimiterView {
            enable: true,
            limit: 1,
            burst: 1,
        });

        // Two requests in a burst window of one: the second is rejected.
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        // After a second the bucket holds one token again.
        std::thread::sleep(Duration::from_millis(1100));
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_update_resets_bucket() {
        let limiter = FlowLimiter::new(FlowLimiterView {
            enable: true,
            limit: 1,
            burst: 1,
        });
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());

        limiter.update(FlowLimiterView {
            enable: true,
            limit: 1,
            burst: 2,
        });
        assert_eq!(limiter.view().burst, 2);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }
}
