//! A small sliding-window rate limiter keyed by (client address, route).

use std::collections::HashMap;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub struct RateLimiter {
    windows: Mutex<HashMap<(IpAddr, &'static str), VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new() -> RateLimiter {
        RateLimiter {
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Returns whether this request is allowed, recording it if so.
    pub fn check(&self, ip: IpAddr, route: &'static str, limit: usize, window: Duration) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("rate limiter lock is never poisoned");
        let entry = windows.entry((ip, route)).or_default();
        while let Some(&front) = entry.front() {
            if now.duration_since(front) >= window {
                entry.pop_front();
            } else {
                break;
            }
        }
        if entry.len() >= limit {
            return false;
        }
        entry.push_back(now);
        true
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        RateLimiter::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_within_the_window() {
        let limiter = RateLimiter::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        for _ in 0..3 {
            assert!(limiter.check(ip, "push_block", 3, Duration::from_secs(60)));
        }
        assert!(!limiter.check(ip, "push_block", 3, Duration::from_secs(60)));

        // other clients and routes are unaffected
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(limiter.check(other, "push_block", 3, Duration::from_secs(60)));
        assert!(limiter.check(ip, "get_block", 3, Duration::from_secs(60)));
    }
}
