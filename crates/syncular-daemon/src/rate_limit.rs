//! In-memory sliding-window rate limiter, counted per `(actor, route
//! class)`.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use syncular_config::RateLimitConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteClass {
    Sync,
    Console,
}

#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// Seconds until the oldest counted request leaves the window.
    pub retry_after_secs: u64,
}

pub struct RateLimiter {
    cfg: RateLimitConfig,
    windows: Mutex<HashMap<(String, RouteClass), VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(cfg: RateLimitConfig) -> Self {
        Self {
            cfg,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, actor: &str, class: RouteClass) -> RateDecision {
        let limit = match class {
            RouteClass::Sync => self.cfg.sync_max_requests,
            RouteClass::Console => self.cfg.console_max_requests,
        };
        let window = Duration::from_secs(self.cfg.window_secs);
        let now = Instant::now();

        let mut windows = self.windows.lock().expect("rate limiter poisoned");
        let entries = windows
            .entry((actor.to_string(), class))
            .or_default();
        while entries.front().is_some_and(|t| now.duration_since(*t) >= window) {
            entries.pop_front();
        }

        if entries.len() as u32 >= limit {
            let retry_after = entries
                .front()
                .map(|t| window.saturating_sub(now.duration_since(*t)).as_secs().max(1))
                .unwrap_or(1);
            return RateDecision {
                allowed: false,
                limit,
                remaining: 0,
                retry_after_secs: retry_after,
            };
        }

        entries.push_back(now);
        RateDecision {
            allowed: true,
            limit,
            remaining: limit - entries.len() as u32,
            retry_after_secs: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denies_over_limit_and_recovers() {
        let limiter = RateLimiter::new(RateLimitConfig {
            window_secs: 60,
            sync_max_requests: 2,
            console_max_requests: 1,
        });

        assert!(limiter.check("a1", RouteClass::Sync).allowed);
        assert!(limiter.check("a1", RouteClass::Sync).allowed);
        let denied = limiter.check("a1", RouteClass::Sync);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert!(denied.retry_after_secs >= 1);

        // Independent per route class and per actor.
        assert!(limiter.check("a1", RouteClass::Console).allowed);
        assert!(limiter.check("a2", RouteClass::Sync).allowed);
    }
}
