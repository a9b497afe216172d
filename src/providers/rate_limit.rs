//! Per-provider rate limiting: a one-second sliding window plus a
//! calendar-day counter. Over-limit calls fail fast with the reset
//! time; nothing is ever queued silently.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, TimeDelta, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Limits a provider declares in its configuration
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub requests_per_second: u32,
    pub requests_per_day: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 4,
            requests_per_day: 1000,
        }
    }
}

/// Returned when a slot cannot be granted
#[derive(Debug, Clone, Copy)]
pub struct RateLimitHit {
    pub retry_at: DateTime<Utc>,
}

#[derive(Debug)]
struct LimiterState {
    window: VecDeque<Instant>,
    day: NaiveDate,
    day_count: u32,
}

/// Sliding-window limiter owned by one provider wrapper
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LimiterState {
                window: VecDeque::new(),
                day: Utc::now().date_naive(),
                day_count: 0,
            }),
        }
    }

    /// Try to take one request slot under the given limits. On refusal
    /// the caller gets the wall-clock time at which a slot frees up.
    pub fn try_acquire(&self, cfg: &RateLimitConfig) -> Result<(), RateLimitHit> {
        let now = Instant::now();
        let today = Utc::now().date_naive();
        let mut state = self.state.lock();

        // Daily counter resets at UTC midnight
        if state.day != today {
            state.day = today;
            state.day_count = 0;
        }
        if state.day_count >= cfg.requests_per_day {
            let midnight = state
                .day
                .succ_opt()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
                .map(|dt| dt.and_utc())
                .unwrap_or_else(|| Utc::now() + TimeDelta::days(1));
            return Err(RateLimitHit { retry_at: midnight });
        }

        // Drop window entries older than one second
        while let Some(&front) = state.window.front() {
            if now.duration_since(front) >= Duration::from_secs(1) {
                state.window.pop_front();
            } else {
                break;
            }
        }
        if state.window.len() >= cfg.requests_per_second as usize {
            let oldest = *state.window.front().unwrap_or(&now);
            let wait = Duration::from_secs(1).saturating_sub(now.duration_since(oldest));
            let retry_at = Utc::now()
                + TimeDelta::from_std(wait).unwrap_or_else(|_| TimeDelta::seconds(1));
            return Err(RateLimitHit { retry_at });
        }

        state.window.push_back(now);
        state.day_count += 1;
        Ok(())
    }

    /// Requests granted so far today
    pub fn daily_count(&self) -> u32 {
        self.state.lock().day_count
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_per_second_limit() {
        let limiter = RateLimiter::new();
        let cfg = RateLimitConfig {
            requests_per_second: 3,
            requests_per_day: 100,
        };
        for _ in 0..3 {
            assert!(limiter.try_acquire(&cfg).is_ok());
        }
        let hit = limiter.try_acquire(&cfg).unwrap_err();
        assert!(hit.retry_at > Utc::now() - TimeDelta::seconds(1));
    }

    #[test]
    fn daily_limit_resets_at_midnight() {
        let limiter = RateLimiter::new();
        let cfg = RateLimitConfig {
            requests_per_second: 100,
            requests_per_day: 2,
        };
        assert!(limiter.try_acquire(&cfg).is_ok());
        assert!(limiter.try_acquire(&cfg).is_ok());
        let hit = limiter.try_acquire(&cfg).unwrap_err();
        let next_midnight = Utc::now()
            .date_naive()
            .succ_opt()
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc();
        assert_eq!(hit.retry_at, next_midnight);
        assert_eq!(limiter.daily_count(), 2);
    }

    #[test]
    fn window_refill_after_a_second() {
        let limiter = RateLimiter::new();
        let cfg = RateLimitConfig {
            requests_per_second: 1,
            requests_per_day: 100,
        };
        assert!(limiter.try_acquire(&cfg).is_ok());
        assert!(limiter.try_acquire(&cfg).is_err());
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(limiter.try_acquire(&cfg).is_ok());
    }
}
