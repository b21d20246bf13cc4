//! Fixed-window rate limiting keyed by `(category, identifier)`.
//!
//! Each key counts requests in a window that starts with its first request.
//! A request that takes the count past `max_requests` is denied and, when
//! the rule has a non-zero `block_duration`, blocks the key until that much
//! time has passed. State for a key is created on first use and removed by
//! [`RateLimiter::cleanup`] once it has been idle for a full window.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

use super::policy::RateLimitPolicy;

/// Category used when the caller does not name one.
pub const DEFAULT_CATEGORY: &str = "default";

/// Limits applied to one category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub max_requests: u32,
    pub window: Duration,
    /// Zero means "deny while over the limit, never block".
    pub block_duration: Duration,
}

impl From<&RateLimitPolicy> for RateLimitRule {
    fn from(policy: &RateLimitPolicy) -> Self {
        Self {
            max_requests: policy.max_requests,
            window: policy.window,
            block_duration: policy.block_duration,
        }
    }
}

/// Snapshot of one key's accounting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub limit: u32,
    pub remaining: u32,
    /// When the window resets, or the block lifts.
    pub reset_time: DateTime<Utc>,
    pub blocked: bool,
}

#[derive(Debug, Clone)]
struct KeyState {
    count: u32,
    window_start: Instant,
    blocked_until: Option<Instant>,
}

struct Table {
    default_rule: RateLimitRule,
    rules: HashMap<String, RateLimitRule>,
    states: HashMap<(String, String), KeyState>,
}

impl Table {
    fn rule(&self, category: &str) -> RateLimitRule {
        self.rules
            .get(category)
            .copied()
            .unwrap_or(self.default_rule)
    }
}

/// Thread-safe rate limiter. Every check-and-update runs under one mutex.
pub struct RateLimiter {
    table: Mutex<Table>,
}

impl RateLimiter {
    pub fn new(default_rule: RateLimitRule) -> Self {
        Self {
            table: Mutex::new(Table {
                default_rule,
                rules: HashMap::new(),
                states: HashMap::new(),
            }),
        }
    }

    /// Rule for categories without their own [`configure`](Self::configure) call.
    pub fn set_default_rule(&self, rule: RateLimitRule) {
        self.table().default_rule = rule;
    }

    /// Set the rule for one category. Existing counters are kept.
    pub fn configure(&self, category: &str, rule: RateLimitRule) {
        self.table().rules.insert(category.to_string(), rule);
    }

    /// Count one request and report whether it is allowed.
    pub fn check_limit(&self, category: &str, identifier: &str) -> bool {
        self.check_limit_at(category, identifier, Instant::now())
    }

    pub(crate) fn check_limit_at(&self, category: &str, identifier: &str, now: Instant) -> bool {
        let mut table = self.table();
        let rule = table.rule(category);
        let state = table
            .states
            .entry((category.to_string(), identifier.to_string()))
            .or_insert(KeyState {
                count: 0,
                window_start: now,
                blocked_until: None,
            });

        if let Some(until) = state.blocked_until {
            if now < until {
                return false;
            }
            state.blocked_until = None;
            state.count = 0;
            state.window_start = now;
        }

        if now.duration_since(state.window_start) >= rule.window {
            state.count = 0;
            state.window_start = now;
        }

        state.count = state.count.saturating_add(1);
        if state.count <= rule.max_requests {
            return true;
        }

        if !rule.block_duration.is_zero() {
            state.blocked_until = Some(now + rule.block_duration);
            debug!(
                "Rate limit exceeded for {}/{}; blocked for {:?}",
                category, identifier, rule.block_duration
            );
        }
        false
    }

    /// Current accounting for a key, without counting a request.
    pub fn status(&self, category: &str, identifier: &str) -> RateLimitStatus {
        self.status_at(category, identifier, Instant::now())
    }

    pub(crate) fn status_at(&self, category: &str, identifier: &str, now: Instant) -> RateLimitStatus {
        let table = self.table();
        let rule = table.rule(category);
        let key = (category.to_string(), identifier.to_string());

        let (remaining, reset_at, blocked) = match table.states.get(&key) {
            None => (rule.max_requests, now, false),
            Some(state) => match state.blocked_until {
                Some(until) if now < until => (0, until, true),
                _ if state.blocked_until.is_some()
                    || now.duration_since(state.window_start) >= rule.window =>
                {
                    (rule.max_requests, now, false)
                }
                _ => (
                    rule.max_requests.saturating_sub(state.count),
                    state.window_start + rule.window,
                    false,
                ),
            },
        };

        RateLimitStatus {
            limit: rule.max_requests,
            remaining,
            reset_time: wall_clock(now, reset_at),
            blocked,
        }
    }

    /// Forget a key's counters and any block.
    pub fn reset(&self, category: &str, identifier: &str) {
        self.table()
            .states
            .remove(&(category.to_string(), identifier.to_string()));
    }

    /// Drop state for keys that are not blocked and idle for a full window.
    /// Returns the number of keys removed.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    pub(crate) fn cleanup_at(&self, now: Instant) -> usize {
        let mut table = self.table();
        let default_window = table.default_rule.window;
        let Table { rules, states, .. } = &mut *table;
        let before = states.len();
        states.retain(|(category, _), state| {
            let window = rules.get(category).map_or(default_window, |r| r.window);
            let blocked = state.blocked_until.is_some_and(|until| now < until);
            blocked || now.duration_since(state.window_start) < window
        });
        let removed = before - states.len();
        if removed > 0 {
            debug!("Rate limiter cleanup removed {} idle keys", removed);
        }
        removed
    }

    /// Number of keys with live state.
    pub fn tracked_keys(&self) -> usize {
        self.table().states.len()
    }

    fn table(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn wall_clock(now: Instant, at: Instant) -> DateTime<Utc> {
    let ahead = at.saturating_duration_since(now);
    Utc::now() + chrono::Duration::from_std(ahead).unwrap_or(chrono::Duration::zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn rule(max: u32, window_secs: u64, block_secs: u64) -> RateLimitRule {
        RateLimitRule {
            max_requests: max,
            window: Duration::from_secs(window_secs),
            block_duration: Duration::from_secs(block_secs),
        }
    }

    #[test]
    fn allows_up_to_limit_then_denies() {
        let limiter = RateLimiter::new(rule(5, 60, 0));
        let now = Instant::now();
        for i in 1..=5 {
            assert!(limiter.check_limit_at("api", "user", now), "request {} denied", i);
        }
        for _ in 6..=8 {
            assert!(!limiter.check_limit_at("api", "user", now));
        }
    }

    #[test]
    fn window_reset_allows_again() {
        let limiter = RateLimiter::new(rule(5, 60, 0));
        let now = Instant::now();
        for _ in 0..6 {
            limiter.check_limit_at("api", "user", now);
        }
        assert!(!limiter.check_limit_at("api", "user", now + Duration::from_secs(59)));
        assert!(limiter.check_limit_at("api", "user", now + Duration::from_secs(60)));
    }

    #[test]
    fn block_outlasts_window() {
        let limiter = RateLimiter::new(rule(2, 10, 300));
        let now = Instant::now();
        assert!(limiter.check_limit_at("login", "ip", now));
        assert!(limiter.check_limit_at("login", "ip", now));
        assert!(!limiter.check_limit_at("login", "ip", now));

        // Window has passed but the block has not.
        let later = now + Duration::from_secs(60);
        assert!(!limiter.check_limit_at("login", "ip", later));
        assert!(limiter.status_at("login", "ip", later).blocked);

        let after_block = now + Duration::from_secs(301);
        assert!(limiter.check_limit_at("login", "ip", after_block));
        assert!(!limiter.status_at("login", "ip", after_block).blocked);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(rule(1, 60, 0));
        let now = Instant::now();
        assert!(limiter.check_limit_at("api", "alice", now));
        assert!(!limiter.check_limit_at("api", "alice", now));
        assert!(limiter.check_limit_at("api", "bob", now));
        assert!(limiter.check_limit_at("upload", "alice", now));
    }

    #[test]
    fn category_rules_override_default() {
        let limiter = RateLimiter::new(rule(1, 60, 0));
        limiter.configure("bulk", rule(3, 60, 0));
        let now = Instant::now();
        for _ in 0..3 {
            assert!(limiter.check_limit_at("bulk", "x", now));
        }
        assert!(!limiter.check_limit_at("bulk", "x", now));
    }

    #[test]
    fn status_does_not_count() {
        let limiter = RateLimiter::new(rule(5, 60, 0));
        let now = Instant::now();
        limiter.check_limit_at("api", "user", now);
        limiter.check_limit_at("api", "user", now);

        let status = limiter.status_at("api", "user", now);
        assert_eq!(status.limit, 5);
        assert_eq!(status.remaining, 3);
        assert!(!status.blocked);
        assert_eq!(limiter.status_at("api", "user", now), status);
        assert!(status.reset_time > Utc::now() + chrono::Duration::seconds(50));
    }

    #[test]
    fn unknown_key_has_full_allowance() {
        let limiter = RateLimiter::new(rule(5, 60, 0));
        let status = limiter.status("api", "nobody");
        assert_eq!(status.remaining, 5);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[test]
    fn reset_clears_block() {
        let limiter = RateLimiter::new(rule(1, 60, 600));
        let now = Instant::now();
        limiter.check_limit_at("api", "user", now);
        assert!(!limiter.check_limit_at("api", "user", now));
        limiter.reset("api", "user");
        assert!(limiter.check_limit_at("api", "user", now));
    }

    #[test]
    fn cleanup_keeps_active_and_blocked_keys() {
        let limiter = RateLimiter::new(rule(1, 10, 600));
        let now = Instant::now();
        limiter.check_limit_at("api", "idle", now);
        limiter.check_limit_at("api", "blocked", now);
        limiter.check_limit_at("api", "blocked", now);
        limiter.check_limit_at("api", "fresh", now + Duration::from_secs(15));

        assert_eq!(limiter.cleanup_at(now + Duration::from_secs(20)), 1);
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[test]
    fn concurrent_checks_never_exceed_limit() {
        let limiter = Arc::new(RateLimiter::new(rule(50, 60, 0)));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..20)
                        .filter(|_| limiter.check_limit("api", "shared"))
                        .count()
                })
            })
            .collect();
        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 50);
    }
}
