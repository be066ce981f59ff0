use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::RateLimitConfig;
use crate::message::Endpoint;

/// Outcome of asking the limiter to admit one message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Admitted { remaining: f64 },
    Dropped,
}

/// Token bucket state for one source endpoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateBucket {
    pub allowance: f64,
    pub last_check: Instant,
}

impl RateBucket {
    fn full(config: &RateLimitConfig, now: Instant) -> Self {
        Self {
            allowance: config.capacity,
            last_check: now,
        }
    }

    /// Allowance this bucket would hold at `now`, capped at capacity.
    fn refilled(&self, config: &RateLimitConfig, now: Instant) -> f64 {
        let elapsed_us = now.saturating_duration_since(self.last_check).as_micros() as f64;
        let window_us = config.window().as_micros().max(1) as f64;
        // multiply before dividing so whole-token refills come out exact
        let allowance = self.allowance + elapsed_us * config.refill / window_us;
        allowance.min(config.capacity)
    }

    /// Refill, stamp `now`, then charge `cost` if at least one token is
    /// available. A dropped attempt still moves the timestamp forward.
    fn admit(&mut self, cost: f64, config: &RateLimitConfig, now: Instant) -> Admission {
        self.allowance = self.refilled(config, now);
        self.last_check = now;
        if self.allowance < 1.0 {
            return Admission::Dropped;
        }
        self.allowance -= cost;
        Admission::Admitted {
            remaining: self.allowance,
        }
    }
}

/// Per-source token buckets. Each bucket is locked independently through its
/// map shard, so sources never contend on a global lock.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    buckets: DashMap<Endpoint, RateBucket>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    pub fn check(&self, source: &Endpoint, cost: f64) -> Admission {
        self.check_at(source, cost, Instant::now())
    }

    pub fn check_at(&self, source: &Endpoint, cost: f64, now: Instant) -> Admission {
        if let Some(mut bucket) = self.buckets.get_mut(source) {
            return bucket.admit(cost, &self.config, now);
        }
        self.buckets
            .entry(source.clone())
            .or_insert_with(|| RateBucket::full(&self.config, now))
            .admit(cost, &self.config, now)
    }

    /// Current state of a source's bucket, if it has ever been charged.
    pub fn bucket(&self, source: &Endpoint) -> Option<RateBucket> {
        self.buckets.get(source).map(|b| *b)
    }

    /// Forget buckets that would already be full again. A fresh bucket starts
    /// full, so this is invisible to admission decisions.
    pub fn prune_idle(&self, now: Instant) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| bucket.refilled(&self.config, now) < self.config.capacity);
        before.saturating_sub(self.buckets.len())
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }
}

impl RateLimitConfig {
    /// Window length. Values no `Duration` can hold saturate instead of
    /// panicking; `Config::parse` already rejects them.
    pub fn window(&self) -> Duration {
        Duration::try_from_secs_f64(self.window_secs).unwrap_or(Duration::MAX)
    }
}
