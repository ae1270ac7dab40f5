use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chronicle_core::TargetId;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Bucket size and refill rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateQuota {
    pub per_second: NonZeroU32,
    pub burst: NonZeroU32,
}

impl RateQuota {
    pub fn new(per_second: NonZeroU32, burst: NonZeroU32) -> Self {
        Self { per_second, burst }
    }

    fn to_quota(self) -> Quota {
        Quota::per_second(self.per_second).allow_burst(self.burst)
    }
}

impl Default for RateQuota {
    fn default() -> Self {
        Self::new(nonzero!(20u32), nonzero!(20u32))
    }
}

/// Quota lookup: (class, target) override, then class default, then global.
#[derive(Debug, Clone, Default)]
pub struct RateLimitPolicy {
    pub global: RateQuota,
    pub classes: HashMap<String, RateQuota>,
    pub targets: HashMap<(String, TargetId), RateQuota>,
}

impl RateLimitPolicy {
    pub fn quota_for(&self, class: &str, target: TargetId) -> RateQuota {
        self.targets
            .get(&(class.to_string(), target))
            .or_else(|| self.classes.get(class))
            .copied()
            .unwrap_or(self.global)
    }
}

struct Bucket {
    limiter: DirectLimiter,
    last_used: Instant,
}

/// Token buckets keyed by (resource class, target), created on first use.
///
/// Idle buckets are dropped by [`RateLimiterRegistry::evict_idle`]; when the
/// registry is full the least recently used bucket makes room.
pub struct RateLimiterRegistry {
    policy: RateLimitPolicy,
    capacity: usize,
    buckets: Mutex<HashMap<(String, TargetId), Bucket>>,
}

impl RateLimiterRegistry {
    pub fn new(policy: RateLimitPolicy, capacity: usize) -> Self {
        Self {
            policy,
            capacity: capacity.max(1),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(String, TargetId), Bucket>> {
        self.buckets.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Takes a token if one is available. Never waits.
    pub fn record_call(&self, class: &str, target: TargetId) -> bool {
        let key = (class.to_string(), target);
        let mut buckets = self.lock();
        if !buckets.contains_key(&key) && buckets.len() >= self.capacity {
            Self::evict_lru(&mut buckets);
        }
        let quota = self.policy.quota_for(class, target);
        let bucket = buckets.entry(key).or_insert_with(|| Bucket {
            limiter: RateLimiter::direct(quota.to_quota()),
            last_used: Instant::now(),
        });
        bucket.last_used = Instant::now();
        let allowed = bucket.limiter.check().is_ok();
        if !allowed {
            tracing::debug!("rate bucket {}/{} is empty", class, target);
        }
        allowed
    }

    fn evict_lru(buckets: &mut HashMap<(String, TargetId), Bucket>) {
        if let Some(oldest) = buckets
            .iter()
            .min_by_key(|(_, b)| b.last_used)
            .map(|(k, _)| k.clone())
        {
            buckets.remove(&oldest);
        }
    }

    /// Drops buckets unused for at least `ttl`. Returns how many went.
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let mut buckets = self.lock();
        let before = buckets.len();
        buckets.retain(|_, b| b.last_used.elapsed() < ttl);
        before - buckets.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RateLimiterRegistry {
    fn default() -> Self {
        Self::new(RateLimitPolicy::default(), 1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quota(per_second: u32, burst: u32) -> RateQuota {
        RateQuota::new(
            NonZeroU32::new(per_second).unwrap(),
            NonZeroU32::new(burst).unwrap(),
        )
    }

    #[test]
    fn quota_falls_back_from_target_to_class_to_global() {
        let mut policy = RateLimitPolicy {
            global: quota(10, 10),
            ..Default::default()
        };
        policy.classes.insert("market".into(), quota(5, 5));
        policy
            .targets
            .insert(("market".into(), TargetId::Account(7)), quota(1, 1));

        assert_eq!(policy.quota_for("market", TargetId::Account(7)), quota(1, 1));
        assert_eq!(policy.quota_for("market", TargetId::Account(8)), quota(5, 5));
        assert_eq!(policy.quota_for("assets", TargetId::Account(7)), quota(10, 10));
    }

    #[test]
    fn empty_bucket_reports_but_does_not_block() {
        let policy = RateLimitPolicy {
            global: quota(1, 2),
            ..Default::default()
        };
        let registry = RateLimiterRegistry::new(policy, 16);

        assert!(registry.record_call("assets", TargetId::Account(1)));
        assert!(registry.record_call("assets", TargetId::Account(1)));
        assert!(!registry.record_call("assets", TargetId::Account(1)));
        // Separate target, separate bucket.
        assert!(registry.record_call("assets", TargetId::Account(2)));
    }

    #[test]
    fn capacity_evicts_least_recently_used_bucket() {
        let registry = RateLimiterRegistry::new(RateLimitPolicy::default(), 2);
        registry.record_call("a", TargetId::Reference);
        std::thread::sleep(Duration::from_millis(2));
        registry.record_call("b", TargetId::Reference);
        std::thread::sleep(Duration::from_millis(2));
        registry.record_call("a", TargetId::Reference);
        registry.record_call("c", TargetId::Reference);

        assert_eq!(registry.len(), 2);
        let buckets = registry.lock();
        assert!(buckets.contains_key(&("a".to_string(), TargetId::Reference)));
        assert!(!buckets.contains_key(&("b".to_string(), TargetId::Reference)));
    }

    #[test]
    fn evict_idle_respects_ttl() {
        let registry = RateLimiterRegistry::default();
        registry.record_call("a", TargetId::Account(1));
        registry.record_call("b", TargetId::Account(1));

        assert_eq!(registry.evict_idle(Duration::from_secs(3600)), 0);
        assert_eq!(registry.evict_idle(Duration::ZERO), 2);
        assert!(registry.is_empty());
    }
}
