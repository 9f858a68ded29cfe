//! Leaky bucket rate limiting for CHECK requests.
//!
//! Sources are grouped by network (IPv4 by the configured prefix, IPv6 by
//! four times that, clamped to /64../128). Each group owns a bucket that
//! fills by one per request and drains at `rate` per second. A bucket that
//! reaches `burst` stays exhausted until it expires `bucket_ttl` after its
//! creation.

use crate::access::canonical;
use crate::config::{ConfigError, RateLimitConfig};
use ipnetwork::IpNetwork;
use lru::LruCache;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

struct Bucket {
    level: f64,
    last: Instant,
    created: Instant,
    exhausted: bool,
}

impl Bucket {
    fn new(now: Instant) -> Self {
        Self {
            level: 1.0,
            last: now,
            created: now,
            exhausted: false,
        }
    }

    /// Drains, then tries to add one request.
    fn admit(&mut self, now: Instant, rate: f64, burst: f64) -> bool {
        if self.exhausted {
            return false;
        }

        let elapsed = now.saturating_duration_since(self.last).as_secs_f64();
        self.level = (self.level - rate * elapsed).max(0.0);
        self.last = now;

        if self.level >= burst {
            self.exhausted = true;
            return false;
        }
        self.level += 1.0;
        true
    }
}

/// Per-network leaky buckets held in a bounded LRU.
pub struct RateLimiter {
    rate: f64,
    burst: f64,
    ttl: Duration,
    mask: u8,
    whitelist: Vec<IpNetwork>,
    log_only: bool,
    buckets: Mutex<LruCache<IpAddr, Bucket>>,
}

impl RateLimiter {
    pub fn new(rate: f64, burst: f64, ttl: Duration, max_buckets: usize) -> Self {
        let capacity = NonZeroUsize::new(max_buckets).unwrap_or(NonZeroUsize::MIN);
        Self {
            rate,
            burst,
            ttl,
            mask: 24,
            whitelist: Vec::new(),
            log_only: false,
            buckets: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Builds the limiter described by `config`, or `None` when disabled.
    pub fn from_config(config: &RateLimitConfig) -> Result<Option<Self>, ConfigError> {
        if !config.enabled {
            return Ok(None);
        }

        let mut limiter = Self::new(
            config.rate,
            config.burst,
            config.bucket_ttl(),
            config.max_buckets,
        )
        .with_mask(config.network_mask)
        .log_only(config.log_only);
        limiter.whitelist = config.whitelist_networks()?;
        Ok(Some(limiter))
    }

    pub fn with_mask(mut self, mask: u8) -> Self {
        self.mask = mask;
        self
    }

    pub fn with_whitelist(mut self, network: IpNetwork) -> Self {
        self.whitelist.push(network);
        self
    }

    pub fn log_only(mut self, log_only: bool) -> Self {
        self.log_only = log_only;
        self
    }

    /// Returns whether a request from `ip` may proceed.
    pub fn check(&self, ip: IpAddr) -> bool {
        self.check_at(ip, Instant::now())
    }

    pub fn check_at(&self, ip: IpAddr, now: Instant) -> bool {
        let ip = canonical(ip);
        if self.whitelist.iter().any(|net| net.contains(ip)) {
            return true;
        }

        let key = mask_addr(ip, self.mask);
        let allowed = {
            let mut buckets = self.buckets.lock();
            match buckets.get_mut(&key) {
                Some(bucket) if now.saturating_duration_since(bucket.created) < self.ttl => {
                    let was_exhausted = bucket.exhausted;
                    let allowed = bucket.admit(now, self.rate, self.burst);
                    if !allowed && !was_exhausted {
                        tracing::info!(
                            "Rate limiting {} ({}), {:.1} max requests",
                            ip,
                            key,
                            self.burst
                        );
                    }
                    allowed
                }
                _ => {
                    buckets.put(key, Bucket::new(now));
                    true
                }
            }
        };

        allowed || self.log_only
    }

    /// Number of tracked buckets.
    pub fn len(&self) -> usize {
        self.buckets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn mask_addr(ip: IpAddr, mask: u8) -> IpAddr {
    match ip {
        IpAddr::V4(v4) => {
            let bits = u32::from(mask.min(32));
            let netmask = if bits == 0 { 0 } else { u32::MAX << (32 - bits) };
            IpAddr::V4(Ipv4Addr::from(u32::from(v4) & netmask))
        }
        IpAddr::V6(v6) => {
            let bits = (u32::from(mask) * 4).clamp(64, 128);
            let netmask = u128::MAX << (128 - bits);
            IpAddr::V6(Ipv6Addr::from(u128::from(v6) & netmask))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn limiter() -> RateLimiter {
        RateLimiter::new(1.0, 3.0, Duration::from_secs(60), 16)
    }

    #[test]
    fn test_burst_then_exhausted() {
        let limiter = limiter();
        let now = Instant::now();
        let src = ip("192.0.2.1");

        assert!(limiter.check_at(src, now));
        assert!(limiter.check_at(src, now));
        assert!(limiter.check_at(src, now));
        assert!(!limiter.check_at(src, now));

        // Exhausted buckets do not drain back.
        assert!(!limiter.check_at(src, now + Duration::from_secs(30)));
    }

    #[test]
    fn test_drain_keeps_bucket_open() {
        let limiter = limiter();
        let start = Instant::now();
        let src = ip("192.0.2.1");

        for i in 0..20 {
            assert!(limiter.check_at(src, start + Duration::from_secs(i)));
        }
    }

    #[test]
    fn test_bucket_expires_after_ttl() {
        let limiter = limiter();
        let now = Instant::now();
        let src = ip("192.0.2.1");

        for _ in 0..4 {
            limiter.check_at(src, now);
        }
        assert!(!limiter.check_at(src, now));
        assert!(limiter.check_at(src, now + Duration::from_secs(61)));
    }

    #[test]
    fn test_network_grouping() {
        let limiter = limiter();
        let now = Instant::now();

        assert!(limiter.check_at(ip("192.0.2.1"), now));
        assert!(limiter.check_at(ip("192.0.2.2"), now));
        assert!(limiter.check_at(ip("192.0.2.3"), now));
        assert!(!limiter.check_at(ip("192.0.2.4"), now));
        assert!(limiter.check_at(ip("198.51.100.1"), now));
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn test_whitelist_and_log_only() {
        let now = Instant::now();
        let src = ip("192.0.2.1");

        let whitelisted = limiter().with_whitelist("192.0.2.0/24".parse().unwrap());
        for _ in 0..10 {
            assert!(whitelisted.check_at(src, now));
        }
        assert!(whitelisted.is_empty());

        let logging = limiter().log_only(true);
        for _ in 0..10 {
            assert!(logging.check_at(src, now));
        }
    }

    #[test]
    fn test_lru_bound() {
        let limiter = RateLimiter::new(1.0, 3.0, Duration::from_secs(60), 2);
        let now = Instant::now();
        for last in 1..=5u8 {
            limiter.check_at(IpAddr::V4(Ipv4Addr::new(10, 0, last, 1)), now);
        }
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn test_mask_addr() {
        assert_eq!(mask_addr(ip("192.0.2.77"), 24), ip("192.0.2.0"));
        assert_eq!(mask_addr(ip("192.0.2.77"), 40), ip("192.0.2.77"));
        assert_eq!(mask_addr(ip("192.0.2.77"), 0), ip("0.0.0.0"));
        assert_eq!(
            mask_addr(ip("2001:db8:1:2:3:4:5:6"), 24),
            ip("2001:db8:1:2:3:4::")
        );
        assert_eq!(mask_addr(ip("2001:db8:1:2:3:4:5:6"), 8), ip("2001:db8:1:2::"));
        assert_eq!(mask_addr(ip("2001:db8::1"), 40), ip("2001:db8::1"));
    }

    #[test]
    fn test_from_config() {
        let mut config = RateLimitConfig::default();
        assert!(RateLimiter::from_config(&config).unwrap().is_none());

        config.enabled = true;
        config.whitelist = vec!["127.0.0.1".into()];
        let limiter = RateLimiter::from_config(&config).unwrap().unwrap();
        assert!(limiter.check(ip("127.0.0.1")));
        assert!(limiter.is_empty());
    }
}
