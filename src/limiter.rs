//! Token-bucket rate limiting per source address and author key.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::time::Instant;

use tracing::debug;

use crate::config::Settings;

/// Admission decision for a single operation.
#[derive(Debug, Clone, PartialEq)]
pub enum RateDecision {
    Allowed,
    /// Temporarily over budget; retry later.
    Limited(String),
    /// Refused outright (deny list, connection cap).
    Blocked(String),
}

impl RateDecision {
    /// Test support: collapse the decision to pass/fail.
    #[cfg(test)]
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

/// A lazily refilled token bucket.
#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_touch: Instant,
}

impl Bucket {
    fn new(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            last_touch: now,
        }
    }

    /// Refill for elapsed time, then try to take `cost` tokens.
    fn take(&mut self, cost: f64, capacity: f64, rate: f64, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate).min(capacity);
        self.last_refill = now;
        self.last_touch = now;
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }
}

/// Per-source and per-author admission control.
///
/// Events take one token from both buckets; subscription requests take
/// `subscription_cost` from the source bucket. Allow-list entries bypass
/// every check, deny-list entries reject unconditionally.
pub struct RateLimiter {
    ip_buckets: HashMap<IpAddr, Bucket>,
    pubkey_buckets: HashMap<String, Bucket>,
    active_connections: HashMap<IpAddr, usize>,
    allow_list: HashSet<IpAddr>,
    deny_list: HashSet<IpAddr>,
    ip_capacity: f64,
    ip_refill: f64,
    pubkey_capacity: f64,
    pubkey_refill: f64,
    subscription_cost: f64,
    max_connections_per_source: usize,
    max_buckets: usize,
    max_event_bytes: usize,
}

impl RateLimiter {
    pub fn new(settings: &Settings) -> Self {
        let mut limiter = Self {
            ip_buckets: HashMap::new(),
            pubkey_buckets: HashMap::new(),
            active_connections: HashMap::new(),
            allow_list: HashSet::new(),
            deny_list: HashSet::new(),
            ip_capacity: settings.rate_ip_capacity,
            ip_refill: settings.rate_ip_refill,
            pubkey_capacity: settings.rate_pubkey_capacity,
            pubkey_refill: settings.rate_pubkey_refill,
            subscription_cost: settings.subscription_cost,
            max_connections_per_source: settings.max_connections_per_source,
            max_buckets: settings.max_rate_buckets,
            max_event_bytes: settings.max_event_bytes,
        };
        for ip in settings.ip_denylist.iter().filter_map(|s| s.parse().ok()) {
            limiter.deny(ip);
        }
        // applied second so an address on both lists ends up allowed
        for ip in settings.ip_allowlist.iter().filter_map(|s| s.parse().ok()) {
            limiter.allow(ip);
        }
        limiter
    }

    /// Admit an event submission of `size` bytes from `ip` signed by `pubkey`.
    pub fn check_event(&mut self, ip: IpAddr, pubkey: &str, size: usize) -> RateDecision {
        self.check_event_at(ip, pubkey, size, Instant::now())
    }

    pub fn check_event_at(
        &mut self,
        ip: IpAddr,
        pubkey: &str,
        size: usize,
        now: Instant,
    ) -> RateDecision {
        if self.deny_list.contains(&ip) {
            return RateDecision::Blocked("address is denied".into());
        }
        if self.allow_list.contains(&ip) {
            return RateDecision::Allowed;
        }
        if size > self.max_event_bytes {
            return RateDecision::Limited(format!(
                "event of {} bytes exceeds the {} byte limit",
                size, self.max_event_bytes
            ));
        }
        let cap = self.ip_capacity;
        let rate = self.ip_refill;
        let bucket = self
            .ip_buckets
            .entry(ip)
            .or_insert_with(|| Bucket::new(cap, now));
        if !bucket.take(1.0, cap, rate, now) {
            return RateDecision::Limited("too many events from your address".into());
        }
        let cap = self.pubkey_capacity;
        let rate = self.pubkey_refill;
        let bucket = self
            .pubkey_buckets
            .entry(pubkey.to_string())
            .or_insert_with(|| Bucket::new(cap, now));
        if !bucket.take(1.0, cap, rate, now) {
            return RateDecision::Limited("too many events for this pubkey".into());
        }
        RateDecision::Allowed
    }

    /// Admit a subscription request from `ip`.
    pub fn check_subscription(&mut self, ip: IpAddr) -> RateDecision {
        self.check_subscription_at(ip, Instant::now())
    }

    pub fn check_subscription_at(&mut self, ip: IpAddr, now: Instant) -> RateDecision {
        if self.deny_list.contains(&ip) {
            return RateDecision::Blocked("address is denied".into());
        }
        if self.allow_list.contains(&ip) {
            return RateDecision::Allowed;
        }
        let cap = self.ip_capacity;
        let rate = self.ip_refill;
        let cost = self.subscription_cost;
        let bucket = self
            .ip_buckets
            .entry(ip)
            .or_insert_with(|| Bucket::new(cap, now));
        if !bucket.take(cost, cap, rate, now) {
            return RateDecision::Limited("too many subscription requests".into());
        }
        RateDecision::Allowed
    }

    /// Count a new connection against the per-source cap.
    pub fn connection_opened(&mut self, ip: IpAddr) -> RateDecision {
        if self.deny_list.contains(&ip) {
            return RateDecision::Blocked("address is denied".into());
        }
        if !self.allow_list.contains(&ip) {
            let active = self.active_connections.get(&ip).copied().unwrap_or(0);
            if active >= self.max_connections_per_source {
                return RateDecision::Blocked("too many concurrent connections".into());
            }
        }
        *self.active_connections.entry(ip).or_insert(0) += 1;
        RateDecision::Allowed
    }

    /// Release a connection slot.
    pub fn connection_closed(&mut self, ip: IpAddr) {
        if let Some(count) = self.active_connections.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.active_connections.remove(&ip);
            }
        }
    }

    /// Add an address to the allow list, removing any deny entry.
    pub fn allow(&mut self, ip: IpAddr) {
        self.deny_list.remove(&ip);
        self.allow_list.insert(ip);
    }

    /// Add an address to the deny list.
    pub fn deny(&mut self, ip: IpAddr) {
        self.deny_list.insert(ip);
    }

    /// Drop idle full buckets and evict least-recently-touched entries
    /// past the table cap. Runs hourly.
    pub fn cleanup(&mut self) {
        self.cleanup_at(Instant::now());
    }

    pub fn cleanup_at(&mut self, now: Instant) {
        let period = |cap: f64, rate: f64| {
            if rate > 0.0 {
                cap / rate
            } else {
                f64::MAX
            }
        };
        let ip_period = period(self.ip_capacity, self.ip_refill);
        let ip_cap = self.ip_capacity;
        self.ip_buckets.retain(|_, b| {
            !(b.tokens >= ip_cap && now.duration_since(b.last_touch).as_secs_f64() >= ip_period)
        });
        let pk_period = period(self.pubkey_capacity, self.pubkey_refill);
        let pk_cap = self.pubkey_capacity;
        self.pubkey_buckets.retain(|_, b| {
            !(b.tokens >= pk_cap && now.duration_since(b.last_touch).as_secs_f64() >= pk_period)
        });
        evict_lru(&mut self.ip_buckets, self.max_buckets);
        evict_lru(&mut self.pubkey_buckets, self.max_buckets);
        debug!(
            ip_buckets = self.ip_buckets.len(),
            pubkey_buckets = self.pubkey_buckets.len(),
            "rate limiter cleanup"
        );
    }

    pub fn tracked_buckets(&self) -> usize {
        self.ip_buckets.len() + self.pubkey_buckets.len()
    }
}

/// Evict least-recently-touched buckets until the table fits the cap.
fn evict_lru<K: Clone + std::hash::Hash + Eq>(table: &mut HashMap<K, Bucket>, cap: usize) {
    while table.len() > cap {
        let oldest = table
            .iter()
            .min_by_key(|(_, b)| b.last_touch)
            .map(|(k, _)| k.clone());
        match oldest {
            Some(k) => table.remove(&k),
            None => break,
        };
    }
}
