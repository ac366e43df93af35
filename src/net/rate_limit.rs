//! Leaky-bucket flood protection
//!
//! Two layers share the same bucket type:
//! - [`RateLimiter`]: address-keyed pool consulted for connectionless traffic,
//!   client commands and gamestate requests. Addresses that keep hammering a
//!   full bucket are marked toxic and dropped outright for a cooldown.
//! - per-connection buckets held directly by each connection.
//!
//! Each request costs `period_ms` units of water and the bucket drains at
//! `burst` units per millisecond, so `burst` requests fit instantly and the
//! whole burst is available again after `period_ms` of quiet.

use std::net::{IpAddr, Ipv6Addr};

use hashbrown::HashMap;
use tracing::{debug, warn};

use crate::config::{BucketConfig, RateLimitConfig};

/// Single leaky bucket
#[derive(Debug, Clone, Copy, Default)]
pub struct LeakyBucket {
    level: u64,
    last_update: u64,
}

impl LeakyBucket {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take one token if available
    pub fn allow(&mut self, config: &BucketConfig, now_ms: u64) -> bool {
        self.drain(config, now_ms);

        let cost = config.period_ms;
        let capacity = config.burst as u64 * config.period_ms;
        if self.level + cost <= capacity {
            self.level += cost;
            true
        } else {
            false
        }
    }

    /// Nothing left in the bucket at `now_ms`
    pub fn is_empty(&self, config: &BucketConfig, now_ms: u64) -> bool {
        let mut probe = *self;
        probe.drain(config, now_ms);
        probe.level == 0
    }

    pub fn reset(&mut self) {
        self.level = 0;
    }

    fn drain(&mut self, config: &BucketConfig, now_ms: u64) {
        if now_ms < self.last_update {
            // Clock went backwards: start over rather than lock the caller out
            self.level = 0;
        } else {
            let elapsed = now_ms - self.last_update;
            let drained = elapsed.saturating_mul(config.burst as u64);
            self.level = self.level.saturating_sub(drained);
        }
        self.last_update = now_ms;
    }
}

/// Traffic class with its own bucket per address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitCategory {
    Challenge,
    Connect,
    Query,
    Rcon,
    Command,
    Gamestate,
}

impl LimitCategory {
    const COUNT: usize = 6;

    fn index(self) -> usize {
        match self {
            LimitCategory::Challenge => 0,
            LimitCategory::Connect => 1,
            LimitCategory::Query => 2,
            LimitCategory::Rcon => 3,
            LimitCategory::Command => 4,
            LimitCategory::Gamestate => 5,
        }
    }

    fn config(self, limits: &RateLimitConfig) -> &BucketConfig {
        match self {
            LimitCategory::Challenge => &limits.challenge,
            LimitCategory::Connect => &limits.connect,
            LimitCategory::Query => &limits.query,
            LimitCategory::Rcon => &limits.rcon,
            LimitCategory::Command => &limits.command,
            LimitCategory::Gamestate => &limits.gamestate,
        }
    }
}

/// Outcome of an address-level check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Bucket empty; drop this request
    Limited,
    /// Address is in its toxic cooldown; drop everything from it
    Toxic,
}

impl RateDecision {
    pub fn is_allowed(self) -> bool {
        self == RateDecision::Allowed
    }
}

#[derive(Debug, Clone)]
struct AddressBuckets {
    address: IpAddr,
    buckets: [LeakyBucket; LimitCategory::COUNT],
    /// Rejections since the last accepted request
    strikes: u32,
    toxic_until: Option<u64>,
    last_used: u64,
}

impl AddressBuckets {
    fn new(address: IpAddr, now_ms: u64) -> Self {
        Self {
            address,
            buckets: [LeakyBucket::default(); LimitCategory::COUNT],
            strikes: 0,
            toxic_until: None,
            last_used: now_ms,
        }
    }

    fn is_toxic(&self, now_ms: u64) -> bool {
        self.toxic_until.is_some_and(|until| now_ms < until)
    }
}

/// Fixed-capacity pool with an explicit free list
struct BucketPool {
    slots: Vec<Option<AddressBuckets>>,
    free: Vec<usize>,
    index: HashMap<IpAddr, usize>,
}

impl BucketPool {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
            // Pop from the back hands out low indices first
            free: (0..capacity).rev().collect(),
            index: HashMap::with_capacity(capacity),
        }
    }

    fn get(&self, address: &IpAddr) -> Option<&AddressBuckets> {
        let slot = *self.index.get(address)?;
        self.slots[slot].as_ref()
    }

    fn get_or_insert(&mut self, address: IpAddr, now_ms: u64) -> Option<&mut AddressBuckets> {
        let slot = match self.index.get(&address) {
            Some(&slot) => slot,
            None => {
                let slot = match self.free.pop() {
                    Some(slot) => slot,
                    None => self.reclaim(now_ms)?,
                };
                self.slots[slot] = Some(AddressBuckets::new(address, now_ms));
                self.index.insert(address, slot);
                slot
            }
        };

        let entry = self.slots[slot].as_mut()?;
        entry.last_used = now_ms;
        Some(entry)
    }

    /// Evict the least recently used address that is not toxic
    fn reclaim(&mut self, now_ms: u64) -> Option<usize> {
        let (slot, address) = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|b| (i, b)))
            .filter(|(_, b)| !b.is_toxic(now_ms))
            .min_by_key(|(_, b)| b.last_used)
            .map(|(i, b)| (i, b.address))?;

        self.index.remove(&address);
        self.slots[slot] = None;
        Some(slot)
    }

    fn release(&mut self, slot: usize) {
        if let Some(entry) = self.slots[slot].take() {
            self.index.remove(&entry.address);
            self.free.push(slot);
        }
    }

    fn len(&self) -> usize {
        self.index.len()
    }
}

/// Address-keyed limiter with separate IPv4 and IPv6 pools
pub struct RateLimiter {
    config: RateLimitConfig,
    v4: BucketPool,
    v6: BucketPool,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            v4: BucketPool::new(config.pool_size),
            v6: BucketPool::new(config.pool_size),
            config,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// IPv6 hosts usually own a whole /64, so buckets are keyed by prefix
    fn key(address: IpAddr) -> IpAddr {
        match address {
            IpAddr::V4(_) => address,
            IpAddr::V6(v6) => {
                let segments = v6.segments();
                IpAddr::V6(Ipv6Addr::new(
                    segments[0],
                    segments[1],
                    segments[2],
                    segments[3],
                    0,
                    0,
                    0,
                    0,
                ))
            }
        }
    }

    fn pool_mut(&mut self, key: &IpAddr) -> &mut BucketPool {
        match key {
            IpAddr::V4(_) => &mut self.v4,
            IpAddr::V6(_) => &mut self.v6,
        }
    }

    fn pool(&self, key: &IpAddr) -> &BucketPool {
        match key {
            IpAddr::V4(_) => &self.v4,
            IpAddr::V6(_) => &self.v6,
        }
    }

    /// Spend a token for `category` from `address`
    pub fn check(&mut self, address: IpAddr, category: LimitCategory, now_ms: u64) -> RateDecision {
        let key = Self::key(address);
        let bucket_config = *category.config(&self.config);
        let threshold = self.config.toxic_threshold;
        let cooldown = self.config.toxic_cooldown_ms;

        let Some(entry) = self.pool_mut(&key).get_or_insert(key, now_ms) else {
            // Pool exhausted by toxic addresses: fail closed
            debug!("Rate limit pool exhausted, dropping request from {}", address);
            return RateDecision::Limited;
        };

        if entry.is_toxic(now_ms) {
            return RateDecision::Toxic;
        }
        if entry.toxic_until.is_some() {
            entry.toxic_until = None;
            entry.strikes = 0;
        }

        if entry.buckets[category.index()].allow(&bucket_config, now_ms) {
            entry.strikes = 0;
            return RateDecision::Allowed;
        }

        entry.strikes += 1;
        if entry.strikes >= threshold {
            entry.toxic_until = Some(now_ms + cooldown);
            warn!(
                "Address {} marked toxic after {} limited requests ({:?})",
                address, entry.strikes, category
            );
            return RateDecision::Toxic;
        }
        RateDecision::Limited
    }

    /// Escalate an address immediately (bad rcon password, protocol abuse)
    pub fn mark_toxic(&mut self, address: IpAddr, now_ms: u64) {
        let key = Self::key(address);
        let cooldown = self.config.toxic_cooldown_ms;
        if let Some(entry) = self.pool_mut(&key).get_or_insert(key, now_ms) {
            entry.toxic_until = Some(now_ms + cooldown);
            warn!("Address {} marked toxic", address);
        }
    }

    pub fn is_toxic(&self, address: IpAddr, now_ms: u64) -> bool {
        let key = Self::key(address);
        self.pool(&key)
            .get(&key)
            .is_some_and(|entry| entry.is_toxic(now_ms))
    }

    /// Give an address its full burst back for one category
    pub fn restore(&mut self, address: IpAddr, category: LimitCategory, now_ms: u64) {
        let key = Self::key(address);
        if let Some(entry) = self.pool_mut(&key).get_or_insert(key, now_ms) {
            entry.buckets[category.index()].reset();
        }
    }

    /// Return idle, drained, non-toxic entries to the free list
    pub fn sweep(&mut self, now_ms: u64) {
        let config = self.config.clone();
        for pool in [&mut self.v4, &mut self.v6] {
            let idle: Vec<usize> = pool
                .slots
                .iter()
                .enumerate()
                .filter_map(|(slot, entry)| {
                    let entry = entry.as_ref()?;
                    let drained = [
                        LimitCategory::Challenge,
                        LimitCategory::Connect,
                        LimitCategory::Query,
                        LimitCategory::Rcon,
                        LimitCategory::Command,
                        LimitCategory::Gamestate,
                    ]
                    .iter()
                    .all(|c| entry.buckets[c.index()].is_empty(c.config(&config), now_ms));
                    let expired = entry.toxic_until.map_or(true, |until| now_ms >= until);
                    (drained && expired).then_some(slot)
                })
                .collect();
            for slot in idle {
                pool.release(slot);
            }
        }
    }

    /// Addresses currently tracked (IPv4, IPv6)
    pub fn tracked(&self) -> (usize, usize) {
        (self.v4.len(), self.v6.len())
    }
}
