//! IP address to domain correlation cache.
//!
//! Maps addresses seen in A/AAAA answers back to the name that was queried.
//! A miss means "unknown", never "not resolved": entries are evicted once the
//! cache is full. TTLs are not tracked, so a mapping stays until it is
//! overwritten or evicted even if the upstream record has expired.

use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use rustc_hash::{FxHashMap, FxHasher};

const DEFAULT_SHARDS: usize = 16;

/// Number of entries inspected when choosing an eviction victim.
const EVICTION_SAMPLE: usize = 8;

/// A cached mapping as seen by callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub domain: String,
    pub last_seen: SystemTime,
}

struct Slot {
    entry: CacheEntry,
    /// Logical access time, bumped on every read and write.
    tick: AtomicU64,
}

/// Bounded, sharded map from resolved address to domain name.
///
/// Each address lives in exactly one shard guarded by one lock, so all
/// operations on a key are linearizable. When a shard is full the least
/// recently used entry among a small fixed sample is evicted, which keeps
/// eviction cheap and reproducible but only approximately LRU.
pub struct CorrelationCache {
    shards: Box<[RwLock<FxHashMap<IpAddr, Slot>>]>,
    shard_capacity: usize,
    clock: AtomicU64,
}

impl CorrelationCache {
    /// Create a cache holding roughly `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self::with_shards(capacity, DEFAULT_SHARDS)
    }

    fn with_shards(capacity: usize, shards: usize) -> Self {
        let capacity = capacity.max(1);
        let shards = shards.clamp(1, capacity);
        let shard_capacity = capacity.div_ceil(shards);

        Self {
            shards: (0..shards)
                .map(|_| RwLock::new(FxHashMap::default()))
                .collect(),
            shard_capacity,
            clock: AtomicU64::new(0),
        }
    }

    fn shard(&self, ip: &IpAddr) -> &RwLock<FxHashMap<IpAddr, Slot>> {
        let mut hasher = FxHasher::default();
        ip.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % self.shards.len()]
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Record that `ip` was returned for `domain`. The latest write wins.
    pub fn record_answer(&self, ip: IpAddr, domain: &str) {
        let tick = self.tick();
        let Ok(mut entries) = self.shard(&ip).write() else {
            return;
        };

        if !entries.contains_key(&ip) && entries.len() >= self.shard_capacity {
            let victim = entries
                .iter()
                .take(EVICTION_SAMPLE)
                .min_by_key(|(_, slot)| slot.tick.load(Ordering::Relaxed))
                .map(|(ip, _)| *ip);
            if let Some(victim) = victim {
                entries.remove(&victim);
            }
        }

        entries.insert(
            ip,
            Slot {
                entry: CacheEntry {
                    domain: domain.to_string(),
                    last_seen: SystemTime::now(),
                },
                tick: AtomicU64::new(tick),
            },
        );
    }

    /// Look up the domain that last resolved to `ip`.
    pub fn lookup(&self, ip: IpAddr) -> Option<String> {
        self.get(ip).map(|entry| entry.domain)
    }

    /// Look up the full entry for `ip`.
    pub fn get(&self, ip: IpAddr) -> Option<CacheEntry> {
        let Ok(entries) = self.shard(&ip).read() else {
            return None;
        };
        let slot = entries.get(&ip)?;
        slot.tick.store(self.tick(), Ordering::Relaxed);
        Some(slot.entry.clone())
    }

    /// Drop every entry.
    pub fn clear(&self) {
        for shard in self.shards.iter() {
            if let Ok(mut entries) = shard.write() {
                entries.clear();
            }
        }
    }

    /// Upper bound on the number of entries held.
    pub fn capacity(&self) -> usize {
        self.shard_capacity * self.shards.len()
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|shard| shard.read().map(|e| e.len()).unwrap_or(0))
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
