//! Shared caching and throttling layer
//!
//! Provides the process-wide structures that concurrent traces share:
//! classification and transfer-page caches with explicit TTL, plus the
//! per-provider token-bucket rate limiters.

pub mod rate_limit;

pub use rate_limit::{RateLimiters, TokenBucket};

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::types::{AddressNode, Chain, TransferPage};

/// Configuration for the cache system
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum entries per cache
    pub max_entries: usize,
    /// TTL for classification entries (seconds)
    pub classification_ttl_secs: u64,
    /// TTL for transfer pages (seconds)
    pub transfer_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 50_000,
            classification_ttl_secs: 3600, // 1 hour
            transfer_ttl_secs: 300,        // 5 minutes
        }
    }
}

/// Cache entry with TTL
#[derive(Clone)]
pub struct Cached<T> {
    pub value: T,
    pub cached_at: Instant,
    pub ttl: Duration,
}

impl<T> Cached<T> {
    pub fn new(value: T, ttl: Duration) -> Self {
        Self {
            value,
            cached_at: Instant::now(),
            ttl,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.cached_at.elapsed() > self.ttl
    }
}

/// Cache statistics for monitoring
#[derive(Default)]
pub struct CacheStats {
    pub classification_hits: AtomicU64,
    pub classification_misses: AtomicU64,
    pub transfer_hits: AtomicU64,
    pub transfer_misses: AtomicU64,
    pub evictions: AtomicU64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let hits = self.classification_hits.load(Ordering::Relaxed)
            + self.transfer_hits.load(Ordering::Relaxed);
        let misses = self.classification_misses.load(Ordering::Relaxed)
            + self.transfer_misses.load(Ordering::Relaxed);
        let total = hits + misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Process-wide cache shared by every trace and cluster scan
pub struct ProvenanceCache {
    config: CacheConfig,

    /// chain:address -> classified node
    classifications: DashMap<String, Cached<AddressNode>>,

    /// provider:chain:address:asset:cursor -> transfer page
    transfer_pages: DashMap<String, Cached<TransferPage>>,

    stats: CacheStats,
}

impl ProvenanceCache {
    /// Create a new cache with default configuration
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    /// Create a new cache with custom configuration
    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            classifications: DashMap::new(),
            transfer_pages: DashMap::new(),
            stats: CacheStats::default(),
            config,
        }
    }

    fn classification_key(chain: Chain, address: &str) -> String {
        format!("{}:{}", chain, address)
    }

    /// Key for one page of inbound transfers
    pub fn transfer_key(
        provider: &str,
        chain: Chain,
        address: &str,
        asset: Option<&str>,
        cursor: Option<&str>,
    ) -> String {
        format!(
            "{}:{}:{}:{}:{}",
            provider,
            chain,
            address,
            asset.map(str::to_uppercase).unwrap_or_default(),
            cursor.unwrap_or("")
        )
    }

    /// Get a classified node from cache
    pub fn get_classification(&self, chain: Chain, address: &str) -> Option<AddressNode> {
        let key = Self::classification_key(chain, address);
        if let Some(entry) = self.classifications.get(&key) {
            if !entry.is_expired() {
                self.stats.classification_hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            // Entry expired, remove it
            drop(entry);
            self.classifications.remove(&key);
        }
        self.stats
            .classification_misses
            .fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a classified node. Unresolved nodes are never cached.
    pub fn set_classification(&self, node: &AddressNode) {
        if !node.resolved {
            return;
        }
        self.make_room(&self.classifications);
        let ttl = Duration::from_secs(self.config.classification_ttl_secs);
        self.classifications.insert(
            Self::classification_key(node.chain, &node.address),
            Cached::new(node.clone(), ttl),
        );
    }

    /// Get a transfer page from cache
    pub fn get_transfers(&self, key: &str) -> Option<TransferPage> {
        if let Some(entry) = self.transfer_pages.get(key) {
            if !entry.is_expired() {
                self.stats.transfer_hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.value.clone());
            }
            drop(entry);
            self.transfer_pages.remove(key);
        }
        self.stats.transfer_misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Store a transfer page
    pub fn set_transfers(&self, key: String, page: TransferPage) {
        self.make_room(&self.transfer_pages);
        let ttl = Duration::from_secs(self.config.transfer_ttl_secs);
        self.transfer_pages.insert(key, Cached::new(page, ttl));
    }

    /// Evict expired entries first, then ~10% of whatever is left
    fn make_room<T>(&self, map: &DashMap<String, Cached<T>>) {
        if map.len() < self.config.max_entries {
            return;
        }

        let before = map.len();
        map.retain(|_, entry| !entry.is_expired());

        if map.len() >= self.config.max_entries {
            let to_remove = (self.config.max_entries / 10).max(1);
            let keys: Vec<_> = map
                .iter()
                .take(to_remove)
                .map(|r| r.key().clone())
                .collect();
            for key in keys {
                map.remove(&key);
            }
        }

        self.stats
            .evictions
            .fetch_add((before - map.len()) as u64, Ordering::Relaxed);
    }

    /// Get cache statistics
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn classification_count(&self) -> usize {
        self.classifications.len()
    }

    pub fn transfer_page_count(&self) -> usize {
        self.transfer_pages.len()
    }

    /// Clear all caches
    pub fn clear(&self) {
        self.classifications.clear();
        self.transfer_pages.clear();
    }
}

impl Default for ProvenanceCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Classification;

    fn node(address: &str, resolved: bool) -> AddressNode {
        AddressNode {
            address: address.to_string(),
            chain: Chain::Polygon,
            classification: Classification::Eoa,
            label: None,
            resolved,
        }
    }

    #[test]
    fn test_classification_roundtrip_and_stats() {
        let cache = ProvenanceCache::new();

        assert!(cache.get_classification(Chain::Polygon, "0xa").is_none()); // miss
        cache.set_classification(&node("0xa", true));
        assert!(cache.get_classification(Chain::Polygon, "0xa").is_some()); // hit
        assert!(cache.get_classification(Chain::Solana, "0xa").is_none()); // miss, other chain

        let stats = cache.stats();
        assert_eq!(stats.classification_hits.load(Ordering::Relaxed), 1);
        assert_eq!(stats.classification_misses.load(Ordering::Relaxed), 2);
        assert!((stats.hit_rate() - 0.333).abs() < 0.01);
    }

    #[test]
    fn test_unresolved_not_cached() {
        let cache = ProvenanceCache::new();
        cache.set_classification(&node("0xa", false));
        assert_eq!(cache.classification_count(), 0);
    }

    #[test]
    fn test_expired_entries_dropped() {
        let cache = ProvenanceCache::with_config(CacheConfig {
            transfer_ttl_secs: 0,
            ..Default::default()
        });
        let key = ProvenanceCache::transfer_key("memory", Chain::Polygon, "0xa", None, None);
        cache.set_transfers(key.clone(), TransferPage::default());
        std::thread::sleep(Duration::from_millis(5));
        assert!(cache.get_transfers(&key).is_none());
        assert_eq!(cache.transfer_page_count(), 0);
    }

    #[test]
    fn test_capacity_eviction() {
        let cache = ProvenanceCache::with_config(CacheConfig {
            max_entries: 10,
            ..Default::default()
        });
        for i in 0..25 {
            cache.set_classification(&node(&format!("0x{:02}", i), true));
        }
        assert!(cache.classification_count() <= 10);
        assert!(cache.stats().evictions.load(Ordering::Relaxed) > 0);
    }

    #[test]
    fn test_transfer_key_shape() {
        let key = ProvenanceCache::transfer_key("etherscan", Chain::Polygon, "0xa", Some("usdc"), Some("2"));
        assert_eq!(key, "etherscan:polygon:0xa:USDC:2");
    }
}
