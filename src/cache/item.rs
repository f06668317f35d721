//! Cache item types and access events.
//!
//! A cache item holds one stored value together with the metadata, prediction
//! and compression bookkeeping the rest of the cache reads and updates.
//! Items are the unit of admission, tiering and eviction.

use std::collections::{BTreeSet, VecDeque};
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::TieringConfig;

/// Thermal category of an item, derived from access rate and idle time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Hot,
    Warm,
    Cold,
    Frozen,
}

impl Category {
    /// Returns the numeric tier level (lower = hotter).
    pub fn level(&self) -> u8 {
        match self {
            Category::Hot => 0,
            Category::Warm => 1,
            Category::Cold => 2,
            Category::Frozen => 3,
        }
    }

    /// Priority assigned to items entering this category.
    pub fn priority(&self) -> f64 {
        match self {
            Category::Hot => 1.0,
            Category::Warm => 0.7,
            Category::Cold => 0.3,
            Category::Frozen => 0.1,
        }
    }

    /// Classify an item from its access counters.
    ///
    /// ```text
    /// rate > hot_min_rate  and idle < hot_max_idle  → hot
    /// rate > warm_min_rate and idle < warm_max_idle → warm
    /// idle < cold_max_idle                          → cold
    /// otherwise                                     → frozen
    /// ```
    pub fn classify(metadata: &ItemMetadata, policy: &TieringConfig, now: Instant) -> Category {
        let lifetime_ms = now.duration_since(metadata.created_at).as_millis().max(1) as f64;
        let rate = metadata.access_count as f64 * 1000.0 / lifetime_ms;
        let idle_ms = now.duration_since(metadata.last_accessed).as_millis() as u64;

        if rate > policy.hot_min_rate && idle_ms < policy.hot_max_idle_ms {
            Category::Hot
        } else if rate > policy.warm_min_rate && idle_ms < policy.warm_max_idle_ms {
            Category::Warm
        } else if idle_ms < policy.cold_max_idle_ms {
            Category::Cold
        } else {
            Category::Frozen
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Hot => write!(f, "hot"),
            Category::Warm => write!(f, "warm"),
            Category::Cold => write!(f, "cold"),
            Category::Frozen => write!(f, "frozen"),
        }
    }
}

/// Inferred shape of an item's own access history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsagePattern {
    Frequent,
    Periodic,
    Burst,
    Declining,
    Random,
}

/// Kind of an access event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Read,
    Write,
    Predict,
    Evict,
}

/// Storage format of an item's value bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// Serialized value stored as-is.
    None,
    /// lz4 block format with the original length prepended.
    Lz4,
    /// zstd frame.
    Zstd,
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Algorithm::None => write!(f, "none"),
            Algorithm::Lz4 => write!(f, "lz4"),
            Algorithm::Zstd => write!(f, "zstd"),
        }
    }
}

/// One entry in the global ledger or in an item's own history.
#[derive(Debug, Clone)]
pub struct AccessEvent {
    pub key: String,
    pub timestamp: Instant,
    pub context: Option<String>,
    pub operation: Operation,
    pub latency: Duration,
    pub cache_hit: bool,
    pub prediction_accuracy: Option<f64>,
}

impl AccessEvent {
    pub fn new(key: impl Into<String>, operation: Operation, context: Option<String>) -> Self {
        Self {
            key: key.into(),
            timestamp: Instant::now(),
            context,
            operation,
            latency: Duration::ZERO,
            cache_hit: false,
            prediction_accuracy: None,
        }
    }

    pub fn read(key: impl Into<String>, context: Option<String>, hit: bool, latency: Duration) -> Self {
        Self {
            cache_hit: hit,
            latency,
            ..Self::new(key, Operation::Read, context)
        }
    }

    pub fn with_timestamp(mut self, timestamp: Instant) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn is_read(&self) -> bool {
        self.operation == Operation::Read
    }

    /// Reads and writes; predictions and evictions are bookkeeping.
    pub fn is_access(&self) -> bool {
        matches!(self.operation, Operation::Read | Operation::Write)
    }
}

/// Caller- and policy-facing metadata of an item.
#[derive(Debug, Clone)]
pub struct ItemMetadata {
    pub created_at: Instant,
    pub last_accessed: Instant,
    pub access_count: u64,

    /// Size of the uncompressed serialized value.
    pub size_bytes: usize,

    pub ttl: Option<Duration>,

    /// 0.0 - 1.0, set by the caller or by tiering.
    pub priority: f64,

    pub category: Category,
    pub tags: BTreeSet<String>,

    /// Keys this item's validity depends on. Informational only.
    pub dependency_chain: Vec<String>,

    /// Pinned items are never eviction candidates.
    pub pinned: bool,
}

impl ItemMetadata {
    pub fn new(size_bytes: usize, now: Instant) -> Self {
        Self {
            created_at: now,
            last_accessed: now,
            access_count: 0,
            size_bytes,
            ttl: None,
            priority: Category::Warm.priority(),
            category: Category::Warm,
            tags: BTreeSet::new(),
            dependency_chain: Vec::new(),
            pinned: false,
        }
    }
}

/// Predictor output attached to an item.
#[derive(Debug, Clone)]
pub struct PredictionData {
    pub next_access_probability: f64,
    pub predicted_access_time: Instant,
    pub usage_pattern: UsagePattern,
    pub pattern_confidence: f64,

    /// Recent access rate relative to the item's lifetime rate.
    pub seasonal_factor: f64,

    /// Share of the item's history recorded under the current context.
    pub context_similarity: f64,
}

impl PredictionData {
    /// Prediction for an item nothing is known about yet.
    pub fn neutral(now: Instant, window: Duration) -> Self {
        Self {
            next_access_probability: 0.5,
            predicted_access_time: now + window,
            usage_pattern: UsagePattern::Random,
            pattern_confidence: 0.0,
            seasonal_factor: 1.0,
            context_similarity: 0.5,
        }
    }
}

/// How an item's value is stored.
#[derive(Debug, Clone)]
pub struct CompressionInfo {
    pub algorithm: Algorithm,
    pub original_size: usize,
    pub compressed_size: usize,

    /// original_size / compressed_size.
    pub ratio: f64,

    pub compress_time: Duration,
    pub decompress_time: Option<Duration>,
}

impl CompressionInfo {
    pub fn uncompressed(size: usize) -> Self {
        Self {
            algorithm: Algorithm::None,
            original_size: size,
            compressed_size: size,
            ratio: 1.0,
            compress_time: Duration::ZERO,
            decompress_time: None,
        }
    }
}

/// Where an item came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Explicit `set` or warm-up.
    Caller,
    /// Speculative prefetch that has not been read yet.
    Prefetch,
}

/// A single stored cache entry.
#[derive(Debug, Clone)]
pub struct CacheItem {
    pub key: String,

    /// Stored representation (possibly compressed).
    pub stored: Bytes,

    pub metadata: ItemMetadata,
    pub prediction: PredictionData,
    pub compression: CompressionInfo,

    /// Most recent accesses of this item, oldest first.
    pub access_history: VecDeque<AccessEvent>,

    pub origin: Origin,

    history_capacity: usize,
}

impl CacheItem {
    pub fn new(
        key: impl Into<String>,
        stored: Bytes,
        metadata: ItemMetadata,
        prediction: PredictionData,
        compression: CompressionInfo,
        history_capacity: usize,
    ) -> Self {
        Self {
            key: key.into(),
            stored,
            metadata,
            prediction,
            compression,
            access_history: VecDeque::with_capacity(history_capacity.min(16)),
            origin: Origin::Caller,
            history_capacity,
        }
    }

    /// Bytes charged against the memory ceiling.
    pub fn stored_size(&self) -> usize {
        self.compression.compressed_size
    }

    /// Whether the item's TTL has elapsed at `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.metadata.ttl {
            Some(ttl) => now.duration_since(self.metadata.created_at) > ttl,
            None => false,
        }
    }

    /// Record an access, updating timestamp, counter and history.
    pub fn touch(&mut self, event: AccessEvent) {
        self.metadata.last_accessed = event.timestamp;
        self.metadata.access_count += 1;
        self.record(event);
    }

    /// Append to the bounded history, dropping the oldest entry when full.
    pub fn record(&mut self, event: AccessEvent) {
        if self.history_capacity == 0 {
            return;
        }
        while self.access_history.len() >= self.history_capacity {
            self.access_history.pop_front();
        }
        self.access_history.push_back(event);
    }

    /// Recompute category and the matching priority.
    pub fn apply_tiering(&mut self, policy: &TieringConfig, now: Instant) -> Category {
        let category = Category::classify(&self.metadata, policy, now);
        self.metadata.category = category;
        self.metadata.priority = category.priority();
        category
    }

    /// Seconds since the last access.
    pub fn idle_secs(&self, now: Instant) -> f64 {
        now.duration_since(self.metadata.last_accessed).as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_item(size: usize) -> CacheItem {
        let now = Instant::now();
        CacheItem::new(
            "k",
            Bytes::from(vec![0u8; size]),
            ItemMetadata::new(size, now),
            PredictionData::neutral(now, Duration::from_secs(60)),
            CompressionInfo::uncompressed(size),
            3,
        )
    }

    #[test]
    fn test_category_levels() {
        assert_eq!(Category::Hot.level(), 0);
        assert_eq!(Category::Frozen.level(), 3);
        assert_eq!(Category::Frozen.priority(), 0.1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_classify_by_rate_and_idle() {
        let policy = TieringConfig::default();
        let start = Instant::now();
        let mut meta = ItemMetadata::new(10, start);

        // 10 accesses over 2s is 5/s with no idle time.
        tokio::time::advance(Duration::from_secs(2)).await;
        let now = Instant::now();
        meta.access_count = 10;
        meta.last_accessed = now;
        assert_eq!(Category::classify(&meta, &policy, now), Category::Hot);

        // Same count over 15s is 0.67/s.
        tokio::time::advance(Duration::from_secs(13)).await;
        let now = Instant::now();
        meta.last_accessed = now;
        assert_eq!(Category::classify(&meta, &policy, now), Category::Warm);

        // Rate decays and the item goes idle for 10 minutes.
        tokio::time::advance(Duration::from_secs(600)).await;
        assert_eq!(Category::classify(&meta, &policy, Instant::now()), Category::Cold);

        tokio::time::advance(Duration::from_secs(3600)).await;
        assert_eq!(Category::classify(&meta, &policy, Instant::now()), Category::Frozen);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut item = make_item(4);
        for i in 0..5 {
            item.touch(AccessEvent::read(format!("e{i}"), None, true, Duration::ZERO));
        }
        assert_eq!(item.metadata.access_count, 5);
        assert_eq!(item.access_history.len(), 3);
        assert_eq!(item.access_history.front().unwrap().key, "e2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let mut item = make_item(4);
        item.metadata.ttl = Some(Duration::from_millis(1000));
        assert!(!item.is_expired(Instant::now()));

        tokio::time::advance(Duration::from_millis(1100)).await;
        assert!(item.is_expired(Instant::now()));
    }
}
