//! Cache store: the item table and the get/set orchestration.
//!
//! The store is the central coordinator. It:
//! - Owns every item, keyed by string, in a sharded table
//! - Charges stored bytes against the memory accountant and evicts on pressure
//! - Records every access in the ledger and feeds the pattern recognizer
//! - Schedules speculative prefetch of keys predicted to follow a hit
//! - Runs expiry sweeps, pattern analysis and analytics on their own schedules

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cache::analytics::{AnalyticsSampler, CompressionAdjustment, RollingMetrics};
use crate::cache::compressor::{CompressionError, Compressor};
use crate::cache::item::{
    AccessEvent, CacheItem, Category, ItemMetadata, Operation, Origin,
};
use crate::cache::ledger::AccessLedger;
use crate::cache::memory::MemoryAccountant;
use crate::cache::patterns::{Pattern, PatternRecognizer};
use crate::cache::predictor::{EvictionView, PredictedAccess, Predictor};
use crate::config::Config;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Cannot admit {key}: needs {required} bytes, ceiling is {max_bytes}")]
    Rejected {
        key: String,
        required: usize,
        max_bytes: usize,
    },

    #[error("Cannot admit {key}: item limit {max_items} reached and nothing is evictable")]
    CapacityExceeded { key: String, max_items: usize },

    #[error("Value serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Compression(#[from] CompressionError),
}

/// Source of values for prefetch and warm-up.
#[async_trait]
pub trait PrefetchLoader: Send + Sync {
    /// Fetch the value for `key`, or `None` if the source has none.
    async fn load(&self, key: &str, context: Option<&str>) -> anyhow::Result<Option<Value>>;
}

#[async_trait]
impl<F> PrefetchLoader for F
where
    F: Fn(&str, Option<&str>) -> anyhow::Result<Option<Value>> + Send + Sync,
{
    async fn load(&self, key: &str, context: Option<&str>) -> anyhow::Result<Option<Value>> {
        self(key, context)
    }
}

/// Per-call options for `set`.
#[derive(Debug, Clone, Default)]
pub struct SetOptions {
    /// Overrides the configured default TTL.
    pub ttl: Option<Duration>,

    /// Overrides the predicted priority (0.0 - 1.0).
    pub priority: Option<f64>,

    pub tags: Vec<String>,
    pub dependency_chain: Vec<String>,
    pub context: Option<String>,

    /// Never evict this item.
    pub pinned: bool,
}

impl SetOptions {
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expirations: AtomicU64,
    rejections: AtomicU64,
    corrupt_removals: AtomicU64,
    prefetch_scheduled: AtomicU64,
    prefetch_completed: AtomicU64,
    prefetch_failed: AtomicU64,
    prefetch_hits: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> CacheStats {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CacheStats {
            hits: load(&self.hits),
            misses: load(&self.misses),
            evictions: load(&self.evictions),
            expirations: load(&self.expirations),
            rejections: load(&self.rejections),
            corrupt_removals: load(&self.corrupt_removals),
            prefetch_scheduled: load(&self.prefetch_scheduled),
            prefetch_completed: load(&self.prefetch_completed),
            prefetch_failed: load(&self.prefetch_failed),
            prefetch_hits: load(&self.prefetch_hits),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.hits,
            &self.misses,
            &self.evictions,
            &self.expirations,
            &self.rejections,
            &self.corrupt_removals,
            &self.prefetch_scheduled,
            &self.prefetch_completed,
            &self.prefetch_failed,
            &self.prefetch_hits,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Lifetime counters since creation or the last `clear`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub rejections: u64,
    pub corrupt_removals: u64,
    pub prefetch_scheduled: u64,
    pub prefetch_completed: u64,
    pub prefetch_failed: u64,
    pub prefetch_hits: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CategoryCounts {
    pub hot: usize,
    pub warm: usize,
    pub cold: usize,
    pub frozen: usize,
}

/// Snapshot returned by `get_analytics` and published by each analytics cycle.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AnalyticsReport {
    #[serde(flatten)]
    pub metrics: RollingMetrics,
    pub counters: CacheStats,
    pub categories: CategoryCounts,
    pub item_count: usize,
    pub bytes_in_use: usize,
    pub max_bytes: usize,
    pub compression_target_ratio: f64,
    pub predictor_sensitivity: f64,

    /// Spread of recent performance scores.
    pub score_spread: f64,
}

/// The predictive cache.
pub struct CacheStore {
    /// All items indexed by key.
    items: DashMap<String, CacheItem>,

    memory: MemoryAccountant,
    compressor: Compressor,
    ledger: AccessLedger,
    recognizer: PatternRecognizer,
    predictor: Predictor,
    sampler: AnalyticsSampler,

    /// Prefetch sources by key.
    loaders: DashMap<String, Arc<dyn PrefetchLoader>>,

    /// Keys with a prefetch in flight, mapped to the ticket that owns them.
    inflight: DashMap<String, u64>,
    next_ticket: AtomicU64,

    counters: Counters,
    reports: watch::Sender<AnalyticsReport>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    destroyed: AtomicBool,

    /// Handle to ourselves for spawned tasks.
    me: Weak<CacheStore>,

    config: Arc<Config>,
}

/// Shared handle to a store.
pub type SharedCache = Arc<CacheStore>;

/// Outcome of reading an item under its lock.
enum Lookup {
    Hit { bytes: Vec<u8>, prefetched: bool },
    Expired,
    Corrupt(String),
    Missing,
}

impl CacheStore {
    /// Create a new store. Background schedules start with [`CacheStore::spawn_background`].
    pub fn new(config: Arc<Config>) -> SharedCache {
        let (reports, _) = watch::channel(AnalyticsReport::default());
        Arc::new_cyclic(|me| Self {
            items: DashMap::new(),
            memory: MemoryAccountant::new(config.memory.max_bytes),
            compressor: Compressor::new(config.compression.clone()),
            ledger: AccessLedger::new(config.patterns.ledger_capacity),
            recognizer: PatternRecognizer::new(config.patterns.clone(), &config.prediction),
            predictor: Predictor::new(config.prediction.clone(), config.eviction.clone()),
            sampler: AnalyticsSampler::new(
                config.analytics.clone(),
                config.prediction.prediction_window(),
                config.prediction.sensitivity_step,
            ),
            loaders: DashMap::new(),
            inflight: DashMap::new(),
            next_ticket: AtomicU64::new(0),
            counters: Counters::default(),
            reports,
            tasks: Mutex::new(Vec::new()),
            destroyed: AtomicBool::new(false),
            me: me.clone(),
            config,
        })
    }

    /// Look up a value. Expired and corrupt items behave as misses.
    pub fn get(&self, key: &str, context: Option<&str>) -> Option<Value> {
        let start = Instant::now();
        let context_owned = context.map(str::to_string);

        let lookup = match self.items.get_mut(key) {
            None => Lookup::Missing,
            Some(mut item) => {
                let now = Instant::now();
                if item.is_expired(now) {
                    Lookup::Expired
                } else {
                    match self.compressor.decompress(&item.stored, &item.compression) {
                        Ok(bytes) => {
                            item.compression.decompress_time = Some(now.elapsed());
                            item.touch(AccessEvent::read(
                                key,
                                context_owned.clone(),
                                true,
                                start.elapsed(),
                            ));
                            item.apply_tiering(&self.config.tiering, now);
                            let prefetched = item.origin == Origin::Prefetch;
                            item.origin = Origin::Caller;
                            Lookup::Hit { bytes, prefetched }
                        }
                        Err(err) => Lookup::Corrupt(err.to_string()),
                    }
                }
            }
        };

        match lookup {
            Lookup::Missing => {
                self.record_miss(key, context_owned, start);
                None
            }
            Lookup::Expired => {
                self.remove_expired(key);
                self.record_miss(key, context_owned, start);
                None
            }
            Lookup::Corrupt(reason) => {
                self.discard_corrupt(key, &reason);
                self.record_miss(key, context_owned, start);
                None
            }
            Lookup::Hit { bytes, prefetched } => match serde_json::from_slice::<Value>(&bytes) {
                Ok(value) => {
                    self.record_hit(key, context_owned, start, prefetched);
                    self.schedule_prefetch(key, context);
                    Some(value)
                }
                Err(err) => {
                    self.discard_corrupt(key, &err.to_string());
                    self.record_miss(key, context_owned, start);
                    None
                }
            },
        }
    }

    /// Store a value, evicting lower-value items if the memory ceiling requires it.
    pub fn set(&self, key: &str, value: &Value, options: SetOptions) -> Result<(), CacheError> {
        // A caller write wins over any prefetch still in flight for this key.
        if self.inflight.remove(key).is_some() {
            debug!(key, "Prefetch superseded by set");
        }
        self.insert(key, value, options, Origin::Caller, false).map(|_| ())
    }

    /// Remove an item. Returns whether it existed.
    pub fn delete(&self, key: &str) -> bool {
        let removed = self.remove_item(key).is_some();
        if removed {
            debug!(key, "Deleted item");
        }
        removed
    }

    /// Whether a live item exists. Does not count as an access.
    pub fn has(&self, key: &str) -> bool {
        let now = Instant::now();
        let Some(expired) = self.items.get(key).map(|item| item.is_expired(now)) else {
            return false;
        };
        if expired {
            self.remove_expired(key);
            return false;
        }
        true
    }

    /// Copy of an item without touching its access metadata.
    pub fn peek(&self, key: &str) -> Option<CacheItem> {
        self.items.get(key).map(|item| item.value().clone())
    }

    /// Number of stored items.
    pub fn size(&self) -> usize {
        self.items.len()
    }

    pub fn bytes_in_use(&self) -> usize {
        self.memory.bytes_in_use()
    }

    pub fn stats(&self) -> CacheStats {
        self.counters.snapshot()
    }

    /// Register the source used to prefetch or warm `key`.
    pub fn register_loader(&self, key: impl Into<String>, loader: Arc<dyn PrefetchLoader>) {
        self.loaders.insert(key.into(), loader);
    }

    pub fn unregister_loader(&self, key: &str) -> bool {
        self.loaders.remove(key).is_some()
    }

    /// Load the given keys through their registered loaders. Best effort.
    ///
    /// A key written by a caller while its load is running keeps the caller's
    /// value. Returns the number of keys populated.
    pub async fn warm_up(&self, keys: &[String]) -> usize {
        let pending: Vec<(&String, Arc<dyn PrefetchLoader>)> = keys
            .iter()
            .filter(|key| !self.has(key))
            .filter_map(|key| {
                let loader = self.loaders.get(key.as_str()).map(|l| Arc::clone(l.value()));
                if loader.is_none() {
                    debug!(key = %key, "No loader registered, skipping warm-up");
                }
                loader.map(|loader| (key, loader))
            })
            .collect();

        let results = join_all(pending.iter().map(|(key, loader)| loader.load(key, None))).await;

        let mut loaded = 0;
        for ((key, _), result) in pending.iter().zip(results) {
            match result {
                Ok(Some(value)) => {
                    match self.insert(key, &value, SetOptions::default(), Origin::Caller, true) {
                        Ok(true) => loaded += 1,
                        Ok(false) => debug!(key = %key, "Key written during warm-up, loaded value dropped"),
                        Err(err) => warn!(key = %key, error = %err, "Warm-up value not admitted"),
                    }
                }
                Ok(None) => debug!(key = %key, "Loader returned no value"),
                Err(err) => warn!(key = %key, error = %err, "Warm-up loader failed"),
            }
        }

        info!(requested = keys.len(), loaded, "Warm-up complete");
        loaded
    }

    /// Drop every item and reset counters, ledger and learned patterns.
    pub fn clear(&self) {
        self.items.retain(|_, item| {
            self.memory.track_deallocation(item.stored_size());
            false
        });
        self.memory.reset();
        self.inflight.clear();
        self.ledger.clear();
        self.recognizer.clear();
        self.sampler.clear();
        self.counters.reset();
        info!("Cache cleared");
    }

    /// Stop background schedules. New prefetches are no longer started.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        info!(tasks = tasks.len(), "Cache destroyed, background tasks stopped");
    }

    /// Start the sweep, pattern analysis and analytics schedules.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn_background(&self) {
        if self.destroyed.load(Ordering::Acquire) {
            warn!("Cannot start background tasks on a destroyed cache");
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            warn!("No tokio runtime, background tasks not started");
            return;
        }

        let schedules: [(&'static str, u64, fn(&CacheStore)); 3] = [
            ("sweep", self.config.analytics.sweep_interval_ms, |store| {
                store.sweep();
            }),
            ("patterns", self.config.patterns.analysis_interval_ms, |store| {
                store.run_pattern_analysis();
            }),
            ("analytics", self.config.analytics.interval_ms, |store| {
                store.run_analytics_cycle();
            }),
        ];

        let mut tasks = self.tasks.lock();
        for (name, period_ms, job) in schedules {
            if period_ms == 0 {
                warn!(task = name, "Zero interval, schedule disabled");
                continue;
            }
            tasks.push(self.spawn_periodic(name, Duration::from_millis(period_ms), job));
        }
        info!(tasks = tasks.len(), "Background schedules started");
    }

    /// Remove expired items and re-score everything that remains.
    ///
    /// Returns the number of expired items removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<String> = self
            .items
            .iter()
            .filter(|item| item.is_expired(now))
            .map(|item| item.key().clone())
            .collect();
        let removed = expired.iter().filter(|key| self.remove_expired(key)).count();

        // Scoring scans the ledger per item and runs outside the shard locks.
        let views: Vec<(String, ItemMetadata, VecDeque<AccessEvent>)> = self
            .items
            .iter_mut()
            .map(|mut item| {
                item.apply_tiering(&self.config.tiering, now);
                (
                    item.key().clone(),
                    item.metadata.clone(),
                    item.access_history.clone(),
                )
            })
            .collect();

        let ledger = self.ledger.snapshot();
        let patterns = self.recognizer.patterns();
        for (key, metadata, history) in views {
            let prediction = self.predictor.generate_predictions(
                &key, &metadata, &history, &ledger, &patterns, None, now,
            );
            if let Some(mut item) = self.items.get_mut(&key) {
                item.prediction = prediction;
            }
        }

        if removed > 0 {
            info!(removed, remaining = self.items.len(), "Expired items swept");
        }
        removed
    }

    /// Re-mine patterns from a ledger snapshot.
    pub fn run_pattern_analysis(&self) -> Vec<Pattern> {
        let snapshot = self.ledger.snapshot();
        self.recognizer.analyze_sequence(&snapshot, Instant::now())
    }

    /// Sample metrics, apply one tuning step and publish the report.
    pub fn run_analytics_cycle(&self) -> AnalyticsReport {
        let report = self.build_report();
        let tuning = self.sampler.tune(&report.metrics);

        match tuning.compression {
            CompressionAdjustment::Increase => {
                self.compressor.increase_compression_level();
            }
            CompressionAdjustment::Decrease => {
                self.compressor.decrease_compression_level();
            }
            CompressionAdjustment::Hold => {}
        }
        if tuning.sensitivity_delta != 0.0 {
            self.predictor.adjust_sensitivity(tuning.sensitivity_delta);
        }
        self.sampler.record(&report.metrics);

        debug!(
            score = report.metrics.performance_score,
            hit_rate = report.metrics.hit_rate,
            memory_usage = report.metrics.memory_usage,
            compression = ?tuning.compression,
            sensitivity_delta = tuning.sensitivity_delta,
            "Analytics cycle complete"
        );

        self.reports.send_replace(report.clone());
        report
    }

    /// Current rolling metrics and counters.
    pub fn get_analytics(&self) -> AnalyticsReport {
        self.build_report()
    }

    /// Receive each report published by the analytics schedule.
    pub fn subscribe_analytics(&self) -> watch::Receiver<AnalyticsReport> {
        self.reports.subscribe()
    }

    /// Patterns currently tracked, most confident first.
    pub fn get_patterns(&self) -> Vec<Pattern> {
        self.recognizer.patterns()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn build_report(&self) -> AnalyticsReport {
        let snapshot = self.ledger.snapshot();
        let metrics = self
            .sampler
            .sample(&snapshot, self.memory.usage_fraction());

        let mut categories = CategoryCounts::default();
        for item in self.items.iter() {
            match item.metadata.category {
                Category::Hot => categories.hot += 1,
                Category::Warm => categories.warm += 1,
                Category::Cold => categories.cold += 1,
                Category::Frozen => categories.frozen += 1,
            }
        }

        AnalyticsReport {
            metrics,
            counters: self.counters.snapshot(),
            categories,
            item_count: self.items.len(),
            bytes_in_use: self.memory.bytes_in_use(),
            max_bytes: self.memory.max_bytes(),
            compression_target_ratio: self.compressor.target_ratio(),
            predictor_sensitivity: self.predictor.sensitivity(),
            score_spread: self.sampler.score_spread(),
        }
    }

    /// Build an item and admit it. Returns `false` if `only_if_absent` is set
    /// and the key was already present.
    fn insert(
        &self,
        key: &str,
        value: &Value,
        options: SetOptions,
        origin: Origin,
        only_if_absent: bool,
    ) -> Result<bool, CacheError> {
        let now = Instant::now();
        let serialized = serde_json::to_vec(value)?;

        let mut metadata = ItemMetadata::new(serialized.len(), now);
        metadata.ttl = options.ttl.or_else(|| self.config.memory.default_ttl());
        metadata.tags = options.tags.into_iter().collect();
        metadata.dependency_chain = options.dependency_chain;
        metadata.pinned = options.pinned;

        let ledger = self.ledger.snapshot();
        let patterns = self.recognizer.find_related_patterns(key);
        let prediction = self.predictor.generate_predictions(
            key,
            &metadata,
            &VecDeque::new(),
            &ledger,
            &patterns,
            options.context.as_deref(),
            now,
        );
        metadata.priority = options
            .priority
            .map(|p| p.clamp(0.0, 1.0))
            .unwrap_or(prediction.next_access_probability);

        let compressed = self.compressor.compress(&serialized)?;
        let write = AccessEvent::new(key, Operation::Write, options.context);

        let mut item = CacheItem::new(
            key,
            Bytes::from(compressed.bytes),
            metadata,
            prediction,
            compressed.info,
            self.config.patterns.history_capacity,
        );
        item.origin = origin;
        item.record(write.clone());

        let inserted = self.admit(item, only_if_absent)?;
        if inserted {
            self.ledger.append(write.clone());
            self.recognizer.analyze_write_pattern(&write);
        }
        Ok(inserted)
    }

    /// Insert or replace an item once its stored bytes fit under the ceiling.
    fn admit(&self, item: CacheItem, only_if_absent: bool) -> Result<bool, CacheError> {
        let key = item.key.clone();
        let size = item.stored_size();
        let max_bytes = self.memory.max_bytes();

        if size > max_bytes {
            Counters::bump(&self.counters.rejections);
            warn!(key = %key, size, max_bytes, "Item larger than the memory ceiling, rejected");
            return Err(CacheError::Rejected {
                key,
                required: size,
                max_bytes,
            });
        }

        loop {
            if !self.items.contains_key(&key) && self.items.len() >= self.config.memory.max_items {
                if self.evict_lowest(1, &key) == 0 {
                    Counters::bump(&self.counters.rejections);
                    return Err(CacheError::CapacityExceeded {
                        key,
                        max_items: self.config.memory.max_items,
                    });
                }
                continue;
            }

            let old = match self.items.entry(key.clone()) {
                Entry::Occupied(mut entry) => {
                    if only_if_absent {
                        return Ok(false);
                    }
                    let old = entry.get().stored_size();
                    if self.memory.try_replace(old, size) {
                        entry.insert(item);
                        debug!(key = %key, old, size, "Replaced item");
                        return Ok(true);
                    }
                    old
                }
                Entry::Vacant(entry) => {
                    if self.memory.try_allocate(size) {
                        entry.insert(item);
                        debug!(key = %key, size, "Admitted item");
                        return Ok(true);
                    }
                    0
                }
            };

            let shortfall = self.memory.shortfall(old, size);
            if shortfall == 0 {
                // Space was released concurrently; retry admission.
                continue;
            }
            // Free at least the bytes the new value adds, not just the overshoot.
            let needed = shortfall.max(size.saturating_sub(old));
            if self.evict_for(needed, &key) == 0 {
                Counters::bump(&self.counters.rejections);
                warn!(key = %key, size, shortfall, "Eviction could not free enough space, rejected");
                return Err(CacheError::Rejected {
                    key,
                    required: size,
                    max_bytes,
                });
            }
        }
    }

    /// Evictable items, never including `protect`.
    fn eviction_views(&self, protect: &str) -> Vec<EvictionView> {
        self.items
            .iter()
            .filter(|item| !item.metadata.pinned && item.key() != protect)
            .map(|item| EvictionView::from(item.value()))
            .collect()
    }

    /// Evict lowest-scoring items until at least `needed` bytes are freed.
    fn evict_for(&self, needed: usize, protect: &str) -> usize {
        let now = Instant::now();
        let views = self.eviction_views(protect);
        let candidates = self
            .predictor
            .identify_eviction_candidates(views.iter(), needed, now);

        let mut freed = 0;
        let mut evicted = 0;
        for candidate in candidates {
            if freed >= needed {
                break;
            }
            if let Some(size) = self.remove_item(&candidate.key) {
                freed += size;
                evicted += 1;
                Counters::bump(&self.counters.evictions);
                debug!(key = %candidate.key, score = candidate.score, size, "Evicted item");
            }
        }

        if evicted > 0 {
            info!(evicted, freed, needed, "Eviction round complete");
        }
        freed
    }

    /// Evict the `count` lowest-scoring items. Returns how many were removed.
    fn evict_lowest(&self, count: usize, protect: &str) -> usize {
        let now = Instant::now();
        let views = self.eviction_views(protect);
        let mut evicted = 0;
        for candidate in self
            .predictor
            .rank_eviction_candidates(views.iter(), now)
            .into_iter()
            .take(count)
        {
            if self.remove_item(&candidate.key).is_some() {
                evicted += 1;
                Counters::bump(&self.counters.evictions);
                debug!(key = %candidate.key, score = candidate.score, "Evicted item for item limit");
            }
        }
        evicted
    }

    /// Remove an item, release its bytes and log an evict event.
    fn remove_item(&self, key: &str) -> Option<usize> {
        let (_, item) = self.items.remove(key)?;
        Some(self.release(item))
    }

    /// Remove `key` only if it is still expired.
    fn remove_expired(&self, key: &str) -> bool {
        let now = Instant::now();
        match self.items.remove_if(key, |_, item| item.is_expired(now)) {
            Some((_, item)) => {
                self.release(item);
                Counters::bump(&self.counters.expirations);
                debug!(key, "Expired item removed");
                true
            }
            None => false,
        }
    }

    fn discard_corrupt(&self, key: &str, reason: &str) {
        warn!(key, reason, "Stored value unreadable, removing item");
        if self.remove_item(key).is_some() {
            Counters::bump(&self.counters.corrupt_removals);
        }
    }

    fn release(&self, item: CacheItem) -> usize {
        let size = item.stored_size();
        self.memory.track_deallocation(size);
        self.ledger
            .append(AccessEvent::new(item.key, Operation::Evict, None));
        size
    }

    fn record_hit(&self, key: &str, context: Option<String>, start: Instant, prefetched: bool) {
        let mut event = AccessEvent::read(key, context, true, start.elapsed());
        if prefetched {
            event.prediction_accuracy = Some(1.0);
            Counters::bump(&self.counters.prefetch_hits);
            debug!(key, "Hit on prefetched item");
        }
        self.ledger.append(event.clone());
        self.recognizer.record_access(&event);
        Counters::bump(&self.counters.hits);
    }

    fn record_miss(&self, key: &str, context: Option<String>, start: Instant) {
        let event = AccessEvent::read(key, context, false, start.elapsed());
        self.ledger.append(event.clone());
        self.recognizer.analyze_miss_pattern(&event);
        Counters::bump(&self.counters.misses);
    }

    /// Start background loads for keys predicted to follow `key`.
    fn schedule_prefetch(&self, key: &str, context: Option<&str>) {
        if !self.config.prefetch.enabled || self.destroyed.load(Ordering::Acquire) {
            return;
        }
        let candidates = self.recognizer.prefetch_candidates(key, context);
        if candidates.is_empty() {
            return;
        }

        let recent = self.ledger.recent(self.config.analytics.window_events);
        let threshold = self
            .predictor
            .effective_threshold(self.config.prefetch.confidence_threshold);
        let predictions = self
            .predictor
            .predict_next_accesses(&recent, &candidates, context, Instant::now());

        let Some(me) = self.me.upgrade() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            debug!(key, "No tokio runtime, prefetch skipped");
            return;
        };

        for prediction in predictions
            .into_iter()
            .filter(|p| p.confidence >= threshold)
            .take(self.config.prefetch.max_per_access)
        {
            if self.items.contains_key(&prediction.key) {
                continue;
            }
            let Some(loader) = self
                .loaders
                .get(&prediction.key)
                .map(|l| Arc::clone(l.value()))
            else {
                continue;
            };

            let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
            match self.inflight.entry(prediction.key.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(entry) => {
                    entry.insert(ticket);
                }
            }

            self.ledger.append(AccessEvent::new(
                prediction.key.clone(),
                Operation::Predict,
                prediction.context.clone(),
            ));
            Counters::bump(&self.counters.prefetch_scheduled);
            debug!(
                trigger = key,
                key = %prediction.key,
                confidence = prediction.confidence,
                "Prefetch scheduled"
            );

            let store = Arc::clone(&me);
            runtime.spawn(async move {
                store.run_prefetch(prediction, loader, ticket).await;
            });
        }
    }

    async fn run_prefetch(&self, prediction: PredictedAccess, loader: Arc<dyn PrefetchLoader>, ticket: u64) {
        let PredictedAccess {
            key,
            confidence,
            context,
        } = prediction;
        let result = loader.load(&key, context.as_deref()).await;

        if self.inflight.remove_if(&key, |_, owner| *owner == ticket).is_none() {
            debug!(key = %key, "Prefetch superseded, result ignored");
            return;
        }

        match result {
            Ok(Some(value)) => {
                let options = SetOptions {
                    context,
                    ..Default::default()
                };
                match self.insert(&key, &value, options, Origin::Prefetch, true) {
                    Ok(true) => {
                        Counters::bump(&self.counters.prefetch_completed);
                        debug!(key = %key, confidence, "Prefetch complete");
                    }
                    Ok(false) => debug!(key = %key, "Key populated before prefetch finished"),
                    Err(err) => {
                        Counters::bump(&self.counters.prefetch_failed);
                        warn!(key = %key, error = %err, "Prefetched value not admitted");
                    }
                }
            }
            Ok(None) => debug!(key = %key, "Loader has no value for predicted key"),
            Err(err) => {
                Counters::bump(&self.counters.prefetch_failed);
                warn!(key = %key, error = %err, "Prefetch loader failed");
            }
        }
    }

    fn spawn_periodic(&self, name: &'static str, period: Duration, job: fn(&CacheStore)) -> JoinHandle<()> {
        let me = self.me.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(store) = me.upgrade() else {
                    break;
                };
                if store.destroyed.load(Ordering::Acquire) {
                    break;
                }
                job(&store);
            }
            debug!(task = name, "Background task stopped");
        })
    }
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}
