//! Predictive cache management.
//!
//! This module contains the core cache data structures and algorithms:
//! - [`item`]: CacheItem, metadata, access events and tier categories
//! - [`store`]: The store that orchestrates get/set, eviction and prefetch
//! - [`memory`]: Byte accounting against the memory ceiling
//! - [`compressor`]: Adaptive lz4/zstd compression of stored values
//! - [`ledger`]: Bounded log of recent accesses
//! - [`patterns`]: Temporal, sequential, contextual and behavioral pattern mining
//! - [`predictor`]: Access prediction and eviction scoring
//! - [`analytics`]: Rolling metrics and auto-tuning

pub mod analytics;
pub mod compressor;
pub mod item;
pub mod ledger;
pub mod memory;
pub mod patterns;
pub mod predictor;
pub mod store;

pub use item::{AccessEvent, CacheItem, Category, Operation};
pub use patterns::{Pattern, PatternType};
pub use store::{
    AnalyticsReport, CacheError, CacheStats, CacheStore, PrefetchLoader, SetOptions, SharedCache,
};
