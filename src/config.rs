//! Runtime configuration for predictive-cache.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! All policy knobs (memory ceiling, tiering thresholds, eviction weights,
//! compression targets, prediction tuning) live here.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "predictive-cache", about = "Predictive in-memory cache server")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Memory ceiling, item ceiling and default expiry.
    pub memory: MemoryConfig,

    /// Thermal tiering thresholds.
    pub tiering: TieringConfig,

    /// Eviction score weights.
    pub eviction: EvictionConfig,

    /// Compression settings.
    pub compression: CompressionConfig,

    /// Prefetching settings.
    pub prefetch: PrefetchConfig,

    /// Prediction tuning.
    pub prediction: PredictionConfig,

    /// Ledger and pattern mining settings.
    pub patterns: PatternConfig,

    /// Analytics sampling and auto-tuning.
    pub analytics: AnalyticsConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Memory and item budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Maximum stored bytes across all items.
    pub max_bytes: usize,

    /// Maximum number of items.
    pub max_items: usize,

    /// TTL applied when `set` does not supply one (0 = never expires).
    pub default_ttl_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            max_bytes: 100 * 1024 * 1024, // 100 MB
            max_items: 10_000,
            default_ttl_ms: 3_600_000,
        }
    }
}

impl MemoryConfig {
    pub fn default_ttl(&self) -> Option<Duration> {
        (self.default_ttl_ms > 0).then(|| Duration::from_millis(self.default_ttl_ms))
    }
}

/// Thermal tiering policy.
///
/// Rates are accesses per second since creation, idle limits are measured
/// from the last access.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TieringConfig {
    pub hot_min_rate: f64,
    pub hot_max_idle_ms: u64,
    pub warm_min_rate: f64,
    pub warm_max_idle_ms: u64,
    pub cold_max_idle_ms: u64,
}

impl Default for TieringConfig {
    fn default() -> Self {
        Self {
            hot_min_rate: 1.0,
            hot_max_idle_ms: 60_000,
            warm_min_rate: 0.5,
            warm_max_idle_ms: 300_000,
            cold_max_idle_ms: 3_600_000,
        }
    }
}

/// Eviction score weights.
///
/// ```text
/// score = priority_weight × priority
///       + probability_weight × next_access_probability
///       + recency_weight × 1 / (1 + idle_secs)
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    pub priority_weight: f64,
    pub probability_weight: f64,
    pub recency_weight: f64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            priority_weight: 0.4,
            probability_weight: 0.4,
            recency_weight: 0.2,
        }
    }
}

/// Compression settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Disable to always store values as-is.
    pub enabled: bool,

    /// Values larger than this (serialized bytes) are compressed.
    pub threshold_bytes: usize,

    /// Initial ratio (original / compressed) an algorithm must reach to be chosen.
    pub target_ratio: f64,

    pub min_target_ratio: f64,
    pub max_target_ratio: f64,

    /// Amount one tuning step moves the target ratio.
    pub level_step: f64,

    /// zstd compression level (1-22).
    pub zstd_level: i32,

    /// Decay for the per-size-bucket ratio moving average.
    pub ratio_ema_decay: f64,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_bytes: 1024,
            target_ratio: 1.5,
            min_target_ratio: 1.1,
            max_target_ratio: 4.0,
            level_step: 0.25,
            zstd_level: 3,
            ratio_ema_decay: 0.8,
        }
    }
}

/// Prefetch strategy settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    pub enabled: bool,

    /// Minimum prediction confidence before a loader is invoked.
    pub confidence_threshold: f64,

    /// Maximum predicted keys acted on per cache hit.
    pub max_per_access: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            confidence_threshold: 0.7,
            max_per_access: 4,
        }
    }
}

/// Predictor tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PredictionConfig {
    /// How far ahead a prediction is considered valid.
    pub prediction_window_ms: u64,

    /// Transitions needed before a sequential pattern is emitted.
    pub min_pattern_occurrences: u32,

    /// Predictions below this confidence are dropped.
    pub min_confidence: f64,

    pub frequency_weight: f64,
    pub pattern_weight: f64,
    pub context_weight: f64,

    /// Largest single sensitivity adjustment.
    pub sensitivity_step: f64,

    /// Sensitivity is clamped to `[-max_sensitivity, max_sensitivity]`.
    pub max_sensitivity: f64,
}

impl Default for PredictionConfig {
    fn default() -> Self {
        Self {
            prediction_window_ms: 300_000,
            min_pattern_occurrences: 3,
            min_confidence: 0.3,
            frequency_weight: 0.4,
            pattern_weight: 0.4,
            context_weight: 0.2,
            sensitivity_step: 0.05,
            max_sensitivity: 0.2,
        }
    }
}

impl PredictionConfig {
    pub fn prediction_window(&self) -> Duration {
        Duration::from_millis(self.prediction_window_ms)
    }
}

/// Ledger and pattern mining settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Global access ledger capacity (events).
    pub ledger_capacity: usize,

    /// Per-item access history capacity (events).
    pub history_capacity: usize,

    pub analysis_interval_ms: u64,

    /// Weight of the previous confidence when a pattern is recomputed.
    pub confidence_smoothing: f64,

    /// Relative deviation from the mean interval still counted as regular.
    pub temporal_tolerance: f64,

    /// Idle gap that separates two access sessions.
    pub session_gap_ms: u64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            ledger_capacity: 1000,
            history_capacity: 100,
            analysis_interval_ms: 60_000,
            confidence_smoothing: 0.5,
            temporal_tolerance: 0.25,
            session_gap_ms: 1_800_000,
        }
    }
}

/// Analytics sampling and feedback thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyticsConfig {
    pub interval_ms: u64,

    /// Number of most recent ledger events the rolling metrics cover.
    pub window_events: usize,

    /// Expiry sweep and re-tiering period.
    pub sweep_interval_ms: u64,

    /// Above this memory usage compression is made more aggressive.
    pub memory_high: f64,

    /// Below this memory usage compression is relaxed.
    pub memory_low: f64,

    /// Below this accuracy the predictor favours precision.
    pub accuracy_low: f64,

    /// Above this accuracy the predictor favours recall.
    pub accuracy_high: f64,
}

impl Default for AnalyticsConfig {
    fn default() -> Self {
        Self {
            interval_ms: 10_000,
            window_events: 100,
            sweep_interval_ms: 30_000,
            memory_high: 0.8,
            memory_low: 0.5,
            accuracy_low: 0.5,
            accuracy_high: 0.8,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)?;
            let config: Config = serde_json::from_str(&data)?;
            Ok(config)
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}
