//! Prediction: access likelihood, follow-up keys and eviction ranking.
//!
//! Three consumers share one scoring model:
//! - `set` seeds each new item with [`Predictor::generate_predictions`]
//! - `get` asks [`Predictor::predict_next_accesses`] which keys to prefetch
//! - admission asks [`Predictor::identify_eviction_candidates`] what to drop

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::cache::item::{AccessEvent, CacheItem, ItemMetadata, Operation, PredictionData, UsagePattern};
use crate::cache::patterns::{Pattern, PatternType};
use crate::config::{EvictionConfig, PredictionConfig};

/// A key expected to be requested soon.
#[derive(Debug, Clone, Serialize)]
pub struct PredictedAccess {
    pub key: String,
    pub confidence: f64,
    pub context: Option<String>,
}

/// Eviction-relevant fields copied out of an item.
#[derive(Debug, Clone)]
pub struct EvictionView {
    pub key: String,
    pub priority: f64,
    pub next_access_probability: f64,
    pub last_accessed: Instant,
    pub created_at: Instant,
    pub stored_size: usize,
}

impl From<&CacheItem> for EvictionView {
    fn from(item: &CacheItem) -> Self {
        Self {
            key: item.key.clone(),
            priority: item.metadata.priority,
            next_access_probability: item.prediction.next_access_probability,
            last_accessed: item.metadata.last_accessed,
            created_at: item.metadata.created_at,
            stored_size: item.stored_size(),
        }
    }
}

/// An eviction candidate with its computed keep-score.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub key: String,
    pub score: f64,
    pub stored_size: usize,
    pub created_at: Instant,
}

// Heap order: the lowest score is the most evictable; ties go to the oldest item.
impl PartialEq for EvictionCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for EvictionCandidate {}

impl PartialOrd for EvictionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EvictionCandidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .score
            .partial_cmp(&self.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.key.cmp(&self.key))
    }
}

/// The prediction engine.
pub struct Predictor {
    config: PredictionConfig,
    eviction: EvictionConfig,

    /// Positive favours recall, negative favours precision.
    sensitivity: Mutex<f64>,
}

impl Predictor {
    pub fn new(config: PredictionConfig, eviction: EvictionConfig) -> Self {
        Self {
            config,
            eviction,
            sensitivity: Mutex::new(0.0),
        }
    }

    /// Compute the keep-score of an item. Lower scores are evicted first.
    ///
    /// ```text
    /// score = w_p × priority + w_a × next_access_probability + w_r × 1 / (1 + idle_secs)
    /// ```
    pub fn compute_score(&self, item: &EvictionView, now: Instant) -> f64 {
        let idle_secs = now.saturating_duration_since(item.last_accessed).as_secs_f64();
        let recency = 1.0 / (1.0 + idle_secs);

        self.eviction.priority_weight * item.priority
            + self.eviction.probability_weight * item.next_access_probability
            + self.eviction.recency_weight * recency
    }

    /// Every candidate, most evictable first.
    pub fn rank_eviction_candidates<'a>(
        &self,
        items: impl Iterator<Item = &'a EvictionView>,
        now: Instant,
    ) -> Vec<EvictionCandidate> {
        let mut heap: BinaryHeap<EvictionCandidate> = items
            .map(|item| EvictionCandidate {
                key: item.key.clone(),
                score: self.compute_score(item, now),
                stored_size: item.stored_size,
                created_at: item.created_at,
            })
            .collect();

        let mut ranked = Vec::with_capacity(heap.len());
        while let Some(candidate) = heap.pop() {
            ranked.push(candidate);
        }
        ranked
    }

    /// The shortest most-evictable prefix whose sizes add up to `required_space`.
    ///
    /// Returns every candidate when even all of them fall short.
    pub fn identify_eviction_candidates<'a>(
        &self,
        items: impl Iterator<Item = &'a EvictionView>,
        required_space: usize,
        now: Instant,
    ) -> Vec<EvictionCandidate> {
        let mut freed = 0usize;
        let mut selected = Vec::new();
        for candidate in self.rank_eviction_candidates(items, now) {
            if freed >= required_space {
                break;
            }
            freed += candidate.stored_size;
            selected.push(candidate);
        }
        selected
    }

    /// Predict how likely `key` is to be read again soon.
    ///
    /// Blends how often the key shows up in the ledger, the strongest pattern
    /// mentioning it and how well the current context matches its history.
    #[allow(clippy::too_many_arguments)]
    pub fn generate_predictions(
        &self,
        key: &str,
        metadata: &ItemMetadata,
        history: &VecDeque<AccessEvent>,
        ledger: &[AccessEvent],
        patterns: &[Pattern],
        context: Option<&str>,
        now: Instant,
    ) -> PredictionData {
        let window = self.config.prediction_window();

        let occurrences = ledger
            .iter()
            .filter(|e| e.key == key && matches!(e.operation, Operation::Read | Operation::Write))
            .count();
        let frequency = 1.0 - (-(occurrences as f64) / 5.0).exp();

        let pattern = patterns
            .iter()
            .filter(|p| p.references(key))
            .map(|p| p.confidence)
            .fold(0.0, f64::max);

        let context_similarity = match context {
            Some(ctx) if !history.is_empty() => {
                let matching = history
                    .iter()
                    .filter(|e| e.context.as_deref() == Some(ctx))
                    .count();
                matching as f64 / history.len() as f64
            }
            _ => 0.5,
        };

        let total_weight =
            self.config.frequency_weight + self.config.pattern_weight + self.config.context_weight;
        let blended = if total_weight > 0.0 {
            (self.config.frequency_weight * frequency
                + self.config.pattern_weight * pattern
                + self.config.context_weight * context_similarity)
                / total_weight
        } else {
            0.5
        };

        let times: Vec<Instant> = history.iter().map(|e| e.timestamp).collect();
        let (usage_pattern, pattern_confidence, mean_interval) = classify_usage(&times);
        let predicted_access_time = match (times.last(), mean_interval) {
            (Some(last), Some(interval)) => *last + interval,
            _ => now + window,
        };

        PredictionData {
            next_access_probability: blended.clamp(0.0, 1.0),
            predicted_access_time,
            usage_pattern,
            pattern_confidence,
            seasonal_factor: seasonal_factor(metadata, &times, window, now),
            context_similarity,
        }
    }

    /// Keys the given patterns expect to be read next, most confident first.
    ///
    /// The anchor is the most recent read in `recent`. Sequential patterns
    /// fire when their leader is the anchor, temporal ones when their key is
    /// due within the pattern's window, contextual ones when `context` matches.
    pub fn predict_next_accesses(
        &self,
        recent: &[AccessEvent],
        patterns: &[Pattern],
        context: Option<&str>,
        now: Instant,
    ) -> Vec<PredictedAccess> {
        let anchor = recent.iter().rev().find(|e| e.is_read());
        let anchor_key = anchor.map(|e| e.key.as_str());
        let min_confidence = self.effective_threshold(self.config.min_confidence);

        let mut best: HashMap<&str, PredictedAccess> = HashMap::new();
        for pattern in patterns {
            let predicted = match pattern.pattern_type {
                PatternType::Sequential => match (anchor_key, pattern.leader(), pattern.follower()) {
                    (Some(a), Some(from), Some(to)) if a == from => Some((to, pattern.confidence)),
                    _ => None,
                },
                PatternType::Temporal => pattern.leader().and_then(|key| {
                    let interval = Duration::from_millis(pattern.parameters.interval_ms?);
                    let last = recent.iter().rev().find(|e| e.is_access() && e.key == key)?;
                    let due = last.timestamp + interval;
                    (due <= now + pattern.prediction_window).then_some((key, pattern.confidence))
                }),
                PatternType::Contextual => match (context, pattern.parameters.context.as_deref()) {
                    (Some(ctx), Some(expected)) if ctx == expected => {
                        pattern.leader().map(|key| (key, pattern.confidence))
                    }
                    _ => None,
                },
                // Session recurrence says nothing about timing; it only feeds scoring.
                PatternType::Behavioral => None,
            };

            let Some((key, confidence)) = predicted else {
                continue;
            };
            if Some(key) == anchor_key || confidence < min_confidence {
                continue;
            }
            let entry = best.entry(key).or_insert_with(|| PredictedAccess {
                key: key.to_string(),
                confidence,
                context: context.map(str::to_string),
            });
            entry.confidence = entry.confidence.max(confidence);
        }

        let mut predictions: Vec<PredictedAccess> = best.into_values().collect();
        predictions.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.key.cmp(&b.key))
        });
        predictions
    }

    /// Shift a confidence threshold by the current sensitivity.
    pub fn effective_threshold(&self, base: f64) -> f64 {
        (base - *self.sensitivity.lock()).clamp(0.0, 1.0)
    }

    /// Nudge toward recall (positive) or precision (negative).
    ///
    /// Each call moves at most one step and the total stays within bounds.
    pub fn adjust_sensitivity(&self, delta: f64) -> f64 {
        let step = self.config.sensitivity_step.abs();
        let bound = self.config.max_sensitivity.abs();
        let mut sensitivity = self.sensitivity.lock();
        *sensitivity = (*sensitivity + delta.clamp(-step, step)).clamp(-bound, bound);
        debug!(sensitivity = *sensitivity, "Predictor sensitivity adjusted");
        *sensitivity
    }

    pub fn sensitivity(&self) -> f64 {
        *self.sensitivity.lock()
    }

    pub fn prediction_window(&self) -> Duration {
        self.config.prediction_window()
    }
}

/// Classify an access history by its inter-arrival times.
///
/// Returns the usage pattern, a confidence for it, and the mean interval.
fn classify_usage(times: &[Instant]) -> (UsagePattern, f64, Option<Duration>) {
    if times.len() < 3 {
        return (UsagePattern::Random, 0.0, None);
    }

    let intervals: Vec<f64> = times
        .windows(2)
        .map(|w| w[1].saturating_duration_since(w[0]).as_secs_f64())
        .collect();
    let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
    let mean_interval = Some(Duration::from_secs_f64(mean.max(0.0)));
    if mean <= 0.0 {
        return (UsagePattern::Burst, 1.0, mean_interval);
    }

    let variance = intervals.iter().map(|i| (i - mean).powi(2)).sum::<f64>() / intervals.len() as f64;
    let cv = variance.sqrt() / mean;

    let half = intervals.len() / 2;
    if half >= 1 {
        let early = intervals[..half].iter().sum::<f64>() / half as f64;
        let late = intervals[half..].iter().sum::<f64>() / (intervals.len() - half) as f64;
        if early > 0.0 && late < early * 0.5 {
            return (UsagePattern::Burst, 1.0 - late / early, mean_interval);
        }
        if late > 0.0 && late > early * 2.0 {
            return (UsagePattern::Declining, 1.0 - early / late, mean_interval);
        }
    }

    if cv < 0.25 {
        (UsagePattern::Periodic, 1.0 - cv, mean_interval)
    } else if mean < 60.0 {
        (UsagePattern::Frequent, (1.0 - cv).clamp(0.1, 1.0), mean_interval)
    } else {
        (UsagePattern::Random, 0.0, mean_interval)
    }
}

/// Recent access rate relative to the lifetime rate.
fn seasonal_factor(metadata: &ItemMetadata, times: &[Instant], window: Duration, now: Instant) -> f64 {
    let lifetime = now.saturating_duration_since(metadata.created_at).as_secs_f64();
    if metadata.access_count == 0 || lifetime <= 0.0 || window.is_zero() {
        return 1.0;
    }
    let lifetime_rate = metadata.access_count as f64 / lifetime;
    let recent = times
        .iter()
        .filter(|t| now.saturating_duration_since(**t) <= window)
        .count();
    let recent_rate = recent as f64 / window.as_secs_f64().min(lifetime);
    (recent_rate / lifetime_rate).clamp(0.0, 10.0)
}
