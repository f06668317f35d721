//! Rolling metrics and the auto-tuning feedback loop.
//!
//! Metrics are computed from a ledger snapshot, never from live state, so a
//! sampling pass can run while the store keeps mutating. Tuning decisions
//! are single fixed-size steps; on an unchanging ledger they push the
//! compressor and predictor to their bounds and stay there.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;

use crate::cache::item::{AccessEvent, Operation};
use crate::config::AnalyticsConfig;

/// Number of recent performance scores kept for oscillation tracking.
const SCORE_HISTORY: usize = 32;

/// Metrics over the most recent ledger events.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RollingMetrics {
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub average_access_time_ms: f64,
    pub memory_usage: f64,
    pub prediction_accuracy: f64,

    /// Number of `predict` events the accuracy is based on.
    pub predictions_evaluated: usize,

    pub performance_score: f64,

    /// Events in the rolling window.
    pub sampled_events: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAdjustment {
    Increase,
    Decrease,
    Hold,
}

/// What one analytics cycle asks the compressor and predictor to do.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Tuning {
    pub compression: CompressionAdjustment,
    pub sensitivity_delta: f64,
}

/// ```text
/// 40 × hit_rate + 20 × (1 − memory_usage) + 20 × max(0, (50 − latency_ms) / 50) + 20 × accuracy
/// ```
pub fn performance_score(hit_rate: f64, memory_usage: f64, avg_latency_ms: f64, accuracy: f64) -> f64 {
    40.0 * hit_rate
        + 20.0 * (1.0 - memory_usage)
        + 20.0 * ((50.0 - avg_latency_ms) / 50.0).max(0.0)
        + 20.0 * accuracy
}

/// Share of `predict` events confirmed by a read of the same key within `window`.
///
/// Returns `(accuracy, predictions_evaluated)`.
pub fn prediction_accuracy(events: &[AccessEvent], window: Duration) -> (f64, usize) {
    let mut evaluated = 0usize;
    let mut confirmed = 0usize;
    for (i, predicted) in events.iter().enumerate() {
        if predicted.operation != Operation::Predict {
            continue;
        }
        evaluated += 1;
        let deadline = predicted.timestamp + window;
        let hit = events[i + 1..].iter().any(|e| {
            e.is_read()
                && e.key == predicted.key
                && e.timestamp > predicted.timestamp
                && e.timestamp <= deadline
        });
        if hit {
            confirmed += 1;
        }
    }
    if evaluated == 0 {
        return (0.0, 0);
    }
    (confirmed as f64 / evaluated as f64, evaluated)
}

pub struct AnalyticsSampler {
    config: AnalyticsConfig,
    prediction_window: Duration,
    sensitivity_step: f64,
    scores: Mutex<VecDeque<f64>>,
}

impl AnalyticsSampler {
    pub fn new(config: AnalyticsConfig, prediction_window: Duration, sensitivity_step: f64) -> Self {
        Self {
            config,
            prediction_window,
            sensitivity_step,
            scores: Mutex::new(VecDeque::with_capacity(SCORE_HISTORY)),
        }
    }

    /// Compute rolling metrics from a ledger snapshot.
    ///
    /// `memory_usage` is the accountant's fill fraction.
    pub fn sample(&self, events: &[AccessEvent], memory_usage: f64) -> RollingMetrics {
        let start = events.len().saturating_sub(self.config.window_events);
        let window = &events[start..];

        let reads: Vec<&AccessEvent> = window.iter().filter(|e| e.is_read()).collect();
        let hits = reads.iter().filter(|e| e.cache_hit).count();
        let (hit_rate, miss_rate) = if reads.is_empty() {
            (0.0, 0.0)
        } else {
            let rate = hits as f64 / reads.len() as f64;
            (rate, 1.0 - rate)
        };
        let average_access_time_ms = if reads.is_empty() {
            0.0
        } else {
            reads.iter().map(|e| e.latency.as_secs_f64() * 1000.0).sum::<f64>() / reads.len() as f64
        };

        let memory_usage = memory_usage.clamp(0.0, 1.0);

        let (accuracy, evaluated) = prediction_accuracy(events, self.prediction_window);

        RollingMetrics {
            hit_rate,
            miss_rate,
            average_access_time_ms,
            memory_usage,
            prediction_accuracy: accuracy,
            predictions_evaluated: evaluated,
            performance_score: performance_score(hit_rate, memory_usage, average_access_time_ms, accuracy),
            sampled_events: window.len(),
        }
    }

    /// Decide the next tuning step for a set of metrics.
    pub fn tune(&self, metrics: &RollingMetrics) -> Tuning {
        let compression = if metrics.memory_usage > self.config.memory_high {
            CompressionAdjustment::Increase
        } else if metrics.memory_usage < self.config.memory_low {
            CompressionAdjustment::Decrease
        } else {
            CompressionAdjustment::Hold
        };

        let sensitivity_delta = if metrics.predictions_evaluated == 0 {
            0.0
        } else if metrics.prediction_accuracy < self.config.accuracy_low {
            -self.sensitivity_step
        } else if metrics.prediction_accuracy > self.config.accuracy_high {
            self.sensitivity_step
        } else {
            0.0
        };

        Tuning {
            compression,
            sensitivity_delta,
        }
    }

    /// Remember a cycle's score.
    pub fn record(&self, metrics: &RollingMetrics) {
        let mut scores = self.scores.lock();
        while scores.len() >= SCORE_HISTORY {
            scores.pop_front();
        }
        scores.push_back(metrics.performance_score);
    }

    /// Max minus min of the remembered scores.
    pub fn score_spread(&self) -> f64 {
        let scores = self.scores.lock();
        let max = scores.iter().copied().fold(f64::MIN, f64::max);
        let min = scores.iter().copied().fold(f64::MAX, f64::min);
        if scores.is_empty() {
            0.0
        } else {
            max - min
        }
    }

    pub fn clear(&self) {
        self.scores.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::Instant;

    fn sampler() -> AnalyticsSampler {
        AnalyticsSampler::new(AnalyticsConfig::default(), Duration::from_secs(60), 0.05)
    }

    fn read(key: &str, hit: bool, latency_ms: u64, at: Instant) -> AccessEvent {
        AccessEvent::read(key, None, hit, Duration::from_millis(latency_ms)).with_timestamp(at)
    }

    #[test]
    fn test_score_formula() {
        assert!((performance_score(1.0, 0.0, 0.0, 1.0) - 100.0).abs() < 1e-10);
        assert!((performance_score(0.5, 0.5, 25.0, 0.0) - 40.0).abs() < 1e-10);
        assert!((performance_score(0.0, 1.0, 200.0, 0.0)).abs() < 1e-10);
    }

    #[test]
    fn test_rates_over_recent_window_only() {
        let now = Instant::now();
        let mut events: Vec<_> = (0..100).map(|_| read("old", false, 0, now)).collect();
        events.extend((0..100).map(|i| read("new", i % 4 != 0, 2, now)));

        let metrics = sampler().sample(&events, 0.25);
        assert_eq!(metrics.sampled_events, 100);
        assert!((metrics.hit_rate - 0.75).abs() < 1e-10);
        assert!((metrics.miss_rate - 0.25).abs() < 1e-10);
        assert!((metrics.average_access_time_ms - 2.0).abs() < 1e-10);
        assert!((metrics.memory_usage - 0.25).abs() < 1e-10);
    }

    #[test]
    fn test_prediction_accuracy_is_window_based() {
        let now = Instant::now();
        let events = vec![
            AccessEvent::new("B", Operation::Predict, None).with_timestamp(now),
            AccessEvent::new("C", Operation::Predict, None).with_timestamp(now),
            AccessEvent::new("D", Operation::Predict, None).with_timestamp(now),
            read("B", true, 0, now + Duration::from_secs(5)),
            read("C", true, 0, now + Duration::from_secs(120)),
        ];

        let (accuracy, evaluated) = prediction_accuracy(&events, Duration::from_secs(60));
        assert_eq!(evaluated, 3);
        assert!((accuracy - 1.0 / 3.0).abs() < 1e-10);
    }

    #[test]
    fn test_tuning_directions() {
        let s = sampler();
        let pressured = RollingMetrics {
            memory_usage: 0.95,
            prediction_accuracy: 0.2,
            predictions_evaluated: 4,
            ..Default::default()
        };
        let tuning = s.tune(&pressured);
        assert_eq!(tuning.compression, CompressionAdjustment::Increase);
        assert!((tuning.sensitivity_delta + 0.05).abs() < 1e-10);

        let idle = RollingMetrics {
            memory_usage: 0.1,
            ..Default::default()
        };
        let tuning = s.tune(&idle);
        assert_eq!(tuning.compression, CompressionAdjustment::Decrease);
        assert_eq!(tuning.sensitivity_delta, 0.0);
    }

    #[test]
    fn test_score_spread() {
        let s = sampler();
        assert_eq!(s.score_spread(), 0.0);
        for score in [50.0, 52.0, 49.0] {
            s.record(&RollingMetrics {
                performance_score: score,
                ..Default::default()
            });
        }
        assert!((s.score_spread() - 3.0).abs() < 1e-10);
    }
}
