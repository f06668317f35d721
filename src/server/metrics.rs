//! Prometheus exposition of cache analytics.
//!
//! Gauges are refreshed from an [`AnalyticsReport`] on every scrape rather
//! than updated on the hot path.

use prometheus::{Encoder, Gauge, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::cache::store::AnalyticsReport;

pub struct CacheMetrics {
    registry: Registry,
    items: IntGauge,
    bytes_in_use: IntGauge,
    max_bytes: IntGauge,
    events: IntGaugeVec,
    categories: IntGaugeVec,
    hit_rate: Gauge,
    prediction_accuracy: Gauge,
    performance_score: Gauge,
    compression_target_ratio: Gauge,
    predictor_sensitivity: Gauge,
}

impl CacheMetrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("predictive_cache".to_string()), None)?;

        let items = IntGauge::new("items", "Number of stored items")?;
        let bytes_in_use = IntGauge::new("bytes_in_use", "Stored bytes charged against the ceiling")?;
        let max_bytes = IntGauge::new("max_bytes", "Memory ceiling in bytes")?;
        let events = IntGaugeVec::new(
            Opts::new("events", "Cache events since start or last clear"),
            &["event"],
        )?;
        let categories = IntGaugeVec::new(
            Opts::new("items_by_category", "Items per tier category"),
            &["category"],
        )?;
        let hit_rate = Gauge::new("hit_rate", "Hit rate over the rolling window")?;
        let prediction_accuracy = Gauge::new(
            "prediction_accuracy",
            "Share of predictions confirmed within the prediction window",
        )?;
        let performance_score = Gauge::new("performance_score", "Composite performance score (0-100)")?;
        let compression_target_ratio =
            Gauge::new("compression_target_ratio", "Ratio an algorithm must reach to be used")?;
        let predictor_sensitivity =
            Gauge::new("predictor_sensitivity", "Offset applied to prediction thresholds")?;

        registry.register(Box::new(items.clone()))?;
        registry.register(Box::new(bytes_in_use.clone()))?;
        registry.register(Box::new(max_bytes.clone()))?;
        registry.register(Box::new(events.clone()))?;
        registry.register(Box::new(categories.clone()))?;
        registry.register(Box::new(hit_rate.clone()))?;
        registry.register(Box::new(prediction_accuracy.clone()))?;
        registry.register(Box::new(performance_score.clone()))?;
        registry.register(Box::new(compression_target_ratio.clone()))?;
        registry.register(Box::new(predictor_sensitivity.clone()))?;

        Ok(Self {
            registry,
            items,
            bytes_in_use,
            max_bytes,
            events,
            categories,
            hit_rate,
            prediction_accuracy,
            performance_score,
            compression_target_ratio,
            predictor_sensitivity,
        })
    }

    /// Copy a report into the gauges.
    pub fn update(&self, report: &AnalyticsReport) {
        self.items.set(report.item_count as i64);
        self.bytes_in_use.set(report.bytes_in_use as i64);
        self.max_bytes.set(report.max_bytes as i64);

        let c = &report.counters;
        for (event, value) in [
            ("hit", c.hits),
            ("miss", c.misses),
            ("eviction", c.evictions),
            ("expiration", c.expirations),
            ("rejection", c.rejections),
            ("corrupt_removal", c.corrupt_removals),
            ("prefetch_scheduled", c.prefetch_scheduled),
            ("prefetch_completed", c.prefetch_completed),
            ("prefetch_failed", c.prefetch_failed),
            ("prefetch_hit", c.prefetch_hits),
        ] {
            self.events.with_label_values(&[event]).set(value as i64);
        }

        let k = &report.categories;
        for (category, count) in [("hot", k.hot), ("warm", k.warm), ("cold", k.cold), ("frozen", k.frozen)] {
            self.categories.with_label_values(&[category]).set(count as i64);
        }

        self.hit_rate.set(report.metrics.hit_rate);
        self.prediction_accuracy.set(report.metrics.prediction_accuracy);
        self.performance_score.set(report.metrics.performance_score);
        self.compression_target_ratio.set(report.compression_target_ratio);
        self.predictor_sensitivity.set(report.predictor_sensitivity);
    }

    /// Encode all gauges in the Prometheus text format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
