//! Pattern recognition over the access ledger.
//!
//! Reads (hits and misses) and writes are grouped by key and context and
//! classified into temporal, sequential, contextual or behavioral patterns.
//! Sequential transitions come from reads only and are also tracked online,
//! so a follow-up key can be predicted before the next periodic analysis.
//! Miss and write tallies are rebuilt from each analyzed snapshot and only
//! grow between analyses.
//!
//! Pattern ids are derived from the keys they describe, so a recomputed
//! pattern replaces its predecessor with a smoothed confidence instead of
//! starting over.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize, Serializer};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::item::{AccessEvent, Operation};
use crate::config::{PatternConfig, PredictionConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatternType {
    /// Accesses to one key at a fixed interval.
    Temporal,
    /// One key reliably followed by another.
    Sequential,
    /// A key mostly requested under one context.
    Contextual,
    /// A key that recurs across sessions without timing regularity.
    Behavioral,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PatternParameters {
    /// Keys the pattern is about. Sequential patterns are `[from, to]`.
    pub keys: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,

    /// Mean interval between accesses, for temporal patterns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
}

fn serialize_millis<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
}

#[derive(Debug, Clone, Serialize)]
pub struct Pattern {
    pub id: String,
    pub name: String,
    pub pattern_type: PatternType,

    /// Number of observations supporting the pattern.
    pub frequency: u32,

    /// Fraction of observations consistent with the pattern (0.0 - 1.0).
    pub confidence: f64,

    pub parameters: PatternParameters,

    #[serde(skip)]
    pub last_seen: Instant,

    #[serde(rename = "prediction_window_ms", serialize_with = "serialize_millis")]
    pub prediction_window: Duration,
}

impl Pattern {
    pub fn references(&self, key: &str) -> bool {
        self.parameters.keys.iter().any(|k| k == key)
    }

    /// Leading key of a sequential pattern (or the subject of any other kind).
    pub fn leader(&self) -> Option<&str> {
        self.parameters.keys.first().map(String::as_str)
    }

    /// Follow-up key of a sequential pattern.
    pub fn follower(&self) -> Option<&str> {
        match self.pattern_type {
            PatternType::Sequential => self.parameters.keys.get(1).map(String::as_str),
            _ => None,
        }
    }
}

type Transitions = HashMap<String, HashMap<String, u32>>;

#[derive(Default)]
struct RecognizerState {
    patterns: HashMap<String, Pattern>,
    transitions: Transitions,
    last_read: Option<(String, Instant)>,
    misses: HashMap<String, u32>,
    writes: HashMap<String, u32>,
}

/// Mines access events for recurring patterns.
pub struct PatternRecognizer {
    config: PatternConfig,
    window: Duration,
    min_occurrences: u32,
    state: Mutex<RecognizerState>,
}

impl PatternRecognizer {
    pub fn new(config: PatternConfig, prediction: &PredictionConfig) -> Self {
        Self {
            config,
            window: prediction.prediction_window(),
            min_occurrences: prediction.min_pattern_occurrences.max(1),
            state: Mutex::new(RecognizerState::default()),
        }
    }

    /// Feed a cache hit.
    pub fn record_access(&self, event: &AccessEvent) {
        let mut state = self.state.lock();
        self.observe_read(&mut state, event);
    }

    /// Feed a cache miss; misses drive the same transition tracking as hits.
    pub fn analyze_miss_pattern(&self, event: &AccessEvent) {
        let mut state = self.state.lock();
        *state.misses.entry(event.key.clone()).or_insert(0) += 1;
        self.observe_read(&mut state, event);
    }

    /// Feed a write.
    pub fn analyze_write_pattern(&self, event: &AccessEvent) {
        let mut state = self.state.lock();
        *state.writes.entry(event.key.clone()).or_insert(0) += 1;
    }

    /// Recompute all patterns from a ledger snapshot and merge them into the table.
    ///
    /// Returns the patterns found in this pass, with smoothed confidences.
    pub fn analyze_sequence(&self, events: &[AccessEvent], now: Instant) -> Vec<Pattern> {
        let accesses: Vec<&AccessEvent> = events.iter().filter(|e| e.is_access()).collect();
        let reads: Vec<&AccessEvent> = accesses.iter().copied().filter(|e| e.is_read()).collect();

        let transitions = build_transitions(&reads, self.window);
        let mut fresh = sequential_patterns(&transitions, self.min_occurrences, self.window, now);
        fresh.extend(temporal_patterns(
            &accesses,
            self.config.temporal_tolerance,
            self.min_occurrences,
            now,
        ));
        fresh.extend(contextual_patterns(&accesses, self.min_occurrences, self.window, now));

        let explained: HashSet<&str> = fresh
            .iter()
            .filter(|p| matches!(p.pattern_type, PatternType::Temporal | PatternType::Sequential))
            .flat_map(|p| p.parameters.keys.iter().map(String::as_str))
            .collect();
        let behavioral = behavioral_patterns(
            &accesses,
            Duration::from_millis(self.config.session_gap_ms),
            &explained,
            self.window,
            now,
        );
        fresh.extend(behavioral);

        let smoothing = self.config.confidence_smoothing.clamp(0.0, 1.0);
        let mut state = self.state.lock();
        let mut merged = Vec::with_capacity(fresh.len());
        for mut pattern in fresh {
            if let Some(previous) = state.patterns.get(&pattern.id) {
                pattern.confidence =
                    smoothing * previous.confidence + (1.0 - smoothing) * pattern.confidence;
            }
            state.patterns.insert(pattern.id.clone(), pattern.clone());
            merged.push(pattern);
        }
        state.transitions = transitions;
        state.misses = tally(events.iter().filter(|e| e.is_read() && !e.cache_hit));
        state.writes = tally(events.iter().filter(|e| e.operation == Operation::Write));
        self.prune(&mut state, now);

        debug!(
            events = events.len(),
            found = merged.len(),
            tracked = state.patterns.len(),
            "Pattern analysis complete"
        );
        merged
    }

    /// Patterns whose parameters mention `key`.
    pub fn find_related_patterns(&self, key: &str) -> Vec<Pattern> {
        self.state
            .lock()
            .patterns
            .values()
            .filter(|p| p.references(key))
            .cloned()
            .collect()
    }

    /// Patterns able to name a follow-up to a read of `key` under `context`:
    /// sequential ones led by `key`, contextual ones for `context` and every
    /// temporal one (the predictor checks whether it is due).
    pub fn prefetch_candidates(&self, key: &str, context: Option<&str>) -> Vec<Pattern> {
        self.state
            .lock()
            .patterns
            .values()
            .filter(|p| match p.pattern_type {
                PatternType::Sequential => p.leader() == Some(key),
                PatternType::Temporal => true,
                PatternType::Contextual => {
                    context.is_some() && p.parameters.context.as_deref() == context
                }
                PatternType::Behavioral => false,
            })
            .cloned()
            .collect()
    }

    /// All tracked patterns, most confident first.
    pub fn patterns(&self) -> Vec<Pattern> {
        let mut patterns: Vec<Pattern> = self.state.lock().patterns.values().cloned().collect();
        patterns.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.id.cmp(&b.id))
        });
        patterns
    }

    pub fn miss_count(&self, key: &str) -> u32 {
        self.state.lock().misses.get(key).copied().unwrap_or(0)
    }

    pub fn write_count(&self, key: &str) -> u32 {
        self.state.lock().writes.get(key).copied().unwrap_or(0)
    }

    pub fn clear(&self) {
        *self.state.lock() = RecognizerState::default();
    }

    fn observe_read(&self, state: &mut RecognizerState, event: &AccessEvent) {
        if let Some((prev, at)) = state.last_read.take() {
            let gap = event.timestamp.saturating_duration_since(at);
            if prev != event.key && gap <= self.window {
                *state
                    .transitions
                    .entry(prev.clone())
                    .or_default()
                    .entry(event.key.clone())
                    .or_insert(0) += 1;
                self.refresh_sequential(state, &prev, event.timestamp);
            }
        }
        state.last_read = Some((event.key.clone(), event.timestamp));
    }

    /// Re-derive the sequential patterns leading out of `from`.
    fn refresh_sequential(&self, state: &mut RecognizerState, from: &str, now: Instant) {
        let Some(followers) = state.transitions.get(from) else {
            return;
        };
        let total: u32 = followers.values().sum();
        let updated: Vec<Pattern> = followers
            .iter()
            .filter(|(_, count)| **count >= self.min_occurrences)
            .map(|(to, count)| sequential_pattern(from, to, *count, total, self.window, now))
            .collect();

        for pattern in updated {
            state.patterns.insert(pattern.id.clone(), pattern);
        }
    }

    /// Drop stale patterns and patterns that no longer name any key.
    fn prune(&self, state: &mut RecognizerState, now: Instant) {
        let stale_after = self
            .window
            .max(Duration::from_millis(self.config.analysis_interval_ms) * 3);

        state.patterns.retain(|id, pattern| {
            if pattern.parameters.keys.is_empty() {
                warn!(pattern = %id, "Pattern references no keys, dropping");
                return false;
            }
            now.saturating_duration_since(pattern.last_seen) <= stale_after
        });
    }
}

fn tally<'a>(events: impl Iterator<Item = &'a AccessEvent>) -> HashMap<String, u32> {
    let mut counts = HashMap::new();
    for event in events {
        *counts.entry(event.key.clone()).or_insert(0) += 1;
    }
    counts
}

fn build_transitions(reads: &[&AccessEvent], window: Duration) -> Transitions {
    let mut transitions = Transitions::new();
    for pair in reads.windows(2) {
        let (prev, next) = (pair[0], pair[1]);
        if prev.key == next.key {
            continue;
        }
        if next.timestamp.saturating_duration_since(prev.timestamp) <= window {
            *transitions
                .entry(prev.key.clone())
                .or_default()
                .entry(next.key.clone())
                .or_insert(0) += 1;
        }
    }
    transitions
}

fn sequential_pattern(
    from: &str,
    to: &str,
    count: u32,
    total: u32,
    window: Duration,
    now: Instant,
) -> Pattern {
    Pattern {
        id: format!("sequential:{from}->{to}"),
        name: format!("{from} followed by {to}"),
        pattern_type: PatternType::Sequential,
        frequency: count,
        confidence: count as f64 / total.max(1) as f64,
        parameters: PatternParameters {
            keys: vec![from.to_string(), to.to_string()],
            ..Default::default()
        },
        last_seen: now,
        prediction_window: window,
    }
}

fn sequential_patterns(
    transitions: &Transitions,
    min_occurrences: u32,
    window: Duration,
    now: Instant,
) -> Vec<Pattern> {
    let mut patterns = Vec::new();
    for (from, followers) in transitions {
        let total: u32 = followers.values().sum();
        for (to, count) in followers {
            if *count >= min_occurrences {
                patterns.push(sequential_pattern(from, to, *count, total, window, now));
            }
        }
    }
    patterns
}

fn temporal_patterns(
    reads: &[&AccessEvent],
    tolerance: f64,
    min_occurrences: u32,
    now: Instant,
) -> Vec<Pattern> {
    let mut by_key: BTreeMap<&str, Vec<Instant>> = BTreeMap::new();
    for event in reads {
        by_key.entry(event.key.as_str()).or_default().push(event.timestamp);
    }

    let mut patterns = Vec::new();
    for (key, times) in by_key {
        if times.len() < min_occurrences as usize + 1 {
            continue;
        }
        let intervals: Vec<f64> = times
            .windows(2)
            .map(|w| w[1].saturating_duration_since(w[0]).as_secs_f64())
            .collect();
        let mean = intervals.iter().sum::<f64>() / intervals.len() as f64;
        if mean <= 0.0 {
            continue;
        }

        let consistent = intervals
            .iter()
            .filter(|i| (*i - mean).abs() <= tolerance * mean)
            .count();
        let confidence = consistent as f64 / intervals.len() as f64;
        if confidence < 0.5 {
            continue;
        }

        let interval = Duration::from_secs_f64(mean);
        patterns.push(Pattern {
            id: format!("temporal:{key}"),
            name: format!("{key} every {}ms", interval.as_millis()),
            pattern_type: PatternType::Temporal,
            frequency: times.len() as u32,
            confidence,
            parameters: PatternParameters {
                keys: vec![key.to_string()],
                interval_ms: Some(interval.as_millis() as u64),
                ..Default::default()
            },
            last_seen: now,
            prediction_window: interval.mul_f64(1.0 + tolerance),
        });
    }
    patterns
}

fn contextual_patterns(
    reads: &[&AccessEvent],
    min_occurrences: u32,
    window: Duration,
    now: Instant,
) -> Vec<Pattern> {
    let mut totals: HashMap<&str, u32> = HashMap::new();
    let mut by_context: BTreeMap<(&str, &str), u32> = BTreeMap::new();
    for event in reads {
        *totals.entry(event.key.as_str()).or_insert(0) += 1;
        if let Some(context) = event.context.as_deref() {
            *by_context.entry((event.key.as_str(), context)).or_insert(0) += 1;
        }
    }

    by_context
        .into_iter()
        .filter(|(_, count)| *count >= min_occurrences)
        .filter_map(|((key, context), count)| {
            let confidence = count as f64 / totals.get(key).copied().unwrap_or(count).max(1) as f64;
            (confidence >= 0.5).then(|| Pattern {
                id: format!("contextual:{key}@{context}"),
                name: format!("{key} under {context}"),
                pattern_type: PatternType::Contextual,
                frequency: count,
                confidence,
                parameters: PatternParameters {
                    keys: vec![key.to_string()],
                    context: Some(context.to_string()),
                    ..Default::default()
                },
                last_seen: now,
                prediction_window: window,
            })
        })
        .collect()
}

fn behavioral_patterns(
    reads: &[&AccessEvent],
    session_gap: Duration,
    explained: &HashSet<&str>,
    window: Duration,
    now: Instant,
) -> Vec<Pattern> {
    let mut sessions: Vec<HashSet<&str>> = Vec::new();
    let mut last: Option<Instant> = None;
    for event in reads {
        let new_session = match last {
            Some(at) => event.timestamp.saturating_duration_since(at) > session_gap,
            None => true,
        };
        if new_session {
            sessions.push(HashSet::new());
        }
        if let Some(session) = sessions.last_mut() {
            session.insert(event.key.as_str());
        }
        last = Some(event.timestamp);
    }
    if sessions.len() < 2 {
        return Vec::new();
    }

    let mut appearances: BTreeMap<&str, u32> = BTreeMap::new();
    for session in &sessions {
        for key in session {
            *appearances.entry(*key).or_insert(0) += 1;
        }
    }

    appearances
        .into_iter()
        .filter(|(key, count)| *count >= 2 && !explained.contains(key))
        .map(|(key, count)| Pattern {
            id: format!("behavioral:{key}"),
            name: format!("{key} recurs across sessions"),
            pattern_type: PatternType::Behavioral,
            frequency: count,
            confidence: count as f64 / sessions.len() as f64,
            parameters: PatternParameters {
                keys: vec![key.to_string()],
                ..Default::default()
            },
            last_seen: now,
            prediction_window: window,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recognizer() -> PatternRecognizer {
        PatternRecognizer::new(PatternConfig::default(), &PredictionConfig::default())
    }

    fn read_at(key: &str, at: Instant, context: Option<&str>) -> AccessEvent {
        AccessEvent::read(key, context.map(str::to_string), true, Duration::ZERO).with_timestamp(at)
    }

    #[test]
    fn test_online_sequential_needs_min_occurrences() {
        let rec = recognizer();
        let start = Instant::now();
        for i in 0..2 {
            rec.record_access(&read_at("A", start + Duration::from_secs(i * 2), None));
            rec.analyze_miss_pattern(&read_at("B", start + Duration::from_secs(i * 2 + 1), None));
        }
        assert!(rec.find_related_patterns("A").is_empty());

        rec.record_access(&read_at("A", start + Duration::from_secs(4), None));
        rec.analyze_miss_pattern(&read_at("B", start + Duration::from_secs(5), None));

        let related = rec.find_related_patterns("A");
        let seq = related
            .iter()
            .find(|p| p.id == "sequential:A->B")
            .expect("A->B pattern");
        assert_eq!(seq.frequency, 3);
        assert!((seq.confidence - 1.0).abs() < 1e-10);
        assert_eq!(seq.follower(), Some("B"));
        assert_eq!(rec.miss_count("B"), 3);
    }

    #[test]
    fn test_confidence_is_share_of_transitions() {
        let rec = recognizer();
        let start = Instant::now();
        let keys = ["A", "B", "A", "B", "A", "B", "A", "C"];
        for (i, key) in keys.iter().enumerate() {
            rec.record_access(&read_at(key, start + Duration::from_secs(i as u64), None));
        }

        let seq = rec
            .patterns()
            .into_iter()
            .find(|p| p.id == "sequential:A->B")
            .unwrap();
        assert!((seq.confidence - 0.75).abs() < 1e-10);
    }

    #[test]
    fn test_transitions_outside_window_ignored() {
        let rec = recognizer();
        let start = Instant::now();
        for i in 0..4u64 {
            rec.record_access(&read_at("A", start + Duration::from_secs(i * 1000), None));
            rec.record_access(&read_at("B", start + Duration::from_secs(i * 1000 + 400), None));
        }
        assert!(rec.find_related_patterns("A").is_empty());
    }

    #[test]
    fn test_temporal_pattern_detected() {
        let rec = recognizer();
        let start = Instant::now();
        let events: Vec<_> = (0..6)
            .map(|i| read_at("tick", start + Duration::from_secs(i * 10), None))
            .collect();

        let found = rec.analyze_sequence(&events, start + Duration::from_secs(60));
        let temporal = found
            .iter()
            .find(|p| p.pattern_type == PatternType::Temporal)
            .unwrap();
        assert_eq!(temporal.parameters.interval_ms, Some(10_000));
        assert!((temporal.confidence - 1.0).abs() < 1e-10);
    }

    #[test]
    fn test_contextual_pattern_detected() {
        let rec = recognizer();
        let start = Instant::now();
        let events: Vec<_> = [0u64, 7, 9, 30]
            .iter()
            .map(|s| read_at("report", start + Duration::from_secs(*s), Some("dashboard")))
            .collect();

        let found = rec.analyze_sequence(&events, start + Duration::from_secs(40));
        let contextual = found
            .iter()
            .find(|p| p.pattern_type == PatternType::Contextual)
            .unwrap();
        assert_eq!(contextual.parameters.context.as_deref(), Some("dashboard"));
        assert_eq!(contextual.frequency, 4);
    }

    #[test]
    fn test_behavioral_pattern_across_sessions() {
        let rec = recognizer();
        let start = Instant::now();
        let hour = Duration::from_secs(3600);
        let events = vec![
            read_at("profile", start, None),
            read_at("inbox", start + Duration::from_secs(5), None),
            read_at("profile", start + hour, None),
            read_at("profile", start + hour * 2 + Duration::from_secs(13), None),
        ];

        let found = rec.analyze_sequence(&events, start + hour * 3);
        let behavioral = found
            .iter()
            .find(|p| p.id == "behavioral:profile")
            .unwrap();
        assert_eq!(behavioral.frequency, 3);
        assert!((behavioral.confidence - 1.0).abs() < 1e-10);
        assert!(!found.iter().any(|p| p.id == "behavioral:inbox"));
    }

    #[test]
    fn test_recomputation_smooths_confidence() {
        let rec = recognizer();
        let start = Instant::now();
        let strong: Vec<_> = (0..4)
            .flat_map(|i| {
                let t = start + Duration::from_secs(i * 2);
                [read_at("A", t, None), read_at("B", t + Duration::from_secs(1), None)]
            })
            .collect();
        rec.analyze_sequence(&strong, start + Duration::from_secs(10));

        let mut weak = strong.clone();
        let t = start + Duration::from_secs(20);
        for (i, key) in ["A", "C", "A", "C", "A", "C", "A", "C"].iter().enumerate() {
            weak.push(read_at(key, t + Duration::from_secs(i as u64), None));
        }
        let found = rec.analyze_sequence(&weak, start + Duration::from_secs(30));

        // Fresh confidence is 4/8; smoothed halfway from 1.0.
        let seq = found.iter().find(|p| p.id == "sequential:A->B").unwrap();
        assert!((seq.confidence - 0.75).abs() < 1e-10);
    }

    fn write_at(key: &str, at: Instant) -> AccessEvent {
        AccessEvent::new(key, Operation::Write, None).with_timestamp(at)
    }

    #[test]
    fn test_periodic_writes_form_temporal_pattern() {
        let rec = recognizer();
        let start = Instant::now();
        let events: Vec<_> = (0..10)
            .map(|i| write_at("W", start + Duration::from_secs(i * 30)))
            .collect();
        for event in &events {
            rec.analyze_write_pattern(event);
        }

        let found = rec.analyze_sequence(&events, start + Duration::from_secs(300));
        let temporal = found.iter().find(|p| p.id == "temporal:W").unwrap();
        assert_eq!(temporal.parameters.interval_ms, Some(30_000));
        assert_eq!(temporal.frequency, 10);
        assert_eq!(rec.write_count("W"), 10);
        // Writes never produce transitions.
        assert!(!found.iter().any(|p| p.pattern_type == PatternType::Sequential));
    }

    #[test]
    fn test_miss_and_write_tallies_follow_snapshot() {
        let rec = recognizer();
        let start = Instant::now();
        for i in 0..5000u64 {
            let at = start + Duration::from_millis(i);
            rec.analyze_miss_pattern(
                &AccessEvent::read(format!("m{i}"), None, false, Duration::ZERO).with_timestamp(at),
            );
            rec.analyze_write_pattern(&write_at(&format!("w{i}"), at));
        }
        assert_eq!(rec.miss_count("m0"), 1);

        let recent = vec![
            AccessEvent::read("m4999", None, false, Duration::ZERO).with_timestamp(start),
            write_at("w4999", start),
        ];
        rec.analyze_sequence(&recent, start + Duration::from_secs(86_400));

        let state = rec.state.lock();
        assert_eq!(state.misses.len(), 1);
        assert_eq!(state.writes.len(), 1);
        drop(state);
        assert_eq!(rec.miss_count("m0"), 0);
        assert_eq!(rec.miss_count("m4999"), 1);
        assert_eq!(rec.write_count("w4999"), 1);
    }

    #[test]
    fn test_prefetch_candidates_select_by_kind() {
        let rec = recognizer();
        let start = Instant::now();
        let mut events = Vec::new();
        for i in 0..4u64 {
            let t = start + Duration::from_secs(i * 20);
            events.push(read_at("A", t, None));
            events.push(read_at("B", t + Duration::from_secs(1), None));
            events.push(read_at("report", t + Duration::from_secs(7), Some("dashboard")));
        }
        rec.analyze_sequence(&events, start + Duration::from_secs(90));

        let ids = |key: &str, context: Option<&str>| -> Vec<String> {
            let mut ids: Vec<String> = rec
                .prefetch_candidates(key, context)
                .into_iter()
                .filter(|p| p.pattern_type != PatternType::Temporal)
                .map(|p| p.id)
                .collect();
            ids.sort();
            ids
        };
        assert!(ids("A", None).contains(&"sequential:A->B".to_string()));
        assert!(!ids("B", None).contains(&"sequential:A->B".to_string()));
        assert!(ids("X", Some("dashboard")).contains(&"contextual:report@dashboard".to_string()));
        assert!(ids("X", None).is_empty());
    }

    #[test]
    fn test_stale_patterns_pruned() {
        let rec = recognizer();
        let start = Instant::now();
        let events: Vec<_> = (0..6)
            .map(|i| read_at("tick", start + Duration::from_secs(i * 10), None))
            .collect();
        rec.analyze_sequence(&events, start + Duration::from_secs(60));
        assert!(!rec.patterns().is_empty());

        rec.analyze_sequence(&[], start + Duration::from_secs(3600));
        assert!(rec.patterns().is_empty());
    }
}
