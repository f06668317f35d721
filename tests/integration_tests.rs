//! Integration tests for prefetching and the HTTP API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use predictive_cache::cache::patterns::PatternType;
use predictive_cache::cache::store::{CacheStore, PrefetchLoader, SetOptions, SharedCache};
use predictive_cache::config::Config;
use predictive_cache::server::api::{build_router, AppState};
use predictive_cache::server::metrics::CacheMetrics;

fn new_store() -> SharedCache {
    CacheStore::new(Arc::new(Config::default()))
}

/// Read A then miss B enough times for the A → B transition to be learned.
fn train_sequence(store: &CacheStore) {
    store.set("A", &json!("a"), SetOptions::default()).unwrap();
    for _ in 0..3 {
        assert!(store.get("A", None).is_some());
        assert!(store.get("B", None).is_none());
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// Loader that counts calls and answers after a delay.
struct SlowLoader {
    calls: AtomicUsize,
    delay: Duration,
    value: Value,
}

#[async_trait]
impl PrefetchLoader for SlowLoader {
    async fn load(&self, _key: &str, _context: Option<&str>) -> anyhow::Result<Option<Value>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        Ok(Some(self.value.clone()))
    }
}

#[tokio::test]
async fn test_learned_sequence_prefetches_follower() {
    let store = new_store();
    store.register_loader(
        "B",
        Arc::new(|_: &str, _: Option<&str>| -> anyhow::Result<Option<Value>> {
            Ok(Some(json!("b")))
        }),
    );

    train_sequence(&store);
    let patterns = store.get_patterns();
    assert!(patterns
        .iter()
        .any(|p| p.pattern_type == PatternType::Sequential && p.id == "sequential:A->B"));

    assert!(store.get("A", None).is_some());
    assert!(wait_for(|| store.has("B")).await);

    assert_eq!(store.get("B", None), Some(json!("b")));
    let stats = store.stats();
    assert_eq!(stats.prefetch_scheduled, 1);
    assert_eq!(stats.prefetch_completed, 1);
    assert_eq!(stats.prefetch_hits, 1);

    // Only the first hit counts as a prefetch hit.
    store.get("B", None);
    assert_eq!(store.stats().prefetch_hits, 1);
}

// Paused so every event shares one instant and no timing pattern forms.
#[tokio::test(start_paused = true)]
async fn test_context_prefetches_key_read_under_it() {
    let store = new_store();
    store.register_loader(
        "report",
        Arc::new(|_: &str, context: Option<&str>| -> anyhow::Result<Option<Value>> {
            Ok(Some(json!({"report": context})))
        }),
    );

    let dashboard = SetOptions {
        context: Some("dashboard".to_string()),
        ..Default::default()
    };
    store.set("report", &json!("r"), dashboard).unwrap();
    for _ in 0..3 {
        assert!(store.get("report", Some("dashboard")).is_some());
    }
    store.delete("report");
    store.set("home", &json!("h"), SetOptions::default()).unwrap();

    let found = store.run_pattern_analysis();
    assert!(found
        .iter()
        .any(|p| p.pattern_type == PatternType::Contextual && p.id == "contextual:report@dashboard"));

    // Reading another key under a different context predicts nothing.
    assert!(store.get("home", Some("billing")).is_some());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!store.has("report"));

    assert!(store.get("home", Some("dashboard")).is_some());
    assert!(wait_for(|| store.has("report")).await);
    assert_eq!(store.get("report", None), Some(json!({"report": "dashboard"})));
    assert_eq!(store.stats().prefetch_hits, 1);
}

#[tokio::test]
async fn test_set_supersedes_inflight_prefetch() {
    let store = new_store();
    let loader = Arc::new(SlowLoader {
        calls: AtomicUsize::new(0),
        delay: Duration::from_millis(50),
        value: json!("stale"),
    });
    store.register_loader("B", loader.clone());

    train_sequence(&store);
    store.get("A", None);

    store.set("B", &json!("fresh"), SetOptions::default()).unwrap();
    store.delete("B");

    assert!(wait_for(|| loader.calls.load(Ordering::SeqCst) == 1).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(!store.has("B"));
    assert_eq!(store.stats().prefetch_completed, 0);
}

#[tokio::test]
async fn test_prefetch_does_not_overwrite_caller_value() {
    let store = new_store();
    store.register_loader(
        "B",
        Arc::new(SlowLoader {
            calls: AtomicUsize::new(0),
            delay: Duration::from_millis(20),
            value: json!("stale"),
        }),
    );

    train_sequence(&store);
    store.get("A", None);
    store.set("B", &json!("fresh"), SetOptions::default()).unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(store.get("B", None), Some(json!("fresh")));
}

#[tokio::test]
async fn test_failing_loader_is_counted_not_raised() {
    let store = new_store();
    store.register_loader(
        "B",
        Arc::new(|_: &str, _: Option<&str>| -> anyhow::Result<Option<Value>> {
            anyhow::bail!("origin timeout")
        }),
    );

    train_sequence(&store);
    assert_eq!(store.get("A", None), Some(json!("a")));

    assert!(wait_for(|| store.stats().prefetch_failed == 1).await);
    assert!(!store.has("B"));
}

#[tokio::test]
async fn test_prefetch_disabled() {
    let mut config = Config::default();
    config.prefetch.enabled = false;
    let store = CacheStore::new(Arc::new(config));
    store.register_loader(
        "B",
        Arc::new(|_: &str, _: Option<&str>| -> anyhow::Result<Option<Value>> {
            Ok(Some(json!("b")))
        }),
    );

    train_sequence(&store);
    store.get("A", None);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!store.has("B"));
    assert_eq!(store.stats().prefetch_scheduled, 0);
}

// ─── HTTP API ──────────────────────────────────────────────────────────────

fn app_with(store: SharedCache) -> Router {
    build_router(Arc::new(AppState {
        cache: store,
        metrics: CacheMetrics::new().unwrap(),
        start_time: Instant::now(),
    }))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Vec<u8>) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, bytes.to_vec())
}

#[tokio::test]
async fn test_http_item_lifecycle() {
    let app = app_with(new_store());

    let (status, _) = send(
        &app,
        "PUT",
        "/v1/cache/user:1",
        Some(json!({"value": {"name": "ada"}, "ttl_ms": 60000, "tags": ["user"]})),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(&app, "GET", "/v1/cache/user:1?context=profile", None).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, json!({"key": "user:1", "value": {"name": "ada"}}));

    let (status, body) = send(&app, "GET", "/v1/cache/user:1/exists", None).await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["exists"], json!(true));

    let (status, _) = send(&app, "DELETE", "/v1/cache/user:1", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, "GET", "/v1/cache/user:1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, "DELETE", "/v1/cache/user:1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_http_rejected_set_is_insufficient_storage() {
    let mut config = Config::default();
    config.memory.max_bytes = 64;
    let app = app_with(CacheStore::new(Arc::new(config)));

    let (status, body) = send(
        &app,
        "PUT",
        "/v1/cache/big",
        Some(json!({"value": "x".repeat(200)})),
    )
    .await;
    assert_eq!(status, StatusCode::INSUFFICIENT_STORAGE);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert!(body["error"].as_str().unwrap().contains("big"));
}

#[tokio::test]
async fn test_http_warmup_and_clear() {
    let store = new_store();
    store.register_loader(
        "cfg",
        Arc::new(|_: &str, _: Option<&str>| -> anyhow::Result<Option<Value>> {
            Ok(Some(json!({"flag": true})))
        }),
    );
    let app = app_with(store.clone());

    let (status, body) = send(
        &app,
        "POST",
        "/v1/cache/warmup",
        Some(json!({"keys": ["cfg", "unknown"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, json!({"requested": 2, "loaded": 1}));
    assert!(store.has("cfg"));

    let (status, _) = send(&app, "POST", "/v1/cache/clear", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert_eq!(store.size(), 0);
}

#[tokio::test]
async fn test_http_stats_patterns_metrics_health() {
    let store = new_store();
    train_sequence(&store);
    let app = app_with(store);

    let (status, body) = send(&app, "GET", "/v1/cache/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    let stats: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(stats["item_count"], json!(1));
    assert_eq!(stats["counters"]["hits"], json!(3));
    assert_eq!(stats["counters"]["misses"], json!(3));
    assert!(stats["hit_rate"].as_f64().is_some());

    let (status, body) = send(&app, "GET", "/v1/cache/patterns", None).await;
    assert_eq!(status, StatusCode::OK);
    let patterns: Value = serde_json::from_slice(&body).unwrap();
    assert!(patterns
        .as_array()
        .unwrap()
        .iter()
        .any(|p| p["id"] == json!("sequential:A->B") && p["pattern_type"] == json!("sequential")));

    let (status, body) = send(&app, "GET", "/metrics", None).await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("predictive_cache_items 1"));
    assert!(text.contains("predictive_cache_events{event=\"miss\"} 3"));

    let (status, body) = send(&app, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    let health: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(health["status"], json!("ok"));
    assert_eq!(health["items"], json!(1));
}
