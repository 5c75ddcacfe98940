//! HTTP request handlers.

use super::AppState;
use crate::history::{
    build_connectivity_timeline, build_service_timelines, ServiceTimeline, TimelinePoint,
    DEFAULT_TIMELINE_POINTS, MAX_HOLDOVER_MINUTES, MAX_TIMELINE_POINTS,
};
use crate::metrics::{compute_service_uptime, ServiceUptime};
use crate::storage::{ConnectivityStatus, StatusEntry};
use crate::window::{RangeKey, Window};

use axum::{
    extract::{Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Query parameters accepted by the API. Unparsable values fall back to
/// their defaults.
#[derive(Debug, Default, Deserialize)]
pub struct ApiQuery {
    pub range: Option<String>,
    pub limit: Option<String>,
    pub points: Option<String>,
}

impl ApiQuery {
    pub fn range(&self) -> RangeKey {
        RangeKey::parse(self.range.as_deref())
    }

    /// Zero means unlimited.
    pub fn limit(&self) -> usize {
        parse_count(self.limit.as_deref())
    }

    /// Bucket count, capped at [`MAX_TIMELINE_POINTS`].
    pub fn points(&self) -> usize {
        match parse_count(self.points.as_deref()) {
            0 => DEFAULT_TIMELINE_POINTS,
            n => n.min(MAX_TIMELINE_POINTS),
        }
    }
}

fn parse_count(raw: Option<&str>) -> usize {
    raw.and_then(|s| s.trim().parse::<i64>().ok())
        .filter(|v| *v > 0)
        .map_or(0, |v| usize::try_from(v).unwrap_or(usize::MAX))
}

/// Check the bearer token when the node API is protected.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), StatusCode> {
    let Some(expected) = state.config.api_key.as_deref() else {
        return Ok(());
    };
    let provided = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);
    if provided == Some(expected) {
        Ok(())
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

// ============================================================================
// Local node
// ============================================================================

pub async fn handle_status(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.latest() {
        Some(entry) => Json(entry).into_response(),
        None => Json(json!({ "timestamp": null, "checks": [] })).into_response(),
    }
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub history: Vec<StatusEntry>,
}

/// Without `range`, returns the whole series (optionally the last `limit`
/// entries); with it, the same payload peers receive.
pub async fn handle_history(
    State(state): State<AppState>,
    Query(query): Query<ApiQuery>,
) -> impl IntoResponse {
    if query.range.is_none() {
        let history = match query.limit() {
            0 => state.store.history(),
            n => state.store.history_n(n),
        };
        return Json(HistoryResponse { history }).into_response();
    }
    Json(state.cluster.node_history(query.range(), query.limit())).into_response()
}

#[derive(Debug, Serialize)]
pub struct UptimeResponse {
    pub range: &'static str,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub services: Vec<ServiceUptime>,
}

pub async fn handle_uptime(
    State(state): State<AppState>,
    Query(query): Query<ApiQuery>,
) -> impl IntoResponse {
    let range = query.range();
    let window = range.window(Utc::now());
    let history = state.store.history_since(window.start);
    let interval = Duration::minutes(i64::from(state.config.interval_minutes));

    Json(UptimeResponse {
        range: range.as_str(),
        range_start: window.start,
        range_end: window.end,
        services: compute_service_uptime(&history, &state.config.targets, &window, interval),
    })
}

#[derive(Debug, Serialize)]
pub struct TimelineResponse {
    pub range: &'static str,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub points: usize,
    pub services: Vec<ServiceTimeline>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub connectivity: Vec<TimelinePoint>,
}

pub async fn handle_timeline(
    State(state): State<AppState>,
    Query(query): Query<ApiQuery>,
) -> impl IntoResponse {
    let range = query.range();
    let points = query.points();
    let window = range.window(Utc::now());

    let history = window.retain(state.store.history_since(window.start));
    let latest = state.store.latest();
    let services = build_service_timelines(
        &history,
        latest.as_ref(),
        &state.config.targets,
        &window,
        points,
    );

    Json(TimelineResponse {
        range: range.as_str(),
        range_start: window.start,
        range_end: window.end,
        points,
        services,
        connectivity: connectivity_timeline(&state, &window, points),
    })
}

#[derive(Debug, Serialize)]
pub struct ConnectivityResponse {
    pub enabled: bool,
    pub target: String,
    pub interval_seconds: u64,
    pub latest: Option<ConnectivityStatus>,
    pub range_start: DateTime<Utc>,
    pub range_end: DateTime<Utc>,
    pub timeline: Vec<TimelinePoint>,
}

pub async fn handle_connectivity(State(state): State<AppState>) -> impl IntoResponse {
    let window = RangeKey::Last24Hours.window(Utc::now());
    let cfg = &state.config.connectivity;

    Json(ConnectivityResponse {
        enabled: cfg.enabled,
        target: cfg.target.clone(),
        interval_seconds: cfg.interval_seconds,
        latest: state.connectivity.latest(),
        range_start: window.start,
        range_end: window.end,
        timeline: connectivity_timeline(&state, &window, DEFAULT_TIMELINE_POINTS),
    })
}

/// Samples just before the window seed the first buckets.
fn connectivity_timeline(state: &AppState, window: &Window, points: usize) -> Vec<TimelinePoint> {
    let lead_in = window.start - Duration::minutes(MAX_HOLDOVER_MINUTES);
    let samples = state.connectivity.history_since(lead_in);
    if samples.is_empty() {
        return Vec::new();
    }
    build_connectivity_timeline(&samples, window, points)
}

// ============================================================================
// Peer protocol
// ============================================================================

pub async fn handle_node_status(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(code) = authorize(&state, &headers) {
        return code.into_response();
    }
    Json(state.cluster.node_status()).into_response()
}

pub async fn handle_node_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ApiQuery>,
) -> impl IntoResponse {
    if let Err(code) = authorize(&state, &headers) {
        return code.into_response();
    }
    Json(state.cluster.node_history(query.range(), query.limit())).into_response()
}

// ============================================================================
// Cluster views
// ============================================================================

pub async fn handle_cluster(
    State(state): State<AppState>,
    Query(query): Query<ApiQuery>,
) -> impl IntoResponse {
    Json(state.cluster.snapshot(query.range()))
}

pub async fn handle_overview(
    State(state): State<AppState>,
    Query(query): Query<ApiQuery>,
) -> impl IntoResponse {
    Json(state.overview(query.limit()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{AggregatorConfig, ClusterAggregator, Node};
    use crate::config::ServerConfig;
    use crate::storage::{Check, ConnectivityStore, StatusStore};
    use crate::web::Server;
    use serde_json::Value;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::sync::watch;

    struct Harness {
        base: String,
        store: Arc<StatusStore>,
        _dir: TempDir,
        _shutdown: watch::Sender<bool>,
    }

    async fn harness(api_key: Option<&str>) -> Harness {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            data_dir: dir.path().to_path_buf(),
            node_id: "local".to_string(),
            node_name: "Local".to_string(),
            api_key: api_key.map(str::to_string),
            ..Default::default()
        };
        let store = Arc::new(StatusStore::open(config.status_history_path()).unwrap());
        let connectivity =
            Arc::new(ConnectivityStore::open(config.connectivity_history_path()).unwrap());
        let cluster = ClusterAggregator::new(
            Node {
                id: config.node_id.clone(),
                name: config.node_name.clone(),
                interval_minutes: config.interval_minutes,
                connectivity_interval_seconds: None,
            },
            config.targets.clone(),
            store.clone(),
            connectivity.clone(),
            Vec::new(),
            AggregatorConfig::from_server(&config),
        )
        .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = Server::new(AppState {
            config: Arc::new(config),
            store: store.clone(),
            connectivity,
            cluster: Arc::new(cluster),
            shutdown: shutdown_rx,
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = server.routes();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        Harness {
            base: format!("http://{}", addr),
            store,
            _dir: dir,
            _shutdown: shutdown_tx,
        }
    }

    async fn get_json(url: &str) -> Value {
        let resp = reqwest::get(url).await.unwrap();
        assert!(resp.status().is_success(), "{} -> {}", url, resp.status());
        resp.json().await.unwrap()
    }

    fn append_example(store: &StatusStore, ok: bool) {
        tokio_test::assert_ok!(store.append(StatusEntry {
            timestamp: Utc::now(),
            checks: vec![Check {
                id: "example".to_string(),
                name: "Example Service".to_string(),
                ok,
                state: if ok { "active" } else { "failed" }.to_string(),
                ..Default::default()
            }],
        }));
    }

    #[test]
    fn test_query_parsing() {
        let q = ApiQuery {
            range: Some("30d".to_string()),
            limit: Some("-3".to_string()),
            points: Some("abc".to_string()),
        };
        assert_eq!(q.range(), RangeKey::Last30Days);
        assert_eq!(q.limit(), 0);
        assert_eq!(q.points(), DEFAULT_TIMELINE_POINTS);
        assert_eq!(parse_count(Some(" 12 ")), 12);

        let huge = ApiQuery {
            points: Some("4294967296".to_string()),
            ..Default::default()
        };
        assert_eq!(huge.points(), MAX_TIMELINE_POINTS);
    }

    #[tokio::test]
    async fn test_status_endpoint() {
        let h = harness(None).await;

        let empty = get_json(&format!("{}/api/status", h.base)).await;
        assert_eq!(empty, json!({ "timestamp": null, "checks": [] }));

        append_example(&h.store, true);
        let status = get_json(&format!("{}/api/status", h.base)).await;
        assert_eq!(status["checks"][0]["id"], "example");
        assert_eq!(status["checks"][0]["ok"], true);
    }

    #[tokio::test]
    async fn test_aggregate_endpoints() {
        let h = harness(None).await;
        append_example(&h.store, false);

        let uptime = get_json(&format!("{}/api/uptime?range=bogus", h.base)).await;
        assert_eq!(uptime["range"], "24h");
        assert_eq!(uptime["services"][0]["id"], "example");
        assert_eq!(uptime["services"][0]["passing"], 0);

        let timeline = get_json(&format!("{}/api/timeline?points=10", h.base)).await;
        let points = timeline["services"][0]["timeline"].as_array().unwrap();
        assert_eq!(points.len(), 10);
        assert_eq!(points[9]["class"], "error");

        let clamped = get_json(&format!("{}/api/timeline?points=4294967296", h.base)).await;
        assert_eq!(clamped["points"], MAX_TIMELINE_POINTS);
        assert_eq!(
            clamped["services"][0]["timeline"].as_array().unwrap().len(),
            MAX_TIMELINE_POINTS
        );

        let history = get_json(&format!("{}/api/history?range=30d", h.base)).await;
        assert_eq!(history["range"], "30d");
        assert_eq!(history["history"].as_array().unwrap().len(), 1);

        append_example(&h.store, true);
        let all = get_json(&format!("{}/api/history", h.base)).await;
        assert_eq!(all["history"].as_array().unwrap().len(), 2);
        let last = get_json(&format!("{}/api/history?limit=1", h.base)).await;
        assert_eq!(last["history"][0]["checks"][0]["ok"], true);

        let connectivity = get_json(&format!("{}/api/connectivity", h.base)).await;
        assert_eq!(connectivity["enabled"], false);
        assert!(connectivity["latest"].is_null());

        let cluster = get_json(&format!("{}/api/cluster", h.base)).await;
        assert_eq!(cluster["nodes"].as_array().unwrap().len(), 1);
        assert_eq!(cluster["nodes"][0]["source"], "local");

        let overview = get_json(&format!("{}/api/overview?limit=5", h.base)).await;
        assert_eq!(overview["bucket_seconds"], 600);
        assert_eq!(overview["items"][0]["node_id"], "local");
        assert_eq!(overview["items"][0]["buckets"][2]["state"], "issue");
    }

    #[tokio::test]
    async fn test_overview_ws_rejects_cross_origin() {
        let h = harness(None).await;
        let resp = reqwest::Client::new()
            .get(format!("{}/api/overview/ws", h.base))
            .header("connection", "upgrade")
            .header("upgrade", "websocket")
            .header("sec-websocket-version", "13")
            .header("sec-websocket-key", "dGhlIHNhbXBsZSBub25jZQ==")
            .header("origin", "http://evil.example")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_node_api_requires_bearer() {
        let h = harness(Some("secret")).await;
        let client = reqwest::Client::new();
        let url = format!("{}/api/node/status", h.base);

        let denied = client.get(&url).send().await.unwrap();
        assert_eq!(denied.status(), reqwest::StatusCode::UNAUTHORIZED);

        let wrong = client.get(&url).bearer_auth("nope").send().await.unwrap();
        assert_eq!(wrong.status(), reqwest::StatusCode::UNAUTHORIZED);

        let allowed = client.get(&url).bearer_auth("secret").send().await.unwrap();
        assert!(allowed.status().is_success());
        let body: Value = allowed.json().await.unwrap();
        assert_eq!(body["node"]["id"], "local");

        let history = client
            .get(format!("{}/api/node/history?range=30d&limit=5", h.base))
            .bearer_auth("secret")
            .send()
            .await
            .unwrap();
        assert!(history.status().is_success());

        // Local endpoints stay open.
        get_json(&format!("{}/api/status", h.base)).await;
    }
}
