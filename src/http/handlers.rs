//! Route handlers: thin translation between HTTP and the core components.

use axum::extract::{ConnectInfo, Query, State};
use axum::response::IntoResponse;
use axum::Json;
use chrono::Utc;
use dashmap::DashMap;
use http::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::detect;
use crate::ratelimit::{IdentifierSnapshot, IdentifierStatus, LimitSource, WindowLimiter};

use super::state::{AppState, LastClient};

/// Policy applied to a discovered URL when detection yields nothing usable.
const FALLBACK_URL_LIMIT: u32 = 60;
const FALLBACK_URL_WINDOW_SECS: u64 = 3600;

#[derive(Debug, Deserialize)]
pub(super) struct ClientParams {
    /// Identifier override, for exercising admission without many clients
    ip: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(super) struct TestUrlRequest {
    url: Option<String>,
    #[serde(default = "default_method")]
    method: String,
}

#[derive(Debug, Deserialize)]
pub(super) struct TestCustomRequest {
    url: Option<String>,
    #[serde(default = "default_method")]
    method: String,
    #[serde(default = "default_custom_limit")]
    limit: u32,
    #[serde(default = "default_custom_window")]
    window: u64,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_custom_limit() -> u32 {
    10
}

fn default_custom_window() -> u64 {
    60
}

pub(super) async fn index() -> impl IntoResponse {
    Json(json!({
        "service": "floodgate",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": {
            "home": { "method": "GET", "path": "/home", "description": "Admission-gated demo endpoint; ?ip= overrides the identifier" },
            "monitor": { "method": "GET", "path": "/monitor", "description": "Tracked client identifiers and their status" },
            "monitor_urls": { "method": "GET", "path": "/monitor-urls", "description": "Tracked tested URLs and their status" },
            "monitor_custom": { "method": "GET", "path": "/monitor-custom", "description": "Tracked custom endpoints and their status" },
            "test_url": { "method": "POST", "path": "/test-url", "description": "Probe a URL once and adopt its detected limits", "body": { "url": "required", "method": "optional, default GET" } },
            "test_custom": { "method": "POST", "path": "/test-custom", "description": "Exercise an endpoint under caller-chosen limits", "body": { "url": "required", "method": "optional", "limit": "optional, default 10", "window": "optional seconds, default 60" } },
            "analytics": { "method": "GET", "path": "/analytics", "description": "Aggregate counts across all limiters" },
            "health": { "method": "GET", "path": "/health", "description": "Liveness and uptime" },
            "clear_data": { "method": "POST", "path": "/clear-data", "description": "Drop all limiter state and counters" },
        },
    }))
}

pub(super) async fn home(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(params): Query<ClientParams>,
) -> impl IntoResponse {
    let client = client_identifier(&params, peer);
    let result = state.clients.check_limit(&client);
    if !result.allowed {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "Too Many Requests",
                "message": format!(
                    "Rate limit exceeded. Try again in {} seconds.",
                    result.time_left_secs
                ),
                "time_left_secs": result.time_left_secs,
            })),
        );
    }

    state.admitted_clients.fetch_add(1, Ordering::Relaxed);
    let client_info = state.client_info(&client).await;
    (
        StatusCode::OK,
        Json(json!({
            "message": "Welcome to the home page!",
            "client": client,
            "client_info": client_info,
            "current_count": result.current_count,
            "timestamp": Utc::now(),
        })),
    )
}

pub(super) async fn monitor(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let data = state.clients.entries();
    Json(json!({
        "endpoint": "/monitor",
        "total_tracked": data.len(),
        "data": data,
    }))
}

pub(super) async fn monitor_urls(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let data = url_rows(state.urls.entries(), &state.last_client_for_url);
    Json(json!({
        "endpoint": "/monitor-urls",
        "total_tracked": data.len(),
        "data": data,
    }))
}

pub(super) async fn monitor_custom(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let data = url_rows(state.custom.entries(), &state.last_client_for_custom);
    Json(json!({
        "endpoint": "/monitor-custom",
        "total_tracked": data.len(),
        "data": data,
    }))
}

pub(super) async fn test_url(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(params): Query<ClientParams>,
    Json(body): Json<TestUrlRequest>,
) -> impl IntoResponse {
    let Some(url) = body.url.filter(|u| !u.is_empty()) else {
        return bad_request("url is required");
    };
    let Some(method) = parse_method(&body.method) else {
        return bad_request(&format!("unsupported method '{}'", body.method));
    };

    // Admission applies once limits are known; the first contact is a
    // discovery pass and goes through unchecked.
    if let Some(existing) = state.urls.configured_limits(&url) {
        let result = state.urls.check_limit(&url);
        if !result.allowed {
            return (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({
                    "error": "Too Many Requests",
                    "message": format!(
                        "Rate limit exceeded for {url}. Try again in {} seconds.",
                        result.time_left_secs
                    ),
                    "time_left_secs": result.time_left_secs,
                    "url": url,
                    "detected_limits": existing,
                })),
            );
        }
    }

    state.admitted_urls.fetch_add(1, Ordering::Relaxed);
    let client = client_identifier(&params, peer);
    let client_info = state.client_info(&client).await;
    state.last_client_for_url.insert(
        url.clone(),
        LastClient {
            client: client.clone(),
            info: client_info.clone(),
            at: Utc::now(),
        },
    );

    let started = Instant::now();
    match state.http.request(method.clone(), &url).send().await {
        Ok(response) => {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let status = response.status();
            let headers = response.headers().clone();
            let detection = detect::detect(&headers, status);

            let applied = match (detection.limit, detection.window_secs) {
                (Some(limit), Some(window)) if limit > 0 && window > 0 => {
                    apply_limits(&state.urls, &url, limit, window, LimitSource::Detected);
                    (limit, window)
                }
                _ => {
                    apply_limits(
                        &state.urls,
                        &url,
                        FALLBACK_URL_LIMIT,
                        FALLBACK_URL_WINDOW_SECS,
                        LimitSource::Default,
                    );
                    (FALLBACK_URL_LIMIT, FALLBACK_URL_WINDOW_SECS)
                }
            };

            let current = state.urls.current_usage(&url);
            (
                StatusCode::OK,
                Json(json!({
                    "message": "URL request successful!",
                    "url": url,
                    "method": method.as_str(),
                    "client": client,
                    "client_info": client_info,
                    "timestamp": Utc::now(),
                    "response_status": status.as_u16(),
                    "response_time_ms": elapsed_ms,
                    "rate_limit_info": {
                        "detected": &detection,
                        "applied": {
                            "limit": applied.0,
                            "window_secs": applied.1,
                            "remaining": detection.remaining,
                            "reset_time": detection.reset_time,
                        },
                    },
                    "current_usage": { "request_count": current, "allowed": true },
                    "response_headers": detect::rate_limit_headers(&headers),
                })),
            )
        }
        Err(err) => {
            warn!(url = %url, error = %err, "upstream request failed");
            let current = state.urls.current_usage(&url);
            (
                StatusCode::OK,
                Json(json!({
                    "message": "Rate limit test completed (URL may be unreachable)",
                    "url": url,
                    "method": method.as_str(),
                    "client": client,
                    "client_info": client_info,
                    "timestamp": Utc::now(),
                    "error": err.to_string(),
                    "rate_limit_info": {
                        "detected": {
                            "limit": null,
                            "window_secs": null,
                            "source": "failed_request",
                            "error": err.to_string(),
                        },
                        "applied": {
                            "limit": FALLBACK_URL_LIMIT,
                            "window_secs": FALLBACK_URL_WINDOW_SECS,
                        },
                    },
                    "current_usage": { "request_count": current, "allowed": true },
                })),
            )
        }
    }
}

pub(super) async fn test_custom(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(params): Query<ClientParams>,
    Json(body): Json<TestCustomRequest>,
) -> impl IntoResponse {
    let Some(url) = body.url.filter(|u| !u.is_empty()) else {
        return bad_request("url is required");
    };
    let Some(method) = parse_method(&body.method) else {
        return bad_request(&format!("unsupported method '{}'", body.method));
    };

    if let Err(err) =
        state
            .custom
            .set_limits(&url, body.limit, Duration::from_secs(body.window), LimitSource::Custom)
    {
        return bad_request(&err.to_string());
    }

    let result = state.custom.check_limit(&url);
    if !result.allowed {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            Json(json!({
                "error": "Too Many Requests",
                "message": format!(
                    "Rate limit exceeded for {url}. Try again in {} seconds.",
                    result.time_left_secs
                ),
                "time_left_secs": result.time_left_secs,
                "url": url,
                "custom_limits": { "limit": body.limit, "window_secs": body.window },
            })),
        );
    }

    state.admitted_custom.fetch_add(1, Ordering::Relaxed);
    let client = client_identifier(&params, peer);
    let client_info = state.client_info(&client).await;
    state.last_client_for_custom.insert(
        url.clone(),
        LastClient {
            client: client.clone(),
            info: client_info.clone(),
            at: Utc::now(),
        },
    );

    let started = Instant::now();
    let mut request = state.http.request(method.clone(), &url);
    if matches!(method, Method::POST | Method::PUT | Method::PATCH) {
        request = request.json(&json!({
            "test": true,
            "timestamp": Utc::now().timestamp_millis(),
        }));
    }

    match request.send().await {
        Ok(response) => {
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let status = response.status();
            let headers = response.headers().clone();

            // An upstream 429 with usable headers replaces the caller's policy.
            if status == StatusCode::TOO_MANY_REQUESTS {
                let detection = detect::detect(&headers, status);
                if let (Some(limit), Some(window)) = (detection.limit, detection.window_secs) {
                    if limit > 0 && window > 0 {
                        apply_limits(&state.custom, &url, limit, window, LimitSource::Detected);
                        let current = state.custom.current_usage(&url);
                        return (
                            StatusCode::TOO_MANY_REQUESTS,
                            Json(json!({
                                "error": "Too Many Requests",
                                "message": format!(
                                    "Rate limit detected from server: {limit} requests/{window}s"
                                ),
                                "url": url,
                                "method": method.as_str(),
                                "client": client,
                                "client_info": client_info,
                                "timestamp": Utc::now(),
                                "response_status": status.as_u16(),
                                "response_time_ms": elapsed_ms,
                                "detected_limits": &detection,
                                "custom_limits": {
                                    "configured": { "limit": body.limit, "window_secs": body.window },
                                    "detected": { "limit": limit, "window_secs": window },
                                    "current": current,
                                    "remaining": limit.saturating_sub(current),
                                },
                                "current_usage": { "request_count": current, "allowed": false },
                                "note": "Server returned 429 - actual limits detected and applied",
                            })),
                        );
                    }
                }
            }

            let current = state.custom.current_usage(&url);
            (
                StatusCode::OK,
                Json(json!({
                    "message": "Custom endpoint test successful!",
                    "url": url,
                    "method": method.as_str(),
                    "client": client,
                    "client_info": client_info,
                    "timestamp": Utc::now(),
                    "response_status": status.as_u16(),
                    "response_time_ms": elapsed_ms,
                    "custom_limits": {
                        "limit": body.limit,
                        "window_secs": body.window,
                        "current": current,
                        "remaining": body.limit.saturating_sub(current),
                    },
                    "current_usage": { "request_count": current, "allowed": true },
                })),
            )
        }
        Err(err) => {
            warn!(url = %url, error = %err, "upstream request failed");
            let current = state.custom.current_usage(&url);
            (
                StatusCode::OK,
                Json(json!({
                    "message": "Custom endpoint test completed (URL may be unreachable)",
                    "url": url,
                    "method": method.as_str(),
                    "client": client,
                    "client_info": client_info,
                    "timestamp": Utc::now(),
                    "error": err.to_string(),
                    "custom_limits": {
                        "limit": body.limit,
                        "window_secs": body.window,
                        "current": current,
                        "remaining": body.limit.saturating_sub(current),
                    },
                    "current_usage": { "request_count": current, "allowed": true },
                })),
            )
        }
    }
}

pub(super) async fn analytics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let url_rows = state.urls.entries();
    let custom_rows = state.custom.entries();
    let clients = state.admitted_clients.load(Ordering::Relaxed);
    let urls = state.admitted_urls.load(Ordering::Relaxed);
    let custom = state.admitted_custom.load(Ordering::Relaxed);

    Json(json!({
        "total_urls": url_rows.len(),
        "total_custom_endpoints": custom_rows.len(),
        "blocked_urls": count_blocked(&url_rows),
        "blocked_custom": count_blocked(&custom_rows),
        "total_requests": clients + urls + custom,
        "breakdown": { "clients": clients, "urls": urls, "custom": custom },
        "detected_limits": url_rows
            .iter()
            .filter(|row| row.limits.source == LimitSource::Detected)
            .count(),
        "timestamp": Utc::now(),
    }))
}

pub(super) async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.uptime_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now(),
    }))
}

pub(super) async fn clear_data(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.clear();
    info!("all rate limiter data cleared");
    Json(json!({
        "message": "All rate limiter data cleared",
        "timestamp": Utc::now(),
    }))
}

/// Identifier for the caller: the `?ip=` override when present, otherwise
/// the peer address with loopback normalized to `localhost`.
fn client_identifier(params: &ClientParams, peer: SocketAddr) -> String {
    if let Some(ip) = params.ip.as_deref().filter(|ip| !ip.is_empty()) {
        return ip.to_string();
    }
    let ip = peer.ip().to_canonical();
    if ip.is_loopback() {
        "localhost".to_string()
    } else {
        ip.to_string()
    }
}

fn parse_method(raw: &str) -> Option<Method> {
    Method::from_bytes(raw.to_uppercase().as_bytes()).ok()
}

fn bad_request(message: &str) -> (StatusCode, Json<Value>) {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "error": "Bad Request",
            "message": message,
        })),
    )
}

fn apply_limits(
    limiter: &WindowLimiter,
    id: &str,
    limit: u32,
    window_secs: u64,
    source: LimitSource,
) {
    if let Err(err) = limiter.set_limits(id, limit, Duration::from_secs(window_secs), source) {
        warn!(id = %id, error = %err, "ignoring unusable limits");
    }
}

fn count_blocked(rows: &[IdentifierSnapshot]) -> usize {
    rows.iter()
        .filter(|row| row.status == IdentifierStatus::Blocked)
        .count()
}

fn url_rows(rows: Vec<IdentifierSnapshot>, last_clients: &DashMap<String, LastClient>) -> Vec<Value> {
    rows.into_iter()
        .map(|snapshot| {
            let last_client = last_clients
                .get(&snapshot.id)
                .map(|entry| entry.value().clone());
            json!({
                "url": snapshot.id,
                "current_count": snapshot.current_count,
                "status": snapshot.status,
                "time_left_secs": snapshot.time_left_secs,
                "last_request_at": snapshot.last_request_at,
                "limits": snapshot.limits,
                "last_client": last_client,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(ip: Option<&str>) -> ClientParams {
        ClientParams {
            ip: ip.map(str::to_string),
        }
    }

    #[test]
    fn test_client_identifier_prefers_query_override() {
        let peer: SocketAddr = "10.1.2.3:5000".parse().unwrap();
        assert_eq!(client_identifier(&params(Some("test-ip-9")), peer), "test-ip-9");
        assert_eq!(client_identifier(&params(Some("")), peer), "10.1.2.3");
    }

    #[test]
    fn test_client_identifier_normalizes_loopback() {
        let v4: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let v6: SocketAddr = "[::1]:5000".parse().unwrap();
        let mapped: SocketAddr = "[::ffff:127.0.0.1]:5000".parse().unwrap();

        assert_eq!(client_identifier(&params(None), v4), "localhost");
        assert_eq!(client_identifier(&params(None), v6), "localhost");
        assert_eq!(client_identifier(&params(None), mapped), "localhost");
    }

    #[test]
    fn test_parse_method_uppercases() {
        assert_eq!(parse_method("get"), Some(Method::GET));
        assert_eq!(parse_method("Delete"), Some(Method::DELETE));
        assert!(parse_method("b@d").is_none());
    }
}
