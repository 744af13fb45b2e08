//! End-to-end tests for the HTTP API.
//!
//! Each test starts a real server on an ephemeral port and drives it with a
//! plain reqwest client. Upstream targets are wiremock servers, so nothing
//! here touches the network.

use serde_json::{json, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use floodgate::config::FloodgateConfig;
use floodgate::http::{AppState, HttpServer};

async fn start_server(config: FloodgateConfig) -> (String, CancellationToken) {
    let state = Arc::new(AppState::new(config).unwrap());
    let server = HttpServer::bind("127.0.0.1:0".parse().unwrap(), state)
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        server
            .serve_with_shutdown(signal.cancelled_owned())
            .await
            .unwrap();
    });

    (format!("http://{addr}"), shutdown)
}

async fn get_json(client: &reqwest::Client, url: &str) -> (u16, Value) {
    let response = client.get(url).send().await.unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap())
}

async fn post_json(client: &reqwest::Client, url: &str, body: Value) -> (u16, Value) {
    let response = client.post(url).json(&body).send().await.unwrap();
    let status = response.status().as_u16();
    (status, response.json().await.unwrap())
}

#[tokio::test]
async fn test_home_admits_up_to_limit_then_blocks() {
    let (base, shutdown) = start_server(FloodgateConfig::default()).await;
    let client = reqwest::Client::new();

    for expected in 1..=3 {
        let (status, body) = get_json(&client, &format!("{base}/home")).await;
        assert_eq!(status, 200);
        assert_eq!(body["message"], "Welcome to the home page!");
        assert_eq!(body["client"], "localhost");
        assert_eq!(body["client_info"]["source"], "local");
        assert_eq!(body["current_count"], expected);
    }

    let (status, body) = get_json(&client, &format!("{base}/home")).await;
    assert_eq!(status, 429);
    assert_eq!(body["error"], "Too Many Requests");
    let time_left = body["time_left_secs"].as_u64().unwrap();
    assert!((59..=60).contains(&time_left));

    let (status, monitor) = get_json(&client, &format!("{base}/monitor")).await;
    assert_eq!(status, 200);
    assert_eq!(monitor["total_tracked"], 1);
    assert_eq!(monitor["data"][0]["id"], "localhost");
    assert_eq!(monitor["data"][0]["status"], "blocked");
    assert_eq!(monitor["data"][0]["limits"]["source"], "default");

    shutdown.cancel();
}

#[tokio::test]
async fn test_url_discovery_applies_detected_limits() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("x-ratelimit-limit", "2")
                .insert_header("x-ratelimit-remaining", "1")
                .insert_header("x-ratelimit-reset", "60"),
        )
        .mount(&upstream)
        .await;

    let (base, shutdown) = start_server(FloodgateConfig::default()).await;
    let client = reqwest::Client::new();
    let body = json!({ "url": upstream.uri() });

    // First contact is a discovery pass: nothing is configured yet, so it
    // bypasses admission and learns the limits from the response.
    let (status, first) = post_json(&client, &format!("{base}/test-url"), body.clone()).await;
    assert_eq!(status, 200);
    assert_eq!(first["message"], "URL request successful!");
    assert_eq!(first["rate_limit_info"]["detected"]["limit"], 2);
    assert_eq!(first["rate_limit_info"]["detected"]["source"], "x-ratelimit");
    assert_eq!(first["rate_limit_info"]["detected"]["window_secs"], 60);
    assert_eq!(first["rate_limit_info"]["applied"]["limit"], 2);
    assert_eq!(first["current_usage"]["request_count"], 0);
    assert_eq!(first["response_headers"]["x-ratelimit-limit"], "2");

    // The detected limit of 2 now gates admission.
    for expected in 1..=2 {
        let (status, ok) = post_json(&client, &format!("{base}/test-url"), body.clone()).await;
        assert_eq!(status, 200);
        assert_eq!(ok["current_usage"]["request_count"], expected);
    }

    let (status, denied) = post_json(&client, &format!("{base}/test-url"), body.clone()).await;
    assert_eq!(status, 429);
    assert_eq!(denied["error"], "Too Many Requests");
    assert_eq!(denied["detected_limits"]["max_requests"], 2);
    assert_eq!(denied["detected_limits"]["source"], "detected");

    let (_, monitor) = get_json(&client, &format!("{base}/monitor-urls")).await;
    assert_eq!(monitor["total_tracked"], 1);
    assert_eq!(monitor["data"][0]["url"], upstream.uri());
    assert_eq!(monitor["data"][0]["status"], "blocked");
    assert_eq!(monitor["data"][0]["limits"]["max_requests"], 2);
    assert_eq!(monitor["data"][0]["limits"]["source"], "detected");
    assert_eq!(monitor["data"][0]["last_client"]["client"], "localhost");

    let (_, analytics) = get_json(&client, &format!("{base}/analytics")).await;
    assert_eq!(analytics["total_urls"], 1);
    assert_eq!(analytics["blocked_urls"], 1);
    assert_eq!(analytics["detected_limits"], 1);
    assert_eq!(analytics["breakdown"]["urls"], 3);

    shutdown.cancel();
}

#[tokio::test]
async fn test_custom_endpoint_enforces_caller_limits() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let (base, shutdown) = start_server(FloodgateConfig::default()).await;
    let client = reqwest::Client::new();
    let body = json!({ "url": upstream.uri(), "method": "POST", "limit": 2, "window": 60 });

    for expected in 1..=2 {
        let (status, ok) = post_json(&client, &format!("{base}/test-custom"), body.clone()).await;
        assert_eq!(status, 200);
        assert_eq!(ok["message"], "Custom endpoint test successful!");
        assert_eq!(ok["custom_limits"]["limit"], 2);
        assert_eq!(ok["custom_limits"]["current"], expected);
        assert_eq!(ok["custom_limits"]["remaining"], 2 - expected);
    }

    let (status, denied) = post_json(&client, &format!("{base}/test-custom"), body.clone()).await;
    assert_eq!(status, 429);
    assert_eq!(denied["custom_limits"]["limit"], 2);
    let time_left = denied["time_left_secs"].as_u64().unwrap();
    assert!((59..=60).contains(&time_left));

    let (_, monitor) = get_json(&client, &format!("{base}/monitor-custom")).await;
    assert_eq!(monitor["total_tracked"], 1);
    assert_eq!(monitor["data"][0]["status"], "blocked");
    assert_eq!(monitor["data"][0]["limits"]["source"], "custom");
    assert_eq!(monitor["data"][0]["last_client"]["client"], "localhost");

    shutdown.cancel();
}

#[tokio::test]
async fn test_custom_endpoint_adopts_upstream_429_limits() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(429)
                .insert_header("x-ratelimit-limit", "5")
                .insert_header("x-ratelimit-reset", "120"),
        )
        .mount(&upstream)
        .await;

    let (base, shutdown) = start_server(FloodgateConfig::default()).await;
    let client = reqwest::Client::new();
    let body = json!({ "url": upstream.uri(), "method": "POST", "limit": 10, "window": 60 });

    let (status, adopted) = post_json(&client, &format!("{base}/test-custom"), body).await;
    assert_eq!(status, 429);
    assert_eq!(
        adopted["note"],
        "Server returned 429 - actual limits detected and applied"
    );
    assert_eq!(adopted["detected_limits"]["limit"], 5);
    assert_eq!(adopted["detected_limits"]["window_secs"], 120);
    assert_eq!(adopted["custom_limits"]["configured"]["limit"], 10);
    assert_eq!(adopted["custom_limits"]["detected"]["limit"], 5);
    assert_eq!(adopted["custom_limits"]["current"], 1);
    assert_eq!(adopted["custom_limits"]["remaining"], 4);
    assert_eq!(adopted["current_usage"]["allowed"], false);

    // The adopted policy replaces the caller's configuration.
    let (_, monitor) = get_json(&client, &format!("{base}/monitor-custom")).await;
    assert_eq!(monitor["data"][0]["limits"]["max_requests"], 5);
    assert_eq!(monitor["data"][0]["limits"]["window_secs"], 120);
    assert_eq!(monitor["data"][0]["limits"]["source"], "detected");

    shutdown.cancel();
}

#[tokio::test]
async fn test_custom_endpoint_caps_oversized_windows() {
    let upstream = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&upstream)
        .await;

    let (base, shutdown) = start_server(FloodgateConfig::default()).await;
    let client = reqwest::Client::new();
    let body = json!({ "url": upstream.uri(), "method": "POST", "limit": 1, "window": u64::MAX });

    let (status, ok) = post_json(&client, &format!("{base}/test-custom"), body.clone()).await;
    assert_eq!(status, 200);
    assert_eq!(ok["custom_limits"]["limit"], 1);
    assert_eq!(ok["custom_limits"]["window_secs"], u64::MAX);

    // The second request is denied with the cooldown capped at a year, and
    // the server keeps answering afterwards.
    let (status, denied) = post_json(&client, &format!("{base}/test-custom"), body).await;
    assert_eq!(status, 429);
    let time_left = denied["time_left_secs"].as_u64().unwrap();
    assert!((31_535_900..=31_536_000).contains(&time_left));

    let (status, health) = get_json(&client, &format!("{base}/health")).await;
    assert_eq!(status, 200);
    assert_eq!(health["status"], "ok");

    shutdown.cancel();
}

#[tokio::test]
async fn test_unreachable_url_reports_failed_request() {
    let (base, shutdown) = start_server(FloodgateConfig::default()).await;
    let client = reqwest::Client::new();

    // Nothing listens on port 1; the upstream request fails at the
    // transport level but the endpoint still answers 200.
    let (status, body) = post_json(
        &client,
        &format!("{base}/test-url"),
        json!({ "url": "http://127.0.0.1:1/" }),
    )
    .await;

    assert_eq!(status, 200);
    assert_eq!(
        body["message"],
        "Rate limit test completed (URL may be unreachable)"
    );
    assert_eq!(body["rate_limit_info"]["detected"]["source"], "failed_request");
    assert!(body["error"].as_str().is_some());
    assert_eq!(body["rate_limit_info"]["applied"]["limit"], 60);
    assert_eq!(body["rate_limit_info"]["applied"]["window_secs"], 3600);

    shutdown.cancel();
}

#[tokio::test]
async fn test_bad_requests_are_rejected() {
    let (base, shutdown) = start_server(FloodgateConfig::default()).await;
    let client = reqwest::Client::new();

    let (status, body) = post_json(&client, &format!("{base}/test-url"), json!({})).await;
    assert_eq!(status, 400);
    assert_eq!(body["message"], "url is required");

    let (status, _) = post_json(
        &client,
        &format!("{base}/test-url"),
        json!({ "url": "http://example.test/", "method": "b@d" }),
    )
    .await;
    assert_eq!(status, 400);

    let (status, body) = post_json(
        &client,
        &format!("{base}/test-custom"),
        json!({ "url": "http://example.test/", "limit": 0 }),
    )
    .await;
    assert_eq!(status, 400);
    assert!(body["message"].as_str().unwrap().contains("max_requests"));

    shutdown.cancel();
}

#[tokio::test]
async fn test_health_and_clear_data_round_trip() {
    let (base, shutdown) = start_server(FloodgateConfig::default()).await;
    let client = reqwest::Client::new();

    let (status, health) = get_json(&client, &format!("{base}/health")).await;
    assert_eq!(status, 200);
    assert_eq!(health["status"], "ok");
    assert_eq!(health["version"], env!("CARGO_PKG_VERSION"));
    assert!(health["uptime_secs"].as_u64().is_some());

    get_json(&client, &format!("{base}/home")).await;
    let (_, monitor) = get_json(&client, &format!("{base}/monitor")).await;
    assert_eq!(monitor["total_tracked"], 1);

    let (status, cleared) = post_json(&client, &format!("{base}/clear-data"), json!({})).await;
    assert_eq!(status, 200);
    assert_eq!(cleared["message"], "All rate limiter data cleared");

    let (_, after) = get_json(&client, &format!("{base}/monitor")).await;
    assert_eq!(after["total_tracked"], 0);

    let (_, analytics) = get_json(&client, &format!("{base}/analytics")).await;
    assert_eq!(analytics["total_requests"], 0);

    shutdown.cancel();
}
