//! End-to-end tests for the proxy surface: real local axum servers stand in
//! for upstream providers and a reqwest client drives the proxy.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::body::Bytes;
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::post;
use serde_json::{Value, json};

use modelgate_common::{ModelMapping, ProviderConfig, ProxyConfig};
use modelgate_core::state::AppState;
use modelgate_router::proxy_router;

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

async fn spawn_server(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

async fn start_proxy(config: ProxyConfig) -> (String, Arc<AppState>) {
    let state = AppState::new(&config, std::env::temp_dir().join("modelgate-proxy-test.yaml"))
        .unwrap();
    let addr = spawn_server(proxy_router(state.clone())).await;
    (format!("http://{addr}"), state)
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

fn mapping(alias: &str, upstream: &str) -> ModelMapping {
    ModelMapping {
        alias: alias.to_string(),
        upstream: upstream.to_string(),
        priority: 0,
        weight: 1,
        max_failures: None,
    }
}

fn provider(
    name: &str,
    addr: SocketAddr,
    priority: i64,
    mappings: Vec<ModelMapping>,
) -> ProviderConfig {
    ProviderConfig {
        name: name.to_string(),
        base_url: format!("http://{addr}"),
        api_key: "sk-upstream".to_string(),
        weight: 1,
        priority,
        timeout: 5,
        model_mappings: mappings,
        exclude_params: Vec::new(),
    }
}

fn config(providers: Vec<ProviderConfig>, max_retries: i64) -> ProxyConfig {
    ProxyConfig {
        max_retries,
        providers,
        ..ProxyConfig::default()
    }
}

type CapturedBodies = Arc<Mutex<Vec<Value>>>;

/// An upstream that records request bodies and answers with a fixed payload.
fn capturing_upstream(response_body: &'static str) -> (Router, CapturedBodies) {
    let captured: CapturedBodies = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();
    let router = Router::new().route(
        "/v1/chat/completions",
        post(move |body: Bytes| {
            let sink = sink.clone();
            async move {
                let value = serde_json::from_slice::<Value>(&body).unwrap_or(Value::Null);
                sink.lock().unwrap().push(value);
                (
                    [(header::CONTENT_TYPE, "application/json")],
                    response_body,
                )
                    .into_response()
            }
        }),
    );
    (router, captured)
}

/// An upstream that always fails with the given status and counts its hits.
fn failing_upstream(status: StatusCode) -> (Router, Arc<AtomicUsize>) {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = hits.clone();
    let router = Router::new().route(
        "/v1/chat/completions",
        post(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                status
            }
        }),
    );
    (router, hits)
}

fn sse_upstream(frames: &'static str) -> Router {
    Router::new().route(
        "/v1/chat/completions",
        post(move || async move {
            (
                [(header::CONTENT_TYPE, "text/event-stream")],
                frames,
            )
                .into_response()
        }),
    )
}

async fn provider_stats(base: &str, name: &str) -> Value {
    let stats: Value = client()
        .get(format!("{base}/internal/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    stats["providers"]
        .as_array()
        .unwrap()
        .iter()
        .find(|entry| entry["name"] == name)
        .cloned()
        .unwrap()
}

// ---------------------------------------------------------------------------
// Buffered dispatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn buffered_response_carries_alias_not_upstream_name() {
    let (upstream, captured) = capturing_upstream(
        r#"{"id":"chatcmpl-1","object":"chat.completion","model":"gpt-4o-2024-08-06","choices":[{"index":0,"message":{"role":"assistant","content":"hi"},"finish_reason":"stop"}]}"#,
    );
    let addr = spawn_server(upstream).await;
    let (base, _state) = start_proxy(config(
        vec![provider(
            "openai",
            addr,
            0,
            vec![mapping("gpt-4o", "gpt-4o-2024-08-06")],
        )],
        1,
    ))
    .await;

    let response = client()
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let text = response.text().await.unwrap();
    assert!(text.contains(r#""model":"gpt-4o""#), "got: {text}");
    assert!(!text.contains("2024-08-06"), "upstream name leaked: {text}");

    // The upstream saw the concrete model name, not the alias.
    let seen = captured.lock().unwrap();
    assert_eq!(seen[0]["model"], "gpt-4o-2024-08-06");
}

#[tokio::test]
async fn failover_moves_to_next_candidate_and_records_health() {
    let (broken, broken_hits) = failing_upstream(StatusCode::INTERNAL_SERVER_ERROR);
    let broken_addr = spawn_server(broken).await;
    let (healthy, healthy_captured) =
        capturing_upstream(r#"{"id":"chatcmpl-2","model":"m-backup","choices":[]}"#);
    let healthy_addr = spawn_server(healthy).await;

    let (base, _state) = start_proxy(config(
        vec![
            provider("primary", broken_addr, 0, vec![mapping("m", "m-primary")]),
            provider("backup", healthy_addr, 1, vec![mapping("m", "m-backup")]),
        ],
        2,
    ))
    .await;

    let response = client()
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let text = response.text().await.unwrap();
    assert!(text.contains(r#""model":"m""#));

    assert_eq!(broken_hits.load(Ordering::SeqCst), 1);
    assert_eq!(healthy_captured.lock().unwrap().len(), 1);

    let primary = provider_stats(&base, "primary").await;
    assert_eq!(primary["total_requests"], 1);
    assert_eq!(primary["success_requests"], 0);
    assert_eq!(primary["models"][0]["failure_count"], 1);
    assert_eq!(primary["models"][0]["healthy"], true);

    let backup = provider_stats(&base, "backup").await;
    assert_eq!(backup["total_requests"], 1);
    assert_eq!(backup["success_requests"], 1);
}

#[tokio::test]
async fn exhausted_attempts_return_upstream_error_envelope() {
    let (broken, hits) = failing_upstream(StatusCode::INTERNAL_SERVER_ERROR);
    let addr = spawn_server(broken).await;
    let (base, _state) = start_proxy(config(
        vec![provider("only", addr, 0, vec![mapping("m", "m-up")])],
        3,
    ))
    .await;

    let response = client()
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);

    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "upstream_error");
    let message = body["error"]["message"].as_str().unwrap();
    assert!(message.contains("all providers failed"), "got: {message}");
    assert!(message.contains("only(m-up)"), "got: {message}");

    // One candidate exists, so only one attempt runs even with retries left.
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn max_retries_one_means_no_failover() {
    let (broken, broken_hits) = failing_upstream(StatusCode::INTERNAL_SERVER_ERROR);
    let broken_addr = spawn_server(broken).await;
    let (healthy, healthy_captured) = capturing_upstream(r#"{"model":"m-b"}"#);
    let healthy_addr = spawn_server(healthy).await;

    let (base, _state) = start_proxy(config(
        vec![
            provider("a", broken_addr, 0, vec![mapping("m", "m-a")]),
            provider("b", healthy_addr, 1, vec![mapping("m", "m-b")]),
        ],
        1,
    ))
    .await;

    let response = client()
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({"model": "m", "messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
    assert_eq!(broken_hits.load(Ordering::SeqCst), 1);
    assert!(healthy_captured.lock().unwrap().is_empty());
}

#[tokio::test]
async fn excluded_and_sentinel_params_are_stripped_before_forwarding() {
    let (upstream, captured) = capturing_upstream(r#"{"model":"m-up"}"#);
    let addr = spawn_server(upstream).await;
    let mut provider_config = provider("p", addr, 0, vec![mapping("m", "m-up")]);
    provider_config.exclude_params = vec!["logit_bias".to_string()];
    let (base, _state) = start_proxy(config(vec![provider_config], 1)).await;

    let response = client()
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "logit_bias": {"50256": -100},
            "stop": null,
            "reasoning_effort": "[undefined]",
            "temperature": 0.2,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let seen = captured.lock().unwrap();
    let body = &seen[0];
    assert_eq!(body["model"], "m-up");
    assert!(body.get("logit_bias").is_none());
    assert!(body.get("stop").is_none());
    assert!(body.get("reasoning_effort").is_none());
    assert_eq!(body["temperature"], 0.2);
}

// ---------------------------------------------------------------------------
// Validation and routing errors
// ---------------------------------------------------------------------------

#[tokio::test]
async fn invalid_requests_get_openai_shaped_400s() {
    let (base, _state) = start_proxy(config(Vec::new(), 1)).await;
    let url = format!("{base}/v1/chat/completions");

    let response = client()
        .post(&url)
        .json(&json!({"messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert_eq!(body["error"]["message"], "model is required");

    let response = client()
        .post(&url)
        .json(&json!({"model": "m", "messages": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["message"], "messages is required");

    let response = client()
        .post(&url)
        .header(header::CONTENT_TYPE, "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");
}

#[tokio::test]
async fn unknown_alias_is_service_unavailable() {
    let (base, _state) = start_proxy(config(Vec::new(), 1)).await;
    let response = client()
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({"model": "ghost", "messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "service_unavailable");
    assert!(
        body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("no provider available for model: ghost")
    );
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bearer_key_auth_guards_the_v1_surface() {
    let mut proxy_config = config(Vec::new(), 1);
    proxy_config.api_keys = vec!["sk-good".to_string()];
    let (base, _state) = start_proxy(proxy_config).await;
    let url = format!("{base}/v1/models");

    let response = client().get(&url).send().await.unwrap();
    assert_eq!(response.status(), 401);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_request_error");
    assert_eq!(body["error"]["message"], "Missing Authorization header");

    let response = client()
        .get(&url)
        .header(header::AUTHORIZATION, "Basic abc")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    let body: Value = response.json().await.unwrap();
    assert!(
        body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("Expected: Bearer")
    );

    let response = client().get(&url).bearer_auth("sk-bad").send().await.unwrap();
    assert_eq!(response.status(), 401);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "invalid_api_key");

    let response = client().get(&url).bearer_auth("sk-good").send().await.unwrap();
    assert_eq!(response.status(), 200);

    // The stats probe sits outside the key-authenticated surface.
    let response = client()
        .get(format!("{base}/internal/stats"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

// ---------------------------------------------------------------------------
// Model listing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn models_are_deduplicated_across_providers() {
    let addr = spawn_server(Router::new()).await;
    let (base, _state) = start_proxy(config(
        vec![
            provider("a", addr, 0, vec![mapping("shared", "shared-a")]),
            provider(
                "b",
                addr,
                0,
                vec![mapping("shared", "shared-b"), mapping("only-b", "only-b-up")],
            ),
        ],
        1,
    ))
    .await;

    let body: Value = client()
        .get(format!("{base}/v1/models"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["object"], "list");
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["only-b", "shared"]);
    assert_eq!(body["data"][0]["owned_by"], "organization-owner");

    let response = client()
        .get(format!("{base}/v1/models/shared"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let response = client()
        .get(format!("{base}/v1/models/ghost"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "not_found_error");
}

// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

const GOOD_SSE: &str = "data: {\"id\":\"c1\",\"model\":\"m-good\",\"choices\":[{\"delta\":{\"role\":\"assistant\"}}]}\n\ndata: {\"model\":\"m-good\",\"choices\":[{\"delta\":{\"content\":\"hello\"}}]}\n\ndata: [DONE]\n\n";

#[tokio::test]
async fn stream_relays_rewritten_lines_until_done() {
    let addr = spawn_server(sse_upstream(GOOD_SSE)).await;
    let (base, _state) = start_proxy(config(
        vec![provider("p", addr, 0, vec![mapping("m", "m-good")])],
        1,
    ))
    .await;

    let response = client()
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-cache");

    let text = response.text().await.unwrap();
    assert!(text.contains(r#""model":"m""#), "got: {text}");
    assert!(!text.contains("m-good"), "upstream name leaked: {text}");
    assert!(text.contains(r#""content":"hello""#));
    assert!(text.trim_end().ends_with("data: [DONE]"));
}

#[tokio::test]
async fn stream_error_in_preamble_triggers_failover() {
    let error_sse =
        "data: {\"error\":{\"message\":\"rate limit\",\"code\":429}}\n\n";
    let error_addr = spawn_server(sse_upstream(error_sse)).await;
    let good_addr = spawn_server(sse_upstream(GOOD_SSE)).await;

    let (base, _state) = start_proxy(config(
        vec![
            provider("flaky", error_addr, 0, vec![mapping("m", "m-flaky")]),
            provider("solid", good_addr, 1, vec![mapping("m", "m-good")]),
        ],
        2,
    ))
    .await;

    let response = client()
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let text = response.text().await.unwrap();
    // Nothing from the failed first candidate reaches the client.
    assert!(!text.contains("rate limit"), "error frame leaked: {text}");
    assert!(text.contains(r#""content":"hello""#), "got: {text}");

    let flaky = provider_stats(&base, "flaky").await;
    assert_eq!(flaky["models"][0]["failure_count"], 1);
    let solid = provider_stats(&base, "solid").await;
    assert_eq!(solid["success_requests"], 1);
}

#[tokio::test]
async fn stream_non_200_handshake_fails_over() {
    let (broken, _hits) = failing_upstream(StatusCode::TOO_MANY_REQUESTS);
    let broken_addr = spawn_server(broken).await;
    let good_addr = spawn_server(sse_upstream(GOOD_SSE)).await;

    let (base, _state) = start_proxy(config(
        vec![
            provider("limited", broken_addr, 0, vec![mapping("m", "m-l")]),
            provider("solid", good_addr, 1, vec![mapping("m", "m-good")]),
        ],
        2,
    ))
    .await;

    let response = client()
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let text = response.text().await.unwrap();
    assert!(text.contains(r#""content":"hello""#));
}

#[tokio::test]
async fn stream_with_all_candidates_failing_returns_502() {
    let error_sse = "data: {\"error\":\"exhausted\"}\n\n";
    let addr = spawn_server(sse_upstream(error_sse)).await;
    let (base, _state) = start_proxy(config(
        vec![provider("p", addr, 0, vec![mapping("m", "m-up")])],
        2,
    ))
    .await;

    let response = client()
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({
            "model": "m",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": true,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 502);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "upstream_error");
    assert!(
        body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("exhausted")
    );
}
