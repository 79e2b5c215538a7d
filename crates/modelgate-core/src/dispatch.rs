use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use reqwest::Method;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info, warn};
use uuid::Uuid;

use modelgate_protocol::openai::ChatRequestEnvelope;
use modelgate_protocol::sse::{LineStream, is_done_frame};
use modelgate_upstream::{Candidate, Manager, UpstreamError};

use crate::error::ProxyError;
use crate::state::AppState;

const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// How many SSE lines are inspected before a 200 stream is promoted to a real
/// response. Error envelopes hidden behind a 200 land in the first frames;
/// anything buried deeper bypasses detection.
pub const STREAM_PREREAD_LINES: usize = 3;

/// Marker some clients send in place of fields they consider unset.
const UNDEFINED_SENTINEL: &str = "[undefined]";

type UpstreamByteStream = BoxStream<'static, Result<Bytes, reqwest::Error>>;

struct RequestContext {
    manager: Arc<Manager>,
    alias: String,
    request_id: String,
    headers: HeaderMap,
}

/// Serves one `/v1/chat/completions` call end to end: validates the envelope,
/// asks the Manager for a failover plan, then walks it buffered or streaming.
pub async fn chat_completions(state: Arc<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let envelope = match serde_json::from_slice::<ChatRequestEnvelope>(&body) {
        Ok(envelope) => envelope,
        Err(err) => return ProxyError::bad_request(err.to_string()).into_response(),
    };
    if envelope.model.is_empty() {
        return ProxyError::bad_request("model is required").into_response();
    }
    if envelope.messages.is_empty() {
        return ProxyError::bad_request("messages is required").into_response();
    }

    let manager = state.manager();
    let plan = manager.failover_plan(&envelope.model);
    if plan.is_empty() {
        return ProxyError::service_unavailable(format!(
            "no provider available for model: {}",
            envelope.model
        ))
        .into_response();
    }

    let attempts = plan.len().min(state.runtime().max_retries.max(1));
    let ctx = RequestContext {
        manager,
        alias: envelope.model,
        request_id: short_request_id(),
        headers,
    };

    if envelope.stream {
        stream_request(&ctx, &plan[..attempts], &body).await
    } else {
        buffered_request(&ctx, &plan[..attempts], &body).await
    }
}

async fn buffered_request(ctx: &RequestContext, plan: &[Candidate], body: &Bytes) -> Response {
    let mut last_error: Option<UpstreamError> = None;
    let mut tried: Vec<String> = Vec::new();

    for (attempt, candidate) in plan.iter().enumerate() {
        let target = candidate.label();
        tried.push(target.clone());
        let request_body = rewrite_request_body(body, candidate, &ctx.alias);
        let timeout = candidate.provider.timeout();

        let outcome = tokio::time::timeout(timeout, async {
            let response = candidate
                .provider
                .request(Method::POST, CHAT_COMPLETIONS_PATH, request_body, &ctx.headers)
                .await?;
            let status = response.status().as_u16();
            if status != 200 {
                return Err(UpstreamError::Status(status));
            }
            response.bytes().await.map_err(UpstreamError::Read)
        })
        .await;

        let payload = match outcome {
            Ok(Ok(payload)) => payload,
            Ok(Err(err)) => {
                record_attempt_failure(ctx, candidate, attempt, &target, &err, false);
                last_error = Some(err);
                continue;
            }
            Err(_) => {
                let err = UpstreamError::Timeout(timeout);
                record_attempt_failure(ctx, candidate, attempt, &target, &err, false);
                last_error = Some(err);
                continue;
            }
        };

        ctx.manager.record_success(candidate);
        info!(
            request_id = %ctx.request_id,
            model = %ctx.alias,
            attempt = attempt + 1,
            provider = %candidate.provider.name(),
            upstream = %candidate.upstream(),
            retried = attempt > 0,
            "completions served"
        );
        let payload = replace_model_token(&payload, candidate.upstream(), &ctx.alias);
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(payload))
            .unwrap_or_else(|_| ProxyError::server("response build failed").into_response());
    }

    all_attempts_failed(ctx, &tried, last_error, false)
}

async fn stream_request(ctx: &RequestContext, plan: &[Candidate], body: &Bytes) -> Response {
    let mut last_error: Option<UpstreamError> = None;
    let mut tried: Vec<String> = Vec::new();

    for (attempt, candidate) in plan.iter().enumerate() {
        let target = candidate.label();
        tried.push(target.clone());
        let request_body = rewrite_request_body(body, candidate, &ctx.alias);

        let response = match candidate
            .provider
            .stream_request(CHAT_COMPLETIONS_PATH, request_body, &ctx.headers)
            .await
        {
            Ok(response) => response,
            Err(err) => {
                record_attempt_failure(ctx, candidate, attempt, &target, &err, true);
                last_error = Some(err);
                continue;
            }
        };
        let status = response.status().as_u16();
        if status != 200 {
            let err = UpstreamError::Status(status);
            record_attempt_failure(ctx, candidate, attempt, &target, &err, true);
            last_error = Some(err);
            continue;
        }

        // Some upstreams answer 200 and smuggle an error object into the first
        // SSE frames. Hold the response back until the preamble looks real.
        let mut lines = LineStream::new(response.bytes_stream().boxed());
        let mut preamble: Vec<String> = Vec::new();
        let mut preamble_error: Option<UpstreamError> = None;
        for _ in 0..STREAM_PREREAD_LINES {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(message) = detect_stream_error(&line) {
                        preamble_error = Some(UpstreamError::Stream(message));
                        break;
                    }
                    let confirmed = is_content_chunk(&line);
                    preamble.push(line);
                    if confirmed {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    preamble_error = Some(UpstreamError::Transport(err));
                    break;
                }
            }
        }
        if let Some(err) = preamble_error {
            record_attempt_failure(ctx, candidate, attempt, &target, &err, true);
            last_error = Some(err);
            continue;
        }

        ctx.manager.record_success(candidate);
        info!(
            request_id = %ctx.request_id,
            model = %ctx.alias,
            attempt = attempt + 1,
            provider = %candidate.provider.name(),
            upstream = %candidate.upstream(),
            retried = attempt > 0,
            "stream serving"
        );
        return relay_stream(
            preamble,
            lines,
            candidate.upstream().to_string(),
            ctx.alias.clone(),
        );
    }

    all_attempts_failed(ctx, &tried, last_error, true)
}

/// Replays the pre-read lines, then relays the tail line by line. Every line is
/// rewritten before leaving, and the relay ends on `data: [DONE]`, a read
/// error, or the client going away. Errors past this point never fail over:
/// the client has already seen bytes.
fn relay_stream(
    preamble: Vec<String>,
    mut lines: LineStream<UpstreamByteStream>,
    upstream: String,
    alias: String,
) -> Response {
    let (tx, rx) = mpsc::channel::<Bytes>(32);
    tokio::spawn(async move {
        for line in preamble {
            if !forward_line(&tx, &line, &upstream, &alias).await {
                return;
            }
        }
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if !forward_line(&tx, &line, &upstream, &alias).await {
                        break;
                    }
                }
                _ => break,
            }
        }
    });

    let stream = ReceiverStream::new(rx).map(Ok::<_, Infallible>);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| ProxyError::server("response build failed").into_response())
}

/// Sends one rewritten SSE line downstream. Returns false once the relay
/// should stop (client gone or terminal frame delivered).
async fn forward_line(tx: &mpsc::Sender<Bytes>, line: &str, upstream: &str, alias: &str) -> bool {
    let rewritten = replace_model_in_line(line, upstream, alias);
    let mut payload = rewritten.into_bytes();
    payload.push(b'\n');
    if tx.send(Bytes::from(payload)).await.is_err() {
        return false;
    }
    !is_done_frame(line)
}

fn record_attempt_failure(
    ctx: &RequestContext,
    candidate: &Candidate,
    attempt: usize,
    target: &str,
    err: &UpstreamError,
    stream: bool,
) {
    warn!(
        request_id = %ctx.request_id,
        model = %ctx.alias,
        attempt = attempt + 1,
        target = %target,
        stream,
        error = %err,
        "attempt failed"
    );
    ctx.manager.record_failure(candidate);
}

fn all_attempts_failed(
    ctx: &RequestContext,
    tried: &[String],
    last_error: Option<UpstreamError>,
    stream: bool,
) -> Response {
    let last = last_error
        .map(|err| err.to_string())
        .unwrap_or_else(|| "no attempt executed".to_string());
    error!(
        request_id = %ctx.request_id,
        model = %ctx.alias,
        tried = ?tried,
        stream,
        error = %last,
        "all providers failed"
    );
    ProxyError::upstream(format!(
        "all providers failed: {last} (tried: {})",
        tried.join(", ")
    ))
    .into_response()
}

/// Rewrites one attempt's request body: the alias becomes the provider's
/// upstream model name, excluded parameters are dropped, and null /
/// `"[undefined]"` values are cleaned out. Bodies the proxy cannot parse are
/// forwarded untouched, as is anything that fails to re-serialize.
fn rewrite_request_body(body: &Bytes, candidate: &Candidate, alias: &str) -> Bytes {
    let Ok(mut value) = serde_json::from_slice::<Value>(body) else {
        return body.clone();
    };
    let Some(object) = value.as_object_mut() else {
        return body.clone();
    };

    let upstream = candidate.upstream();
    if upstream != alias {
        object.insert("model".to_string(), Value::String(upstream.to_string()));
    }
    for param in &candidate.provider.config().exclude_params {
        object.remove(param);
    }
    object.retain(|_, value| match value {
        Value::Null => false,
        Value::String(text) => text != UNDEFINED_SENTINEL,
        _ => true,
    });

    match serde_json::to_vec(&value) {
        Ok(bytes) => Bytes::from(bytes),
        Err(_) => body.clone(),
    }
}

/// Exact-token substitution of `"model":"<upstream>"` with the alias form.
/// Quote-bounded so `"<upstream>-variant"` is left alone; textual replacement
/// keeps upstream-specific fields a JSON round-trip might drop.
fn replace_model_token(payload: &[u8], upstream: &str, alias: &str) -> Bytes {
    if upstream == alias {
        return Bytes::copy_from_slice(payload);
    }
    match std::str::from_utf8(payload) {
        Ok(text) => {
            let needle = format!("\"model\":\"{upstream}\"");
            let replacement = format!("\"model\":\"{alias}\"");
            Bytes::from(text.replace(&needle, &replacement))
        }
        Err(_) => Bytes::copy_from_slice(payload),
    }
}

fn replace_model_in_line(line: &str, upstream: &str, alias: &str) -> String {
    if upstream == alias {
        return line.to_string();
    }
    line.replace(
        &format!("\"model\":\"{upstream}\""),
        &format!("\"model\":\"{alias}\""),
    )
}

/// Inspects one pre-read SSE line for an embedded error envelope. Returns the
/// message when the line carries one; plain data frames, `[DONE]` and lines
/// that fail to parse as JSON pass.
fn detect_stream_error(line: &str) -> Option<String> {
    if !line.contains("\"error\"") {
        return None;
    }
    let data = line.strip_prefix("data: ").unwrap_or(line).trim();
    if data.is_empty() || data == "[DONE]" {
        return None;
    }
    let Ok(value) = serde_json::from_str::<Value>(data) else {
        return None;
    };
    match value.get("error")? {
        Value::Null => None,
        Value::String(message) => Some(message.clone()),
        Value::Object(detail) => {
            let message = detail
                .get("message")
                .and_then(Value::as_str)
                .filter(|message| !message.is_empty())
                .unwrap_or("upstream error");
            match detail.get("code") {
                Some(code) => Some(format!("{message} (code: {code})")),
                None => Some(message.to_string()),
            }
        }
        other => Some(other.to_string()),
    }
}

/// A chunk carrying actual delta content confirms the stream is real.
fn is_content_chunk(line: &str) -> bool {
    line.contains("\"content\":\"") || line.contains("\"role\":\"")
}

fn short_request_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(8);
    id
}
