use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::HeaderMap;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_LENGTH, CONTENT_TYPE, HOST};
use reqwest::header::HeaderValue;
use reqwest::{Client, Method, Response};

use modelgate_common::{ModelMapping, ProviderConfig};

use crate::health::HealthState;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 20;

#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    #[error("request build failed: {0}")]
    Build(String),
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("read response body failed: {0}")]
    Read(#[source] reqwest::Error),
    #[error("upstream returned status {0}")]
    Status(u16),
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("stream error: {0}")]
    Stream(String),
}

impl UpstreamError {
    pub(crate) fn from_send(err: reqwest::Error) -> Self {
        if err.is_builder() {
            Self::Build(err.to_string())
        } else {
            Self::Transport(err)
        }
    }
}

/// One configured upstream endpoint.
///
/// Owns two HTTP clients: a buffered one bounded by the provider timeout, and a
/// streaming one without an overall deadline so long SSE sessions survive
/// (cancellation is the caller's job). The alias index and the per-upstream
/// health map are built once here and never mutated afterwards.
pub struct Provider {
    config: ProviderConfig,
    client: Client,
    stream_client: Client,
    model_index: HashMap<String, Vec<usize>>,
    health: HashMap<String, Arc<HealthState>>,
    total_requests: AtomicU64,
    success_requests: AtomicU64,
}

impl Provider {
    pub fn new(config: ProviderConfig, default_max_failures: u32) -> Result<Self, UpstreamError> {
        let client = Client::builder()
            .timeout(config.effective_timeout())
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build()
            .map_err(|err| UpstreamError::Build(err.to_string()))?;
        let stream_client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .build()
            .map_err(|err| UpstreamError::Build(err.to_string()))?;

        let mut model_index: HashMap<String, Vec<usize>> = HashMap::new();
        let mut health: HashMap<String, Arc<HealthState>> = HashMap::new();
        for (idx, mapping) in config.model_mappings.iter().enumerate() {
            model_index
                .entry(mapping.effective_alias().to_string())
                .or_default()
                .push(idx);
            health
                .entry(mapping.upstream.clone())
                .or_insert_with(|| {
                    Arc::new(HealthState::new(
                        mapping.effective_max_failures(default_max_failures),
                    ))
                });
        }

        Ok(Self {
            config,
            client,
            stream_client,
            model_index,
            health,
            total_requests: AtomicU64::new(0),
            success_requests: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    pub fn timeout(&self) -> Duration {
        self.config.effective_timeout()
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.model_index.keys().map(String::as_str)
    }

    pub(crate) fn mapping_indices(&self, alias: &str) -> Option<&[usize]> {
        self.model_index.get(alias).map(Vec::as_slice)
    }

    pub(crate) fn mapping(&self, idx: usize) -> &ModelMapping {
        &self.config.model_mappings[idx]
    }

    pub fn health_for(&self, upstream: &str) -> Option<&Arc<HealthState>> {
        self.health.get(upstream)
    }

    pub(crate) fn health_entries(&self) -> impl Iterator<Item = (&str, &Arc<HealthState>)> {
        self.health.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub(crate) fn record_request(&self, success: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if success {
            self.success_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn request_counts(&self) -> (u64, u64) {
        (
            self.total_requests.load(Ordering::Relaxed),
            self.success_requests.load(Ordering::Relaxed),
        )
    }

    /// Buffered request on the timeout-bounded client. Returns the upstream
    /// response envelope untouched; non-2xx statuses are the caller's decision.
    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Bytes,
        headers: &HeaderMap,
    ) -> Result<Response, UpstreamError> {
        let forward = self.forward_headers(headers, false)?;
        self.client
            .request(method, self.url_for(path))
            .headers(forward)
            .body(body)
            .send()
            .await
            .map_err(UpstreamError::from_send)
    }

    /// Streaming POST on the deadline-free client; also asks for SSE.
    pub async fn stream_request(
        &self,
        path: &str,
        body: Bytes,
        headers: &HeaderMap,
    ) -> Result<Response, UpstreamError> {
        let forward = self.forward_headers(headers, true)?;
        self.stream_client
            .post(self.url_for(path))
            .headers(forward)
            .body(body)
            .send()
            .await
            .map_err(UpstreamError::from_send)
    }

    fn url_for(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    /// Credential plus content headers first, then the caller's headers minus
    /// the hop-sensitive ones, so client overrides of e.g. Content-Type stick.
    fn forward_headers(
        &self,
        headers: &HeaderMap,
        stream: bool,
    ) -> Result<HeaderMap, UpstreamError> {
        let mut out = HeaderMap::new();
        let bearer = HeaderValue::from_str(&format!("Bearer {}", self.config.api_key))
            .map_err(|err| UpstreamError::Build(err.to_string()))?;
        out.insert(AUTHORIZATION, bearer);
        out.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if stream {
            out.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        }
        for (name, value) in headers {
            if name == AUTHORIZATION || name == HOST || name == CONTENT_LENGTH {
                continue;
            }
            if stream && name == ACCEPT {
                continue;
            }
            out.insert(name.clone(), value.clone());
        }
        Ok(out)
    }
}
