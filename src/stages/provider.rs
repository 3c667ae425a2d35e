//! The outbound provider stage.
//!
//! Wraps a [`ProviderClient`] — the one object allowed to touch the network
//! — in the [`Stage`] shape. The HTTP implementation resolves credentials by
//! key index, keeps OAuth tokens cached with coalesced refresh, enforces the
//! provider-call timeout, and translates transport failures and provider
//! status codes into [`GatewayError`]s. A scripted mock implementation
//! backs tests and offline wiring.

use crate::config::{AuthKind, ProviderConfig, Target};
use crate::context::ExecutionContext;
use crate::envelope::{stream_from_chunks, stream_from_receiver, ChunkStream};
use crate::error::{GatewayError, Result};
use crate::sse::SseDecoder;
use crate::stage::{Stage, StageKind};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// A normalized provider response.
#[derive(Debug, Clone)]
pub struct ProviderResponse {
    /// HTTP status (always 2xx — error statuses become `Err`).
    pub status: u16,
    /// Response headers worth keeping (currently: rate-limit metadata).
    pub headers: HashMap<String, String>,
    /// Parsed response body. An empty provider body parses as `{}`.
    pub body: Value,
}

/// The outbound-call contract, one implementation per transport.
///
/// Implementations surface provider status codes as [`GatewayError`]s per
/// the fixed classification; a returned `Ok` always means 2xx.
#[async_trait]
pub trait ProviderClient: Send + Sync {
    /// Perform a non-streaming call.
    async fn call(&self, body: &Value, ctx: &ExecutionContext) -> Result<ProviderResponse>;

    /// Perform a streaming call. The stream ends at the provider's final
    /// frame or the first error; cancelling the context closes it.
    async fn call_stream(&self, body: &Value, ctx: &ExecutionContext) -> Result<ChunkStream>;

    /// Name for logs and diagnostics.
    fn name(&self) -> &str;
}

// ---------------------------------------------------------------------------
// OAuth token cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// Cached OAuth access token with coalesced refresh.
///
/// The async mutex is held across the refresh call, so concurrent callers
/// that miss the cache wait for the single in-flight fetch instead of
/// stampeding the token endpoint.
pub struct TokenCache {
    token_url: String,
    credential: String,
    client: reqwest::Client,
    state: tokio::sync::Mutex<Option<CachedToken>>,
}

impl TokenCache {
    const EXPIRY_MARGIN: Duration = Duration::from_secs(30);

    /// Create a cache against a provider's token endpoint.
    pub fn new(token_url: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            token_url: token_url.into(),
            credential: credential.into(),
            client: reqwest::Client::new(),
            state: tokio::sync::Mutex::new(None),
        }
    }

    /// Return a valid access token, refreshing if needed. Idempotent.
    pub async fn ensure_token(&self) -> Result<String> {
        let mut state = self.state.lock().await;
        if let Some(token) = state.as_ref() {
            if token.expires_at > Instant::now() + Self::EXPIRY_MARGIN {
                return Ok(token.access_token.clone());
            }
        }

        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_secret", self.credential.as_str()),
            ])
            .send()
            .await
            .map_err(|e| GatewayError::ProviderAuth {
                status: 0,
                body: format!("token endpoint unreachable: {e}"),
            })?;

        let status = response.status().as_u16();
        if !response.status().is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::ProviderAuth { status, body });
        }

        let payload: Value = response.json().await.map_err(|e| GatewayError::ProviderAuth {
            status,
            body: format!("malformed token response: {e}"),
        })?;
        let access_token = payload
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| GatewayError::ProviderAuth {
                status,
                body: "token response missing access_token".to_string(),
            })?
            .to_string();
        let expires_in = payload
            .get("expires_in")
            .and_then(Value::as_u64)
            .unwrap_or(3600);

        *state = Some(CachedToken {
            access_token: access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(expires_in),
        });
        Ok(access_token)
    }
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("token_url", &self.token_url)
            .field("credential", &"***")
            .finish()
    }
}

// ---------------------------------------------------------------------------
// HTTP client
// ---------------------------------------------------------------------------

/// How outbound requests authenticate.
enum AuthScheme {
    /// `Authorization: Bearer {key}` (OpenAI, Qwen).
    Bearer(String),
    /// `x-api-key: {key}` (Anthropic).
    ApiKeyHeader(String),
    /// `?key={key}` query parameter (Gemini).
    QueryKey(String),
    /// OAuth access token resolved through the cache per call.
    Oauth(Arc<TokenCache>),
}

impl std::fmt::Debug for AuthScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthScheme::Bearer(k) => write!(f, "Bearer({})", redact(k)),
            AuthScheme::ApiKeyHeader(k) => write!(f, "ApiKeyHeader({})", redact(k)),
            AuthScheme::QueryKey(k) => write!(f, "QueryKey({})", redact(k)),
            AuthScheme::Oauth(_) => write!(f, "Oauth"),
        }
    }
}

fn redact(key: &str) -> String {
    if key.len() > 6 {
        format!("{}***", &key[..6])
    } else {
        "***".to_string()
    }
}

/// Reqwest-backed [`ProviderClient`].
#[derive(Debug)]
pub struct HttpProviderClient {
    client: reqwest::Client,
    provider_type: String,
    url: String,
    stream_url: String,
    auth: AuthScheme,
    timeout: Duration,
}

impl HttpProviderClient {
    /// Build the client for one (provider, model, key) binding.
    pub fn new(
        provider: &ProviderConfig,
        model_id: &str,
        key: Option<&str>,
        timeout: Duration,
    ) -> Result<Self> {
        let base = provider.endpoint.trim_end_matches('/');
        let (url, stream_url) = match provider.provider_type.as_str() {
            "anthropic" => (
                format!("{base}/v1/messages"),
                format!("{base}/v1/messages"),
            ),
            "gemini" => (
                format!("{base}/v1beta/models/{model_id}:generateContent"),
                format!("{base}/v1beta/models/{model_id}:streamGenerateContent?alt=sse"),
            ),
            // OpenAI and its dialects share one path; streaming is flagged
            // in the body.
            _ => (
                format!("{base}/v1/chat/completions"),
                format!("{base}/v1/chat/completions"),
            ),
        };

        let auth = match provider.auth.kind {
            AuthKind::ApiKey | AuthKind::Custom => {
                let key = key.map(str::to_string).unwrap_or_default();
                match provider.provider_type.as_str() {
                    "anthropic" => AuthScheme::ApiKeyHeader(key),
                    "gemini" => AuthScheme::QueryKey(key),
                    _ => AuthScheme::Bearer(key),
                }
            }
            AuthKind::Oauth2 => {
                let key = key.ok_or_else(|| {
                    GatewayError::StageConfigInvalid(format!(
                        "provider '{}' uses oauth2 but no credential was resolved",
                        provider.provider_id
                    ))
                })?;
                AuthScheme::Oauth(Arc::new(TokenCache::new(
                    format!("{base}/oauth/token"),
                    key,
                )))
            }
        };

        Ok(Self {
            client: reqwest::Client::new(),
            provider_type: provider.provider_type.clone(),
            url,
            stream_url,
            auth,
            timeout,
        })
    }

    async fn send(&self, body: &Value, streaming: bool) -> Result<reqwest::Response> {
        let url = if streaming { &self.stream_url } else { &self.url };
        let mut request = self
            .client
            .post(url)
            .timeout(self.timeout)
            .json(body);

        request = match &self.auth {
            AuthScheme::Bearer(key) => request.header("Authorization", format!("Bearer {key}")),
            AuthScheme::ApiKeyHeader(key) => request
                .header("x-api-key", key.as_str())
                .header("anthropic-version", "2023-06-01"),
            AuthScheme::QueryKey(key) => request.query(&[("key", key.as_str())]),
            AuthScheme::Oauth(cache) => {
                let token = cache.ensure_token().await?;
                request.header("Authorization", format!("Bearer {token}"))
            }
        };

        let response = request.send().await.map_err(GatewayError::from)?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(parse_retry_after);
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::from_provider_status(status, body, retry_after));
        }
        Ok(response)
    }
}

/// Parse a `Retry-After` header value as seconds.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn call(&self, body: &Value, ctx: &ExecutionContext) -> Result<ProviderResponse> {
        ctx.check_cancelled()?;
        let response = self.send(body, false).await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter(|(name, _)| name.as_str().starts_with("x-ratelimit"))
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let raw = response.bytes().await.map_err(GatewayError::from)?;
        // An empty 200 body is still a success.
        let body = if raw.is_empty() {
            json!({})
        } else {
            serde_json::from_slice(&raw).map_err(|e| GatewayError::ProviderServerError {
                status,
                body: format!("unparseable provider body: {e}"),
            })?
        };
        Ok(ProviderResponse {
            status,
            headers,
            body,
        })
    }

    async fn call_stream(&self, body: &Value, ctx: &ExecutionContext) -> Result<ChunkStream> {
        ctx.check_cancelled()?;
        let response = self.send(body, true).await?;
        let cancel = ctx.child_token();
        let (tx, rx) = mpsc::channel::<Result<Value>>(32);

        tokio::spawn(async move {
            let mut decoder = SseDecoder::new();
            let mut bytes = response.bytes_stream();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = tx.send(Err(GatewayError::Cancelled)).await;
                        return;
                    }
                    chunk = bytes.next() => match chunk {
                        Some(Ok(data)) => {
                            for frame in decoder.decode(&data) {
                                if tx.send(Ok(frame.data)).await.is_err() {
                                    return;
                                }
                            }
                            if decoder.finished() {
                                return;
                            }
                        }
                        Some(Err(e)) => {
                            let _ = tx.send(Err(e.into())).await;
                            return;
                        }
                        None => {
                            for frame in decoder.flush() {
                                if tx.send(Ok(frame.data)).await.is_err() {
                                    return;
                                }
                            }
                            return;
                        }
                    }
                }
            }
        });

        Ok(stream_from_receiver(rx))
    }

    fn name(&self) -> &str {
        &self.provider_type
    }
}

// ---------------------------------------------------------------------------
// Mock client
// ---------------------------------------------------------------------------

/// One scripted outcome for [`MockProviderClient`].
#[derive(Debug, Clone)]
pub enum MockOutcome {
    /// Succeed with this body.
    Success(Value),
    /// Succeed with this chunk sequence (streaming calls only).
    Stream(Vec<Value>),
    /// Fail with a provider status code.
    Status {
        /// The status to report.
        status: u16,
        /// Response body text.
        body: String,
        /// Optional `Retry-After` hint.
        retry_after: Option<Duration>,
    },
    /// Fail with a transport error.
    Network,
    /// Fail with a provider timeout.
    Timeout,
    /// Never answer; resolves only through cancellation.
    Hang,
}

/// A scripted [`ProviderClient`] for tests and offline wiring.
///
/// Outcomes are consumed in order and the last one repeats once the script
/// is exhausted.
pub struct MockProviderClient {
    name: String,
    outcomes: Mutex<Vec<MockOutcome>>,
    cursor: AtomicUsize,
    calls: AtomicUsize,
    /// Artificial latency applied before every outcome.
    delay: Duration,
}

impl MockProviderClient {
    /// Create a mock with a script of outcomes.
    pub fn new(name: impl Into<String>, outcomes: Vec<MockOutcome>) -> Self {
        assert!(
            !outcomes.is_empty(),
            "MockProviderClient requires at least one outcome"
        );
        Self {
            name: name.into(),
            outcomes: Mutex::new(outcomes),
            cursor: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
            delay: Duration::ZERO,
        }
    }

    /// A mock that always succeeds with the same body.
    pub fn always(body: Value) -> Self {
        Self::new("mock", vec![MockOutcome::Success(body)])
    }

    /// Apply artificial latency before every outcome.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// How many calls (streaming included) this mock has served.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }

    fn next_outcome(&self) -> MockOutcome {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let outcomes = self.outcomes.lock().unwrap_or_else(|e| e.into_inner());
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed);
        outcomes[idx.min(outcomes.len() - 1)].clone()
    }

    async fn resolve(&self, outcome: MockOutcome, ctx: &ExecutionContext) -> Result<ProviderResponse> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match outcome {
            MockOutcome::Success(body) => Ok(ProviderResponse {
                status: 200,
                headers: HashMap::new(),
                body,
            }),
            MockOutcome::Stream(_) => Err(GatewayError::Internal {
                stage: Some("provider".to_string()),
                message: "mock scripted a stream for a non-streaming call".to_string(),
            }),
            MockOutcome::Status {
                status,
                body,
                retry_after,
            } => Err(GatewayError::from_provider_status(status, body, retry_after)),
            MockOutcome::Network => Err(GatewayError::ProviderNetwork {
                message: "mock: connection refused".to_string(),
            }),
            MockOutcome::Timeout => Err(GatewayError::ProviderTimeout {
                message: "mock: provider deadline elapsed".to_string(),
            }),
            MockOutcome::Hang => {
                ctx.cancelled().await;
                Err(GatewayError::Cancelled)
            }
        }
    }
}

#[async_trait]
impl ProviderClient for MockProviderClient {
    async fn call(&self, _body: &Value, ctx: &ExecutionContext) -> Result<ProviderResponse> {
        ctx.check_cancelled()?;
        let outcome = self.next_outcome();
        self.resolve(outcome, ctx).await
    }

    async fn call_stream(&self, _body: &Value, ctx: &ExecutionContext) -> Result<ChunkStream> {
        ctx.check_cancelled()?;
        let outcome = self.next_outcome();
        match outcome {
            MockOutcome::Stream(chunks) => Ok(stream_from_chunks(chunks)),
            MockOutcome::Success(body) => Ok(stream_from_chunks(vec![body])),
            other => {
                self.resolve(other, ctx).await?;
                unreachable!("non-success mock outcomes resolve to errors")
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

// ---------------------------------------------------------------------------
// The stage
// ---------------------------------------------------------------------------

/// Build-time configuration of one provider stage.
#[derive(Debug, Clone)]
pub struct ProviderStageConfig {
    /// Provider id this stage calls.
    pub provider_id: String,
    /// Protocol family.
    pub provider_type: String,
    /// Concrete model routed to.
    pub model_id: String,
    /// Index into the provider's credential list.
    pub key_index: usize,
    /// Hard timeout for the provider call.
    pub timeout: Duration,
}

/// The outbound-call stage.
pub struct ProviderStage {
    config: ProviderStageConfig,
    client: Arc<dyn ProviderClient>,
}

impl std::fmt::Debug for ProviderStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderStage")
            .field("config", &self.config)
            .finish()
    }
}

impl ProviderStage {
    /// Wire the stage against a real HTTP client.
    ///
    /// Resolves the credential at `target.key_index`; an out-of-range index
    /// is a fatal configuration error.
    pub fn from_config(
        provider: &ProviderConfig,
        target: &Target,
        timeout: Duration,
    ) -> Result<Self> {
        provider.validate()?;
        let key = if provider.auth.keys.is_empty() {
            None
        } else {
            Some(
                provider
                    .auth
                    .keys
                    .get(target.key_index)
                    .ok_or_else(|| {
                        GatewayError::StageConfigInvalid(format!(
                            "target {}/{} references key index {} but provider has {} keys",
                            target.provider_id,
                            target.model_id,
                            target.key_index,
                            provider.auth.keys.len()
                        ))
                    })?
                    .as_str(),
            )
        };
        let client = Arc::new(HttpProviderClient::new(
            provider,
            &target.model_id,
            key,
            timeout,
        )?);
        Ok(Self::with_client(
            ProviderStageConfig {
                provider_id: provider.provider_id.clone(),
                provider_type: provider.provider_type.clone(),
                model_id: target.model_id.clone(),
                key_index: target.key_index,
                timeout,
            },
            client,
        ))
    }

    /// Wire the stage against an injected client (mocks, custom transports).
    pub fn with_client(config: ProviderStageConfig, client: Arc<dyn ProviderClient>) -> Self {
        Self { config, client }
    }

    /// The stage configuration.
    pub fn config(&self) -> &ProviderStageConfig {
        &self.config
    }

    /// Stamp the concrete model id onto the outbound body.
    ///
    /// Gemini carries the model in the URL instead.
    fn finalize_body(&self, mut body: Value) -> Value {
        if self.config.provider_type != "gemini" {
            if let Some(obj) = body.as_object_mut() {
                obj.insert("model".to_string(), json!(self.config.model_id));
            }
        }
        body
    }

    /// Open a provider chunk stream (streaming execution path).
    pub async fn open_stream(&self, request: Value, ctx: &ExecutionContext) -> Result<ChunkStream> {
        let body = self.finalize_body(request);
        self.client.call_stream(&body, ctx).await
    }
}

#[async_trait]
impl Stage for ProviderStage {
    fn kind(&self) -> StageKind {
        StageKind::Provider
    }

    async fn process(&self, request: Value, ctx: &ExecutionContext) -> Result<Value> {
        ctx.check_cancelled()?;
        let body = self.finalize_body(request);
        let response = self.client.call(&body, ctx).await?;
        tracing::debug!(
            provider = %self.config.provider_id,
            model = %self.config.model_id,
            status = response.status,
            "provider call completed"
        );
        Ok(response.body)
    }

    async fn process_response(&self, response: Value, _ctx: &ExecutionContext) -> Result<Value> {
        Ok(response)
    }
}
