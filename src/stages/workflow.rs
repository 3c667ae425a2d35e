//! Streaming reconciliation stage.
//!
//! The client's streaming preference and the provider's capability don't
//! always agree. This stage decides, per request, which of three modes
//! applies and rewrites the `stream` flag accordingly; the executor then
//! uses [`accumulate`] or [`fragment`] to bridge the difference on the
//! response side.
//!
//! - `None`: preference and capability agree; bodies pass through.
//! - `StreamToNonStream`: provider streams, client wants one response —
//!   chunks are accumulated and emitted as a single body.
//! - `NonStreamToStream`: client wants a stream, provider can't — the
//!   single response is fragmented into delta chunks.

use crate::context::ExecutionContext;
use crate::error::{GatewayError, Result};
use crate::stage::{Stage, StageKind};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::time::Duration;

/// How this request's streaming preference maps onto the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowMode {
    /// No conversion needed.
    None,
    /// Accumulate provider chunks into one response.
    StreamToNonStream,
    /// Fragment the provider response into chunks.
    NonStreamToStream,
}

/// Configuration for one [`Workflow`] instance.
#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    /// Whether the bound provider/model can stream.
    pub provider_streams: bool,
    /// Whether the provider *only* answers over a stream. Implies
    /// `provider_streams`; non-streaming clients get accumulated responses.
    pub provider_stream_only: bool,
    /// Characters of delta content per synthesized chunk.
    pub chunk_size: usize,
    /// Optional pacing delay between synthesized chunks.
    pub stream_delay: Duration,
}

impl WorkflowConfig {
    /// Validate tunables. Fatal before the stage accepts traffic.
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(GatewayError::StageConfigInvalid(
                "workflow chunk_size must be greater than zero".to_string(),
            ));
        }
        if self.provider_stream_only && !self.provider_streams {
            return Err(GatewayError::StageConfigInvalid(
                "provider_stream_only requires provider_streams".to_string(),
            ));
        }
        Ok(())
    }

    /// The mode for a request, given the client's preference.
    pub fn mode(&self, client_wants_stream: bool) -> WorkflowMode {
        match (client_wants_stream, self.provider_streams) {
            (true, false) => WorkflowMode::NonStreamToStream,
            (false, _) if self.provider_stream_only => WorkflowMode::StreamToNonStream,
            _ => WorkflowMode::None,
        }
    }

    /// Whether the provider call itself should be a streaming call.
    pub fn provider_call_streams(&self, client_wants_stream: bool) -> bool {
        self.provider_stream_only || (client_wants_stream && self.provider_streams)
    }
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            provider_streams: true,
            provider_stream_only: false,
            chunk_size: 256,
            stream_delay: Duration::ZERO,
        }
    }
}

/// The streaming reconciliation stage.
#[derive(Debug)]
pub struct Workflow {
    config: WorkflowConfig,
}

impl Workflow {
    /// Build the stage, validating tunables.
    pub fn new(config: WorkflowConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// The stage configuration.
    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }
}

#[async_trait]
impl Stage for Workflow {
    fn kind(&self) -> StageKind {
        StageKind::Workflow
    }

    /// Clamp the `stream` flag to what the provider supports.
    ///
    /// The original client preference is what the scheduler acted on when it
    /// chose `execute` vs `execute_stream`; by this point the flag only
    /// steers the provider call.
    async fn process(&self, mut request: Value, ctx: &ExecutionContext) -> Result<Value> {
        ctx.check_cancelled()?;
        let wants_stream = request
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let provider_stream = self.config.provider_call_streams(wants_stream);
        if let Some(obj) = request.as_object_mut() {
            if provider_stream {
                obj.insert("stream".to_string(), Value::Bool(true));
            } else {
                obj.remove("stream");
            }
        }
        Ok(request)
    }

    async fn process_response(&self, response: Value, ctx: &ExecutionContext) -> Result<Value> {
        ctx.check_cancelled()?;
        Ok(response)
    }
}

/// Merge a sequence of OpenAI-style stream chunks into one response body.
///
/// Delta content concatenates in arrival order; the final chunk's
/// `finish_reason`, `model`, `id`, and `usage` win. Partial failure never
/// reaches here — the executor propagates the error instead of calling this.
pub fn accumulate(chunks: &[Value]) -> Value {
    let mut content = String::new();
    let mut finish_reason = Value::Null;
    let mut meta = Map::new();

    for chunk in chunks {
        if let Some(delta) = chunk
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
        {
            content.push_str(delta);
        }
        if let Some(reason) = chunk.pointer("/choices/0/finish_reason") {
            if !reason.is_null() {
                finish_reason = reason.clone();
            }
        }
        for key in ["id", "model", "usage"] {
            if let Some(v) = chunk.get(key) {
                if !v.is_null() {
                    meta.insert(key.to_string(), v.clone());
                }
            }
        }
    }

    let mut out = json!({
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": if finish_reason.is_null() { json!("stop") } else { finish_reason },
        }],
    });
    if let Some(obj) = out.as_object_mut() {
        for (k, v) in meta {
            obj.insert(k, v);
        }
    }
    out
}

/// Split a complete response body into OpenAI-style delta chunks.
///
/// The concatenation of all delta contents equals the original content
/// exactly; the last chunk carries the finish reason. Content splits on
/// char boundaries.
pub fn fragment(response: &Value, chunk_size: usize) -> Vec<Value> {
    let content = response
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .unwrap_or("");
    let id = response.get("id").cloned().unwrap_or(Value::Null);
    let model = response.get("model").cloned().unwrap_or(Value::Null);
    let finish_reason = response
        .pointer("/choices/0/finish_reason")
        .cloned()
        .unwrap_or(json!("stop"));

    let pieces: Vec<String> = if content.is_empty() {
        vec![String::new()]
    } else {
        let chars: Vec<char> = content.chars().collect();
        chars
            .chunks(chunk_size.max(1))
            .map(|c| c.iter().collect())
            .collect()
    };

    let last = pieces.len() - 1;
    pieces
        .into_iter()
        .enumerate()
        .map(|(i, piece)| {
            json!({
                "id": id,
                "model": model,
                "object": "chat.completion.chunk",
                "choices": [{
                    "index": 0,
                    "delta": {"content": piece},
                    "finish_reason": if i == last { finish_reason.clone() } else { Value::Null },
                }],
            })
        })
        .collect()
}
