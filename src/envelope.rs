//! Boundary types exchanged with the HTTP shim.
//!
//! The gateway core never parses HTTP itself: the shim hands it an already
//! parsed [`GatewayRequest`] plus the resolved virtual-model id, and receives
//! either a [`GatewayResponse`] or a chunk stream. Bodies stay opaque
//! `serde_json::Value`s end to end; stages address into them by path.

use crate::error::Result;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::pin::Pin;

/// A stream of response chunks produced by a streaming dispatch.
///
/// Terminates after the final chunk or the first error; cancellation closes
/// the stream early.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Value>> + Send>>;

/// Adapt an mpsc receiver into a [`ChunkStream`].
pub(crate) fn stream_from_receiver(rx: tokio::sync::mpsc::Receiver<Result<Value>>) -> ChunkStream {
    Box::pin(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

/// A [`ChunkStream`] over pre-computed chunks.
pub(crate) fn stream_from_chunks(chunks: Vec<Value>) -> ChunkStream {
    Box::pin(futures::stream::iter(chunks.into_iter().map(Ok)))
}

/// An already-parsed inbound request, as delivered by the HTTP shim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRequest {
    /// Shim-assigned request id (echoed back in the response envelope).
    pub id: String,
    /// HTTP method (`POST` for chat-like routes).
    pub method: String,
    /// Request path.
    pub path: String,
    /// Header map, lowercased keys.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Opaque request body.
    pub body: Value,
    /// Query parameters.
    #[serde(default)]
    pub query: HashMap<String, String>,
    /// Caller identity, when the shim authenticated one.
    #[serde(default)]
    pub client_id: Option<String>,
    /// W3C `traceparent` carried end to end for observability.
    #[serde(default)]
    pub traceparent: Option<String>,
}

impl GatewayRequest {
    /// Build a minimal request around a body; the common test/embedding path.
    pub fn new(id: impl Into<String>, body: Value) -> Self {
        Self {
            id: id.into(),
            method: "POST".to_string(),
            path: "/v1/chat/completions".to_string(),
            headers: HashMap::new(),
            body,
            query: HashMap::new(),
            client_id: None,
            traceparent: None,
        }
    }

    /// Attach a header (builder style).
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into().to_lowercase(), value.into());
        self
    }

    /// Attach a traceparent.
    pub fn with_traceparent(mut self, traceparent: impl Into<String>) -> Self {
        self.traceparent = Some(traceparent.into());
        self
    }

    /// Whether the client asked for a streamed response (`"stream": true`).
    pub fn wants_stream(&self) -> bool {
        self.body
            .get("stream")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// The outbound envelope handed back to the HTTP shim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayResponse {
    /// HTTP status for the shim to emit.
    pub status: u16,
    /// Response headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,
    /// Opaque response body.
    pub body: Value,
    /// Wall-clock processing time in the core.
    pub processing_time_ms: u64,
    /// Short error description when `status` is an error.
    #[serde(default)]
    pub error: Option<String>,
    /// Echo of the inbound request id.
    pub request_id: String,
}

/// Terminal state of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    /// The pipeline ran to completion.
    Completed,
    /// The pipeline failed after exhausting recovery options.
    Failed,
    /// The per-request hard deadline elapsed.
    Timeout,
    /// The caller cancelled the request.
    Cancelled,
}

/// Outcome of a single dispatched request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Unique id of this execution (distinct from the shim request id).
    pub execution_id: String,
    /// Terminal status.
    pub status: ExecutionStatus,
    /// Total duration across all attempts.
    pub duration_ms: u64,
    /// Response body on success.
    #[serde(default)]
    pub body: Option<Value>,
    /// Normalized error body (`{"error": {...}}`) on failure.
    #[serde(default)]
    pub error: Option<Value>,
}

impl ExecutionResult {
    /// True when the execution completed with a body.
    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Completed
    }

    /// Package this result as the response envelope for the HTTP shim.
    ///
    /// Success maps to 200 with the body; failures carry the normalized
    /// error body and the status embedded in it by the policy.
    pub fn into_response(self, request_id: impl Into<String>) -> GatewayResponse {
        let (status, body, error) = match (&self.body, &self.error) {
            (Some(_), _) => (200, self.body.unwrap_or(Value::Null), None),
            (None, Some(err)) => {
                let status = err
                    .pointer("/error/httpStatus")
                    .and_then(Value::as_u64)
                    .unwrap_or(500) as u16;
                let message = err
                    .pointer("/error/message")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                (status, self.error.clone().unwrap_or(Value::Null), message)
            }
            (None, None) => (200, Value::Null, None),
        };
        GatewayResponse {
            status,
            headers: HashMap::new(),
            body,
            processing_time_ms: self.duration_ms,
            error,
            request_id: request_id.into(),
        }
    }
}
