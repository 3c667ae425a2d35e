//! The stage abstraction shared by all four pipeline stages.
//!
//! A stage sees the request on the forward path and the response on the
//! reverse path, both as opaque `serde_json::Value`s. Stages are stateless
//! per request; anything they need (transform tables, HTTP clients, token
//! caches) is built and validated at construction, before traffic flows.

use crate::context::ExecutionContext;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;

/// The four stage positions, in forward execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Protocol remap between client and provider wire formats.
    LlmSwitch,
    /// Streaming/non-streaming reconciliation.
    Workflow,
    /// Provider-specific field quirks.
    Compatibility,
    /// The outbound HTTP call.
    Provider,
}

impl StageKind {
    /// Forward execution order; the reverse pass walks this backwards.
    pub const FORWARD_ORDER: [StageKind; 4] = [
        StageKind::LlmSwitch,
        StageKind::Workflow,
        StageKind::Compatibility,
        StageKind::Provider,
    ];

    /// Stable stage name used in logs, events, and I/O records.
    pub fn name(self) -> &'static str {
        match self {
            StageKind::LlmSwitch => "llm-switch",
            StageKind::Workflow => "workflow",
            StageKind::Compatibility => "compatibility",
            StageKind::Provider => "provider",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One stage in a pipeline instance.
///
/// Object-safe so instances can hold `Box<dyn Stage>` quadruples without
/// generic plumbing. Transform stages must not block on I/O; only the
/// provider stage awaits the network.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Which of the four positions this stage occupies.
    fn kind(&self) -> StageKind;

    /// Transform the request on the forward path.
    async fn process(&self, request: Value, ctx: &ExecutionContext) -> Result<Value>;

    /// Transform the response on the reverse path.
    async fn process_response(&self, response: Value, ctx: &ExecutionContext) -> Result<Value>;
}
