//! Provider-quirk compatibility stage.
//!
//! LLMSwitch gets the body into the provider's protocol family; this stage
//! patches the idiosyncrasies of a specific provider within that family.
//! Qwen's DashScope API, for example, speaks OpenAI-flavored chat but nests
//! sampling controls under `parameters` and the prompt under `input`. The
//! response path is the derived reverse of the request table.

use crate::context::ExecutionContext;
use crate::error::Result;
use crate::stage::{Stage, StageKind};
use crate::transform::{TransformMode, TransformRule, TransformTable};
use async_trait::async_trait;
use serde_json::Value;

/// Configuration for one [`Compatibility`] instance.
#[derive(Debug, Clone)]
pub struct CompatibilityConfig {
    /// The provider type whose quirks apply.
    pub provider_type: String,
}

/// The provider-quirk stage.
pub struct Compatibility {
    /// Request-path table; `None` for providers without quirks.
    request_table: Option<TransformTable>,
    /// Response-path table, derived from the request table.
    response_table: Option<TransformTable>,
}

impl Compatibility {
    /// Build the stage for a provider type.
    ///
    /// Provider types without registered quirks get an identity stage; that
    /// is the common case, not an error.
    pub fn new(config: CompatibilityConfig) -> Result<Self> {
        let request_table = match config.provider_type.as_str() {
            "qwen" => Some(qwen_request_table()?),
            "gemini" => Some(gemini_request_table()?),
            _ => None,
        };
        let response_table = request_table.as_ref().map(TransformTable::reverse);
        Ok(Self {
            request_table,
            response_table,
        })
    }

    /// Whether this stage actually rewrites anything.
    pub fn is_identity(&self) -> bool {
        self.request_table.is_none()
    }
}

#[async_trait]
impl Stage for Compatibility {
    fn kind(&self) -> StageKind {
        StageKind::Compatibility
    }

    async fn process(&self, request: Value, ctx: &ExecutionContext) -> Result<Value> {
        ctx.check_cancelled()?;
        match &self.request_table {
            Some(table) => table.apply(&request),
            None => Ok(request),
        }
    }

    async fn process_response(&self, response: Value, ctx: &ExecutionContext) -> Result<Value> {
        ctx.check_cancelled()?;
        match &self.response_table {
            Some(table) => table.apply(&response),
            None => Ok(response),
        }
    }
}

/// DashScope nests sampling controls under `parameters` and the message
/// list under `input.messages`.
fn qwen_request_table() -> Result<TransformTable> {
    Ok(TransformTable::new(
        "compatibility:qwen",
        vec![
            TransformRule::rename("messages", "input.messages"),
            TransformRule::rename("max_tokens", "parameters.max_tokens"),
            TransformRule::rename("temperature", "parameters.temperature"),
            TransformRule::rename("top_p", "parameters.top_p"),
            TransformRule::rename("stream", "parameters.incremental_output"),
        ],
        TransformMode::Passthrough,
    ))
}

/// Gemini rejects OpenAI-only sampling knobs; strip what the protocol
/// remap left behind.
fn gemini_request_table() -> Result<TransformTable> {
    Ok(TransformTable::new(
        "compatibility:gemini",
        vec![
            TransformRule::rename("contents", "contents"),
            TransformRule::rename("systemInstruction", "systemInstruction"),
            TransformRule::rename("generationConfig", "generationConfig"),
        ],
        TransformMode::Lax,
    ))
}
