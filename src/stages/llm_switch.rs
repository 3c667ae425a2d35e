//! Protocol remap stage.
//!
//! Translates request and response bodies between wire protocols: Anthropic
//! messages, OpenAI chat completions, and Gemini generateContent. The
//! mapping is table-driven ([`TransformTable`]); a little glue around the
//! tables handles the parts that cannot be expressed as path moves (hoisting
//! an Anthropic `system` field into the OpenAI message list, stamping the
//! fixed `type`/`role` fields on synthesized Anthropic responses).

use crate::context::ExecutionContext;
use crate::error::{GatewayError, Result};
use crate::stage::{Stage, StageKind};
use crate::transform::{
    structural_hash, TransformCache, TransformMode, TransformOp, TransformRule, TransformTable,
};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Mutex;

/// Wire protocols the switch can translate between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// OpenAI `/v1/chat/completions` shapes.
    OpenaiChat,
    /// Anthropic `/v1/messages` shapes.
    AnthropicMessages,
    /// Gemini `generateContent` shapes.
    GeminiGenerate,
}

impl Protocol {
    /// Map a configured provider type string to its protocol family.
    pub fn from_provider_type(provider_type: &str) -> Result<Self> {
        match provider_type {
            "openai" | "qwen" => Ok(Protocol::OpenaiChat),
            "anthropic" => Ok(Protocol::AnthropicMessages),
            "gemini" => Ok(Protocol::GeminiGenerate),
            other => Err(GatewayError::StageConfigInvalid(format!(
                "unknown provider type '{other}'"
            ))),
        }
    }
}

/// Configuration for one [`LlmSwitch`] instance.
#[derive(Debug, Clone)]
pub struct LlmSwitchConfig {
    /// Protocol the client speaks.
    pub client: Protocol,
    /// Protocol the provider expects.
    pub provider: Protocol,
    /// Unknown-field handling on the request path.
    pub mode: TransformMode,
    /// Transform cache capacity; 0 disables the cache.
    pub cache_size: usize,
}

impl LlmSwitchConfig {
    /// Identity configuration for same-protocol pairs.
    pub fn passthrough(protocol: Protocol) -> Self {
        Self {
            client: protocol,
            provider: protocol,
            mode: TransformMode::Passthrough,
            cache_size: 0,
        }
    }
}

/// The protocol remap stage.
#[derive(Debug)]
pub struct LlmSwitch {
    config: LlmSwitchConfig,
    /// Client-protocol request → provider-protocol request. `None` = identity.
    request_table: Option<TransformTable>,
    /// Provider-protocol response → client-protocol response.
    response_table: Option<TransformTable>,
    cache: Option<Mutex<TransformCache>>,
}

impl LlmSwitch {
    /// Build the switch, resolving transform tables for the protocol pair.
    ///
    /// Unsupported pairs are a fatal configuration error.
    pub fn new(config: LlmSwitchConfig) -> Result<Self> {
        let (request_table, response_table) = match (config.client, config.provider) {
            (a, b) if a == b => (None, None),
            (Protocol::AnthropicMessages, Protocol::OpenaiChat) => (
                Some(anthropic_to_openai_request(config.mode)?),
                Some(openai_to_anthropic_response()?),
            ),
            (Protocol::OpenaiChat, Protocol::AnthropicMessages) => (
                Some(openai_to_anthropic_request(config.mode)?),
                Some(anthropic_to_openai_response()?),
            ),
            (Protocol::OpenaiChat, Protocol::GeminiGenerate) => (
                Some(openai_to_gemini_request(config.mode)?),
                Some(gemini_to_openai_response()?),
            ),
            (client, provider) => {
                return Err(GatewayError::StageConfigInvalid(format!(
                    "no transform table for protocol pair {client:?} -> {provider:?}"
                )))
            }
        };
        let cache = (config.cache_size > 0)
            .then(|| Mutex::new(TransformCache::new(config.cache_size)));
        Ok(Self {
            config,
            request_table,
            response_table,
            cache,
        })
    }

    /// The configured protocol pair.
    pub fn config(&self) -> &LlmSwitchConfig {
        &self.config
    }

    fn apply_request(&self, request: &Value) -> Result<Value> {
        let Some(table) = &self.request_table else {
            return Ok(request.clone());
        };

        let key = self.cache.as_ref().map(|_| structural_hash(request));
        if let (Some(cache), Some(key)) = (&self.cache, key) {
            let cache = cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(hit) = cache.get(key) {
                return Ok(hit.clone());
            }
        }

        let prepared = match (self.config.client, self.config.provider) {
            (Protocol::AnthropicMessages, Protocol::OpenaiChat) => hoist_system(request)?,
            _ => request.clone(),
        };
        let mut out = table.apply(&prepared)?;
        match (self.config.client, self.config.provider) {
            (Protocol::OpenaiChat, Protocol::GeminiGenerate) => {
                out = attach_gemini_system(request, out)?;
            }
            (Protocol::OpenaiChat, Protocol::AnthropicMessages) => {
                out = split_anthropic_system(out)?;
            }
            _ => {}
        }

        if let (Some(cache), Some(key)) = (&self.cache, key) {
            cache
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .put(key, out.clone());
        }
        Ok(out)
    }

    fn apply_response(&self, response: &Value) -> Result<Value> {
        let Some(table) = &self.response_table else {
            return Ok(response.clone());
        };
        let mut out = table.apply(response)?;
        if self.config.client == Protocol::AnthropicMessages {
            // Fixed fields the table cannot synthesize.
            out["type"] = json!("message");
            out["role"] = json!("assistant");
        }
        Ok(out)
    }
}

#[async_trait]
impl Stage for LlmSwitch {
    fn kind(&self) -> StageKind {
        StageKind::LlmSwitch
    }

    async fn process(&self, request: Value, ctx: &ExecutionContext) -> Result<Value> {
        ctx.check_cancelled()?;
        self.apply_request(&request)
    }

    async fn process_response(&self, response: Value, ctx: &ExecutionContext) -> Result<Value> {
        ctx.check_cancelled()?;
        self.apply_response(&response)
    }
}

/// Move an Anthropic top-level `system` prompt into the message list, where
/// the OpenAI protocol expects it.
fn hoist_system(request: &Value) -> Result<Value> {
    let mut out = request.clone();
    let Some(system) = out.as_object_mut().and_then(|o| o.remove("system")) else {
        return Ok(out);
    };
    let system_text: String = match &system {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect(),
        _ => String::new(),
    };
    if let Some(messages) = out.get_mut("messages").and_then(Value::as_array_mut) {
        messages.insert(0, json!({"role": "system", "content": system_text}));
    }
    Ok(out)
}

/// Anthropic rejects `system`-role entries in `messages`; pull them out
/// into the top-level `system` field after the table has run.
fn split_anthropic_system(mut out: Value) -> Result<Value> {
    let Some(messages) = out.get_mut("messages").and_then(Value::as_array_mut) else {
        return Ok(out);
    };
    let mut system_text = String::new();
    messages.retain(|message| {
        if message.get("role").and_then(Value::as_str) == Some("system") {
            if let Some(blocks) = message.get("content").and_then(Value::as_array) {
                for block in blocks {
                    system_text.push_str(block.get("text").and_then(Value::as_str).unwrap_or(""));
                }
            }
            false
        } else {
            true
        }
    });
    if !system_text.is_empty() {
        out["system"] = json!(system_text);
    }
    Ok(out)
}

/// Gemini keeps the system prompt out of `contents`, under
/// `systemInstruction`.
fn attach_gemini_system(original: &Value, mut out: Value) -> Result<Value> {
    let system_text: String = original
        .get("messages")
        .and_then(Value::as_array)
        .map(|messages| {
            messages
                .iter()
                .filter(|m| m.get("role").and_then(Value::as_str) == Some("system"))
                .filter_map(|m| m.get("content").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default();
    if !system_text.is_empty() {
        out["systemInstruction"] = json!({"parts": [{"text": system_text}]});
    }
    Ok(out)
}

fn op(name: &str, params: Value) -> Result<TransformOp> {
    TransformOp::resolve(name, &params)
}

fn anthropic_to_openai_request(mode: TransformMode) -> Result<TransformTable> {
    Ok(TransformTable::new(
        "llm-switch:anthropic->openai",
        vec![
            TransformRule::with_op(
                "model",
                "model",
                op("validation", json!({"type": "string", "required": true}))?,
            ),
            TransformRule::with_op(
                "messages",
                "messages",
                op("function", json!({"name": "anthropic-messages-to-openai"}))?,
            ),
            TransformRule::rename("max_tokens", "max_tokens"),
            TransformRule::rename("temperature", "temperature"),
            TransformRule::rename("top_p", "top_p"),
            TransformRule::rename("stream", "stream"),
            TransformRule::rename("stop_sequences", "stop"),
        ],
        mode,
    ))
}

fn openai_to_anthropic_request(mode: TransformMode) -> Result<TransformTable> {
    Ok(TransformTable::new(
        "llm-switch:openai->anthropic",
        vec![
            TransformRule::with_op(
                "model",
                "model",
                op("validation", json!({"type": "string", "required": true}))?,
            ),
            TransformRule::with_op(
                "messages",
                "messages",
                op("function", json!({"name": "openai-messages-to-anthropic"}))?,
            ),
            TransformRule::rename("max_tokens", "max_tokens"),
            TransformRule::rename("temperature", "temperature"),
            TransformRule::rename("top_p", "top_p"),
            TransformRule::rename("stream", "stream"),
            TransformRule::rename("stop", "stop_sequences"),
        ],
        mode,
    ))
}

fn openai_to_gemini_request(mode: TransformMode) -> Result<TransformTable> {
    Ok(TransformTable::new(
        "llm-switch:openai->gemini",
        vec![
            TransformRule::with_op(
                "messages",
                "contents",
                op("function", json!({"name": "messages-to-gemini-contents"}))?,
            ),
            TransformRule::rename("max_tokens", "generationConfig.maxOutputTokens"),
            TransformRule::rename("temperature", "generationConfig.temperature"),
            TransformRule::rename("top_p", "generationConfig.topP"),
            TransformRule::rename("stop", "generationConfig.stopSequences"),
        ],
        mode,
    ))
}

fn openai_to_anthropic_response() -> Result<TransformTable> {
    Ok(TransformTable::new(
        "llm-switch:openai-response->anthropic",
        vec![
            TransformRule::rename("id", "id"),
            TransformRule::rename("model", "model"),
            TransformRule::with_op(
                "choices.0.message.content",
                "content",
                op("function", json!({"name": "string-to-text-blocks"}))?,
            ),
            TransformRule::with_op(
                "choices.0.finish_reason",
                "stop_reason",
                op(
                    "mapping",
                    json!({"table": {
                        "stop": "end_turn",
                        "length": "max_tokens",
                        "tool_calls": "tool_use",
                    }}),
                )?,
            ),
            TransformRule::rename("usage.prompt_tokens", "usage.input_tokens"),
            TransformRule::rename("usage.completion_tokens", "usage.output_tokens"),
        ],
        TransformMode::Lax,
    ))
}

fn anthropic_to_openai_response() -> Result<TransformTable> {
    Ok(TransformTable::new(
        "llm-switch:anthropic-response->openai",
        vec![
            TransformRule::rename("id", "id"),
            TransformRule::rename("model", "model"),
            TransformRule::with_op(
                "content",
                "choices.0.message.content",
                op("function", json!({"name": "text-blocks-to-string"}))?,
            ),
            TransformRule::with_op(
                "stop_reason",
                "choices.0.finish_reason",
                op(
                    "mapping",
                    json!({"table": {
                        "end_turn": "stop",
                        "max_tokens": "length",
                        "tool_use": "tool_calls",
                    }}),
                )?,
            ),
            TransformRule::rename("usage.input_tokens", "usage.prompt_tokens"),
            TransformRule::rename("usage.output_tokens", "usage.completion_tokens"),
        ],
        TransformMode::Lax,
    ))
}

fn gemini_to_openai_response() -> Result<TransformTable> {
    Ok(TransformTable::new(
        "llm-switch:gemini-response->openai",
        vec![
            TransformRule::with_op(
                "candidates",
                "choices",
                op("function", json!({"name": "gemini-candidates-to-choices"}))?,
            ),
            TransformRule::rename("usageMetadata.promptTokenCount", "usage.prompt_tokens"),
            TransformRule::rename("usageMetadata.candidatesTokenCount", "usage.completion_tokens"),
            TransformRule::rename("modelVersion", "model"),
        ],
        TransformMode::Lax,
    ))
}
