//! Declarative request/response transforms.
//!
//! The LLMSwitch and Compatibility stages are table-driven: an ordered list
//! of [`TransformRule`]s, each moving a dotted `source` path to a `target`
//! path with an optional [`TransformOp`]. Ops are resolved by name at
//! startup from a fixed registry (`mapping`, `string`, `array`, `object`,
//! `function`, `validation`); an unknown name is a fatal configuration
//! error, never a per-request one.
//!
//! Tables can be reversed for the response path. Reversal drops rules that
//! are inherently lossy (non-invertible mappings, validations), which is the
//! documented lossy subset of the round-trip law.

use crate::error::{GatewayError, Result};
use serde_json::{json, Map, Value};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};

// ---------------------------------------------------------------------------
// Dotted paths
// ---------------------------------------------------------------------------

/// Read the value at a dotted path. Numeric segments index arrays.
pub fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Remove and return the value at a dotted path.
///
/// Only object keys are removed; an array hit at the final segment is
/// cloned in place (arrays keep their shape for the strict-mode residue
/// check).
pub fn take_path(value: &mut Value, path: &str) -> Option<Value> {
    let (parent_path, leaf) = match path.rsplit_once('.') {
        Some((p, l)) => (Some(p), l),
        None => (None, path),
    };

    let parent = match parent_path {
        Some(p) => get_path_mut(value, p)?,
        None => value,
    };

    match parent {
        Value::Object(map) => map.remove(leaf),
        Value::Array(items) => items.get(leaf.parse::<usize>().ok()?).cloned(),
        _ => None,
    }
}

fn get_path_mut<'a>(value: &'a mut Value, path: &str) -> Option<&'a mut Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = match current {
            Value::Object(map) => map.get_mut(segment)?,
            Value::Array(items) => items.get_mut(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Write a value at a dotted path, creating intermediate objects.
///
/// Fails when the path traverses something that is neither an object nor an
/// indexable array slot.
pub fn set_path(value: &mut Value, path: &str, new_value: Value) -> Result<()> {
    let mut current = value;
    let segments: Vec<&str> = path.split('.').collect();

    for (i, segment) in segments.iter().enumerate() {
        let last = i + 1 == segments.len();
        match current {
            Value::Object(map) => {
                if last {
                    map.insert(segment.to_string(), new_value);
                    return Ok(());
                }
                current = map
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
            }
            Value::Array(items) => {
                let idx = segment.parse::<usize>().map_err(|_| path_error(path))?;
                let slot = items.get_mut(idx).ok_or_else(|| path_error(path))?;
                if last {
                    *slot = new_value;
                    return Ok(());
                }
                current = slot;
            }
            _ => return Err(path_error(path)),
        }
    }
    unreachable!("set_path exits inside the loop")
}

fn path_error(path: &str) -> GatewayError {
    GatewayError::StageTransformFailed {
        stage: "transform".to_string(),
        message: format!("path '{path}' traverses a non-container value"),
    }
}

// ---------------------------------------------------------------------------
// Ops
// ---------------------------------------------------------------------------

/// A named value-to-value function from the fixed protocol registry.
#[derive(Clone, Copy)]
pub struct NamedFn {
    /// Registry name.
    pub name: &'static str,
    /// Name of the inverse function, when one exists.
    pub inverse: Option<&'static str>,
    func: fn(&Value) -> Result<Value>,
}

impl std::fmt::Debug for NamedFn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedFn").field("name", &self.name).finish()
    }
}

/// Expected JSON type for `validation` ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Any value is acceptable; only presence is checked.
    Any,
    /// Must be a string.
    String,
    /// Must be a number.
    Number,
    /// Must be a boolean.
    Bool,
    /// Must be an array.
    Array,
    /// Must be an object.
    Object,
}

impl ValueKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            ValueKind::Any => true,
            ValueKind::String => value.is_string(),
            ValueKind::Number => value.is_number(),
            ValueKind::Bool => value.is_boolean(),
            ValueKind::Array => value.is_array(),
            ValueKind::Object => value.is_object(),
        }
    }
}

/// String manipulation for `string` ops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StringOp {
    /// Prepend a fixed prefix.
    Prefix(String),
    /// Remove a fixed prefix when present.
    StripPrefix(String),
    /// Lowercase the value.
    Lowercase,
    /// Uppercase the value.
    Uppercase,
}

/// Array reshaping for `array` ops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArrayOp {
    /// Wrap the value in a one-element array.
    Wrap,
    /// Take the sole element out of a one-element array.
    Unwrap,
}

/// One transform operation applied to a moved value.
#[derive(Debug, Clone)]
pub enum TransformOp {
    /// Copy the value unchanged (a pure path move).
    Move,
    /// Substitute through a lookup table; `fallback` applies on miss,
    /// otherwise a miss passes the value through unchanged.
    Mapping {
        /// Source string → replacement value.
        table: HashMap<String, Value>,
        /// Replacement on lookup miss.
        fallback: Option<Value>,
    },
    /// String manipulation.
    String(StringOp),
    /// Array wrap/unwrap.
    Array(ArrayOp),
    /// Merge the (object) value's fields into the target object instead of
    /// nesting it under the target path's leaf.
    Object,
    /// Apply a named function from the fixed registry.
    Function(NamedFn),
    /// Assert presence/shape without changing the value.
    Validation {
        /// Expected type.
        expect: ValueKind,
        /// Whether absence is an error.
        required: bool,
    },
}

impl TransformOp {
    /// Resolve an op by registry name.
    ///
    /// `params` is op-specific configuration. Unknown names and malformed
    /// params are build-time errors.
    pub fn resolve(name: &str, params: &Value) -> Result<Self> {
        match name {
            "mapping" => {
                let table = params
                    .get("table")
                    .and_then(Value::as_object)
                    .ok_or_else(|| bad_params(name, "missing 'table' object"))?
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
                Ok(TransformOp::Mapping {
                    table,
                    fallback: params.get("fallback").cloned(),
                })
            }
            "string" => {
                let op = if let Some(p) = params.get("prefix").and_then(Value::as_str) {
                    StringOp::Prefix(p.to_string())
                } else if let Some(p) = params.get("strip_prefix").and_then(Value::as_str) {
                    StringOp::StripPrefix(p.to_string())
                } else {
                    match params.get("case").and_then(Value::as_str) {
                        Some("lower") => StringOp::Lowercase,
                        Some("upper") => StringOp::Uppercase,
                        _ => return Err(bad_params(name, "expected prefix/strip_prefix/case")),
                    }
                };
                Ok(TransformOp::String(op))
            }
            "array" => match params.get("mode").and_then(Value::as_str) {
                Some("wrap") => Ok(TransformOp::Array(ArrayOp::Wrap)),
                Some("unwrap") => Ok(TransformOp::Array(ArrayOp::Unwrap)),
                _ => Err(bad_params(name, "mode must be 'wrap' or 'unwrap'")),
            },
            "object" => Ok(TransformOp::Object),
            "function" => {
                let fn_name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or_else(|| bad_params(name, "missing function 'name'"))?;
                resolve_function(fn_name).map(TransformOp::Function).ok_or_else(|| {
                    GatewayError::StageConfigInvalid(format!(
                        "unknown transform function '{fn_name}'"
                    ))
                })
            }
            "validation" => {
                let expect = match params.get("type").and_then(Value::as_str) {
                    None | Some("any") => ValueKind::Any,
                    Some("string") => ValueKind::String,
                    Some("number") => ValueKind::Number,
                    Some("bool") => ValueKind::Bool,
                    Some("array") => ValueKind::Array,
                    Some("object") => ValueKind::Object,
                    Some(other) => {
                        return Err(bad_params(name, &format!("unknown type '{other}'")))
                    }
                };
                Ok(TransformOp::Validation {
                    expect,
                    required: params
                        .get("required")
                        .and_then(Value::as_bool)
                        .unwrap_or(false),
                })
            }
            other => Err(GatewayError::StageConfigInvalid(format!(
                "unknown transform op '{other}'"
            ))),
        }
    }

    fn apply(&self, value: Value, path: &str, label: &str) -> Result<Value> {
        let fail = |message: String| GatewayError::StageTransformFailed {
            stage: label.to_string(),
            message,
        };
        match self {
            TransformOp::Move | TransformOp::Object => Ok(value),
            TransformOp::Mapping { table, fallback } => {
                let key = value.as_str();
                match key.and_then(|k| table.get(k)) {
                    Some(mapped) => Ok(mapped.clone()),
                    None => Ok(fallback.clone().unwrap_or(value)),
                }
            }
            TransformOp::String(op) => {
                let s = value
                    .as_str()
                    .ok_or_else(|| fail(format!("'{path}' is not a string")))?;
                let out = match op {
                    StringOp::Prefix(p) => format!("{p}{s}"),
                    StringOp::StripPrefix(p) => s.strip_prefix(p.as_str()).unwrap_or(s).to_string(),
                    StringOp::Lowercase => s.to_lowercase(),
                    StringOp::Uppercase => s.to_uppercase(),
                };
                Ok(Value::String(out))
            }
            TransformOp::Array(ArrayOp::Wrap) => Ok(json!([value])),
            TransformOp::Array(ArrayOp::Unwrap) => match value {
                Value::Array(mut items) if items.len() == 1 => Ok(items.remove(0)),
                Value::Array(items) => Err(fail(format!(
                    "'{path}' has {} elements, expected exactly 1",
                    items.len()
                ))),
                _ => Err(fail(format!("'{path}' is not an array"))),
            },
            TransformOp::Function(f) => (f.func)(&value).map_err(|e| match e {
                GatewayError::StageTransformFailed { message, .. } => fail(message),
                other => other,
            }),
            TransformOp::Validation { expect, .. } => {
                if expect.matches(&value) {
                    Ok(value)
                } else {
                    Err(fail(format!("'{path}' failed {expect:?} validation")))
                }
            }
        }
    }

    /// The inverse op for response-path tables, when one exists.
    fn invert(&self) -> Option<TransformOp> {
        match self {
            TransformOp::Move => Some(TransformOp::Move),
            TransformOp::Object => Some(TransformOp::Object),
            TransformOp::Mapping { table, .. } => {
                let mut inverted = HashMap::with_capacity(table.len());
                for (k, v) in table {
                    let key = v.as_str()?.to_string();
                    if inverted.insert(key, Value::String(k.clone())).is_some() {
                        return None;
                    }
                }
                Some(TransformOp::Mapping {
                    table: inverted,
                    fallback: None,
                })
            }
            TransformOp::String(StringOp::Prefix(p)) => {
                Some(TransformOp::String(StringOp::StripPrefix(p.clone())))
            }
            TransformOp::String(StringOp::StripPrefix(p)) => {
                Some(TransformOp::String(StringOp::Prefix(p.clone())))
            }
            // Case folding is lossy.
            TransformOp::String(_) => None,
            TransformOp::Array(ArrayOp::Wrap) => Some(TransformOp::Array(ArrayOp::Unwrap)),
            TransformOp::Array(ArrayOp::Unwrap) => Some(TransformOp::Array(ArrayOp::Wrap)),
            TransformOp::Function(f) => {
                let inverse = f.inverse?;
                resolve_function(inverse).map(TransformOp::Function)
            }
            // Validations only make sense on the forward path.
            TransformOp::Validation { .. } => None,
        }
    }
}

fn bad_params(op: &str, detail: &str) -> GatewayError {
    GatewayError::StageConfigInvalid(format!("transform op '{op}': {detail}"))
}

// ---------------------------------------------------------------------------
// Rules and tables
// ---------------------------------------------------------------------------

/// One source→target mapping inside a table.
#[derive(Debug, Clone)]
pub struct TransformRule {
    /// Dotted path in the input.
    pub source: String,
    /// Dotted path in the output.
    pub target: String,
    /// Operation applied to the moved value.
    pub op: TransformOp,
}

impl TransformRule {
    /// A plain path move.
    pub fn rename(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            op: TransformOp::Move,
        }
    }

    /// A move with an explicit op.
    pub fn with_op(source: impl Into<String>, target: impl Into<String>, op: TransformOp) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            op,
        }
    }
}

/// Unknown-field handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransformMode {
    /// Unmapped source fields are a request error.
    Strict,
    /// Unmapped source fields are dropped.
    #[default]
    Lax,
    /// Unmapped source fields are copied through unchanged.
    Passthrough,
}

/// An ordered transform table.
#[derive(Debug, Clone)]
pub struct TransformTable {
    label: String,
    rules: Vec<TransformRule>,
    mode: TransformMode,
}

impl TransformTable {
    /// Build a table. The label shows up in error messages and logs.
    pub fn new(label: impl Into<String>, rules: Vec<TransformRule>, mode: TransformMode) -> Self {
        Self {
            label: label.into(),
            rules,
            mode,
        }
    }

    /// The table's label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Apply the table to an object value.
    ///
    /// Rules run in declared order; each consumes its source path from a
    /// working copy. What remains afterwards is handled per the mode.
    pub fn apply(&self, input: &Value) -> Result<Value> {
        if !input.is_object() {
            return Err(GatewayError::StageTransformFailed {
                stage: self.label.clone(),
                message: "transform input must be a JSON object".to_string(),
            });
        }

        let mut working = input.clone();
        let mut output = Value::Object(Map::new());

        for rule in &self.rules {
            match take_path(&mut working, &rule.source) {
                Some(value) => {
                    let transformed = rule.op.apply(value, &rule.source, &self.label)?;
                    if matches!(rule.op, TransformOp::Object) {
                        merge_object(&mut output, &rule.target, transformed, &self.label)?;
                    } else {
                        set_path(&mut output, &rule.target, transformed)?;
                    }
                }
                None => {
                    if let TransformOp::Validation { required: true, .. } = rule.op {
                        return Err(GatewayError::StageTransformFailed {
                            stage: self.label.clone(),
                            message: format!("required field '{}' is missing", rule.source),
                        });
                    }
                }
            }
        }

        match self.mode {
            TransformMode::Strict => {
                let leftover = residual_keys(&working);
                if !leftover.is_empty() {
                    return Err(GatewayError::StageTransformFailed {
                        stage: self.label.clone(),
                        message: format!("unknown fields: {}", leftover.join(", ")),
                    });
                }
            }
            TransformMode::Lax => {}
            TransformMode::Passthrough => {
                if let (Value::Object(rest), Value::Object(out)) = (&working, &mut output) {
                    for (k, v) in rest {
                        if !is_residual_empty(v) {
                            out.entry(k.clone()).or_insert_with(|| v.clone());
                        }
                    }
                }
            }
        }

        Ok(output)
    }

    /// Derive the response-path table: inverted rules in reverse order.
    ///
    /// Rules without an inverse (validations, lossy mappings) are dropped;
    /// the reverse table always runs in the forgiving mode because provider
    /// responses routinely carry extra fields.
    pub fn reverse(&self) -> TransformTable {
        let rules = self
            .rules
            .iter()
            .rev()
            .filter_map(|rule| {
                rule.op.invert().map(|op| TransformRule {
                    source: rule.target.clone(),
                    target: rule.source.clone(),
                    op,
                })
            })
            .collect();
        TransformTable {
            label: format!("{}:reverse", self.label),
            rules,
            mode: TransformMode::Passthrough,
        }
    }
}

fn merge_object(output: &mut Value, target: &str, value: Value, label: &str) -> Result<()> {
    let Value::Object(fields) = value else {
        return Err(GatewayError::StageTransformFailed {
            stage: label.to_string(),
            message: format!("'object' op at '{target}' needs an object value"),
        });
    };
    for (k, v) in fields {
        let path = if target.is_empty() {
            k
        } else {
            format!("{target}.{k}")
        };
        set_path(output, &path, v)?;
    }
    Ok(())
}

fn residual_keys(value: &Value) -> Vec<String> {
    match value {
        Value::Object(map) => map
            .iter()
            .filter(|(_, v)| !is_residual_empty(v))
            .map(|(k, _)| k.clone())
            .collect(),
        _ => Vec::new(),
    }
}

fn is_residual_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.values().all(is_residual_empty),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Function registry
// ---------------------------------------------------------------------------

/// Look up a named function in the fixed registry.
pub fn resolve_function(name: &str) -> Option<NamedFn> {
    FUNCTIONS.iter().find(|f| f.name == name).copied()
}

static FUNCTIONS: &[NamedFn] = &[
    NamedFn {
        name: "text-blocks-to-string",
        inverse: Some("string-to-text-blocks"),
        func: text_blocks_to_string,
    },
    NamedFn {
        name: "string-to-text-blocks",
        inverse: Some("text-blocks-to-string"),
        func: string_to_text_blocks,
    },
    NamedFn {
        name: "messages-to-gemini-contents",
        inverse: Some("gemini-contents-to-messages"),
        func: messages_to_gemini_contents,
    },
    NamedFn {
        name: "gemini-contents-to-messages",
        inverse: Some("messages-to-gemini-contents"),
        func: gemini_contents_to_messages,
    },
    NamedFn {
        name: "anthropic-messages-to-openai",
        inverse: Some("openai-messages-to-anthropic"),
        func: anthropic_messages_to_openai,
    },
    NamedFn {
        name: "openai-messages-to-anthropic",
        inverse: Some("anthropic-messages-to-openai"),
        func: openai_messages_to_anthropic,
    },
    NamedFn {
        name: "gemini-candidates-to-choices",
        inverse: None,
        func: gemini_candidates_to_choices,
    },
];

fn transform_err(message: impl Into<String>) -> GatewayError {
    GatewayError::StageTransformFailed {
        stage: "transform".to_string(),
        message: message.into(),
    }
}

/// Anthropic-style content blocks → plain string.
///
/// `[{"type": "text", "text": "hi"}, ...]` becomes the concatenated text.
/// A bare string passes through.
fn text_blocks_to_string(value: &Value) -> Result<Value> {
    match value {
        Value::String(_) => Ok(value.clone()),
        Value::Array(blocks) => {
            let mut out = String::new();
            for block in blocks {
                match block.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        out.push_str(block.get("text").and_then(Value::as_str).unwrap_or(""))
                    }
                    // Non-text blocks (tool_use, images) are a documented
                    // lossy case for this function.
                    _ => {}
                }
            }
            Ok(Value::String(out))
        }
        _ => Err(transform_err("content must be a string or block array")),
    }
}

/// Plain string → one Anthropic-style text block.
fn string_to_text_blocks(value: &Value) -> Result<Value> {
    match value {
        Value::String(s) => Ok(json!([{"type": "text", "text": s}])),
        Value::Array(_) => Ok(value.clone()),
        _ => Err(transform_err("content must be a string or block array")),
    }
}

/// OpenAI-style messages → Gemini `contents`.
///
/// Role `assistant` becomes `model`; content strings become one-part
/// `parts` arrays. System messages are skipped here (they map to
/// `systemInstruction` via a separate rule).
fn messages_to_gemini_contents(value: &Value) -> Result<Value> {
    let messages = value
        .as_array()
        .ok_or_else(|| transform_err("messages must be an array"))?;
    let mut contents = Vec::with_capacity(messages.len());
    for message in messages {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        if role == "system" {
            continue;
        }
        let text = match message.get("content") {
            Some(content) => text_blocks_to_string(content)?,
            None => Value::String(String::new()),
        };
        contents.push(json!({
            "role": if role == "assistant" { "model" } else { "user" },
            "parts": [{"text": text}],
        }));
    }
    Ok(Value::Array(contents))
}

/// Gemini `contents` → OpenAI-style messages.
fn gemini_contents_to_messages(value: &Value) -> Result<Value> {
    let contents = value
        .as_array()
        .ok_or_else(|| transform_err("contents must be an array"))?;
    let mut messages = Vec::with_capacity(contents.len());
    for content in contents {
        let role = content.get("role").and_then(Value::as_str).unwrap_or("user");
        let text: String = content
            .get("parts")
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default();
        messages.push(json!({
            "role": if role == "model" { "assistant" } else { "user" },
            "content": text,
        }));
    }
    Ok(Value::Array(messages))
}

/// Anthropic message array → OpenAI message array.
///
/// Roles pass through; block-array content collapses to a string.
fn anthropic_messages_to_openai(value: &Value) -> Result<Value> {
    let messages = value
        .as_array()
        .ok_or_else(|| transform_err("messages must be an array"))?;
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        let content = match message.get("content") {
            Some(content) => text_blocks_to_string(content)?,
            None => Value::String(String::new()),
        };
        out.push(json!({"role": role, "content": content}));
    }
    Ok(Value::Array(out))
}

/// OpenAI message array → Anthropic message array (content as text blocks).
fn openai_messages_to_anthropic(value: &Value) -> Result<Value> {
    let messages = value
        .as_array()
        .ok_or_else(|| transform_err("messages must be an array"))?;
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        let content = match message.get("content") {
            Some(content) => string_to_text_blocks(content)?,
            None => json!([]),
        };
        out.push(json!({"role": role, "content": content}));
    }
    Ok(Value::Array(out))
}

/// Gemini `candidates` → OpenAI `choices`.
fn gemini_candidates_to_choices(value: &Value) -> Result<Value> {
    let candidates = value
        .as_array()
        .ok_or_else(|| transform_err("candidates must be an array"))?;
    let mut choices = Vec::with_capacity(candidates.len());
    for (index, candidate) in candidates.iter().enumerate() {
        let text: String = candidate
            .pointer("/content/parts")
            .and_then(Value::as_array)
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(Value::as_str))
                    .collect()
            })
            .unwrap_or_default();
        let finish = match candidate.get("finishReason").and_then(Value::as_str) {
            Some("MAX_TOKENS") => "length",
            _ => "stop",
        };
        choices.push(json!({
            "index": index,
            "message": {"role": "assistant", "content": text},
            "finish_reason": finish,
        }));
    }
    Ok(Value::Array(choices))
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Order-insensitive structural hash of a JSON value.
pub fn structural_hash(value: &Value) -> u64 {
    let mut hasher = DefaultHasher::new();
    hash_value(value, &mut hasher);
    hasher.finish()
}

fn hash_value(value: &Value, hasher: &mut DefaultHasher) {
    match value {
        Value::Null => 0u8.hash(hasher),
        Value::Bool(b) => {
            1u8.hash(hasher);
            b.hash(hasher);
        }
        Value::Number(n) => {
            2u8.hash(hasher);
            n.to_string().hash(hasher);
        }
        Value::String(s) => {
            3u8.hash(hasher);
            s.hash(hasher);
        }
        Value::Array(items) => {
            4u8.hash(hasher);
            items.len().hash(hasher);
            for item in items {
                hash_value(item, hasher);
            }
        }
        Value::Object(map) => {
            5u8.hash(hasher);
            map.len().hash(hasher);
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                key.hash(hasher);
                hash_value(&map[key.as_str()], hasher);
            }
        }
    }
}

/// Bounded transform cache keyed by structural hash.
///
/// Insertion-order eviction; a handful of entries is enough to absorb the
/// common case of identical system prompts hitting the same table.
#[derive(Debug)]
pub struct TransformCache {
    capacity: usize,
    entries: HashMap<u64, Value>,
    order: VecDeque<u64>,
}

impl TransformCache {
    /// Create a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: HashMap::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
        }
    }

    /// Look up a transformed value by input hash.
    pub fn get(&self, key: u64) -> Option<&Value> {
        self.entries.get(&key)
    }

    /// Insert a transformed value, evicting the oldest entry when full.
    pub fn put(&mut self, key: u64, value: Value) {
        if self.capacity == 0 || self.entries.contains_key(&key) {
            return;
        }
        if self.entries.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
        self.entries.insert(key, value);
        self.order.push_back(key);
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_path_nested() {
        let v = json!({"a": {"b": {"c": 42}}, "list": [{"x": 1}, {"x": 2}]});
        assert_eq!(get_path(&v, "a.b.c"), Some(&json!(42)));
        assert_eq!(get_path(&v, "list.1.x"), Some(&json!(2)));
        assert_eq!(get_path(&v, "a.missing"), None);
    }

    #[test]
    fn test_set_path_creates_intermediates() {
        let mut v = json!({});
        set_path(&mut v, "parameters.max_tokens", json!(512)).unwrap();
        assert_eq!(v, json!({"parameters": {"max_tokens": 512}}));
    }

    #[test]
    fn test_set_path_rejects_scalar_traversal() {
        let mut v = json!({"a": 1});
        assert!(set_path(&mut v, "a.b", json!(2)).is_err());
    }

    #[test]
    fn test_take_path_removes_key() {
        let mut v = json!({"a": {"b": 1}, "c": 2});
        assert_eq!(take_path(&mut v, "a.b"), Some(json!(1)));
        assert_eq!(v, json!({"a": {}, "c": 2}));
    }

    #[test]
    fn test_table_rename_and_modes() {
        let table = TransformTable::new(
            "t",
            vec![TransformRule::rename("max_tokens", "parameters.max_tokens")],
            TransformMode::Strict,
        );
        let out = table.apply(&json!({"max_tokens": 100})).unwrap();
        assert_eq!(out, json!({"parameters": {"max_tokens": 100}}));

        // Strict rejects unknown fields.
        let err = table
            .apply(&json!({"max_tokens": 100, "rogue": true}))
            .unwrap_err();
        assert_eq!(err.code(), "STAGE_TRANSFORM_FAILED");

        // Passthrough carries them instead.
        let table = TransformTable::new(
            "t",
            vec![TransformRule::rename("max_tokens", "parameters.max_tokens")],
            TransformMode::Passthrough,
        );
        let out = table
            .apply(&json!({"max_tokens": 100, "temperature": 0.5}))
            .unwrap();
        assert_eq!(out["temperature"], json!(0.5));
    }

    #[test]
    fn test_mapping_op_with_fallback() {
        let op = TransformOp::resolve(
            "mapping",
            &json!({"table": {"assistant": "model"}, "fallback": "user"}),
        )
        .unwrap();
        assert_eq!(
            op.apply(json!("assistant"), "role", "t").unwrap(),
            json!("model")
        );
        assert_eq!(op.apply(json!("weird"), "role", "t").unwrap(), json!("user"));
    }

    #[test]
    fn test_unknown_op_is_config_error() {
        let err = TransformOp::resolve("rot13", &json!({})).unwrap_err();
        assert_eq!(err.code(), "STAGE_CONFIG_INVALID");
    }

    #[test]
    fn test_object_op_merges_fields() {
        let table = TransformTable::new(
            "t",
            vec![TransformRule::with_op(
                "parameters",
                "",
                TransformOp::resolve("object", &json!({})).unwrap(),
            )],
            TransformMode::Passthrough,
        );
        let out = table
            .apply(&json!({"model": "m", "parameters": {"max_tokens": 9, "top_p": 0.5}}))
            .unwrap();
        assert_eq!(out, json!({"max_tokens": 9, "top_p": 0.5, "model": "m"}));
    }

    #[test]
    fn test_validation_required() {
        let table = TransformTable::new(
            "t",
            vec![TransformRule::with_op(
                "model",
                "model",
                TransformOp::resolve("validation", &json!({"type": "string", "required": true}))
                    .unwrap(),
            )],
            TransformMode::Lax,
        );
        assert!(table.apply(&json!({"model": "m1"})).is_ok());
        assert!(table.apply(&json!({})).is_err());
        assert!(table.apply(&json!({"model": 7})).is_err());
    }

    #[test]
    fn test_round_trip_on_lossless_subset() {
        let table = TransformTable::new(
            "t",
            vec![
                TransformRule::rename("max_tokens", "parameters.max_tokens"),
                TransformRule::with_op(
                    "role",
                    "role",
                    TransformOp::resolve("mapping", &json!({"table": {"assistant": "model"}}))
                        .unwrap(),
                ),
            ],
            TransformMode::Lax,
        );
        let input = json!({"max_tokens": 64, "role": "assistant"});
        let forward = table.apply(&input).unwrap();
        let back = table.reverse().apply(&forward).unwrap();
        assert_eq!(back, input);
    }

    #[test]
    fn test_text_block_functions_invert() {
        let blocks = json!([{"type": "text", "text": "hello"}]);
        let s = text_blocks_to_string(&blocks).unwrap();
        assert_eq!(s, json!("hello"));
        assert_eq!(string_to_text_blocks(&s).unwrap(), blocks);
    }

    #[test]
    fn test_gemini_content_functions() {
        let messages = json!([
            {"role": "user", "content": "hi"},
            {"role": "assistant", "content": "hello"},
        ]);
        let contents = messages_to_gemini_contents(&messages).unwrap();
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["text"], "hello");

        let back = gemini_contents_to_messages(&contents).unwrap();
        assert_eq!(back, messages);
    }

    #[test]
    fn test_structural_hash_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"x": 1, "y": [1, 2]}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"y": [1, 2], "x": 1}"#).unwrap();
        assert_eq!(structural_hash(&a), structural_hash(&b));
        assert_ne!(structural_hash(&a), structural_hash(&json!({"x": 2})));
    }

    #[test]
    fn test_cache_evicts_oldest() {
        let mut cache = TransformCache::new(2);
        cache.put(1, json!("a"));
        cache.put(2, json!("b"));
        cache.put(3, json!("c"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(1).is_none());
        assert_eq!(cache.get(3), Some(&json!("c")));
    }
}
