//! Content payload definitions.
//!
//! A commit carries exactly one content payload: a tagged union
//! discriminated by `content_type`. Seven built-in variants cover the
//! shapes an LLM conversation produces; a per-tract [`TypeRegistry`] can
//! extend the union with custom validated types.
//!
//! Text extraction for token counting follows a fixed rule: the `text`
//! field when present, else a string `content` field, else the canonical
//! JSON of `payload`.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{Result, TractError};
use crate::hash::canonical_json_string;
use crate::model::annotation::Priority;

/// Role of a dialogue message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DialogueRole {
    User,
    Assistant,
    System,
    Tool,
}

impl DialogueRole {
    pub const fn as_str(&self) -> &'static str {
        match self {
            DialogueRole::User => "user",
            DialogueRole::Assistant => "assistant",
            DialogueRole::System => "system",
            DialogueRole::Tool => "tool",
        }
    }
}

impl fmt::Display for DialogueRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a tool I/O payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolDirection {
    Call,
    Result,
}

impl ToolDirection {
    pub const fn as_str(&self) -> &'static str {
        match self {
            ToolDirection::Call => "call",
            ToolDirection::Result => "result",
        }
    }
}

/// Outcome of a tool invocation, when known.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolStatus {
    Success,
    Error,
}

/// Output rendering format.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Text,
    Markdown,
    Json,
}

/// A commit's content payload: the built-in tagged union.
///
/// The discriminator field is `content_type`; variants serialize to the
/// snake_case names the storage layer and compiler dispatch on.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "content_type", rename_all = "snake_case")]
pub enum Content {
    /// System-level instructions for the LLM. Default priority PINNED,
    /// compiles to the `system` role.
    Instruction { text: String },
    /// A dialogue message. The content's own role drives compilation.
    Dialogue {
        role: DialogueRole,
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// A tool call or tool result. Compiles to the `tool` role.
    ToolIo {
        tool_name: String,
        direction: ToolDirection,
        payload: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<ToolStatus>,
    },
    /// Internal reasoning or chain-of-thought.
    Reasoning { text: String },
    /// A produced artifact (code, document, config, ...).
    Artifact {
        artifact_type: String,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        language: Option<String>,
    },
    /// Final output content.
    Output {
        text: String,
        #[serde(default)]
        format: OutputFormat,
    },
    /// Freeform content with no schema enforcement. Used for merge
    /// commits and other structural markers.
    Freeform { payload: Value },
}

impl Content {
    /// The discriminator string stored alongside the payload.
    pub const fn content_type(&self) -> &'static str {
        match self {
            Content::Instruction { .. } => "instruction",
            Content::Dialogue { .. } => "dialogue",
            Content::ToolIo { .. } => "tool_io",
            Content::Reasoning { .. } => "reasoning",
            Content::Artifact { .. } => "artifact",
            Content::Output { .. } => "output",
            Content::Freeform { .. } => "freeform",
        }
    }

    /// Extract the primary text for token counting.
    pub fn extract_text(&self) -> String {
        match self {
            Content::Instruction { text }
            | Content::Reasoning { text }
            | Content::Output { text, .. } => text.clone(),
            Content::Dialogue { text, .. } => text.clone(),
            Content::Artifact { content, .. } => content.clone(),
            Content::ToolIo { payload, .. } | Content::Freeform { payload } => {
                canonical_json_string(payload).unwrap_or_default()
            }
        }
    }

    /// Serialize to the JSON object the blob store persists.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Convenience constructors for the common dialogue shapes.
    pub fn user(text: impl Into<String>) -> Self {
        Content::Dialogue {
            role: DialogueRole::User,
            text: text.into(),
            name: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Content::Dialogue {
            role: DialogueRole::Assistant,
            text: text.into(),
            name: None,
        }
    }

    pub fn instruction(text: impl Into<String>) -> Self {
        Content::Instruction { text: text.into() }
    }
}

/// Extract the primary text from a raw payload object.
///
/// The raw-value twin of [`Content::extract_text`], used when the payload
/// may be a custom registered type the built-in union does not know.
pub fn extract_text_from_value(data: &Value) -> String {
    if let Some(text) = data.get("text").and_then(Value::as_str) {
        return text.to_string();
    }
    if let Some(content) = data.get("content").and_then(Value::as_str) {
        return content.to_string();
    }
    if let Some(payload) = data.get("payload") {
        return canonical_json_string(payload).unwrap_or_default();
    }
    canonical_json_string(data).unwrap_or_default()
}

/// Default behavioral hints for a content type.
///
/// Consulted by the compiler (role mapping) and the compressor (what to
/// protect first) when no annotation overrides them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentTypeHints {
    pub default_priority: Priority,
    pub default_role: &'static str,
    /// 0 = compress first, 100 = protect.
    pub compression_priority: u8,
}

/// Hints for a built-in content type, `None` for unknown/custom types.
pub fn builtin_type_hints(content_type: &str) -> Option<ContentTypeHints> {
    match content_type {
        "instruction" => Some(ContentTypeHints {
            default_priority: Priority::Pinned,
            default_role: "system",
            compression_priority: 90,
        }),
        "dialogue" => Some(ContentTypeHints {
            default_priority: Priority::Normal,
            default_role: "user",
            compression_priority: 50,
        }),
        "tool_io" => Some(ContentTypeHints {
            default_priority: Priority::Normal,
            default_role: "tool",
            compression_priority: 30,
        }),
        "reasoning" => Some(ContentTypeHints {
            default_priority: Priority::Normal,
            default_role: "assistant",
            compression_priority: 40,
        }),
        "artifact" => Some(ContentTypeHints {
            default_priority: Priority::Normal,
            default_role: "assistant",
            compression_priority: 60,
        }),
        "output" => Some(ContentTypeHints {
            default_priority: Priority::Normal,
            default_role: "assistant",
            compression_priority: 70,
        }),
        "freeform" => Some(ContentTypeHints {
            default_priority: Priority::Normal,
            default_role: "assistant",
            compression_priority: 50,
        }),
        _ => None,
    }
}

/// Default priority for a content type (NORMAL for unknown types).
pub fn default_type_priority(content_type: &str) -> Priority {
    builtin_type_hints(content_type)
        .map(|h| h.default_priority)
        .unwrap_or(Priority::Normal)
}

/// Schema of a custom registered content type.
///
/// Deliberately small: a list of required fields with expected JSON
/// kinds. Full JSON-Schema validation is the host's concern; the engine
/// only needs enough structure to reject malformed payloads at the
/// commit boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CustomTypeSchema {
    /// Required field names mapped to expected kinds:
    /// `"string" | "number" | "bool" | "object" | "array" | "any"`.
    pub required: HashMap<String, String>,
    /// Role emitted for this type at compile time, default `assistant`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
}

/// Per-tract registry of custom content types, consulted before the
/// built-in union during boundary validation.
#[derive(Debug, Clone, Default)]
pub struct TypeRegistry {
    types: HashMap<String, CustomTypeSchema>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or shadow) a content type.
    pub fn register(&mut self, name: impl Into<String>, schema: CustomTypeSchema) {
        self.types.insert(name.into(), schema);
    }

    pub fn get(&self, name: &str) -> Option<&CustomTypeSchema> {
        self.types.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.types.contains_key(name)
    }

    /// Validate a raw payload against the registry, falling through to
    /// the built-in union when the type is not registered.
    pub fn validate(&self, data: &Value) -> Result<()> {
        let content_type = data
            .get("content_type")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                TractError::ContentValidation("payload is missing 'content_type'".to_string())
            })?;

        if let Some(schema) = self.types.get(content_type) {
            for (field, kind) in &schema.required {
                let value = data.get(field).ok_or_else(|| {
                    TractError::ContentValidation(format!(
                        "custom content type '{content_type}' requires field '{field}'"
                    ))
                })?;
                if !kind_matches(value, kind) {
                    return Err(TractError::ContentValidation(format!(
                        "custom content type '{content_type}': field '{field}' is not a {kind}"
                    )));
                }
            }
            return Ok(());
        }

        // Fall through to the built-in discriminated union.
        serde_json::from_value::<Content>(data.clone())
            .map(|_| ())
            .map_err(|e| TractError::ContentValidation(format!("Content validation failed: {e}")))
    }
}

fn kind_matches(value: &Value, kind: &str) -> bool {
    match kind {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "bool" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        _ => true,
    }
}
