use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Who said what. `System` carries the assembled initial prompt, `Tool`
/// carries injected tool results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// One entry in the conversation history. Immutable once appended, except
/// for removal by the context trimmer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, Value>>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(Role::Tool, content)
    }
}

/// Declared argument types a tool schema can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl ParamType {
    /// Whether a JSON value satisfies this declared type.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            ParamType::String => value.is_string(),
            ParamType::Number => value.is_number(),
            ParamType::Boolean => value.is_boolean(),
            ParamType::Object => value.is_object(),
            ParamType::Array => value.is_array(),
        }
    }
}

/// A single parameter in a tool schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolParam {
    #[serde(rename = "type")]
    pub kind: ParamType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub required: bool,
}

impl ToolParam {
    pub fn required(kind: ParamType, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            required: true,
        }
    }

    pub fn optional(kind: ParamType, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            required: false,
        }
    }
}

/// The declared contract of an invocable tool. Loaded once per conversation,
/// immutable afterwards. The BTreeMap keeps parameter ordering stable so
/// assembled prompts are deterministic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    #[serde(default)]
    pub parameters: BTreeMap<String, ToolParam>,
}

impl ToolSchema {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_param(mut self, name: impl Into<String>, param: ToolParam) -> Self {
        self.parameters.insert(name.into(), param);
        self
    }
}

/// A parsed tool-call candidate lifted out of the model stream.
/// `raw_span` is the byte range of the full `<tool_call>…</tool_call>` block
/// within the turn's concatenated stream output.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub tool_name: String,
    pub arguments: Map<String, Value>,
    pub raw_span: (usize, usize),
}

/// What came back from executing a dispatched call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOutcome {
    Success(String),
    Error(String),
}

impl ToolOutcome {
    pub fn text(&self) -> &str {
        match self {
            ToolOutcome::Success(s) | ToolOutcome::Error(s) => s,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ToolOutcome::Error(_))
    }
}

/// Record of one dispatched tool call: what was asked, with which arguments,
/// and what it produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallResult {
    pub tool_name: String,
    pub arguments: Map<String, Value>,
    #[serde(rename = "result")]
    pub outcome: ToolOutcome,
}

/// Metadata describing a resource the model may be told about on turn one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub uri: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "mimeType")]
    pub mime_type: String,
}

/// Sampling parameters forwarded to the model stream service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    pub temperature: f32,
    pub top_p: f32,
    pub max_tokens: Option<u32>,
    pub stop: Option<Vec<String>>,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            max_tokens: None,
            stop: None,
        }
    }
}

impl SamplerConfig {
    /// Request-body parameters, `None`s omitted.
    pub fn to_params(&self) -> Map<String, Value> {
        let mut params = Map::new();
        params.insert("temperature".into(), self.temperature.into());
        params.insert("top_p".into(), self.top_p.into());
        if let Some(max_tokens) = self.max_tokens {
            params.insert("max_tokens".into(), max_tokens.into());
        }
        if let Some(ref stop) = self.stop {
            params.insert("stop".into(), stop.clone().into());
        }
        params
    }
}

/// Result of `process_detailed`: the final text plus the per-call records
/// for the turn and, when a trace sink is attached, the collected traces.
#[derive(Debug, Clone)]
pub struct DetailedResponse {
    pub result: String,
    pub tool_calls: Vec<ToolCallResult>,
    pub traces: Option<Vec<Value>>,
}
