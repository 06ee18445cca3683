use serde_json::{Map, Value};

use crate::error::ValidationError;
use crate::types::{ToolCallRequest, ToolSchema};

/// A call that passed schema validation and is ready to dispatch.
/// Unknown extra arguments ride along unchanged.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedCall {
    pub tool_name: String,
    pub arguments: Map<String, Value>,
}

/// Parse the raw text captured between tool-call delimiters into a request.
///
/// Accepts, in order:
/// 1. a JSON object `{"tool_name": …, "arguments": {…}}`;
/// 2. the same object with extraneous text around it (trimmed to the
///    outermost braces);
/// 3. the shorthand `name{…}` where a bare identifier precedes the
///    argument object.
pub fn parse_call(payload: &str, raw_span: (usize, usize)) -> Result<ToolCallRequest, ValidationError> {
    let trimmed = payload.trim();

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return request_from_payload(value, raw_span);
    }

    let start = trimmed
        .find('{')
        .ok_or_else(|| ValidationError::MalformedPayload("malformed JSON".into()))?;
    let end = trimmed
        .rfind('}')
        .filter(|&end| end > start)
        .ok_or_else(|| ValidationError::MalformedPayload("malformed JSON".into()))?;

    let inner: Value = serde_json::from_str(&trimmed[start..=end])
        .map_err(|_| ValidationError::MalformedPayload("malformed JSON".into()))?;

    // `name{…}` shorthand: a bare identifier before the braces names the
    // tool and the object itself is the argument map.
    let prefix = trimmed[..start].trim();
    if !prefix.is_empty() && is_identifier(prefix) {
        if let Value::Object(arguments) = inner {
            if !arguments.contains_key("tool_name") {
                return Ok(ToolCallRequest {
                    tool_name: prefix.to_string(),
                    arguments,
                    raw_span,
                });
            }
            return request_from_payload(Value::Object(arguments), raw_span);
        }
        return Err(ValidationError::MalformedPayload(
            "arguments must be an object".into(),
        ));
    }

    request_from_payload(inner, raw_span)
}

fn request_from_payload(value: Value, raw_span: (usize, usize)) -> Result<ToolCallRequest, ValidationError> {
    let Value::Object(mut payload) = value else {
        return Err(ValidationError::MalformedPayload("payload is not an object".into()));
    };

    let tool_name = match payload.remove("tool_name") {
        Some(Value::String(name)) if !name.is_empty() => name,
        _ => {
            return Err(ValidationError::MalformedPayload(
                "missing or malformed 'tool_name'".into(),
            ))
        }
    };

    let arguments = match payload.remove("arguments") {
        None => Map::new(),
        Some(Value::Object(args)) => args,
        Some(_) => {
            return Err(ValidationError::MalformedPayload(format!(
                "arguments for tool '{tool_name}' must be an object"
            )))
        }
    };

    Ok(ToolCallRequest {
        tool_name,
        arguments,
        raw_span,
    })
}

fn is_identifier(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.')
}

/// Validate a parsed request against the declared schemas.
///
/// Checks, in order: the tool exists; every required parameter is present
/// and type-compatible. Extra unknown arguments pass through untouched.
/// Pure — no side effects, consumes the request exactly once.
pub fn validate_call(
    request: ToolCallRequest,
    schemas: &[ToolSchema],
) -> Result<ValidatedCall, ValidationError> {
    let schema = schemas
        .iter()
        .find(|s| s.name == request.tool_name)
        .ok_or_else(|| ValidationError::UnknownTool(request.tool_name.clone()))?;

    for (name, param) in &schema.parameters {
        if !param.required {
            continue;
        }
        match request.arguments.get(name) {
            Some(value) if param.kind.matches(value) => {}
            _ => {
                return Err(ValidationError::SchemaViolation {
                    tool: request.tool_name.clone(),
                    field: name.clone(),
                })
            }
        }
    }

    Ok(ValidatedCall {
        tool_name: request.tool_name,
        arguments: request.arguments,
    })
}
