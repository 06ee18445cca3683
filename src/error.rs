/// Errors that end a turn (or construction). Everything the model could
/// plausibly react to is *not* here — validation and recoverable tool
/// failures are re-injected into the conversation instead of raised.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("prompt assembly failed: {0}")]
    Assembly(String),
    #[error("model stream error: {0}")]
    Model(#[from] ModelError),
    #[error("stream ended inside a tool call block: {0}")]
    TruncatedCall(String),
    #[error("exceeded {limit} tool iterations in a single turn")]
    MaxIterationsExceeded { limit: usize },
    #[error("tool transport unreachable: {0}")]
    ToolTransport(String),
    #[error("turn cancelled")]
    Cancelled,
    #[error("state error: {0}")]
    State(String),
}

/// Failure from the model stream service. Always fatal for the turn.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("failed to parse stream payload: {0}")]
    Parse(String),
}

/// Failure from the tool-execution service. `Execution` and `Timeout` are
/// recovered into conversation content; `Transport` is fatal.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool execution failed: {0}")]
    Execution(String),
    #[error("tool execution timed out after {0}ms")]
    Timeout(u64),
    #[error("tool transport error: {0}")]
    Transport(String),
}

impl ToolError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ToolError::Transport(_))
    }
}

/// Tool-call validation failures. Never surfaced as `Err` from the engine:
/// the Display form is injected into history as an error tool result so the
/// model can self-correct.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("ERROR: Invalid tool call ({0}).")]
    MalformedPayload(String),
    #[error("ERROR: Tool '{0}' not found.")]
    UnknownTool(String),
    #[error("ERROR: Tool '{tool}' missing or invalid required argument '{field}'.")]
    SchemaViolation { tool: String, field: String },
}
