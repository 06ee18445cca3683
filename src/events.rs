use serde_json::Value;

/// Events emitted during a turn, for streaming consumers (UIs, logs).
/// Delivery is best-effort: a full or closed channel never stalls the loop.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    TurnStart { iteration: usize },
    Text { content: String },
    ToolCall { name: String, arguments: Value },
    ToolResult { name: String, output: String, is_error: bool },
    Finished { iterations: usize },
    Error { message: String },
}
