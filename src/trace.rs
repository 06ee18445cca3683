use std::path::Path;
use std::sync::Mutex;

use serde_json::{json, Value};
use tracing::info;

use crate::error::OrchestratorError;

/// Fire-and-forget sink for interaction traces. Failures here must never
/// affect orchestration outcome, so the interface is infallible.
pub trait TraceSink: Send + Sync {
    /// Record a structured event (system message, tool result, …).
    fn log_event(&self, event: Value);

    /// Record a complete per-turn interaction trace.
    fn log_complete_trace(&self, trace: Value);

    /// Traces collected so far, if this sink retains them.
    fn traces(&self) -> Vec<Value> {
        Vec::new()
    }
}

/// In-memory sink that retains events and traces for later export.
/// Each complete trace gets a timestamp and an explicit `reward` field
/// (null unless the caller supplied one) so downstream training code can
/// fill it in, plus any events recorded since the previous trace.
pub struct MemoryTraceSink {
    events: Mutex<Vec<Value>>,
    complete: Mutex<Vec<Value>>,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            complete: Mutex::new(Vec::new()),
        }
    }

    /// Write all collected traces to disk: JSONL when the path ends in
    /// `.jsonl` (appending), pretty JSON otherwise.
    pub async fn save_all(&self, path: impl AsRef<Path>) -> Result<(), OrchestratorError> {
        let path = path.as_ref();
        let traces = self.traces();
        if traces.is_empty() {
            info!("no interaction traces to save");
            return Ok(());
        }

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| OrchestratorError::State(e.to_string()))?;
            }
        }

        if path.extension().is_some_and(|ext| ext == "jsonl") {
            let mut lines = String::new();
            for trace in &traces {
                lines.push_str(&trace.to_string());
                lines.push('\n');
            }
            let existing = tokio::fs::read_to_string(path).await.unwrap_or_default();
            tokio::fs::write(path, existing + &lines)
                .await
                .map_err(|e| OrchestratorError::State(e.to_string()))?;
        } else {
            let body = serde_json::to_string_pretty(&traces)
                .map_err(|e| OrchestratorError::State(e.to_string()))?;
            tokio::fs::write(path, body)
                .await
                .map_err(|e| OrchestratorError::State(e.to_string()))?;
        }

        info!(count = traces.len(), path = %path.display(), "saved interaction traces");
        Ok(())
    }
}

impl Default for MemoryTraceSink {
    fn default() -> Self {
        Self::new()
    }
}

impl TraceSink for MemoryTraceSink {
    fn log_event(&self, event: Value) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    fn log_complete_trace(&self, trace: Value) {
        let mut stamped = json!({
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "reward": trace.get("reward").cloned().unwrap_or(Value::Null),
        });
        if let (Value::Object(out), Value::Object(fields)) = (&mut stamped, &trace) {
            for (key, value) in fields {
                out.insert(key.clone(), value.clone());
            }
        }

        let drained: Vec<Value> = self
            .events
            .lock()
            .map(|mut events| events.drain(..).collect())
            .unwrap_or_default();
        if !drained.is_empty() {
            stamped["events"] = Value::Array(drained);
        }

        if let Ok(mut complete) = self.complete.lock() {
            complete.push(stamped);
        }
    }

    fn traces(&self) -> Vec<Value> {
        self.complete
            .lock()
            .map(|complete| complete.clone())
            .unwrap_or_default()
    }
}
