use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::{trim_context, TokenEstimator};
use crate::intercept::wrap_tool_result;
use crate::types::{Message, Role, ToolCallResult};

/// Serializable projection of conversation state. `turn_count` is a
/// runtime counter and deliberately not part of the snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSnapshot {
    pub messages: Vec<Message>,
    pub last_tool_calls: Vec<ToolCallResult>,
}

/// Owns the message history and the last turn's tool-call record.
///
/// Exactly one orchestration loop mutates a given instance at a time; the
/// engine only touches state through these operations, never directly.
pub struct ConversationStateManager {
    messages: Vec<Message>,
    last_tool_calls: Vec<ToolCallResult>,
    turn_count: usize,
}

impl ConversationStateManager {
    pub fn new() -> Self {
        Self {
            messages: Vec::new(),
            last_tool_calls: Vec::new(),
            turn_count: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn last_tool_calls(&self) -> &[ToolCallResult] {
        &self.last_tool_calls
    }

    pub fn turn_count(&self) -> usize {
        self.turn_count
    }

    /// Start a new turn: clear the last-turn call record and bump the
    /// counter.
    pub fn begin_turn(&mut self) {
        self.last_tool_calls.clear();
        self.turn_count += 1;
    }

    /// Install the assembled initial system prompt. Only valid on an empty
    /// history — the system message must come first.
    pub fn append_initial_prompt(&mut self, message: Message) {
        debug_assert!(self.messages.is_empty());
        debug_assert_eq!(message.role, Role::System);
        self.messages.push(message);
    }

    pub fn append_user_message(&mut self, content: &str) {
        self.messages.push(Message::user(content));
    }

    /// Record what the model produced, verbatim (tags included).
    pub fn append_assistant_chunk(&mut self, content: &str) {
        self.messages.push(Message::assistant(content));
    }

    /// Record a dispatched call: the wrapped result goes into history and
    /// the call lands in the last-turn record.
    pub fn append_tool_result(&mut self, result: ToolCallResult) {
        self.messages
            .push(Message::tool(wrap_tool_result(result.outcome.text())));
        self.last_tool_calls.push(result);
    }

    /// Inject an error payload for a call that never reached a tool
    /// (parse or validation failure). History only — no call record.
    pub fn append_tool_error(&mut self, payload: &str) {
        self.messages.push(Message::tool(wrap_tool_result(payload)));
    }

    /// Enforce the token budget over the history, in place.
    pub fn trim_to_budget(&mut self, max_tokens: u32, estimator: &dyn TokenEstimator) {
        trim_context(&mut self.messages, max_tokens, estimator);
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            messages: self.messages.clone(),
            last_tool_calls: self.last_tool_calls.clone(),
        }
    }

    /// Replace in-memory state wholesale with the snapshot's contents.
    /// Never merges. The turn counter restarts from zero.
    pub fn resume(&mut self, snapshot: ConversationSnapshot) {
        debug!(
            messages = snapshot.messages.len(),
            last_tool_calls = snapshot.last_tool_calls.len(),
            "resuming conversation state from snapshot"
        );
        self.messages = snapshot.messages;
        self.last_tool_calls = snapshot.last_tool_calls;
        self.turn_count = 0;
    }
}

impl Default for ConversationStateManager {
    fn default() -> Self {
        Self::new()
    }
}
