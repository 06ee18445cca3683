use tracing::debug;

use crate::types::Message;

/// Estimates the token cost of a message list for a model family.
/// Pure: no state, no side effects.
pub trait TokenEstimator: Send + Sync {
    fn estimate(&self, messages: &[Message]) -> u32;
}

/// Default estimator: 4 tokens of per-message overhead plus content
/// chars / 4. Good enough for budget enforcement; swap in a real tokenizer
/// behind the trait when exact counts matter.
pub struct HeuristicTokenEstimator;

impl TokenEstimator for HeuristicTokenEstimator {
    fn estimate(&self, messages: &[Message]) -> u32 {
        messages
            .iter()
            .map(|m| 4 + estimate_str_tokens(&m.content))
            .sum()
    }
}

/// chars/4 heuristic for a plain string.
pub fn estimate_str_tokens(s: &str) -> u32 {
    (s.len() as u32) / 4
}

/// Trim the history in place until it fits `max_tokens`.
///
/// Removes the message at index 1 repeatedly: the first message (the
/// assembled system prompt) always survives, and so does the latest
/// message. Stops at two messages even if still over budget. Idempotent —
/// an already-fitting list is untouched.
pub fn trim_context(messages: &mut Vec<Message>, max_tokens: u32, estimator: &dyn TokenEstimator) {
    let before = messages.len();
    while estimator.estimate(messages) > max_tokens && messages.len() > 2 {
        messages.remove(1);
    }
    if messages.len() < before {
        debug!(
            dropped = before - messages.len(),
            remaining = messages.len(),
            "trimmed context to token budget"
        );
    }
}
