use tracing::debug;

use crate::error::OrchestratorError;

pub const TOOL_CALL_OPEN: &str = "<tool_call>";
pub const TOOL_CALL_CLOSE: &str = "</tool_call>";
pub const TOOL_RESULT_OPEN: &str = "<tool_result>";
pub const TOOL_RESULT_CLOSE: &str = "</tool_result>";
pub const AVAILABLE_TOOLS_OPEN: &str = "<available_tools>";
pub const AVAILABLE_TOOLS_CLOSE: &str = "</available_tools>";
pub const AVAILABLE_RESOURCES_OPEN: &str = "<available_resources>";
pub const AVAILABLE_RESOURCES_CLOSE: &str = "</available_resources>";
pub const THOUGHT_OPEN: &str = "<thought>";
pub const THOUGHT_CLOSE: &str = "</thought>";

/// What the interceptor surfaces while consuming a model stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Plain assistant text, delivered in stream order.
    Text(String),
    /// A complete tool-call block. `payload` is the raw text between the
    /// delimiters; `span` is the byte range of the whole block in the
    /// turn's concatenated stream output.
    ToolCall { payload: String, span: (usize, usize) },
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum State {
    Passthrough,
    Body,
    Finished,
}

/// State machine that lifts `<tool_call>` blocks out of a fragment stream.
///
/// Fragment boundaries are arbitrary — a delimiter may arrive split across
/// any number of fragments. In passthrough, everything that cannot still
/// become an opening delimiter is emitted immediately; only a trailing
/// prefix of the tag is held back, and a failed match re-emits it
/// unchanged. Inside a block nothing is emitted until the closing
/// delimiter lands. One call per turn: after a block completes, the rest
/// of the stream is discarded.
pub struct StreamInterceptor {
    state: State,
    /// Trailing bytes that may still become the opening delimiter.
    held: String,
    /// Accumulated call body (between the delimiters).
    body: String,
    /// Everything consumed this turn, truncated at the block end once a
    /// call is detected. This is what gets recorded as the assistant
    /// message, verbatim.
    consumed: String,
    /// Byte offset of the opening delimiter in `consumed`.
    span_start: usize,
}

impl StreamInterceptor {
    pub fn new() -> Self {
        Self {
            state: State::Passthrough,
            held: String::new(),
            body: String::new(),
            consumed: String::new(),
            span_start: 0,
        }
    }

    /// Consume one fragment, returning the events it completes.
    pub fn feed(&mut self, fragment: &str) -> Vec<StreamEvent> {
        if self.state == State::Finished {
            return Vec::new();
        }

        self.consumed.push_str(fragment);
        let mut events = Vec::new();
        let mut work = std::mem::take(&mut self.held);
        work.push_str(fragment);

        loop {
            match self.state {
                State::Passthrough => {
                    if let Some(pos) = work.find(TOOL_CALL_OPEN) {
                        if pos > 0 {
                            events.push(StreamEvent::Text(work[..pos].to_string()));
                        }
                        self.span_start = self.consumed.len() - work.len() + pos;
                        work.drain(..pos + TOOL_CALL_OPEN.len());
                        self.state = State::Body;
                    } else {
                        let keep = longest_suffix_prefix(&work, TOOL_CALL_OPEN);
                        if keep < work.len() {
                            events.push(StreamEvent::Text(work[..work.len() - keep].to_string()));
                        }
                        self.held = work.split_off(work.len() - keep);
                        break;
                    }
                }
                State::Body => {
                    self.body.push_str(&work);
                    work.clear();
                    if let Some(pos) = self.body.find(TOOL_CALL_CLOSE) {
                        let payload = self.body[..pos].to_string();
                        let span_end =
                            self.span_start + TOOL_CALL_OPEN.len() + pos + TOOL_CALL_CLOSE.len();
                        self.consumed.truncate(span_end);
                        self.state = State::Finished;
                        debug!(
                            span_start = self.span_start,
                            span_end, "tool call block intercepted"
                        );
                        events.push(StreamEvent::ToolCall {
                            payload,
                            span: (self.span_start, span_end),
                        });
                    }
                    break;
                }
                State::Finished => break,
            }
        }

        events
    }

    /// Signal end-of-stream. Flushes a held delimiter prefix as text, or
    /// fails if the stream died inside a call block.
    pub fn finish(&mut self) -> Result<Option<StreamEvent>, OrchestratorError> {
        match self.state {
            State::Passthrough => {
                self.state = State::Finished;
                if self.held.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(StreamEvent::Text(std::mem::take(&mut self.held))))
                }
            }
            State::Body => Err(OrchestratorError::TruncatedCall(preview(&self.body))),
            State::Finished => Ok(None),
        }
    }

    /// The raw stream text consumed this turn. After a detection this ends
    /// exactly at the closing delimiter.
    pub fn consumed(&self) -> &str {
        &self.consumed
    }

    /// Whether a tool call has been detected (no further input is read).
    pub fn is_finished(&self) -> bool {
        self.state == State::Finished
    }
}

impl Default for StreamInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

/// First 120 bytes of a partial call body, for error reporting.
fn preview(body: &str) -> String {
    let mut end = body.len().min(120);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    body[..end].to_string()
}

/// Length of the longest suffix of `text` that is a proper prefix of `tag`.
/// Tags are ASCII, so a matching suffix always sits on a char boundary.
fn longest_suffix_prefix(text: &str, tag: &str) -> usize {
    let text = text.as_bytes();
    let tag = tag.as_bytes();
    for len in (1..tag.len()).rev() {
        if len <= text.len() && text[text.len() - len..] == tag[..len] {
            return len;
        }
    }
    0
}

/// Wrap a tool result payload in its protocol delimiters for injection.
pub fn wrap_tool_result(content: &str) -> String {
    format!("{TOOL_RESULT_OPEN}\n{content}\n{TOOL_RESULT_CLOSE}")
}

const BLOCK_TAGS: [(&str, &str); 5] = [
    (TOOL_CALL_OPEN, TOOL_CALL_CLOSE),
    (TOOL_RESULT_OPEN, TOOL_RESULT_CLOSE),
    (AVAILABLE_TOOLS_OPEN, AVAILABLE_TOOLS_CLOSE),
    (AVAILABLE_RESOURCES_OPEN, AVAILABLE_RESOURCES_CLOSE),
    (THOUGHT_OPEN, THOUGHT_CLOSE),
];

/// Strip complete protocol blocks from the final assistant text and
/// normalize whitespace. Incomplete blocks are left as-is.
pub fn clean_final_output(text: &str) -> String {
    let mut out = text.to_string();
    for (open, close) in BLOCK_TAGS {
        while let Some(start) = out.find(open) {
            let Some(rel) = out[start + open.len()..].find(close) else {
                break;
            };
            let end = start + open.len() + rel + close.len();
            out.replace_range(start..end, "");
        }
    }
    while out.contains("\n\n\n") {
        out = out.replace("\n\n\n", "\n\n");
    }
    out.trim().to_string()
}
