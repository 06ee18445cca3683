use crate::error::OrchestratorError;
use crate::intercept::{
    AVAILABLE_RESOURCES_CLOSE, AVAILABLE_RESOURCES_OPEN, AVAILABLE_TOOLS_CLOSE,
    AVAILABLE_TOOLS_OPEN,
};
use crate::types::{Message, ResourceDescriptor, ToolSchema};

/// Builds the initial system message from instructions, tool schemas, and
/// resource descriptors. Implementations must be deterministic for
/// identical inputs.
pub trait PromptBuilder: Send + Sync {
    fn available_tools_block(&self, schemas: &[ToolSchema]) -> String;

    fn available_resources_block(&self, resources: &[ResourceDescriptor]) -> String;

    fn build_initial_prompt(
        &self,
        user_input: &str,
        schemas: &[ToolSchema],
        resources: &[ResourceDescriptor],
    ) -> Result<Message, OrchestratorError>;
}

const INSTRUCTIONS: &str = "\
INSTRUCTIONS: You are an AI assistant that can use tools to help solve problems. \
After using tools to gather information, provide a complete, natural language \
response to the user's question. \
If you want to use a tool, you MUST use ONLY the tool names listed in the \
<available_tools> block below. \
Always emit a <tool_call>...</tool_call> block with valid, complete JSON inside. \
Before calling a tool, explain your thinking in a <thought>...</thought> block. \
Do NOT invent tool names. Do NOT use any tool not listed. \
Do NOT emit malformed or incomplete JSON. \
After using a tool and receiving its result, continue your reasoning to provide \
a complete answer to the user's question.

CORRECT EXAMPLE:
<thought>I need to add two numbers. I'll use the add tool.</thought>
<tool_call>
{\"tool_name\": \"add\", \"arguments\": {\"a\": 3, \"b\": 3}}
</tool_call>

INCORRECT EXAMPLES (do NOT do this):
<tool_call>
{\"tool_name\": \"calculator\", \"arguments\": {\"operation\": \"add\", \"numbers\": [3, 4]}}
</tool_call>
<tool_call>
{\"tool_name\": \"add\", \"arguments\": {\"a\": 3, \"b\": 4}
</tool_call>

After using a tool and getting its result, continue to answer the user's \
original question completely.";

/// Default builder: fixed instruction preamble, the user's question, a
/// JSON tools block, and an optional resources block — all in the tag
/// protocol the interceptor understands.
pub struct TaggedPromptBuilder;

impl PromptBuilder for TaggedPromptBuilder {
    fn available_tools_block(&self, schemas: &[ToolSchema]) -> String {
        // BTreeMap parameters + pretty printing keep this deterministic.
        let body = serde_json::to_string_pretty(schemas).unwrap_or_else(|_| "[]".into());
        format!("{AVAILABLE_TOOLS_OPEN}\n{body}\n{AVAILABLE_TOOLS_CLOSE}")
    }

    fn available_resources_block(&self, resources: &[ResourceDescriptor]) -> String {
        let body = serde_json::to_string_pretty(resources).unwrap_or_else(|_| "[]".into());
        format!("{AVAILABLE_RESOURCES_OPEN}\n{body}\n{AVAILABLE_RESOURCES_CLOSE}")
    }

    fn build_initial_prompt(
        &self,
        user_input: &str,
        schemas: &[ToolSchema],
        resources: &[ResourceDescriptor],
    ) -> Result<Message, OrchestratorError> {
        if let Some(bad) = schemas.iter().find(|s| s.name.trim().is_empty()) {
            return Err(OrchestratorError::Assembly(format!(
                "tool schema with empty name (description: {:?})",
                bad.description
            )));
        }

        let tools_block = self.available_tools_block(schemas);
        let mut prompt = format!("{INSTRUCTIONS}\n\nUser: {user_input}\n\n{tools_block}\n");
        if !resources.is_empty() {
            prompt.push('\n');
            prompt.push_str(&self.available_resources_block(resources));
            prompt.push('\n');
        }

        Ok(Message::system(prompt))
    }
}
