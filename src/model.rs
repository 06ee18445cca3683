use std::pin::Pin;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tracing::debug;

use crate::error::ModelError;
use crate::types::{Message, Role, SamplerConfig};

/// A cancellable stream of text fragments from the model. Fragments arrive
/// in generation order; dropping the stream cancels the request.
pub type FragmentStream = Pin<Box<dyn Stream<Item = Result<String, ModelError>> + Send>>;

/// Pure token-stream access. Request in, fragment stream out — no history,
/// no context management, no tool awareness.
#[async_trait]
pub trait ModelStreamService: Send + Sync {
    async fn generate(
        &self,
        messages: &[Message],
        sampling: &SamplerConfig,
    ) -> Result<FragmentStream, ModelError>;
}

/// Blanket impl so a `Box<dyn ModelStreamService>` can be handed straight
/// to `Orchestrator::new()`.
#[async_trait]
impl ModelStreamService for Box<dyn ModelStreamService> {
    async fn generate(
        &self,
        messages: &[Message],
        sampling: &SamplerConfig,
    ) -> Result<FragmentStream, ModelError> {
        (**self).generate(messages, sampling).await
    }
}

/// Streaming client for OpenAI-compatible `/v1/chat/completions` endpoints
/// (SSE). The canonical default model service.
pub struct OpenAiCompatModel {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl OpenAiCompatModel {
    pub fn new(model: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: "https://api.openai.com".into(),
            model: model.into(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }
}

/// Wire role for the chat-completions API. Tool results ride as system
/// messages — the tag protocol carries the tool framing in the content.
fn wire_role(role: Role) -> &'static str {
    match role {
        Role::System | Role::Tool => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    }
}

/// Parse one SSE data payload into a text fragment. `[DONE]` and deltas
/// without content yield nothing.
fn parse_delta(data: &str) -> Result<Option<String>, ModelError> {
    if data.trim() == "[DONE]" {
        return Ok(None);
    }
    let chunk: Value =
        serde_json::from_str(data).map_err(|e| ModelError::Parse(e.to_string()))?;
    Ok(chunk["choices"][0]["delta"]["content"]
        .as_str()
        .filter(|s| !s.is_empty())
        .map(String::from))
}

#[async_trait]
impl ModelStreamService for OpenAiCompatModel {
    async fn generate(
        &self,
        messages: &[Message],
        sampling: &SamplerConfig,
    ) -> Result<FragmentStream, ModelError> {
        let wire_messages: Vec<Value> = messages
            .iter()
            .map(|m| {
                serde_json::json!({
                    "role": wire_role(m.role),
                    "content": m.content,
                })
            })
            .collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "stream": true,
            "messages": wire_messages,
        });
        if let Value::Object(ref mut obj) = body {
            obj.extend(sampling.to_params());
        }

        debug!(model = %self.model, messages = messages.len(), "opening model stream");

        let resp = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| ModelError::Request(e.to_string()))?;

        let status = resp.status().as_u16();
        if status != 200 {
            let body = resp
                .text()
                .await
                .map_err(|e| ModelError::Request(e.to_string()))?;
            return Err(ModelError::Api { status, body });
        }

        let stream = resp.bytes_stream().eventsource().filter_map(|event| async move {
            match event {
                Err(e) => Some(Err(ModelError::Request(e.to_string()))),
                Ok(event) => match parse_delta(&event.data) {
                    Ok(Some(fragment)) => Some(Ok(fragment)),
                    Ok(None) => None,
                    Err(e) => Some(Err(e)),
                },
            }
        });

        Ok(Box::pin(stream))
    }
}
