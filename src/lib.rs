pub mod context;
pub mod error;
pub mod events;
pub mod intercept;
pub mod model;
pub mod prompt;
pub mod state;
pub mod tool_service;
pub mod trace;
pub mod types;
pub mod validate;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use context::{estimate_str_tokens, HeuristicTokenEstimator, TokenEstimator};
pub use error::{ModelError, OrchestratorError, ToolError, ValidationError};
pub use events::OrchestratorEvent;
pub use intercept::{clean_final_output, StreamEvent, StreamInterceptor};
pub use model::{FragmentStream, ModelStreamService, OpenAiCompatModel};
pub use prompt::{PromptBuilder, TaggedPromptBuilder};
pub use state::{ConversationSnapshot, ConversationStateManager};
pub use tool_service::{
    LocalToolService, ResourceProvider, ToolExecutionService, ToolHandler, ToolRegistry,
};
pub use trace::{MemoryTraceSink, TraceSink};
pub use types::{
    DetailedResponse, Message, ParamType, ResourceDescriptor, Role, SamplerConfig,
    ToolCallRequest, ToolCallResult, ToolOutcome, ToolParam, ToolSchema,
};
pub use validate::{parse_call, validate_call, ValidatedCall};

use intercept::wrap_tool_result;

/// Engine configuration, validated once at construction.
///
/// Tool schemas come from exactly one source: a static list, or one-shot
/// discovery through the tool service. Supplying both (or neither) is a
/// configuration error, not a precedence question.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Token budget the assembled history must fit before each model call.
    pub max_context_tokens: u32,
    /// Guard on tool round-trips within a single turn.
    pub max_iterations: usize,
    pub sampling: SamplerConfig,
    pub tools: Option<Vec<ToolSchema>>,
    pub discover_tools: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_context_tokens: 6000,
            max_iterations: 10,
            sampling: SamplerConfig::default(),
            tools: None,
            discover_tools: true,
        }
    }
}

impl OrchestratorConfig {
    fn validate(&self) -> Result<(), OrchestratorError> {
        if self.tools.is_some() && self.discover_tools {
            return Err(OrchestratorError::Config(
                "static tools list and tool discovery are mutually exclusive".into(),
            ));
        }
        if self.tools.is_none() && !self.discover_tools {
            return Err(OrchestratorError::Config(
                "no tool source: supply a tools list or enable discovery".into(),
            ));
        }
        if self.max_iterations == 0 {
            return Err(OrchestratorError::Config(
                "max_iterations must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

/// The interaction-loop engine. Streams model output, intercepts embedded
/// tool calls, dispatches them, injects results, and resumes generation
/// until a turn completes with no pending call.
pub struct Orchestrator {
    model: Box<dyn ModelStreamService>,
    tools: Box<dyn ToolExecutionService>,
    resources: Option<Box<dyn ResourceProvider>>,
    trace: Option<Box<dyn TraceSink>>,
    prompt: Box<dyn PromptBuilder>,
    estimator: Box<dyn TokenEstimator>,
    state: ConversationStateManager,
    schemas: Vec<ToolSchema>,
    discovered: bool,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        model: impl ModelStreamService + 'static,
        tools: impl ToolExecutionService + 'static,
        config: OrchestratorConfig,
    ) -> Result<Self, OrchestratorError> {
        config.validate()?;
        let schemas = config.tools.clone().unwrap_or_default();
        let discovered = config.tools.is_some();
        Ok(Self {
            model: Box::new(model),
            tools: Box::new(tools),
            resources: None,
            trace: None,
            prompt: Box::new(TaggedPromptBuilder),
            estimator: Box::new(HeuristicTokenEstimator),
            state: ConversationStateManager::new(),
            schemas,
            discovered,
            config,
        })
    }

    pub fn with_resources(mut self, resources: impl ResourceProvider + 'static) -> Self {
        self.resources = Some(Box::new(resources));
        self
    }

    pub fn with_trace(mut self, trace: impl TraceSink + 'static) -> Self {
        self.trace = Some(Box::new(trace));
        self
    }

    pub fn with_prompt_builder(mut self, prompt: impl PromptBuilder + 'static) -> Self {
        self.prompt = Box::new(prompt);
        self
    }

    pub fn with_estimator(mut self, estimator: impl TokenEstimator + 'static) -> Self {
        self.estimator = Box::new(estimator);
        self
    }

    /// Run one turn, returning the final assistant text with protocol tags
    /// stripped.
    pub async fn process(&mut self, input: &str) -> Result<String, OrchestratorError> {
        self.run_turn(input, None, None).await
    }

    /// Run one turn and return the final text plus per-call records and
    /// collected traces.
    pub async fn process_detailed(
        &mut self,
        input: &str,
    ) -> Result<DetailedResponse, OrchestratorError> {
        let result = self.run_turn(input, None, None).await?;
        Ok(DetailedResponse {
            result,
            tool_calls: self.state.last_tool_calls().to_vec(),
            traces: self.trace.as_ref().map(|t| t.traces()),
        })
    }

    /// Run one turn with live events forwarded over the channel.
    pub async fn process_streaming(
        &mut self,
        input: &str,
        tx: mpsc::Sender<OrchestratorEvent>,
    ) -> Result<String, OrchestratorError> {
        match self.run_turn(input, None, Some(tx.clone())).await {
            Ok(result) => Ok(result),
            Err(err) => {
                let _ = tx
                    .send(OrchestratorEvent::Error {
                        message: err.to_string(),
                    })
                    .await;
                Err(err)
            }
        }
    }

    /// Run one turn with cancellation support. Cancellation is honored
    /// between stream fragments and before tool dispatch; a tool call
    /// already in flight runs to completion and its result is committed
    /// before `Cancelled` is returned.
    pub async fn process_with_cancel(
        &mut self,
        input: &str,
        cancel: CancellationToken,
    ) -> Result<String, OrchestratorError> {
        self.run_turn(input, Some(cancel), None).await
    }

    /// Capture the conversation state for later resumption.
    pub fn snapshot(&self) -> ConversationSnapshot {
        self.state.snapshot()
    }

    /// Replace the conversation state with a snapshot's contents.
    pub fn resume(&mut self, snapshot: ConversationSnapshot) {
        self.state.resume(snapshot);
    }

    pub fn state(&self) -> &ConversationStateManager {
        &self.state
    }

    async fn ensure_tools(&mut self) -> Result<(), OrchestratorError> {
        if self.discovered {
            return Ok(());
        }
        let schemas = self
            .tools
            .discover_tools()
            .await
            .map_err(|e| OrchestratorError::ToolTransport(e.to_string()))?;
        info!(count = schemas.len(), "discovered tools");
        self.schemas = schemas;
        self.discovered = true;
        Ok(())
    }

    fn log_event(&self, role: &str, content: &str) {
        if let Some(ref trace) = self.trace {
            trace.log_event(json!({"role": role, "content": content}));
        }
    }

    async fn run_turn(
        &mut self,
        input: &str,
        cancel: Option<CancellationToken>,
        tx: Option<mpsc::Sender<OrchestratorEvent>>,
    ) -> Result<String, OrchestratorError> {
        if let Some(ref c) = cancel {
            if c.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
        }

        self.ensure_tools().await?;
        self.state.begin_turn();

        if self.state.is_empty() {
            // First turn: resources are best-effort, then everything lands
            // in a single system message.
            let resources = match self.resources {
                Some(ref provider) => provider.list_resources().await.unwrap_or_else(|e| {
                    debug!(error = %e, "resource listing failed, continuing without");
                    Vec::new()
                }),
                None => Vec::new(),
            };
            let initial = self
                .prompt
                .build_initial_prompt(input, &self.schemas, &resources)?;
            self.log_event("system", &initial.content);
            self.state.append_initial_prompt(initial);
        } else {
            self.state.append_user_message(input);
        }

        self.state
            .trim_to_budget(self.config.max_context_tokens, self.estimator.as_ref());

        let mut raw_conversation: Vec<Value> = vec![json!({
            "role": "system",
            "content": self.state.messages()[0].content,
        })];

        for iteration in 0..self.config.max_iterations {
            if let Some(ref c) = cancel {
                if c.is_cancelled() {
                    return Err(OrchestratorError::Cancelled);
                }
            }
            if let Some(ref tx) = tx {
                let _ = tx.send(OrchestratorEvent::TurnStart { iteration }).await;
            }
            info!(turn = self.state.turn_count(), iteration, "streaming model output");

            let mut stream = match cancel {
                Some(ref c) => tokio::select! {
                    result = self.model.generate(self.state.messages(), &self.config.sampling) => result?,
                    _ = c.cancelled() => return Err(OrchestratorError::Cancelled),
                },
                None => {
                    self.model
                        .generate(self.state.messages(), &self.config.sampling)
                        .await?
                }
            };

            let mut interceptor = StreamInterceptor::new();
            let mut detected: Option<(String, (usize, usize))> = None;

            'stream: loop {
                let item = match cancel {
                    Some(ref c) => tokio::select! {
                        item = stream.next() => item,
                        // returning drops the stream, which cancels it
                        _ = c.cancelled() => return Err(OrchestratorError::Cancelled),
                    },
                    None => stream.next().await,
                };
                let Some(fragment) = item else { break };
                let fragment = fragment?;

                for event in interceptor.feed(&fragment) {
                    match event {
                        StreamEvent::Text(content) => {
                            if let Some(ref tx) = tx {
                                let _ = tx.send(OrchestratorEvent::Text { content }).await;
                            }
                        }
                        StreamEvent::ToolCall { payload, span } => {
                            detected = Some((payload, span));
                            break 'stream;
                        }
                    }
                }
            }

            match detected {
                None => {
                    if let Some(StreamEvent::Text(content)) = interceptor.finish()? {
                        if let Some(ref tx) = tx {
                            let _ = tx.send(OrchestratorEvent::Text { content }).await;
                        }
                    }
                    let raw = interceptor.consumed().to_string();
                    self.state.append_assistant_chunk(&raw);
                    raw_conversation.push(json!({"role": "assistant", "content": raw}));

                    let cleaned = clean_final_output(&raw);
                    self.log_event("assistant", &cleaned);
                    if let Some(ref trace) = self.trace {
                        trace.log_complete_trace(json!({
                            "conversation": raw_conversation,
                            "final_clean_output": cleaned,
                            "reward": null,
                        }));
                    }
                    if let Some(ref tx) = tx {
                        let _ = tx
                            .send(OrchestratorEvent::Finished {
                                iterations: iteration + 1,
                            })
                            .await;
                    }
                    info!(iterations = iteration + 1, "turn complete");
                    return Ok(cleaned);
                }
                Some((payload, span)) => {
                    // The remainder of this stream is dead; cancel it
                    // before the tool runs.
                    drop(stream);

                    let raw = interceptor.consumed().to_string();
                    self.state.append_assistant_chunk(&raw);
                    raw_conversation.push(json!({"role": "assistant", "content": raw}));

                    let result = self.dispatch_call(&payload, span, &cancel, &tx).await?;
                    let wrapped = wrap_tool_result(&result);
                    self.log_event("tool", &wrapped);
                    raw_conversation.push(json!({"role": "tool", "content": wrapped}));

                    if let Some(ref c) = cancel {
                        if c.is_cancelled() {
                            return Err(OrchestratorError::Cancelled);
                        }
                    }
                }
            }
        }

        warn!(
            limit = self.config.max_iterations,
            "tool iteration guard tripped"
        );
        Err(OrchestratorError::MaxIterationsExceeded {
            limit: self.config.max_iterations,
        })
    }

    /// Parse, validate, and execute one intercepted call. Returns the
    /// result payload injected into history. Validation failures and
    /// recoverable execution errors come back as `ERROR:` payloads; only
    /// transport failures (and cancellation) escape as `Err`.
    async fn dispatch_call(
        &mut self,
        payload: &str,
        span: (usize, usize),
        cancel: &Option<CancellationToken>,
        tx: &Option<mpsc::Sender<OrchestratorEvent>>,
    ) -> Result<String, OrchestratorError> {
        debug!(payload, "tool call intercepted");

        let request = match parse_call(payload, span) {
            Ok(request) => request,
            Err(e) => {
                let message = e.to_string();
                debug!(error = %message, "tool call parse failed");
                self.state.append_tool_error(&message);
                return Ok(message);
            }
        };

        let call = match validate_call(request, &self.schemas) {
            Ok(call) => call,
            Err(e) => {
                let message = e.to_string();
                debug!(error = %message, "tool call validation failed");
                self.state.append_tool_error(&message);
                return Ok(message);
            }
        };

        if let Some(c) = cancel {
            if c.is_cancelled() {
                return Err(OrchestratorError::Cancelled);
            }
        }
        if let Some(tx) = tx {
            let _ = tx
                .send(OrchestratorEvent::ToolCall {
                    name: call.tool_name.clone(),
                    arguments: Value::Object(call.arguments.clone()),
                })
                .await;
        }

        info!(tool = %call.tool_name, "executing tool");
        // Tools are not guaranteed cancellable: the call runs to
        // completion and its result is committed regardless.
        let outcome = match self.tools.execute(&call.tool_name, &call.arguments).await {
            Ok(output) => ToolOutcome::Success(output),
            Err(e) if e.is_fatal() => {
                return Err(OrchestratorError::ToolTransport(e.to_string()));
            }
            Err(e) => {
                let message = format!("ERROR: Failed to execute tool '{}': {e}", call.tool_name);
                warn!(tool = %call.tool_name, error = %e, "tool execution failed, recovering");
                ToolOutcome::Error(message)
            }
        };

        let output = outcome.text().to_string();
        if let Some(tx) = tx {
            let _ = tx
                .send(OrchestratorEvent::ToolResult {
                    name: call.tool_name.clone(),
                    output: output.clone(),
                    is_error: outcome.is_error(),
                })
                .await;
        }

        self.state.append_tool_result(ToolCallResult {
            tool_name: call.tool_name,
            arguments: call.arguments,
            outcome,
        });
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Map;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Mutex;

    // --- Mock model: scripted fragment streams, one per generate() call ---

    struct MockModel {
        scripts: Mutex<VecDeque<Vec<Result<String, ModelError>>>>,
    }

    impl MockModel {
        fn new(scripts: Vec<Vec<&str>>) -> Self {
            Self {
                scripts: Mutex::new(
                    scripts
                        .into_iter()
                        .map(|s| s.into_iter().map(|f| Ok(f.to_string())).collect())
                        .collect(),
                ),
            }
        }

        fn with_raw(scripts: Vec<Vec<Result<String, ModelError>>>) -> Self {
            Self {
                scripts: Mutex::new(scripts.into_iter().collect()),
            }
        }
    }

    #[async_trait]
    impl ModelStreamService for MockModel {
        async fn generate(
            &self,
            _messages: &[Message],
            _sampling: &SamplerConfig,
        ) -> Result<FragmentStream, ModelError> {
            let script = self
                .scripts
                .lock()
                .await
                .pop_front()
                .ok_or_else(|| ModelError::Request("no scripted response left".into()))?;
            Ok(Box::pin(futures_util::stream::iter(script)))
        }
    }

    // --- Tools ---

    struct MultiplyTool;

    #[async_trait]
    impl ToolHandler for MultiplyTool {
        async fn call(&self, arguments: &Map<String, Value>) -> Result<String, String> {
            let a = arguments["a"].as_i64().ok_or("a must be an integer")?;
            let b = arguments["b"].as_i64().ok_or("b must be an integer")?;
            Ok((a * b).to_string())
        }
    }

    struct FailingTool;

    #[async_trait]
    impl ToolHandler for FailingTool {
        async fn call(&self, _arguments: &Map<String, Value>) -> Result<String, String> {
            Err("boom".into())
        }
    }

    /// Cancels the supplied token from inside the call, then succeeds.
    struct CancellingTool {
        token: CancellationToken,
    }

    #[async_trait]
    impl ToolHandler for CancellingTool {
        async fn call(&self, _arguments: &Map<String, Value>) -> Result<String, String> {
            self.token.cancel();
            Ok("done".into())
        }
    }

    struct UnreachableToolService;

    #[async_trait]
    impl ToolExecutionService for UnreachableToolService {
        async fn discover_tools(&self) -> Result<Vec<ToolSchema>, ToolError> {
            Ok(vec![multiply_schema()])
        }

        async fn execute(
            &self,
            _name: &str,
            _arguments: &Map<String, Value>,
        ) -> Result<String, ToolError> {
            Err(ToolError::Transport("connection refused".into()))
        }
    }

    struct CountingToolService {
        inner: LocalToolService,
        discoveries: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ToolExecutionService for CountingToolService {
        async fn discover_tools(&self) -> Result<Vec<ToolSchema>, ToolError> {
            self.discoveries.fetch_add(1, Ordering::SeqCst);
            self.inner.discover_tools().await
        }

        async fn execute(
            &self,
            name: &str,
            arguments: &Map<String, Value>,
        ) -> Result<String, ToolError> {
            self.inner.execute(name, arguments).await
        }
    }

    struct StaticResources;

    #[async_trait]
    impl ResourceProvider for StaticResources {
        async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>, ToolError> {
            Ok(vec![ResourceDescriptor {
                uri: "file:///data/report.txt".into(),
                name: "report".into(),
                description: "Quarterly report".into(),
                mime_type: "text/plain".into(),
            }])
        }
    }

    // --- Helpers ---

    fn multiply_schema() -> ToolSchema {
        ToolSchema::new("multiply", "Multiply two integers")
            .with_param("a", ToolParam::required(ParamType::Number, "left factor"))
            .with_param("b", ToolParam::required(ParamType::Number, "right factor"))
    }

    fn divide_schema() -> ToolSchema {
        ToolSchema::new("divide", "Divide a by b")
            .with_param("a", ToolParam::required(ParamType::Number, "dividend"))
            .with_param("b", ToolParam::required(ParamType::Number, "divisor"))
    }

    fn calculator_service() -> LocalToolService {
        LocalToolService::new(
            ToolRegistry::new()
                .add(multiply_schema(), MultiplyTool)
                .add(divide_schema(), FailingTool),
        )
    }

    fn discovery_config() -> OrchestratorConfig {
        OrchestratorConfig::default()
    }

    fn make_orchestrator(model: MockModel) -> Orchestrator {
        Orchestrator::new(model, calculator_service(), discovery_config()).unwrap()
    }

    // --- Tests ---

    #[tokio::test]
    async fn single_stream_text_only_turn() {
        let model = MockModel::new(vec![vec!["Hello", ", world!"]]);
        let mut orchestrator = make_orchestrator(model);
        let result = orchestrator.process("Say hello").await.unwrap();
        assert_eq!(result, "Hello, world!");
        assert_eq!(orchestrator.state().messages().len(), 2);
        assert_eq!(orchestrator.state().messages()[0].role, Role::System);
    }

    #[tokio::test]
    async fn multiply_scenario_split_mid_tag() {
        let model = MockModel::new(vec![
            vec![
                "<thought>I'll use multiply.</thought> <tool_",
                "call>multiply{\"a\":25,\"b\":16}</tool_call>",
            ],
            vec!["The answer is ", "400."],
        ]);
        let mut orchestrator = make_orchestrator(model);
        let detailed = orchestrator
            .process_detailed("What is 25*16?")
            .await
            .unwrap();

        assert!(detailed.result.contains("400"));
        assert!(!detailed.result.contains("<tool_call>"));

        assert_eq!(detailed.tool_calls.len(), 1);
        let call = &detailed.tool_calls[0];
        assert_eq!(call.tool_name, "multiply");
        assert_eq!(call.arguments["a"], json!(25));
        assert_eq!(call.arguments["b"], json!(16));
        assert_eq!(call.outcome, ToolOutcome::Success("400".into()));

        // history: system prompt, assistant w/ call, tool result, final answer
        let messages = orchestrator.state().messages();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[1].role, Role::Assistant);
        assert!(messages[1].content.contains("<tool_call>"));
        assert_eq!(messages[2].role, Role::Tool);
        assert!(messages[2].content.contains("400"));
        assert_eq!(messages[3].role, Role::Assistant);
    }

    #[tokio::test]
    async fn first_turn_builds_system_prompt_later_turns_append_user() {
        let model = MockModel::new(vec![vec!["one"], vec!["two"]]);
        let mut orchestrator = make_orchestrator(model);

        orchestrator.process("first question").await.unwrap();
        let first = &orchestrator.state().messages()[0];
        assert_eq!(first.role, Role::System);
        assert!(first.content.contains("User: first question"));
        assert!(first.content.contains("<available_tools>"));

        orchestrator.process("second question").await.unwrap();
        let roles: Vec<Role> = orchestrator
            .state()
            .messages()
            .iter()
            .map(|m| m.role)
            .collect();
        assert_eq!(
            roles,
            [Role::System, Role::Assistant, Role::User, Role::Assistant]
        );
        assert_eq!(orchestrator.state().messages()[2].content, "second question");
    }

    #[tokio::test]
    async fn schema_violation_recovers_within_turn() {
        let model = MockModel::new(vec![
            vec!["<tool_call>{\"tool_name\":\"divide\",\"arguments\":{\"a\":10}}</tool_call>"],
            vec!["I need a divisor to do that."],
        ]);
        let mut orchestrator = make_orchestrator(model);
        let detailed = orchestrator.process_detailed("10 / ?").await.unwrap();

        assert_eq!(detailed.result, "I need a divisor to do that.");
        // never dispatched, so no call record
        assert!(detailed.tool_calls.is_empty());

        let error_msg = orchestrator
            .state()
            .messages()
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert!(error_msg.content.contains("ERROR:"));
        assert!(error_msg.content.contains("'b'"));
    }

    #[tokio::test]
    async fn unknown_tool_recovers_within_turn() {
        let model = MockModel::new(vec![
            vec!["<tool_call>{\"tool_name\":\"frobnicate\",\"arguments\":{}}</tool_call>"],
            vec!["That tool does not exist."],
        ]);
        let mut orchestrator = make_orchestrator(model);
        let result = orchestrator.process("do the thing").await.unwrap();
        assert_eq!(result, "That tool does not exist.");

        let error_msg = orchestrator
            .state()
            .messages()
            .iter()
            .find(|m| m.role == Role::Tool)
            .unwrap();
        assert!(error_msg.content.contains("'frobnicate' not found"));
    }

    #[tokio::test]
    async fn malformed_payload_recovers_within_turn() {
        let model = MockModel::new(vec![
            vec!["<tool_call>this is not json</tool_call>"],
            vec!["Let me try again properly."],
        ]);
        let mut orchestrator = make_orchestrator(model);
        let result = orchestrator.process("compute").await.unwrap();
        assert_eq!(result, "Let me try again properly.");
        assert!(orchestrator
            .state()
            .messages()
            .iter()
            .any(|m| m.role == Role::Tool && m.content.contains("Invalid tool call")));
    }

    #[tokio::test]
    async fn execution_error_recovers_and_is_recorded() {
        let model = MockModel::new(vec![
            vec!["<tool_call>{\"tool_name\":\"divide\",\"arguments\":{\"a\":1,\"b\":0}}</tool_call>"],
            vec!["Division failed, sorry."],
        ]);
        let mut orchestrator = make_orchestrator(model);
        let detailed = orchestrator.process_detailed("1/0").await.unwrap();

        assert_eq!(detailed.result, "Division failed, sorry.");
        assert_eq!(detailed.tool_calls.len(), 1);
        let call = &detailed.tool_calls[0];
        assert!(call.outcome.is_error());
        assert!(call.outcome.text().contains("boom"));
    }

    #[tokio::test]
    async fn transport_failure_is_fatal() {
        let model = MockModel::new(vec![vec![
            "<tool_call>{\"tool_name\":\"multiply\",\"arguments\":{\"a\":2,\"b\":2}}</tool_call>",
        ]]);
        let mut orchestrator =
            Orchestrator::new(model, UnreachableToolService, discovery_config()).unwrap();
        let err = orchestrator.process("2*2").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::ToolTransport(_)));
    }

    #[tokio::test]
    async fn max_iterations_guard_trips() {
        let call = "<tool_call>{\"tool_name\":\"multiply\",\"arguments\":{\"a\":2,\"b\":2}}</tool_call>";
        let model = MockModel::new(vec![vec![call], vec![call]]);
        let mut orchestrator = Orchestrator::new(
            model,
            calculator_service(),
            OrchestratorConfig {
                max_iterations: 2,
                ..OrchestratorConfig::default()
            },
        )
        .unwrap();

        let err = orchestrator.process("loop forever").await.unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::MaxIterationsExceeded { limit: 2 }
        ));
        // state up to the guard remains intact and resumable
        assert!(orchestrator.state().messages().len() >= 4);
        let snapshot = orchestrator.snapshot();
        assert_eq!(snapshot.messages.len(), orchestrator.state().messages().len());
    }

    #[tokio::test]
    async fn truncated_call_is_fatal() {
        let model = MockModel::new(vec![vec!["<tool_call>{\"tool_name\":\"mul"]]);
        let mut orchestrator = make_orchestrator(model);
        let err = orchestrator.process("compute").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::TruncatedCall(_)));
    }

    #[tokio::test]
    async fn model_error_mid_stream_surfaces_unmodified() {
        let model = MockModel::with_raw(vec![vec![
            Ok("partial ".into()),
            Err(ModelError::Api {
                status: 429,
                body: "rate limited".into(),
            }),
        ]]);
        let mut orchestrator = make_orchestrator(model);
        let err = orchestrator.process("hello").await.unwrap_err();
        assert!(err.to_string().contains("429"));
    }

    #[tokio::test]
    async fn model_error_on_open_surfaces() {
        let model = MockModel::new(vec![]);
        let mut orchestrator = make_orchestrator(model);
        let err = orchestrator.process("hello").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Model(_)));
    }

    #[tokio::test]
    async fn context_trimmed_to_budget_keeps_first_message() {
        struct PerMessage3;
        impl TokenEstimator for PerMessage3 {
            fn estimate(&self, messages: &[Message]) -> u32 {
                (messages.len() as u32) * 3
            }
        }

        let model = MockModel::new(vec![vec!["a"], vec!["b"], vec!["c"]]);
        let mut orchestrator = Orchestrator::new(
            model,
            calculator_service(),
            OrchestratorConfig {
                max_context_tokens: 6,
                ..OrchestratorConfig::default()
            },
        )
        .unwrap()
        .with_estimator(PerMessage3);

        orchestrator.process("one").await.unwrap();
        orchestrator.process("two").await.unwrap();
        orchestrator.process("three").await.unwrap();

        let messages = orchestrator.state().messages();
        assert_eq!(messages[0].role, Role::System);
        assert!(messages[0].content.contains("User: one"));
        // trimmed to the 2-message floor before the last call, then the
        // final assistant message was appended
        assert_eq!(messages.len(), 3);
    }

    #[tokio::test]
    async fn snapshot_resume_round_trip_through_engine() {
        let model = MockModel::new(vec![vec![
            "<tool_call>{\"tool_name\":\"multiply\",\"arguments\":{\"a\":6,\"b\":7}}</tool_call>",
            "ignored",
        ], vec!["42 it is."]]);
        let mut orchestrator = make_orchestrator(model);
        orchestrator.process("6*7").await.unwrap();

        let snapshot = orchestrator.snapshot();
        let encoded = serde_json::to_string(&snapshot).unwrap();
        let decoded: ConversationSnapshot = serde_json::from_str(&encoded).unwrap();

        let model2 = MockModel::new(vec![vec!["Resumed fine."]]);
        let mut resumed = make_orchestrator(model2);
        resumed.resume(decoded);

        assert_eq!(resumed.state().messages(), orchestrator.state().messages());
        assert_eq!(
            resumed.state().last_tool_calls(),
            orchestrator.state().last_tool_calls()
        );

        // the resumed conversation keeps going
        let result = resumed.process("and again?").await.unwrap();
        assert_eq!(result, "Resumed fine.");
        assert_eq!(
            resumed.state().messages()[resumed.state().messages().len() - 2].content,
            "and again?"
        );
    }

    #[tokio::test]
    async fn streaming_emits_events_in_order() {
        let model = MockModel::new(vec![
            vec![
                "Working… ",
                "<tool_call>{\"tool_name\":\"multiply\",\"arguments\":{\"a\":3,\"b\":3}}</tool_call>",
            ],
            vec!["Nine."],
        ]);
        let mut orchestrator = make_orchestrator(model);
        let (tx, mut rx) = mpsc::channel(64);
        let result = orchestrator.process_streaming("3*3", tx).await.unwrap();
        assert_eq!(result, "Nine.");

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }

        assert!(matches!(events[0], OrchestratorEvent::TurnStart { iteration: 0 }));
        assert!(matches!(events[1], OrchestratorEvent::Text { .. }));
        assert!(matches!(events[2], OrchestratorEvent::ToolCall { .. }));
        assert!(matches!(events[3], OrchestratorEvent::ToolResult { .. }));
        assert!(matches!(events[4], OrchestratorEvent::TurnStart { iteration: 1 }));
        assert!(matches!(events[5], OrchestratorEvent::Text { .. }));
        assert!(matches!(
            events.last().unwrap(),
            OrchestratorEvent::Finished { iterations: 2 }
        ));
    }

    #[tokio::test]
    async fn pre_cancelled_turn_leaves_state_untouched() {
        let model = MockModel::new(vec![vec!["never reached"]]);
        let mut orchestrator = make_orchestrator(model);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = orchestrator
            .process_with_cancel("anything", cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled));
        assert!(orchestrator.state().messages().is_empty());
    }

    #[tokio::test]
    async fn cancellation_during_tool_call_commits_result_first() {
        let cancel = CancellationToken::new();
        let registry = ToolRegistry::new().add(
            ToolSchema::new("slow_job", "Runs a slow job"),
            CancellingTool {
                token: cancel.clone(),
            },
        );
        let model = MockModel::new(vec![vec![
            "<tool_call>{\"tool_name\":\"slow_job\",\"arguments\":{}}</tool_call>",
        ]]);
        let mut orchestrator = Orchestrator::new(
            model,
            LocalToolService::new(registry),
            discovery_config(),
        )
        .unwrap();

        let err = orchestrator
            .process_with_cancel("run it", cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Cancelled));

        // the in-flight call ran to completion and its result is committed
        assert_eq!(orchestrator.state().last_tool_calls().len(), 1);
        let last = orchestrator.state().messages().last().unwrap();
        assert_eq!(last.role, Role::Tool);
        assert!(last.content.contains("done"));
    }

    #[tokio::test]
    async fn config_rejects_both_tool_sources() {
        let model = MockModel::new(vec![]);
        let err = Orchestrator::new(
            model,
            calculator_service(),
            OrchestratorConfig {
                tools: Some(vec![multiply_schema()]),
                discover_tools: true,
                ..OrchestratorConfig::default()
            },
        )
        .err()
        .unwrap();
        assert!(matches!(err, OrchestratorError::Config(_)));
    }

    #[tokio::test]
    async fn config_rejects_missing_tool_source() {
        let model = MockModel::new(vec![]);
        let err = Orchestrator::new(
            model,
            calculator_service(),
            OrchestratorConfig {
                tools: None,
                discover_tools: false,
                ..OrchestratorConfig::default()
            },
        )
        .err()
        .unwrap();
        assert!(matches!(err, OrchestratorError::Config(_)));
    }

    #[tokio::test]
    async fn static_tools_skip_discovery_and_discovery_runs_once() {
        let discoveries = Arc::new(AtomicUsize::new(0));
        let service = CountingToolService {
            inner: calculator_service(),
            discoveries: discoveries.clone(),
        };
        let model = MockModel::new(vec![vec!["a"], vec!["b"]]);
        let mut orchestrator =
            Orchestrator::new(model, service, discovery_config()).unwrap();
        orchestrator.process("one").await.unwrap();
        orchestrator.process("two").await.unwrap();
        assert_eq!(discoveries.load(Ordering::SeqCst), 1);

        let discoveries2 = Arc::new(AtomicUsize::new(0));
        let service2 = CountingToolService {
            inner: calculator_service(),
            discoveries: discoveries2.clone(),
        };
        let model2 = MockModel::new(vec![vec!["a"]]);
        let mut static_orch = Orchestrator::new(
            model2,
            service2,
            OrchestratorConfig {
                tools: Some(vec![multiply_schema()]),
                discover_tools: false,
                ..OrchestratorConfig::default()
            },
        )
        .unwrap();
        static_orch.process("one").await.unwrap();
        assert_eq!(discoveries2.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn resources_embedded_on_first_turn() {
        let model = MockModel::new(vec![vec!["ok"]]);
        let mut orchestrator = make_orchestrator(model).with_resources(StaticResources);
        orchestrator.process("summarize the report").await.unwrap();
        let first = &orchestrator.state().messages()[0];
        assert!(first.content.contains("<available_resources>"));
        assert!(first.content.contains("file:///data/report.txt"));
    }

    #[tokio::test]
    async fn assembly_error_surfaces_before_any_model_call() {
        let model = MockModel::new(vec![]);
        let mut orchestrator = Orchestrator::new(
            model,
            calculator_service(),
            OrchestratorConfig {
                tools: Some(vec![ToolSchema::new("", "nameless")]),
                discover_tools: false,
                ..OrchestratorConfig::default()
            },
        )
        .unwrap();
        let err = orchestrator.process("hi").await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Assembly(_)));
        assert!(orchestrator.state().messages().is_empty());
    }

    #[tokio::test]
    async fn trace_sink_collects_complete_trace() {
        let model = MockModel::new(vec![
            vec!["<tool_call>{\"tool_name\":\"multiply\",\"arguments\":{\"a\":5,\"b\":5}}</tool_call>"],
            vec!["25."],
        ]);
        let mut orchestrator = make_orchestrator(model).with_trace(MemoryTraceSink::new());
        let detailed = orchestrator.process_detailed("5*5").await.unwrap();

        let traces = detailed.traces.unwrap();
        assert_eq!(traces.len(), 1);
        let trace = &traces[0];
        assert_eq!(trace["final_clean_output"], json!("25."));
        assert!(trace["reward"].is_null());
        let conversation = trace["conversation"].as_array().unwrap();
        assert_eq!(conversation[0]["role"], "system");
        assert!(conversation
            .iter()
            .any(|entry| entry["role"] == "tool"
                && entry["content"].as_str().unwrap().contains("25")));
    }

    #[tokio::test]
    async fn text_after_detected_call_is_discarded() {
        let model = MockModel::new(vec![
            vec![
                "<tool_call>{\"tool_name\":\"multiply\",\"arguments\":{\"a\":2,\"b\":3}}</tool_call>",
                " this text must never be seen",
            ],
            vec!["Six."],
        ]);
        let mut orchestrator = make_orchestrator(model);
        orchestrator.process("2*3").await.unwrap();
        assert!(!orchestrator
            .state()
            .messages()
            .iter()
            .any(|m| m.content.contains("never be seen")));
    }
}
