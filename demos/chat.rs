//! Interactive chat REPL for the relay-agent orchestrator.
//!
//! Usage:
//!   OPENAI_API_KEY=sk-... cargo run --example chat
//!   cargo run --example chat -- --base-url http://localhost:11434 --model llama3.2
//!
//! Ctrl-C or type "exit" / "quit" to leave.

use std::io::{self, BufRead, Write};

use async_trait::async_trait;
use clap::Parser;
use serde_json::{Map, Value};

use relay_agent::{
    LocalToolService, OpenAiCompatModel, Orchestrator, OrchestratorConfig, ParamType,
    SamplerConfig, ToolHandler, ToolParam, ToolRegistry, ToolSchema,
};

#[derive(Parser)]
#[command(name = "chat", about = "Chat with a relay-agent orchestrator")]
struct Cli {
    /// Model to use
    #[arg(long, default_value = "gpt-4o")]
    model: String,

    /// API base URL (any OpenAI-compatible endpoint)
    #[arg(long, default_value = "https://api.openai.com")]
    base_url: String,

    /// Token budget for the conversation history
    #[arg(long, default_value_t = 6000)]
    max_context_tokens: u32,

    /// Max tool round-trips per turn
    #[arg(long, default_value_t = 10)]
    max_iterations: usize,

    /// Sampling temperature
    #[arg(long, default_value_t = 1.0)]
    temperature: f32,
}

struct AddTool;

#[async_trait]
impl ToolHandler for AddTool {
    async fn call(&self, arguments: &Map<String, Value>) -> Result<String, String> {
        let a = arguments["a"].as_f64().ok_or("a must be a number")?;
        let b = arguments["b"].as_f64().ok_or("b must be a number")?;
        Ok((a + b).to_string())
    }
}

struct MultiplyTool;

#[async_trait]
impl ToolHandler for MultiplyTool {
    async fn call(&self, arguments: &Map<String, Value>) -> Result<String, String> {
        let a = arguments["a"].as_f64().ok_or("a must be a number")?;
        let b = arguments["b"].as_f64().ok_or("b must be a number")?;
        Ok((a * b).to_string())
    }
}

struct DivideTool;

#[async_trait]
impl ToolHandler for DivideTool {
    async fn call(&self, arguments: &Map<String, Value>) -> Result<String, String> {
        let a = arguments["a"].as_f64().ok_or("a must be a number")?;
        let b = arguments["b"].as_f64().ok_or("b must be a number")?;
        if b == 0.0 {
            return Err("division by zero".into());
        }
        Ok((a / b).to_string())
    }
}

fn calculator_registry() -> ToolRegistry {
    ToolRegistry::new()
        .add(
            ToolSchema::new("add", "Add two numbers")
                .with_param("a", ToolParam::required(ParamType::Number, "left addend"))
                .with_param("b", ToolParam::required(ParamType::Number, "right addend")),
            AddTool,
        )
        .add(
            ToolSchema::new("multiply", "Multiply two numbers")
                .with_param("a", ToolParam::required(ParamType::Number, "left factor"))
                .with_param("b", ToolParam::required(ParamType::Number, "right factor")),
            MultiplyTool,
        )
        .add(
            ToolSchema::new("divide", "Divide a by b")
                .with_param("a", ToolParam::required(ParamType::Number, "dividend"))
                .with_param("b", ToolParam::required(ParamType::Number, "divisor")),
            DivideTool,
        )
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "relay_agent=info".into()),
        )
        .init();

    let cli = Cli::parse();

    let api_key = std::env::var("OPENAI_API_KEY").unwrap_or_else(|_| {
        eprintln!("error: OPENAI_API_KEY not set");
        std::process::exit(1);
    });

    let model = OpenAiCompatModel::new(&cli.model, &api_key).with_base_url(&cli.base_url);
    let tools = LocalToolService::new(calculator_registry());
    let config = OrchestratorConfig {
        max_context_tokens: cli.max_context_tokens,
        max_iterations: cli.max_iterations,
        sampling: SamplerConfig {
            temperature: cli.temperature,
            ..SamplerConfig::default()
        },
        tools: None,
        discover_tools: true,
    };

    let mut orchestrator = match Orchestrator::new(model, tools, config) {
        Ok(orchestrator) => orchestrator,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    println!("relay-agent chat — model: {} ({})", cli.model, cli.base_url);
    println!("Type 'exit' or 'quit' to leave.\n");

    let stdin = io::stdin();
    loop {
        print!("> ");
        let _ = io::stdout().flush();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                eprintln!("error reading input: {e}");
                break;
            }
        }

        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input == "exit" || input == "quit" {
            break;
        }

        match orchestrator.process(input).await {
            Ok(answer) => println!("{answer}\n"),
            Err(e) => eprintln!("error: {e}\n"),
        }
    }
}
