use std::env;
use std::error::Error;

use futures_util::StreamExt;
use sql_agent_rs::tools::calculator::{CALCULATOR_PROMPT, calculator_tool};
use sql_agent_rs::{Agent, AgentEvent, AppConfig, OpenRouterModel, RunContext, telemetry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();
    telemetry::init();

    let config = AppConfig::from_env()?;

    let question = env::args().skip(1).collect::<Vec<_>>().join(" ");
    let question = if question.trim().is_empty() {
        "What is 3 * 1?".to_string()
    } else {
        question
    };

    let model = OpenRouterModel::new(config.model_config())?;
    let agent = Agent::builder()
        .model(model)
        .tool(calculator_tool())
        .system_prompt(CALCULATOR_PROMPT)
        .build()?;

    let stream = agent.invoke_stream(&RunContext::new("1"), question);
    futures_util::pin_mut!(stream);

    while let Some(event) = stream.next().await {
        match event? {
            AgentEvent::ToolCall {
                tool, args_json, ..
            } => println!("tool-call {tool}: {args_json}"),
            AgentEvent::ToolResult {
                tool,
                result_text,
                is_error,
                ..
            } => {
                let label = if is_error { "tool-error" } else { "tool-result" };
                println!("{label} {tool}: {result_text}");
            }
            AgentEvent::FinalResponse { content } => println!("\n{content}"),
            AgentEvent::Thinking { .. }
            | AgentEvent::Text { .. }
            | AgentEvent::ApprovalRequired { .. } => {}
        }
    }

    Ok(())
}
