use std::error::Error;
use std::sync::Arc;

use clap::Parser;
use futures_util::{Stream, StreamExt};
use sql_agent_rs::hitl::prompt_decision;
use sql_agent_rs::sql::EXECUTE_QUERY_TOOL;
use sql_agent_rs::state::ConversationState;
use sql_agent_rs::{
    Agent, AgentError, AgentEvent, AppConfig, DecisionKind, InMemoryConversationState,
    OpenRouterModel, PendingApproval, PgBackend, PgConversationState, QueryExecutor, Role,
    RunContext, execute_query_tool, telemetry,
};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, Stdout};

const DEFAULT_QUESTION: &str = "What is the latest invoice in the invoice table?";

#[derive(Parser, Debug)]
#[command(name = "sql_agent", version, about = "Ask questions about a Postgres database", long_about = None)]
struct Cli {
    /// Question to ask; defaults to the latest-invoice question.
    question: Vec<String>,
    /// Ask before every query is executed.
    #[arg(long)]
    approval: bool,
    /// Keep reading questions from stdin on the same thread.
    #[arg(long)]
    interactive: bool,
    /// Answer as a restricted caller, overriding SQL_AGENT_ROLE.
    #[arg(long)]
    restricted: bool,
    #[arg(long, default_value = "1")]
    thread_id: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();

    dotenvy::dotenv().ok();
    telemetry::init();

    let config = AppConfig::from_env()?;
    let database_url = config.require_database_url()?;

    let backend = PgBackend::connect(database_url)
        .await?
        .with_max_string_length(config.max_string_length);

    let state: Arc<dyn ConversationState> = match &config.checkpoint_database_url {
        Some(url) => Arc::new(PgConversationState::connect(url).await?),
        None => Arc::new(InMemoryConversationState::new()),
    };

    let role = if cli.restricted {
        Role::Restricted
    } else {
        config.role
    };
    tracing::info!(model = %config.openrouter_model, %role, approval = cli.approval, "sql agent starting");

    let mut builder = Agent::builder()
        .model(OpenRouterModel::new(config.model_config())?)
        .tool(execute_query_tool())
        .dependency(QueryExecutor::new(backend))
        .dependency(config.access_gate())
        .prompt_policy(config.prompt_policy())
        .state(state);
    if cli.approval {
        builder = builder.interrupt_on(EXECUTE_QUERY_TOOL, &DecisionKind::ALL);
    }
    let agent = builder.build()?;

    let ctx = RunContext::new(cli.thread_id).with_role(role);
    let mut input = BufReader::new(tokio::io::stdin());
    let mut output = tokio::io::stdout();

    // A durable store may hold an approval left by an earlier process.
    if let Some(pending) = agent.pending(&ctx.thread_id).await? {
        settle(&agent, &ctx, Some(pending), &config, &mut input, &mut output).await?;
    }

    let question = cli.question.join(" ");
    let question = if question.trim().is_empty() {
        DEFAULT_QUESTION.to_string()
    } else {
        question
    };

    let pending = print_events(agent.invoke_stream(&ctx, question)).await?;
    settle(&agent, &ctx, pending, &config, &mut input, &mut output).await?;

    if !cli.interactive {
        return Ok(());
    }

    let mut line = String::new();
    loop {
        output.write_all(b"\n> ").await?;
        output.flush().await?;

        line.clear();
        if input.read_line(&mut line).await? == 0 {
            break;
        }
        let question = line.trim();
        if question.is_empty() {
            continue;
        }
        if question == "exit" || question == "quit" {
            break;
        }

        let pending = print_events(agent.invoke_stream(&ctx, question)).await?;
        settle(&agent, &ctx, pending, &config, &mut input, &mut output).await?;
    }

    Ok(())
}

/// Asks the operator about each approval until the run reaches a final answer.
async fn settle<R>(
    agent: &Agent,
    ctx: &RunContext,
    mut pending: Option<PendingApproval>,
    config: &AppConfig,
    input: &mut R,
    output: &mut Stdout,
) -> Result<(), Box<dyn Error>>
where
    R: AsyncBufRead + Unpin,
{
    while let Some(current) = pending {
        let allowed = agent
            .approval_gate()
            .allowed_decisions(&current.action.name)
            .to_vec();
        let decision =
            prompt_decision(input, output, &current, &allowed, &config.reject_reason).await?;
        pending = print_events(agent.resume_stream(ctx, decision)).await?;
    }
    Ok(())
}

async fn print_events<S>(stream: S) -> Result<Option<PendingApproval>, AgentError>
where
    S: Stream<Item = Result<AgentEvent, AgentError>>,
{
    futures_util::pin_mut!(stream);

    while let Some(event) = stream.next().await {
        match event? {
            AgentEvent::Thinking { content } => eprintln!("thinking: {}", truncate(&content, 160)),
            AgentEvent::Text { content } => println!("{content}"),
            AgentEvent::ToolCall {
                tool,
                args_json,
                tool_call_id,
            } => println!("tool-call [{tool_call_id}] {tool}: {args_json}"),
            AgentEvent::ToolResult {
                tool,
                result_text,
                tool_call_id,
                is_error,
            } => {
                let label = if is_error { "tool-error" } else { "tool-result" };
                println!("{label} [{tool_call_id}] {tool}: {}", truncate(&result_text, 400));
            }
            AgentEvent::ApprovalRequired { pending } => return Ok(Some(pending)),
            AgentEvent::FinalResponse { content } => println!("\n{content}"),
        }
    }

    Ok(None)
}

fn truncate(value: &str, max_chars: usize) -> String {
    let mut chars = value.chars();
    let head = chars.by_ref().take(max_chars).collect::<String>();
    if chars.next().is_some() {
        format!("{head}...")
    } else {
        head
    }
}
