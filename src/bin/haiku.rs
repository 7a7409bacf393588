use std::env;
use std::error::Error;

use sql_agent_rs::tools::haiku::{HAIKU_PROMPT, haiku_tool};
use sql_agent_rs::{Agent, AppConfig, OpenRouterModel, RunContext, telemetry};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();
    telemetry::init();

    let config = AppConfig::from_env()?;

    let request = env::args().skip(1).collect::<Vec<_>>().join(" ");
    let request = if request.trim().is_empty() {
        "Please write to me a poet about happiness".to_string()
    } else {
        request
    };

    let model = OpenRouterModel::new(config.model_config())?;
    let agent = Agent::builder()
        .model(model)
        .tool(haiku_tool())
        .system_prompt(HAIKU_PROMPT)
        .max_iterations(8)
        .build()?;

    let ctx = RunContext::new("1");
    agent.invoke(&ctx, request).await?;

    for turn in agent.history(&ctx.thread_id).await? {
        match &turn.tool_name {
            Some(tool) => println!("================ {} ({tool}) ================", turn.role.as_str()),
            None => println!("================ {} ================", turn.role.as_str()),
        }
        if !turn.content.is_empty() {
            println!("{}", turn.content);
        }
        for call in &turn.tool_calls {
            println!("tool call {} [{}]: {}", call.name, call.id, call.arguments);
        }
        println!();
    }

    Ok(())
}
