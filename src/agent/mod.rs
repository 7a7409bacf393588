use std::collections::VecDeque;
use std::sync::Arc;

use async_stream::try_stream;
use futures_util::{Stream, StreamExt};

use crate::error::AgentError;
use crate::hitl::{ApprovalGate, Decision, DecisionKind, PendingApproval};
use crate::llm::{ChatModel, ModelMessage, ModelToolDefinition};
use crate::sql::{PromptPolicy, Role};
use crate::state::{ConversationState, InMemoryConversationState, ThreadId, Turn, turns_to_messages};
use crate::tools::{DependencyMap, ToolRegistry, ToolSpec};

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub require_done_tool: bool,
    pub max_iterations: u32,
    pub system_prompt: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            require_done_tool: false,
            max_iterations: 24,
            system_prompt: None,
        }
    }
}

/// Identifies one run: which thread it continues and who is asking.
///
/// Tools can read it from their dependencies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub thread_id: ThreadId,
    pub role: Role,
}

impl RunContext {
    pub fn new(thread_id: impl Into<ThreadId>) -> Self {
        Self {
            thread_id: thread_id.into(),
            role: Role::default(),
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.role = role;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    Thinking {
        content: String,
    },
    Text {
        content: String,
    },
    ToolCall {
        tool: String,
        args_json: serde_json::Value,
        tool_call_id: String,
    },
    ToolResult {
        tool: String,
        result_text: String,
        tool_call_id: String,
        is_error: bool,
    },
    /// The run is suspended until the approval is resolved.
    ApprovalRequired {
        pending: PendingApproval,
    },
    FinalResponse {
        content: String,
    },
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Final(String),
    Interrupted(PendingApproval),
}

impl RunOutcome {
    pub fn final_text(&self) -> Option<&str> {
        match self {
            RunOutcome::Final(text) => Some(text),
            RunOutcome::Interrupted(_) => None,
        }
    }

    pub fn pending(&self) -> Option<&PendingApproval> {
        match self {
            RunOutcome::Final(_) => None,
            RunOutcome::Interrupted(pending) => Some(pending),
        }
    }
}

#[derive(Debug, Clone)]
enum Instructions {
    Static(String),
    Policy(PromptPolicy),
}

enum RunStart {
    Message(String),
    Resume(Decision),
}

pub struct AgentBuilder {
    model: Option<Arc<dyn ChatModel>>,
    tools: Vec<ToolSpec>,
    config: AgentConfig,
    prompt_policy: Option<PromptPolicy>,
    state: Option<Arc<dyn ConversationState>>,
    interrupts: Vec<(String, Vec<DecisionKind>)>,
    dependencies: DependencyMap,
}

impl Default for AgentBuilder {
    fn default() -> Self {
        Self {
            model: None,
            tools: Vec::new(),
            config: AgentConfig::default(),
            prompt_policy: None,
            state: None,
            interrupts: Vec::new(),
            dependencies: DependencyMap::new(),
        }
    }
}

impl AgentBuilder {
    pub fn model<M>(mut self, model: M) -> Self
    where
        M: ChatModel + 'static,
    {
        self.model = Some(Arc::new(model));
        self
    }

    pub fn tool(mut self, tool: ToolSpec) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools.extend(tools);
        self
    }

    pub fn config(mut self, config: AgentConfig) -> Self {
        self.config = config;
        self
    }

    pub fn system_prompt(mut self, system_prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(system_prompt.into());
        self
    }

    /// Builds the system prompt per run from the caller's role. Takes
    /// precedence over `system_prompt`.
    pub fn prompt_policy(mut self, policy: PromptPolicy) -> Self {
        self.prompt_policy = Some(policy);
        self
    }

    /// Conversation store; defaults to an in-memory store.
    pub fn state(mut self, state: Arc<dyn ConversationState>) -> Self {
        self.state = Some(state);
        self
    }

    /// Suspends every call to `tool` until a human resolves it with one of
    /// the `allowed` decisions.
    pub fn interrupt_on(mut self, tool: impl Into<String>, allowed: &[DecisionKind]) -> Self {
        self.interrupts.push((tool.into(), allowed.to_vec()));
        self
    }

    pub fn require_done_tool(mut self, require_done_tool: bool) -> Self {
        self.config.require_done_tool = require_done_tool;
        self
    }

    pub fn max_iterations(mut self, max_iterations: u32) -> Self {
        self.config.max_iterations = max_iterations;
        self
    }

    /// Makes `value` available to every tool handler, keyed by its type.
    pub fn dependency<T>(mut self, value: T) -> Self
    where
        T: Send + Sync + 'static,
    {
        self.dependencies.insert(value);
        self
    }

    pub fn build(self) -> Result<Agent, AgentError> {
        let Some(model) = self.model else {
            return Err(AgentError::Config(
                "agent model must be configured via AgentBuilder::model(...)".to_string(),
            ));
        };

        let mut tools = ToolRegistry::default();
        for tool in self.tools {
            if let Err(duplicate) = tools.register(tool) {
                return Err(AgentError::Config(format!(
                    "duplicate tool registered: {}",
                    duplicate.name()
                )));
            }
        }

        let state = self
            .state
            .unwrap_or_else(|| Arc::new(InMemoryConversationState::new()));
        let mut gate = ApprovalGate::new(state.clone());
        for (tool, allowed) in self.interrupts {
            if !tools.contains(&tool) {
                return Err(AgentError::Config(format!(
                    "interrupt configured for unregistered tool: {tool}"
                )));
            }
            if allowed.is_empty() {
                return Err(AgentError::Config(format!(
                    "interrupt for {tool} must allow at least one decision"
                )));
            }
            gate = gate.interrupt_on(tool, &allowed);
        }

        let instructions = match (self.prompt_policy, self.config.system_prompt.clone()) {
            (Some(policy), _) => Some(Instructions::Policy(policy)),
            (None, Some(prompt)) => Some(Instructions::Static(prompt)),
            (None, None) => None,
        };

        Ok(Agent {
            model,
            tool_definitions: tools.definitions(),
            tools,
            config: self.config,
            instructions,
            state,
            gate,
            dependencies: self.dependencies,
        })
    }
}

/// A tool-calling agent over per-thread conversation state.
///
/// The agent itself holds no conversation; every run names its thread through
/// a [`RunContext`], so one agent can serve many threads.
pub struct Agent {
    model: Arc<dyn ChatModel>,
    tool_definitions: Vec<ModelToolDefinition>,
    tools: ToolRegistry,
    config: AgentConfig,
    instructions: Option<Instructions>,
    state: Arc<dyn ConversationState>,
    gate: ApprovalGate,
    dependencies: DependencyMap,
}

impl Agent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    pub fn state(&self) -> &Arc<dyn ConversationState> {
        &self.state
    }

    pub fn approval_gate(&self) -> &ApprovalGate {
        &self.gate
    }

    /// The system prompt a run for `ctx` would send.
    pub fn instructions(&self, ctx: &RunContext) -> Option<String> {
        match &self.instructions {
            Some(Instructions::Static(prompt)) => Some(prompt.clone()),
            Some(Instructions::Policy(policy)) => Some(policy.build_instructions(ctx.role)),
            None => None,
        }
    }

    pub async fn history(&self, thread_id: &ThreadId) -> Result<Vec<Turn>, AgentError> {
        Ok(self.state.history(thread_id).await?)
    }

    pub async fn pending(&self, thread_id: &ThreadId) -> Result<Option<PendingApproval>, AgentError> {
        Ok(self.state.pending(thread_id).await?)
    }

    pub async fn invoke(
        &self,
        ctx: &RunContext,
        user_message: impl Into<String>,
    ) -> Result<RunOutcome, AgentError> {
        collect_outcome(self.invoke_stream(ctx, user_message)).await
    }

    pub async fn resume(&self, ctx: &RunContext, decision: Decision) -> Result<RunOutcome, AgentError> {
        collect_outcome(self.resume_stream(ctx, decision)).await
    }

    /// Appends `user_message` to the thread and runs until a final response
    /// or an approval interrupt. Fails if the thread is awaiting approval.
    pub fn invoke_stream(
        &self,
        ctx: &RunContext,
        user_message: impl Into<String>,
    ) -> impl Stream<Item = Result<AgentEvent, AgentError>> + '_ {
        self.run(ctx.clone(), RunStart::Message(user_message.into()))
    }

    /// Resolves the thread's pending approval with `decision`, then continues
    /// the run it suspended.
    pub fn resume_stream(
        &self,
        ctx: &RunContext,
        decision: Decision,
    ) -> impl Stream<Item = Result<AgentEvent, AgentError>> + '_ {
        self.run(ctx.clone(), RunStart::Resume(decision))
    }

    fn run(
        &self,
        ctx: RunContext,
        start: RunStart,
    ) -> impl Stream<Item = Result<AgentEvent, AgentError>> + '_ {
        try_stream! {
            let thread_id = ctx.thread_id.clone();
            let dependencies = self.dependencies.for_run(&ctx);
            let mut queue = VecDeque::new();

            match start {
                RunStart::Message(user_message) => {
                    if self.state.pending(&thread_id).await?.is_some() {
                        Err::<(), AgentError>(AgentError::AwaitingApproval {
                            thread_id: thread_id.to_string(),
                        })?;
                    }
                    tracing::info!(thread = %thread_id, role = %ctx.role, "agent run started");
                    self.state.append(&thread_id, Turn::user(user_message)).await?;
                }
                RunStart::Resume(decision) => {
                    tracing::info!(thread = %thread_id, decision = %decision.kind(), "agent run resumed");
                    let resolution = self
                        .gate
                        .resolve(&thread_id, decision, |call| {
                            let dependencies = &dependencies;
                            async move { self.tools.execute(&call, dependencies).await }
                        })
                        .await?;

                    if let Some(turn) = &resolution.turn {
                        yield AgentEvent::ToolResult {
                            tool: resolution.pending.action.name.clone(),
                            result_text: turn.content.clone(),
                            tool_call_id: resolution.pending.action.id.clone(),
                            is_error: turn.is_error,
                        };
                    }

                    if let Some(done_message) = resolution
                        .execution
                        .as_ref()
                        .and_then(|execution| execution.done_message.clone())
                    {
                        yield AgentEvent::FinalResponse {
                            content: done_message,
                        };
                        return;
                    }

                    queue.extend(resolution.pending.remaining);
                }
            }

            let mut iterations = 0;
            loop {
                while let Some(tool_call) = queue.pop_front() {
                    yield AgentEvent::ToolCall {
                        tool: tool_call.name.clone(),
                        args_json: tool_call.arguments.clone(),
                        tool_call_id: tool_call.id.clone(),
                    };

                    if self.gate.intercepts(&tool_call.name) {
                        let remaining = queue.drain(..).collect::<Vec<_>>();
                        let pending = self.gate.request(&thread_id, tool_call, remaining).await?;
                        yield AgentEvent::ApprovalRequired { pending };
                        return;
                    }

                    let execution = self.tools.execute(&tool_call, &dependencies).await;
                    self.state
                        .append(
                            &thread_id,
                            Turn::tool_result(&tool_call, execution.result_text.clone(), execution.is_error),
                        )
                        .await?;

                    yield AgentEvent::ToolResult {
                        tool: tool_call.name.clone(),
                        result_text: execution.result_text.clone(),
                        tool_call_id: tool_call.id.clone(),
                        is_error: execution.is_error,
                    };

                    if let Some(done_message) = execution.done_message {
                        yield AgentEvent::FinalResponse {
                            content: done_message,
                        };
                        return;
                    }
                }

                if iterations >= self.config.max_iterations {
                    Err::<(), AgentError>(AgentError::MaxIterationsReached {
                        max_iterations: self.config.max_iterations,
                    })?;
                }
                iterations += 1;

                let messages = self.model_messages(&ctx).await?;
                tracing::debug!(thread = %thread_id, messages = messages.len(), "invoking model");
                let completion = self
                    .model
                    .invoke(&messages, &self.tool_definitions)
                    .await?;

                if let Some(thinking) = completion.thinking.clone() {
                    yield AgentEvent::Thinking { content: thinking };
                }

                self.state
                    .append(
                        &thread_id,
                        Turn::assistant_with_calls(completion.text.clone(), completion.tool_calls.clone()),
                    )
                    .await?;

                if let Some(text) = completion.text.clone() {
                    if !text.is_empty() {
                        yield AgentEvent::Text {
                            content: text.clone(),
                        };
                    }
                }

                if completion.tool_calls.is_empty() {
                    if !self.config.require_done_tool {
                        yield AgentEvent::FinalResponse {
                            content: completion.text.unwrap_or_default(),
                        };
                        return;
                    }
                    continue;
                }

                queue.extend(completion.tool_calls);
            }
        }
    }

    async fn model_messages(&self, ctx: &RunContext) -> Result<Vec<ModelMessage>, AgentError> {
        let history = self.state.history(&ctx.thread_id).await?;
        let mut messages = Vec::with_capacity(history.len() + 1);
        if let Some(instructions) = self.instructions(ctx) {
            messages.push(ModelMessage::System(instructions));
        }
        messages.extend(turns_to_messages(&history));
        Ok(messages)
    }
}

async fn collect_outcome<S>(stream: S) -> Result<RunOutcome, AgentError>
where
    S: Stream<Item = Result<AgentEvent, AgentError>>,
{
    futures_util::pin_mut!(stream);

    let mut outcome: Option<RunOutcome> = None;

    while let Some(event) = stream.next().await {
        match event? {
            AgentEvent::FinalResponse { content } => outcome = Some(RunOutcome::Final(content)),
            AgentEvent::ApprovalRequired { pending } => {
                outcome = Some(RunOutcome::Interrupted(pending))
            }
            AgentEvent::Thinking { .. }
            | AgentEvent::Text { .. }
            | AgentEvent::ToolCall { .. }
            | AgentEvent::ToolResult { .. } => {}
        }
    }

    outcome.ok_or(AgentError::MissingFinalResponse)
}

pub async fn query(
    agent: &Agent,
    ctx: &RunContext,
    user_message: impl Into<String>,
) -> Result<RunOutcome, AgentError> {
    agent.invoke(ctx, user_message).await
}

pub fn query_stream<'a>(
    agent: &'a Agent,
    ctx: &RunContext,
    user_message: impl Into<String>,
) -> impl Stream<Item = Result<AgentEvent, AgentError>> + 'a {
    agent.invoke_stream(ctx, user_message)
}
