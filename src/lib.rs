//! Tool-calling agents for SQL question answering.
//!
//! Surface:
//! - `Agent` loop over per-thread `ConversationState`, with `invoke`/`resume` entry points
//! - Role-gated system prompts via `PromptPolicy`, optional enforced `AccessGate`
//! - `execute_query` tool backed by `QueryExecutor` (Postgres via `PgBackend`)
//! - Human approval of gated tool calls through `ApprovalGate` (approve / reject / skip)
//! - Tool registry + JSON schema validation + dependency injection
//! - OpenAI-compatible chat adapter via `OpenRouterModel`

pub mod agent;
pub mod config;
pub mod error;
pub mod hitl;
pub mod llm;
pub mod sql;
pub mod state;
pub mod telemetry;
pub mod tools;

pub use agent::{Agent, AgentBuilder, AgentConfig, AgentEvent, RunContext, RunOutcome, query, query_stream};
pub use config::AppConfig;
pub use error::{
    AgentError, ApprovalError, BackendError, ConfigError, DecisionError, PromptError, ProviderError,
    SchemaError, StateError, ToolError,
};
pub use hitl::{ApprovalGate, Decision, DecisionKind, PendingApproval, Resolution};
pub use llm::{
    ChatModel, ModelCompletion, ModelMessage, ModelToolCall, ModelToolDefinition, OpenRouterModel,
    OpenRouterModelConfig,
};
pub use sql::{
    AccessGate, AccessMode, PgBackend, PromptPolicy, PromptTemplate, QueryExecutor, QueryRequest,
    QueryResult, Role, TableAllowList, execute_query_tool,
};
pub use state::{ConversationState, InMemoryConversationState, PgConversationState, ThreadId, Turn};
pub use tools::{DependencyMap, ToolExecution, ToolOutcome, ToolRegistry, ToolSpec};
