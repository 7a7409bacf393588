use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("tool schema must be a JSON object")]
    SchemaNotObject,
    #[error("tool schema must declare type=object")]
    RootTypeMustBeObject,
    #[error("required must be an array of strings")]
    InvalidRequired,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{name} is not a valid tool, try one of [{available}].")]
    NotFound { name: String, available: String },
    #[error("invalid tool arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },
    #[error("dependency missing: {0}")]
    MissingDependency(&'static str),
    #[error("tool execution failed: {0}")]
    Execution(String),
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("provider request failed: {0}")]
    Request(String),
    #[error("provider response invalid: {0}")]
    Response(String),
}

/// Failure reported by a query backend. Never escapes `QueryExecutor`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct BackendError(pub String);

#[derive(Debug, Error)]
pub enum StateError {
    #[error("thread {thread_id} already has a pending approval ({existing})")]
    ConcurrentPending { thread_id: String, existing: String },
    #[error("thread {thread_id} has no pending approval")]
    NoPendingApproval { thread_id: String },
    #[error("conversation storage failed: {0}")]
    Storage(String),
}

impl From<sqlx::Error> for StateError {
    fn from(err: sqlx::Error) -> Self {
        StateError::Storage(err.to_string())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecisionError {
    #[error("invalid option '{0}', choose accept, reject, or skip")]
    Unknown(String),
    #[error("decision '{decision}' is not allowed for tool {tool}")]
    NotAllowed { decision: String, tool: String },
}

#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Decision(#[from] DecisionError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PromptError {
    #[error("prompt template must contain exactly one {{{placeholder}}} placeholder, found {found}")]
    PlaceholderCount { placeholder: String, found: usize },
    #[error("prompt template contains unknown placeholder {{{0}}}")]
    UnknownPlaceholder(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration: {0}")]
    Missing(&'static str),
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
    #[error(transparent)]
    Prompt(#[from] PromptError),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Tool(#[from] ToolError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Approval(#[from] ApprovalError),
    #[error("max iterations reached ({max_iterations})")]
    MaxIterationsReached { max_iterations: u32 },
    #[error("thread {thread_id} is waiting for an approval decision")]
    AwaitingApproval { thread_id: String },
    #[error("agent stream ended without final response")]
    MissingFinalResponse,
    #[error("agent configuration error: {0}")]
    Config(String),
}
