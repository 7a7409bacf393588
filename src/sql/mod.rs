//! Role-gated SQL querying: prompt policy, access checks and query execution.

pub mod access;
pub mod executor;
pub mod prompt;

pub use access::{AccessDenied, AccessGate, AccessMode};
pub use executor::{
    EXECUTE_QUERY_TOOL, PgBackend, QueryBackend, QueryExecutor, QueryRequest, QueryResult,
    execute_query_tool,
};
pub use prompt::{PromptPolicy, PromptTemplate, Role, TableAllowList};
