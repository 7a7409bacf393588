use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Column, Executor, Row, TypeInfo, ValueRef};

use crate::error::BackendError;
use crate::sql::access::{AccessGate, split_statements};
use crate::tools::{ToolOutcome, ToolSpec};

pub const EXECUTE_QUERY_TOOL: &str = "execute_query";
pub const DEFAULT_MAX_STRING_LENGTH: usize = 300;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub query: String,
    pub requested_at: DateTime<Utc>,
}

impl QueryRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            requested_at: Utc::now(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryResult {
    Success(String),
    Failure(String),
}

impl QueryResult {
    pub fn is_success(&self) -> bool {
        matches!(self, QueryResult::Success(_))
    }

    pub fn text(&self) -> &str {
        match self {
            QueryResult::Success(text) | QueryResult::Failure(text) => text,
        }
    }

    pub fn into_text(self) -> String {
        match self {
            QueryResult::Success(text) | QueryResult::Failure(text) => text,
        }
    }
}

/// A store that runs one read query and renders the rows as text.
#[async_trait]
pub trait QueryBackend: Send + Sync {
    async fn run(&self, query: &str) -> Result<String, BackendError>;
}

/// Runs single statements against a backend, folding every failure into
/// [`QueryResult::Failure`].
#[derive(Clone)]
pub struct QueryExecutor {
    backend: Arc<dyn QueryBackend>,
}

impl std::fmt::Debug for QueryExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryExecutor").finish_non_exhaustive()
    }
}

impl QueryExecutor {
    pub fn new<B>(backend: B) -> Self
    where
        B: QueryBackend + 'static,
    {
        Self {
            backend: Arc::new(backend),
        }
    }

    pub fn from_arc(backend: Arc<dyn QueryBackend>) -> Self {
        Self { backend }
    }

    pub async fn execute(&self, request: &QueryRequest) -> QueryResult {
        let statements = split_statements(&request.query);
        match statements.len() {
            0 => return QueryResult::Failure("query is empty".to_string()),
            1 => {}
            count => {
                tracing::warn!(count, "refusing multi-statement query");
                return QueryResult::Failure(format!(
                    "only one statement may be executed per call, received {count}"
                ));
            }
        }

        tracing::debug!(query = %request.query, "executing query");
        match self.backend.run(&statements[0]).await {
            Ok(rows) => QueryResult::Success(rows),
            Err(err) => {
                tracing::warn!(query = %request.query, error = %err, "query failed");
                QueryResult::Failure(err.to_string())
            }
        }
    }
}

/// Builds the `execute_query` tool. It reads the [`QueryExecutor`] and an
/// optional [`AccessGate`] from the dependency map, and the caller's role from
/// the injected [`RunContext`](crate::agent::RunContext).
pub fn execute_query_tool() -> ToolSpec {
    ToolSpec::new(EXECUTE_QUERY_TOOL, "Execute a SQL query")
        .with_schema(json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "A single SELECT statement"
                }
            },
            "required": ["query"],
            "additionalProperties": false
        }))
        .expect("valid schema")
        .with_handler(|args, deps| {
            let query = args
                .get("query")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let executor = deps.require::<QueryExecutor>();
            let gate = deps.get::<AccessGate>();
            let role = deps.role();

            async move {
                let executor = executor?;

                if let Some(gate) = gate {
                    if let Err(denied) = gate.check(role, &query) {
                        return Ok(ToolOutcome::Text(denied.to_string()));
                    }
                }

                let result = executor.execute(&QueryRequest::new(query)).await;
                Ok(ToolOutcome::Text(result.into_text()))
            }
        })
}

/// One column value, rendered the way Python's `repr` shows the matching
/// driver type.
#[derive(Clone, Debug, PartialEq)]
pub enum Cell {
    Null,
    Number(String),
    Decimal(String),
    Bool(bool),
    Text(String),
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
}

/// Renders rows as a list of tuples: `[(1, 'AC/DC'), (2, "Guns N' Roses")]`.
/// No rows renders as the empty string.
pub fn render_rows(rows: &[Vec<Cell>], max_string_length: usize) -> String {
    if rows.is_empty() {
        return String::new();
    }

    let rendered = rows
        .iter()
        .map(|row| {
            let cells = row
                .iter()
                .map(|cell| render_cell(cell, max_string_length))
                .collect::<Vec<_>>();
            if cells.len() == 1 {
                format!("({},)", cells[0])
            } else {
                format!("({})", cells.join(", "))
            }
        })
        .collect::<Vec<_>>();

    format!("[{}]", rendered.join(", "))
}

fn render_cell(cell: &Cell, max_string_length: usize) -> String {
    match cell {
        Cell::Null => "None".to_string(),
        Cell::Bool(true) => "True".to_string(),
        Cell::Bool(false) => "False".to_string(),
        Cell::Number(number) => number.clone(),
        Cell::Decimal(number) => format!("Decimal('{number}')"),
        Cell::Text(text) => quote_text(&truncate_value(text, max_string_length)),
        Cell::Timestamp(value) => {
            let mut parts = vec![
                value.year().to_string(),
                value.month().to_string(),
                value.day().to_string(),
                value.hour().to_string(),
                value.minute().to_string(),
            ];
            let micros = value.nanosecond() / 1_000;
            if value.second() != 0 || micros != 0 {
                parts.push(value.second().to_string());
            }
            if micros != 0 {
                parts.push(micros.to_string());
            }
            format!("datetime.datetime({})", parts.join(", "))
        }
        Cell::Date(value) => format!(
            "datetime.date({}, {}, {})",
            value.year(),
            value.month(),
            value.day()
        ),
    }
}

/// Single quotes unless the text holds a `'` and no `"`.
fn quote_text(text: &str) -> String {
    let quote = if text.contains('\'') && !text.contains('"') {
        '"'
    } else {
        '\''
    };

    let mut quoted = String::with_capacity(text.len() + 2);
    quoted.push(quote);
    for ch in text.chars() {
        match ch {
            '\\' => quoted.push_str("\\\\"),
            '\n' => quoted.push_str("\\n"),
            '\r' => quoted.push_str("\\r"),
            '\t' => quoted.push_str("\\t"),
            c if c == quote => {
                quoted.push('\\');
                quoted.push(c);
            }
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                quoted.push_str(&format!("\\x{:02x}", c as u32));
            }
            c => quoted.push(c),
        }
    }
    quoted.push(quote);
    quoted
}

fn truncate_value(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        text.to_string()
    } else {
        let mut truncated = text.chars().take(max).collect::<String>();
        truncated.push_str("...");
        truncated
    }
}

fn is_numeric_type(name: &str) -> bool {
    matches!(
        name,
        "INT2" | "INT4" | "INT8" | "FLOAT4" | "FLOAT8" | "OID"
    )
}

#[derive(Debug, Clone)]
pub struct PgBackend {
    pool: PgPool,
    max_string_length: usize,
}

impl PgBackend {
    pub async fn connect(database_url: &str) -> Result<Self, BackendError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|err| BackendError(err.to_string()))?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            max_string_length: DEFAULT_MAX_STRING_LENGTH,
        }
    }

    pub fn with_max_string_length(mut self, max_string_length: usize) -> Self {
        self.max_string_length = max_string_length;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl QueryBackend for PgBackend {
    async fn run(&self, query: &str) -> Result<String, BackendError> {
        let backend_error = |err: sqlx::Error| BackendError(err.to_string());
        let mut tx = self.pool.begin().await.map_err(backend_error)?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(backend_error)?;

        // Parsing as a prepared statement makes the server refuse anything
        // that is not exactly one command.
        let conn: &mut sqlx::PgConnection = &mut tx;
        conn.prepare(query).await.map_err(backend_error)?;

        // The simple-query protocol returns every column in text format.
        let rows = conn
            .fetch_all(sqlx::raw_sql(query))
            .await
            .map_err(backend_error)?;
        tx.rollback().await.map_err(backend_error)?;

        let cells = rows
            .iter()
            .map(row_cells)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(render_rows(&cells, self.max_string_length))
    }
}

fn row_cells(row: &PgRow) -> Result<Vec<Cell>, BackendError> {
    let mut cells = Vec::with_capacity(row.columns().len());
    for column in row.columns() {
        let raw = row
            .try_get_raw(column.ordinal())
            .map_err(|err| BackendError(err.to_string()))?;
        if raw.is_null() {
            cells.push(Cell::Null);
            continue;
        }

        let type_name = column.type_info().name().to_string();
        let text = raw
            .as_str()
            .map_err(|err| BackendError(err.to_string()))?
            .to_string();

        let cell = match type_name.as_str() {
            "BOOL" => Cell::Bool(text == "t" || text == "true"),
            "NUMERIC" => Cell::Decimal(text),
            "TIMESTAMP" => NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f")
                .map_or(Cell::Text(text), Cell::Timestamp),
            "DATE" => NaiveDate::parse_from_str(&text, "%Y-%m-%d")
                .map_or(Cell::Text(text), Cell::Date),
            name if is_numeric_type(name) => Cell::Number(text),
            _ => Cell::Text(text),
        };
        cells.push(cell);
    }
    Ok(cells)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::agent::RunContext;
    use crate::error::ToolError;
    use crate::sql::prompt::{DEFAULT_ALLOWED_TABLES, Role, TableAllowList};
    use crate::tools::DependencyMap;

    #[derive(Default)]
    struct RecordingBackend {
        queries: Mutex<Vec<String>>,
        fail_with: Option<String>,
    }

    #[async_trait]
    impl QueryBackend for RecordingBackend {
        async fn run(&self, query: &str) -> Result<String, BackendError> {
            self.queries
                .lock()
                .expect("lock poisoned")
                .push(query.to_string());
            match &self.fail_with {
                Some(message) => Err(BackendError(message.clone())),
                None => Ok("[(1, 'For Those About To Rock We Salute You')]".to_string()),
            }
        }
    }

    #[tokio::test]
    async fn backend_errors_become_failures() {
        let message = "error returned from database: relation \"invoice\" does not exist";
        let executor = QueryExecutor::new(RecordingBackend {
            fail_with: Some(message.to_string()),
            ..Default::default()
        });

        let result = executor
            .execute(&QueryRequest::new(
                "SELECT * FROM Invoice ORDER BY InvoiceDate DESC LIMIT 1",
            ))
            .await;

        assert_eq!(result, QueryResult::Failure(message.to_string()));
    }

    #[tokio::test]
    async fn multi_statement_queries_never_reach_the_backend() {
        let backend = Arc::new(RecordingBackend::default());
        let executor = QueryExecutor::from_arc(backend.clone());

        let result = executor
            .execute(&QueryRequest::new("SELECT 1; DROP TABLE Track"))
            .await;

        assert!(!result.is_success());
        assert!(result.text().contains("only one statement"));
        assert!(backend.queries.lock().expect("lock poisoned").is_empty());
    }

    #[tokio::test]
    async fn escape_strings_cannot_hide_a_second_statement() {
        let backend = Arc::new(RecordingBackend::default());
        let executor = QueryExecutor::from_arc(backend.clone());

        let result = executor
            .execute(&QueryRequest::new(
                r#"SELECT E'\''; DELETE FROM "Track"; SELECT 'x'"#,
            ))
            .await;

        assert_eq!(
            result,
            QueryResult::Failure(
                "only one statement may be executed per call, received 3".to_string()
            )
        );
        assert!(backend.queries.lock().expect("lock poisoned").is_empty());
    }

    #[tokio::test]
    #[ignore = "needs TEST_DATABASE_URL pointing at a scratch Postgres database"]
    async fn postgres_backend_runs_one_read_only_command() {
        let url = std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL is set");
        let backend = PgBackend::connect(&url).await.expect("connects");

        let rows = backend
            .run("SELECT 1 AS one, 'it''s' AS text, 0.99::numeric AS price, NULL AS nothing")
            .await
            .expect("select runs");
        assert_eq!(rows, "[(1, \"it's\", Decimal('0.99'), None)]");

        let err = backend
            .run("SELECT 1; SELECT 2")
            .await
            .expect_err("two commands are refused");
        assert!(err.0.contains("multiple commands"), "{err}");

        let err = backend
            .run("CREATE TABLE sql_agent_write_check (id int)")
            .await
            .expect_err("writes are refused");
        assert!(err.0.contains("read-only"), "{err}");
    }

    #[tokio::test]
    async fn trailing_semicolon_is_a_single_statement() {
        let backend = Arc::new(RecordingBackend::default());
        let executor = QueryExecutor::from_arc(backend.clone());

        let result = executor
            .execute(&QueryRequest::new("SELECT \"Title\" FROM \"Album\" LIMIT 1;"))
            .await;

        assert!(result.is_success());
        assert_eq!(
            backend.queries.lock().expect("lock poisoned").as_slice(),
            ["SELECT \"Title\" FROM \"Album\" LIMIT 1".to_string()]
        );
    }

    #[test]
    fn render_rows_matches_tuple_list_format() {
        let rows = vec![
            vec![
                Cell::Number("1".to_string()),
                Cell::Text("AC/DC".to_string()),
                Cell::Null,
            ],
            vec![
                Cell::Number("2".to_string()),
                Cell::Text("Guns N' Roses".to_string()),
                Cell::Bool(true),
            ],
        ];

        assert_eq!(
            render_rows(&rows, DEFAULT_MAX_STRING_LENGTH),
            "[(1, 'AC/DC', None), (2, \"Guns N' Roses\", True)]"
        );
        assert_eq!(
            render_rows(&[vec![Cell::Number("275".to_string())]], 300),
            "[(275,)]"
        );
        assert_eq!(render_rows(&[], 300), "");
    }

    #[test]
    fn render_rows_follows_repr_for_quotes_decimals_and_dates() {
        let invoice_date = NaiveDate::from_ymd_opt(2013, 12, 22)
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .expect("valid timestamp");
        let rows = vec![vec![
            Cell::Number("412".to_string()),
            Cell::Timestamp(invoice_date),
            Cell::Decimal("1.99".to_string()),
            Cell::Text("say \"hi\" it's".to_string()),
            Cell::Date(invoice_date.date()),
        ]];

        assert_eq!(
            render_rows(&rows, DEFAULT_MAX_STRING_LENGTH),
            "[(412, datetime.datetime(2013, 12, 22, 0, 0), Decimal('1.99'), \
             'say \"hi\" it\\'s', datetime.date(2013, 12, 22))]"
        );

        let with_seconds = NaiveDate::from_ymd_opt(2009, 1, 1)
            .and_then(|date| date.and_hms_opt(10, 5, 7))
            .expect("valid timestamp");
        assert_eq!(
            render_rows(&[vec![Cell::Timestamp(with_seconds)]], 300),
            "[(datetime.datetime(2009, 1, 1, 10, 5, 7),)]"
        );
        assert_eq!(
            render_rows(&[vec![Cell::Text("a\\b\nc".to_string())]], 300),
            "[('a\\\\b\\nc',)]"
        );
    }

    #[test]
    fn render_rows_truncates_long_values() {
        let rows = vec![vec![Cell::Text("abcdefghij".to_string())]];
        assert_eq!(render_rows(&rows, 4), "[('abcd...',)]");
    }

    #[tokio::test]
    async fn tool_reports_access_denial_as_output() {
        let backend = Arc::new(RecordingBackend::default());
        let deps = DependencyMap::new()
            .with(QueryExecutor::from_arc(backend.clone()))
            .with(AccessGate::enforced(TableAllowList::new(
                DEFAULT_ALLOWED_TABLES.iter().copied(),
            )))
            .for_run(&RunContext::new("t-1").with_role(Role::Restricted));

        let outcome = execute_query_tool()
            .execute(json!({"query": "SELECT * FROM Customers LIMIT 5"}), &deps)
            .await
            .expect("tool runs");

        match outcome {
            ToolOutcome::Text(text) => assert!(text.contains("Customers")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(backend.queries.lock().expect("lock poisoned").is_empty());
    }

    #[tokio::test]
    async fn tool_requires_an_executor() {
        let err = execute_query_tool()
            .execute(json!({"query": "SELECT 1"}), &DependencyMap::new())
            .await
            .expect_err("missing executor");
        assert!(matches!(err, ToolError::MissingDependency("QueryExecutor")));
    }
}
